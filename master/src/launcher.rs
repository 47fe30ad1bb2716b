//! Zone launcher: turns a zone id into the endpoint of a live worker
//!
//! [`ZoneLauncher::resolve`] is the only way a zone comes into existence.
//! It answers from the registry when the cached worker still passes its
//! liveness probe, and otherwise starts a fresh worker and waits for it.
//!
//! Resolves for the same zone inside one master are single-flighted behind
//! a per-zone lock: the first caller launches, the others wait and then find
//! the new registry entry. If the supervisor reports the process as already
//! running (another master won the race), the launcher waits for that
//! winner's registration instead of failing. A name left behind by a dead
//! process is cleared and the spawn retried once. A zone's lock is dropped
//! from the map once no resolve holds or waits on it.
//!
//! [`ZoneLauncher::sweep`] walks the registry periodically, refreshing
//! healthy entries and retiring dead ones.

use crate::config::LauncherConfig;
use crate::probe::LivenessProbe;
use crate::registry::{InstanceRegistry, InstanceState, RegistryError, ZoneInstance};
use crate::supervisor::{ProcessHandle, ProcessSupervisor, SupervisorError, WorkerSpec};
use log::{debug, error, info, warn};
use shared::{get_timestamp, ZoneId, ZoneIdError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("zone {zone_id} did not come up within {deadline:?}")]
    LaunchTimeout { zone_id: String, deadline: Duration },
    #[error(transparent)]
    InvalidZoneId(#[from] ZoneIdError),
    #[error("no free port in {start}..{end}")]
    PortsExhausted { start: u16, end: u16 },
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl LaunchError {
    /// True for failures where trying again later may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LaunchError::LaunchTimeout { .. }
                | LaunchError::PortsExhausted { .. }
                | LaunchError::Supervisor(_)
        )
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub healthy: usize,
    pub unreachable: usize,
    pub terminated: usize,
    pub evicted: usize,
}

/// One resolve's handle on a zone's launch lock. On drop the map entry goes
/// too when nobody else holds a clone; clones are only taken under the map
/// mutex, so the count cannot grow while it is checked.
struct LaunchSlot<'a> {
    locks: &'a Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for LaunchSlot<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

/// A port picked for a worker that has not registered yet. Released on drop.
struct PortReservation<'a> {
    reserved: &'a Mutex<HashSet<u16>>,
    port: u16,
}

impl Drop for PortReservation<'_> {
    fn drop(&mut self) {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
    }
}

pub struct ZoneLauncher<S, P> {
    config: LauncherConfig,
    registry: Arc<InstanceRegistry>,
    supervisor: S,
    probe: P,
    launch_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Ports picked for launches not yet in the registry.
    reserved_ports: Mutex<HashSet<u16>>,
    spawns: AtomicU64,
}

impl<S: ProcessSupervisor, P: LivenessProbe> ZoneLauncher<S, P> {
    pub fn new(
        config: LauncherConfig,
        registry: Arc<InstanceRegistry>,
        supervisor: S,
        probe: P,
    ) -> Self {
        Self {
            config,
            registry,
            supervisor,
            probe,
            launch_locks: Mutex::new(HashMap::new()),
            reserved_ports: Mutex::new(HashSet::new()),
            spawns: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }

    /// Number of worker processes this launcher has started.
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Returns the endpoint of a live worker for `zone_id`, starting one if
    /// needed. Waits at most the startup deadline for a new worker; dropping
    /// the future abandons the wait.
    pub async fn resolve(&self, zone_id: &str) -> Result<String, LaunchError> {
        let zone: ZoneId = zone_id.parse()?;
        let key = zone.to_string();

        if let Some(endpoint) = self.live_endpoint(&key).await? {
            return Ok(endpoint);
        }

        let slot = self.launch_slot(&key);
        let _guard = slot.lock.lock().await;

        // Whoever held the lock before us may have just launched it.
        if let Some(endpoint) = self.live_endpoint(&key).await? {
            return Ok(endpoint);
        }

        self.launch(&zone).await
    }

    fn launch_slot(&self, key: &str) -> LaunchSlot<'_> {
        let mut locks = self
            .launch_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        LaunchSlot {
            locks: &self.launch_locks,
            key: key.to_string(),
            lock: Arc::clone(locks.entry(key.to_string()).or_default()),
        }
    }

    #[cfg(test)]
    fn launch_lock_count(&self) -> usize {
        self.launch_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The registered endpoint, if its worker answers a probe.
    async fn live_endpoint(&self, key: &str) -> Result<Option<String>, LaunchError> {
        let Some(instance) = self.registry.get(key).await else {
            return Ok(None);
        };

        if self.probe.probe(&instance.endpoint).await {
            self.registry.mark_healthy(&instance).await?;
            debug!("Zone {} served from registry at {}", key, instance.endpoint);
            return Ok(Some(instance.endpoint));
        }
        Ok(None)
    }

    async fn launch(&self, zone: &ZoneId) -> Result<String, LaunchError> {
        let key = zone.to_string();

        if let Some(stale) = self.registry.remove(&key).await? {
            info!(
                "Replacing unhealthy instance of {} at {}",
                key, stale.endpoint
            );
            if let Some(handle) = &stale.process {
                if let Err(e) = self.supervisor.terminate(handle).await {
                    debug!("Old process for {} already gone: {}", key, e);
                }
            }
        }

        let reservation = self.reserve_port().await?;
        self.start_worker(zone, reservation.port).await
    }

    async fn start_worker(&self, zone: &ZoneId, port: u16) -> Result<String, LaunchError> {
        let key = zone.to_string();
        let spec = WorkerSpec::new(zone.clone(), &self.config.worker_host, port);
        let endpoint = spec.endpoint();

        let Some(handle) = self.spawn_worker(&spec).await? else {
            return self.await_registration(&key).await;
        };
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let instance = ZoneInstance::starting(&key, &endpoint, port, handle.clone());
        self.registry.insert(instance.clone()).await?;

        if self.wait_until_ready(&endpoint).await {
            self.registry.mark_healthy(&instance).await?;
            info!("Zone {} is up at {}", key, endpoint);
            return Ok(endpoint);
        }

        warn!(
            "Zone {} did not answer within {:?}, stopping it",
            key, self.config.startup_deadline
        );
        if let Err(e) = self.supervisor.terminate(&handle).await {
            error!("Failed to stop half-started {}: {}", handle, e);
        }
        self.registry.remove_if_same(&instance).await?;

        Err(LaunchError::LaunchTimeout {
            zone_id: key,
            deadline: self.config.startup_deadline,
        })
    }

    /// Asks the supervisor for the worker. A name the supervisor already
    /// knows is a lost race only while that process runs; a dead leftover is
    /// cleared and the spawn retried once. Returns None when a live process
    /// holds the name.
    async fn spawn_worker(&self, spec: &WorkerSpec) -> Result<Option<ProcessHandle>, LaunchError> {
        let existing = match self.supervisor.spawn(spec).await {
            Ok(handle) => return Ok(Some(handle)),
            Err(SupervisorError::AlreadyRunning(name)) => ProcessHandle(name),
            Err(e) => return Err(e.into()),
        };

        if self.supervisor.is_alive(&existing).await {
            info!(
                "{} is already being started elsewhere, waiting for its registration",
                existing
            );
            return Ok(None);
        }

        warn!("{} is left over from a dead worker, restarting it", existing);
        if let Err(e) = self.supervisor.terminate(&existing).await {
            debug!("Clearing {} failed: {}", existing, e);
        }

        match self.supervisor.spawn(spec).await {
            Ok(handle) => Ok(Some(handle)),
            Err(SupervisorError::AlreadyRunning(name)) => {
                info!("{} was claimed while restarting, waiting for it", name);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Polls the probe until it succeeds or the startup deadline passes.
    async fn wait_until_ready(&self, endpoint: &str) -> bool {
        let deadline = Instant::now() + self.config.startup_deadline;
        loop {
            if self.probe.probe(endpoint).await {
                return true;
            }
            if Instant::now() + self.config.poll_interval > deadline {
                return false;
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Waits for a launch this master did not start to show up and answer.
    async fn await_registration(&self, key: &str) -> Result<String, LaunchError> {
        let deadline = Instant::now() + self.config.startup_deadline;
        loop {
            self.registry.refresh().await?;
            if let Some(endpoint) = self.live_endpoint(key).await? {
                return Ok(endpoint);
            }
            if Instant::now() + self.config.poll_interval > deadline {
                return Err(LaunchError::LaunchTimeout {
                    zone_id: key.to_string(),
                    deadline: self.config.startup_deadline,
                });
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Picks the first port in range that no instance holds and that can be
    /// bound on the worker host.
    async fn reserve_port(&self) -> Result<PortReservation<'_>, LaunchError> {
        let registered = self.registry.used_ports().await;

        for port in self.config.ports() {
            if registered.contains(&port) || self.is_reserved(port) {
                continue;
            }
            if UdpSocket::bind((self.config.worker_host.as_str(), port))
                .await
                .is_err()
            {
                continue;
            }

            let mut reserved = self
                .reserved_ports
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if reserved.insert(port) {
                return Ok(PortReservation {
                    reserved: &self.reserved_ports,
                    port,
                });
            }
        }

        Err(LaunchError::PortsExhausted {
            start: self.config.port_start,
            end: self.config.port_end,
        })
    }

    fn is_reserved(&self, port: u16) -> bool {
        self.reserved_ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&port)
    }

    /// Probes every registered instance once and retires dead ones.
    ///
    /// Healthy instances get a fresh health check. An instance that fails is
    /// marked unreachable while its process lives and terminated once it is
    /// gone; terminated instances older than the grace window are evicted.
    pub async fn sweep(&self) -> Result<SweepReport, LaunchError> {
        let mut report = SweepReport::default();
        let grace_ms = self.config.eviction_grace.as_millis() as u64;
        let startup_ms = self.config.startup_deadline.as_millis() as u64;

        for instance in self.registry.snapshot().await {
            let now = get_timestamp();

            // Launches still inside their deadline belong to `resolve`.
            if instance.state == InstanceState::Starting
                && now.saturating_sub(instance.state_changed_at) < startup_ms
            {
                continue;
            }

            if self.probe.probe(&instance.endpoint).await {
                self.registry.mark_healthy(&instance).await?;
                report.healthy += 1;
                continue;
            }

            let alive = match &instance.process {
                Some(handle) => self.supervisor.is_alive(handle).await,
                None => false,
            };

            if alive {
                if self
                    .registry
                    .set_state(&instance, InstanceState::Unreachable)
                    .await?
                {
                    warn!("Zone {} is not answering", instance.zone_id);
                    report.unreachable += 1;
                }
            } else if instance.state != InstanceState::Terminated {
                if self
                    .registry
                    .set_state(&instance, InstanceState::Terminated)
                    .await?
                {
                    warn!("Zone {} has stopped", instance.zone_id);
                    report.terminated += 1;
                }
            } else if now.saturating_sub(instance.state_changed_at) >= grace_ms
                && self.registry.remove_if_same(&instance).await?
            {
                info!("Evicted {} from the registry", instance.zone_id);
                if let Some(handle) = &instance.process {
                    if let Err(e) = self.supervisor.terminate(handle).await {
                        debug!("Nothing to reap for {}: {}", handle, e);
                    }
                }
                report.evicted += 1;
            }
        }

        debug!("Sweep finished: {:?}", report);
        Ok(report)
    }
}

impl<S, P> ZoneLauncher<S, P>
where
    S: ProcessSupervisor + 'static,
    P: LivenessProbe + 'static,
{
    /// Spawns task that sweeps the registry every sweep interval until `stop`
    /// turns true.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut stop: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let launcher = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(launcher.config.sweep_interval);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = launcher.sweep().await {
                            error!("Registry sweep failed: {}", e);
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
