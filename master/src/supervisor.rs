//! Starting, watching and stopping zone worker processes
//!
//! The launcher only talks to the [`ProcessSupervisor`] trait. Two backends
//! are provided: [`DirectSupervisor`] runs the worker binary as a child of
//! the master, [`ControlSupervisor`] hands the work to an external process
//! supervisor through its control program.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shared::ZoneId;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Name under which a supervisor tracks one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle(pub String);

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to start the worker for one zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub zone_id: ZoneId,
    pub host: String,
    pub port: u16,
}

impl WorkerSpec {
    pub fn new(zone_id: ZoneId, host: &str, port: u16) -> Self {
        Self {
            zone_id,
            host: host.to_string(),
            port,
        }
    }

    /// One process name per zone, so a second start of the same zone is
    /// recognisable as a duplicate.
    pub fn process_name(&self) -> String {
        format!("zone-{}", self.zone_id)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Command line arguments for the worker binary.
    pub fn args(&self) -> Vec<String> {
        vec![
            "--port".to_string(),
            self.port.to_string(),
            "--instance-type".to_string(),
            self.zone_id.instance_type.clone(),
            "--zone-name".to_string(),
            self.zone_id.zone_name.clone(),
            "--owner".to_string(),
            self.zone_id.owner.clone(),
            "--host".to_string(),
            self.host.clone(),
        ]
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A process with this name is already running; someone else won the race
    /// to start it.
    #[error("process {0} is already running")]
    AlreadyRunning(String),
    #[error("failed to start {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("supervisor control failed: {0}")]
    Control(String),
    #[error("unknown process {0}")]
    UnknownHandle(String),
}

pub trait ProcessSupervisor: Send + Sync {
    fn spawn(
        &self,
        spec: &WorkerSpec,
    ) -> impl Future<Output = Result<ProcessHandle, SupervisorError>> + Send;

    fn is_alive(&self, handle: &ProcessHandle) -> impl Future<Output = bool> + Send;

    fn terminate(
        &self,
        handle: &ProcessHandle,
    ) -> impl Future<Output = Result<(), SupervisorError>> + Send;
}

/// Runs workers as child processes of the master.
pub struct DirectSupervisor {
    worker_bin: PathBuf,
    children: Mutex<HashMap<ProcessHandle, Child>>,
}

impl DirectSupervisor {
    pub fn new(worker_bin: impl Into<PathBuf>) -> Self {
        Self {
            worker_bin: worker_bin.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub async fn running(&self) -> usize {
        let mut children = self.children.lock().await;
        children.retain(|_, child| matches!(child.try_wait(), Ok(None)));
        children.len()
    }
}

impl ProcessSupervisor for DirectSupervisor {
    async fn spawn(&self, spec: &WorkerSpec) -> Result<ProcessHandle, SupervisorError> {
        let handle = ProcessHandle(spec.process_name());
        let mut children = self.children.lock().await;

        if let Some(child) = children.get_mut(&handle) {
            if let Ok(None) = child.try_wait() {
                return Err(SupervisorError::AlreadyRunning(handle.0));
            }
        }

        let child = Command::new(&self.worker_bin)
            .args(spec.args())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                name: handle.0.clone(),
                source,
            })?;

        info!(
            "Started {} (pid {:?}) on {}",
            handle,
            child.id(),
            spec.endpoint()
        );
        children.insert(handle.clone(), child);
        Ok(handle)
    }

    async fn is_alive(&self, handle: &ProcessHandle) -> bool {
        let mut children = self.children.lock().await;
        match children.get_mut(handle) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn terminate(&self, handle: &ProcessHandle) -> Result<(), SupervisorError> {
        let child = self.children.lock().await.remove(handle);
        let Some(mut child) = child else {
            return Err(SupervisorError::UnknownHandle(handle.0.clone()));
        };

        if let Ok(None) = child.try_wait() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", handle, e);
            }
        }
        debug!("Reaped {}", handle);
        Ok(())
    }
}

/// Delegates to an external supervisor through its control program:
///
/// - `<ctl> start <name> -- <worker-bin> <args…>` starts a process
/// - `<ctl> status <name>` exits successfully while it runs
/// - `<ctl> stop <name>` stops it
///
/// A start refused with "already exists" is reported as
/// [`SupervisorError::AlreadyRunning`].
pub struct ControlSupervisor {
    program: PathBuf,
    worker_bin: PathBuf,
}

impl ControlSupervisor {
    pub fn new(program: impl Into<PathBuf>, worker_bin: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            worker_bin: worker_bin.into(),
        }
    }

    async fn control(&self, args: &[String]) -> Result<std::process::Output, SupervisorError> {
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                SupervisorError::Control(format!("{}: {}", self.program.display(), e))
            })
    }
}

impl ProcessSupervisor for ControlSupervisor {
    async fn spawn(&self, spec: &WorkerSpec) -> Result<ProcessHandle, SupervisorError> {
        let name = spec.process_name();
        let mut args = vec![
            "start".to_string(),
            name.clone(),
            "--".to_string(),
            self.worker_bin.display().to_string(),
        ];
        args.extend(spec.args());

        let output = self.control(&args).await?;
        if output.status.success() {
            info!("Supervisor started {} on {}", name, spec.endpoint());
            return Ok(ProcessHandle(name));
        }

        let message = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if message.to_lowercase().contains("already exists") {
            return Err(SupervisorError::AlreadyRunning(name));
        }
        Err(SupervisorError::Control(format!(
            "start {} failed: {}",
            name,
            message.trim()
        )))
    }

    async fn is_alive(&self, handle: &ProcessHandle) -> bool {
        match self.control(&["status".to_string(), handle.0.clone()]).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                warn!("Could not query {}: {}", handle, e);
                false
            }
        }
    }

    async fn terminate(&self, handle: &ProcessHandle) -> Result<(), SupervisorError> {
        let output = self
            .control(&["stop".to_string(), handle.0.clone()])
            .await?;
        if output.status.success() {
            debug!("Supervisor stopped {}", handle);
            Ok(())
        } else {
            Err(SupervisorError::Control(format!(
                "stop {} failed: {}",
                handle,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn spec() -> WorkerSpec {
        WorkerSpec::new(
            "playerinstance-Meadow-Alice".parse().unwrap(),
            "127.0.0.1",
            1301,
        )
    }

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "master-supervisor-{}-{}",
            label,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_worker_spec_command_line() {
        let spec = spec();
        assert_eq!(spec.process_name(), "zone-playerinstance-Meadow-Alice");
        assert_eq!(spec.endpoint(), "127.0.0.1:1301");
        assert_eq!(
            spec.args(),
            vec![
                "--port",
                "1301",
                "--instance-type",
                "playerinstance",
                "--zone-name",
                "Meadow",
                "--owner",
                "Alice",
                "--host",
                "127.0.0.1"
            ]
        );
    }

    #[tokio::test]
    async fn test_direct_supervisor_lifecycle() {
        let dir = scratch_dir("direct");
        let worker = script(&dir, "worker.sh", "sleep 30");
        let supervisor = DirectSupervisor::new(&worker);

        let handle = supervisor.spawn(&spec()).await.unwrap();
        assert!(supervisor.is_alive(&handle).await);
        assert!(matches!(
            supervisor.spawn(&spec()).await,
            Err(SupervisorError::AlreadyRunning(_))
        ));

        supervisor.terminate(&handle).await.unwrap();
        assert!(!supervisor.is_alive(&handle).await);
        assert!(matches!(
            supervisor.terminate(&handle).await,
            Err(SupervisorError::UnknownHandle(_))
        ));
        assert_eq!(supervisor.running().await, 0);
    }

    #[tokio::test]
    async fn test_control_supervisor_maps_duplicate_start() {
        let dir = scratch_dir("control");
        let ctl = script(
            &dir,
            "ctl.sh",
            r#"case "$1" in
  start) echo "ERROR: process $2 already exists" >&2; exit 1 ;;
  status) exit 0 ;;
  stop) exit 0 ;;
esac"#,
        );
        let supervisor = ControlSupervisor::new(&ctl, "/usr/bin/zone-worker");

        match supervisor.spawn(&spec()).await {
            Err(SupervisorError::AlreadyRunning(name)) => {
                assert_eq!(name, "zone-playerinstance-Meadow-Alice")
            }
            other => panic!("unexpected result {:?}", other),
        }

        let handle = ProcessHandle(spec().process_name());
        assert!(supervisor.is_alive(&handle).await);
        supervisor.terminate(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_control_supervisor_reports_other_failures() {
        let dir = scratch_dir("control-fail");
        let ctl = script(&dir, "ctl.sh", r#"echo "no such program" >&2; exit 2"#);
        let supervisor = ControlSupervisor::new(&ctl, "/usr/bin/zone-worker");

        assert!(matches!(
            supervisor.spawn(&spec()).await,
            Err(SupervisorError::Control(_))
        ));
        assert!(!supervisor.is_alive(&ProcessHandle("zone-x".to_string())).await);
    }
}
