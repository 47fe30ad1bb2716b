//! Instance registry: which zone runs where
//!
//! The registry maps a zone id to the endpoint of the worker serving it. It is
//! the only state shared between zones, so every access goes through one
//! async lock, and callers are expected to hold it only briefly (never while
//! probing a worker).
//!
//! When a path is configured the registry is mirrored to a JSON file that
//! several masters may share. A write touches only the zone that changed:
//! the file is read back, that one entry is replaced or dropped, and the
//! result is renamed into place, so entries other masters wrote survive.
//! Health checks that do not change an entry's state stay in memory.
//! Entries read from disk are unverified until a probe confirms them.

use crate::supervisor::ProcessHandle;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::get_timestamp;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry file is not valid: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Spawned, not yet answering.
    Starting,
    Running,
    /// Process alive but not answering probes.
    Unreachable,
    /// Process gone; evicted after the grace window.
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneInstance {
    pub zone_id: String,
    pub endpoint: String,
    pub port: u16,
    pub state: InstanceState,
    pub process: Option<ProcessHandle>,
    pub registered_at: u64,
    pub last_health_check: u64,
    pub state_changed_at: u64,
}

impl ZoneInstance {
    pub fn starting(zone_id: &str, endpoint: &str, port: u16, process: ProcessHandle) -> Self {
        let now = get_timestamp();
        Self {
            zone_id: zone_id.to_string(),
            endpoint: endpoint.to_string(),
            port,
            state: InstanceState::Starting,
            process: Some(process),
            registered_at: now,
            last_health_check: 0,
            state_changed_at: now,
        }
    }

    /// True if both describe the same launch of the zone, not a later one.
    pub fn same_launch(&self, other: &ZoneInstance) -> bool {
        self.zone_id == other.zone_id
            && self.port == other.port
            && self.registered_at == other.registered_at
    }
}

/// One zone's change, as written through to the shared file.
enum Change<'a> {
    Upsert(&'a ZoneInstance),
    /// Dropped from the file only if the file still holds this launch.
    Remove(&'a ZoneInstance),
}

impl Change<'_> {
    fn apply(&self, on_disk: &mut HashMap<String, ZoneInstance>) {
        match self {
            Change::Upsert(instance) => {
                on_disk.insert(instance.zone_id.clone(), (*instance).clone());
            }
            Change::Remove(instance) => {
                if on_disk
                    .get(&instance.zone_id)
                    .is_some_and(|current| current.same_launch(instance))
                {
                    on_disk.remove(&instance.zone_id);
                }
            }
        }
    }
}

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    instances: Vec<ZoneInstance>,
}

#[derive(Debug, Default)]
pub struct InstanceRegistry {
    entries: RwLock<HashMap<String, ZoneInstance>>,
    path: Option<PathBuf>,
}

impl InstanceRegistry {
    /// In-memory registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry backed by `path`, starting from its current contents.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let entries = read_file(&path).await?;
        info!(
            "Loaded {} zone instances from {}",
            entries.len(),
            path.display()
        );
        Ok(Self {
            entries: RwLock::new(entries),
            path: Some(path),
        })
    }

    pub async fn get(&self, zone_id: &str) -> Option<ZoneInstance> {
        self.entries.read().await.get(zone_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<ZoneInstance> {
        let mut instances: Vec<ZoneInstance> = self.entries.read().await.values().cloned().collect();
        instances.sort_by(|a, b| a.zone_id.cmp(&b.zone_id));
        instances
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn used_ports(&self) -> HashSet<u16> {
        self.entries.read().await.values().map(|i| i.port).collect()
    }

    pub async fn insert(&self, instance: ZoneInstance) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().await;
        debug!(
            "Registering {} at {} ({:?})",
            instance.zone_id, instance.endpoint, instance.state
        );
        self.persist(Change::Upsert(&instance)).await?;
        entries.insert(instance.zone_id.clone(), instance);
        Ok(())
    }

    /// Applies `f` to the entry, but only if it still belongs to the same
    /// launch as `expected`. Returns whether the entry was found.
    ///
    /// `f` returns true when it changed something worth writing to the file.
    pub async fn update_if_same<F>(
        &self,
        expected: &ZoneInstance,
        f: F,
    ) -> Result<bool, RegistryError>
    where
        F: FnOnce(&mut ZoneInstance) -> bool,
    {
        let mut entries = self.entries.write().await;
        let Some(current) = entries
            .get_mut(&expected.zone_id)
            .filter(|current| current.same_launch(expected))
        else {
            return Ok(false);
        };

        if f(current) {
            self.persist(Change::Upsert(current)).await?;
        }
        Ok(true)
    }

    /// Moves the entry to `state`, stamping the time of the change.
    pub async fn set_state(
        &self,
        expected: &ZoneInstance,
        state: InstanceState,
    ) -> Result<bool, RegistryError> {
        self.update_if_same(expected, |instance| {
            if instance.state == state {
                return false;
            }
            instance.state = state;
            instance.state_changed_at = get_timestamp();
            true
        })
        .await
    }

    /// Records a successful probe. Only a change of state reaches the file.
    pub async fn mark_healthy(&self, expected: &ZoneInstance) -> Result<bool, RegistryError> {
        self.update_if_same(expected, |instance| {
            let now = get_timestamp();
            instance.last_health_check = now;
            if instance.state == InstanceState::Running {
                return false;
            }
            instance.state = InstanceState::Running;
            instance.state_changed_at = now;
            true
        })
        .await
    }

    pub async fn remove(&self, zone_id: &str) -> Result<Option<ZoneInstance>, RegistryError> {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(zone_id);
        if let Some(instance) = &removed {
            self.persist(Change::Remove(instance)).await?;
        }
        Ok(removed)
    }

    pub async fn remove_if_same(&self, expected: &ZoneInstance) -> Result<bool, RegistryError> {
        let mut entries = self.entries.write().await;
        let same = entries
            .get(&expected.zone_id)
            .is_some_and(|current| current.same_launch(expected));
        if !same {
            return Ok(false);
        }

        if let Some(instance) = entries.remove(&expected.zone_id) {
            self.persist(Change::Remove(&instance)).await?;
        }
        Ok(true)
    }

    /// Picks up entries another master wrote to the shared file. Entries this
    /// master already knows about are kept as they are.
    pub async fn refresh(&self) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let on_disk = read_file(path).await?;

        let mut entries = self.entries.write().await;
        for (zone_id, instance) in on_disk {
            entries.entry(zone_id).or_insert(instance);
        }
        Ok(())
    }

    /// Writes one zone's change through to the file, keeping every other
    /// entry as the file has it. Called with the entries lock held.
    async fn persist(&self, change: Change<'_>) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut on_disk = read_file(path).await?;
        change.apply(&mut on_disk);

        let mut instances: Vec<ZoneInstance> = on_disk.into_values().collect();
        instances.sort_by(|a, b| a.zone_id.cmp(&b.zone_id));
        let json = serde_json::to_vec_pretty(&RegistryFile { instances })?;

        let staging = path.with_extension(format!(
            "{}-{}.tmp",
            std::process::id(),
            STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&staging, json).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }
}

async fn read_file(path: &Path) -> Result<HashMap<String, ZoneInstance>, RegistryError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };

    let file: RegistryFile = serde_json::from_slice(&bytes)?;
    Ok(file
        .instances
        .into_iter()
        .map(|instance| (instance.zone_id.clone(), instance))
        .collect())
}
