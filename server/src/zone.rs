//! One running zone: its store plus everything that acts on it
//!
//! [`Zone`] owns the world store and the three components that change it
//! (movement authority, script engine and physics integrator). It turns a
//! request packet into a response packet and runs one simulation tick; the
//! network layer only moves bytes.

use crate::movement::{MoveOutcome, MoveRejection, MovementAuthority, StatusOutcome, StatusRejection};
use crate::physics::{PhysicsIntegrator, PhysicsReport, SphereSpace, DEFAULT_SUBSTEPS};
use crate::scripts::{ScriptEngine, ScriptRegistry, TickReport};
use crate::store::WorldStore;
use crate::templates::ZoneTemplate;
use log::{debug, info, warn};
use shared::{
    ObjectId, Packet, Vec3, ZoneId, MAX_FRAME_SKIP, MAX_ZONE_OBJECT_MESSAGE_COUNT,
    UPDATE_INTERVAL_MS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Settings for a single zone worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub zone_id: ZoneId,
    pub host: String,
    pub port: u16,
    pub tick_interval: Duration,
    pub max_frame_skip: u32,
    pub max_messages: usize,
    pub physics_substeps: u32,
}

impl WorkerConfig {
    pub fn new(zone_id: ZoneId, host: &str, port: u16) -> Self {
        Self {
            zone_id,
            host: host.to_string(),
            port,
            tick_interval: Duration::from_millis(UPDATE_INTERVAL_MS),
            max_frame_skip: MAX_FRAME_SKIP,
            max_messages: MAX_ZONE_OBJECT_MESSAGE_COUNT,
            physics_substeps: DEFAULT_SUBSTEPS,
        }
    }

    /// Sets the tick interval from a rate in ticks per second.
    pub fn with_tick_rate(mut self, ticks_per_second: u32) -> Self {
        self.tick_interval = Duration::from_secs_f64(1.0 / ticks_per_second.max(1) as f64);
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub struct Zone {
    id: ZoneId,
    store: Arc<WorldStore>,
    movement: Arc<MovementAuthority>,
    scripts: Arc<ScriptEngine>,
    physics: Mutex<PhysicsIntegrator<SphereSpace>>,
}

impl Zone {
    /// Builds the zone, places its template content and loads its scripts.
    pub fn new(config: &WorkerConfig, registry: ScriptRegistry) -> Self {
        let store = Arc::new(WorldStore::new());
        ZoneTemplate::for_name(&config.zone_id.zone_name).populate(&store, &registry);

        let movement = Arc::new(MovementAuthority::new(Arc::clone(&store)));
        let scripts = Arc::new(ScriptEngine::new(
            &config.zone_id.to_string(),
            registry,
            Arc::clone(&store),
            Arc::clone(&movement),
            config.max_messages,
        ));
        scripts.reload();

        let physics = PhysicsIntegrator::new(
            Arc::clone(&store),
            SphereSpace::new(),
            config.physics_substeps,
        );

        info!("Zone {} ready with {} objects", config.zone_id, store.len());

        Self {
            id: config.zone_id.clone(),
            store,
            movement,
            scripts,
            physics: Mutex::new(physics),
        }
    }

    pub fn id(&self) -> &ZoneId {
        &self.id
    }

    pub fn store(&self) -> &Arc<WorldStore> {
        &self.store
    }

    pub fn movement(&self) -> &MovementAuthority {
        &self.movement
    }

    pub fn scripts(&self) -> &Arc<ScriptEngine> {
        &self.scripts
    }

    /// One simulation step: scripts first, then physics.
    pub async fn tick(&self) -> (TickReport, PhysicsReport) {
        let scripts = self.scripts.run_tick().await;
        let physics = self.physics.lock().await.run_cycle();
        (scripts, physics)
    }

    /// Answers one request packet. Packets that are not requests get no reply.
    pub async fn handle(&self, packet: Packet) -> Option<Packet> {
        let response = match packet {
            Packet::Ping => Packet::Pong {
                zone_id: self.id.to_string(),
                tick: self.scripts.ticks_run(),
            },

            Packet::Move {
                object_id,
                dx,
                dy,
                dz,
            } => match self.movement.attempt_move(object_id, dx, dy, dz) {
                MoveOutcome::Moved(object) => Packet::Moved {
                    position: object.position.unwrap_or(Vec3::ZERO),
                },
                MoveOutcome::Rejected(MoveRejection::Collision { blocker }) => Packet::Rejected {
                    reason: format!("collision with object {}", blocker),
                },
                MoveOutcome::Rejected(MoveRejection::UnknownObject) => unknown(object_id),
            },

            Packet::SetStatus { object_id, status } => {
                match self.movement.set_status(object_id, &status) {
                    StatusOutcome::Updated(object) => Packet::StatusSet { object },
                    StatusOutcome::Rejected(StatusRejection::InvalidStatus(status)) => {
                        Packet::Rejected {
                            reason: format!("invalid status `{}`", status),
                        }
                    }
                    StatusOutcome::Rejected(StatusRejection::UnknownObject) => unknown(object_id),
                }
            }

            Packet::Activate { object_id, actor } => {
                if self.store.get(object_id).is_none() {
                    unknown(object_id)
                } else {
                    Packet::Activated {
                        results: self.scripts.activate(object_id, &actor).await,
                    }
                }
            }

            Packet::EnsureCharacter { name, owner } => Packet::CharacterReady {
                object_id: self.movement.ensure_character(&name, &owner),
            },

            Packet::FindObjects { query } => Packet::Objects {
                objects: self.store.find(&query),
            },

            Packet::ReloadScripts => Packet::ScriptsReloaded {
                bindings: self.scripts.reload(),
            },

            other => {
                warn!("Zone {} ignoring unexpected packet {:?}", self.id, other);
                return None;
            }
        };

        debug!("Zone {} answered with {:?}", self.id, response);
        Some(response)
    }
}

fn unknown(object_id: ObjectId) -> Packet {
    Packet::Rejected {
        reason: format!("unknown object {}", object_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{ObjectQuery, ScriptOutcome, WorldObject};

    fn zone(name: &str) -> Zone {
        let zone_id: ZoneId = format!("playerinstance-{}-Alice", name).parse().unwrap();
        Zone::new(&WorkerConfig::new(zone_id, "127.0.0.1", 0), ScriptRegistry::builtin())
    }

    #[tokio::test]
    async fn test_ping_reports_zone_and_tick() {
        let zone = zone("Meadow");
        zone.tick().await;
        zone.tick().await;

        match zone.handle(Packet::Ping).await {
            Some(Packet::Pong { zone_id, tick }) => {
                assert_eq!(zone_id, "playerinstance-Meadow-Alice");
                assert_eq!(tick, 2);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_character_moves_and_goes_online() {
        let zone = zone("Meadow");

        let object_id = match zone
            .handle(Packet::EnsureCharacter {
                name: "Groxnor".to_string(),
                owner: "alice".to_string(),
            })
            .await
        {
            Some(Packet::CharacterReady { object_id }) => object_id,
            other => panic!("unexpected response {:?}", other),
        };

        match zone
            .handle(Packet::Move {
                object_id,
                dx: 1,
                dy: 0,
                dz: 0,
            })
            .await
        {
            Some(Packet::Moved { position }) => assert_eq!(position, Vec3::new(5.0, 0.0, 0.0)),
            other => panic!("unexpected response {:?}", other),
        }

        match zone
            .handle(Packet::SetStatus {
                object_id,
                status: "online".to_string(),
            })
            .await
        {
            Some(Packet::StatusSet { object }) => {
                assert!(object.has_state("online"));
                assert!(!object.has_state("offline"));
            }
            other => panic!("unexpected response {:?}", other),
        }

        assert!(matches!(
            zone.handle(Packet::SetStatus {
                object_id,
                status: "away".to_string(),
            })
            .await,
            Some(Packet::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_blocked_move_is_rejected() {
        let zone = zone("Meadow");
        let mover = zone.store().insert(
            WorldObject::character("Groxnor", Some("alice"), 1.0).at(Vec3::ZERO),
        );
        zone.store()
            .insert(WorldObject::new("Boulder", "rock").physical(true).at(Vec3::new(1.0, 0.0, 0.0)));

        let response = zone
            .handle(Packet::Move {
                object_id: mover,
                dx: 1,
                dy: 0,
                dz: 0,
            })
            .await;

        assert!(matches!(response, Some(Packet::Rejected { .. })));
        assert_eq!(zone.store().get(mover).unwrap().position, Some(Vec3::ZERO));
    }

    #[tokio::test]
    async fn test_activate_dungeon_chat_bot() {
        let zone = zone("AdventureDungeon");
        let bot = zone.store().find_by_name("Linnea").unwrap();

        match zone
            .handle(Packet::Activate {
                object_id: bot.id,
                actor: "Groxnor".to_string(),
            })
            .await
        {
            Some(Packet::Activated { results }) => {
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].outcome, ScriptOutcome::Activated);
            }
            other => panic!("unexpected response {:?}", other),
        }

        assert!(matches!(
            zone.handle(Packet::Activate {
                object_id: 9_999,
                actor: "Groxnor".to_string(),
            })
            .await,
            Some(Packet::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_find_and_reload() {
        let zone = zone("GhibliHills");

        match zone
            .handle(Packet::FindObjects {
                query: ObjectQuery::all().has_scripts(true),
            })
            .await
        {
            Some(Packet::Objects { objects }) => assert_eq!(objects.len(), 10),
            other => panic!("unexpected response {:?}", other),
        }

        match zone.handle(Packet::ReloadScripts).await {
            Some(Packet::ScriptsReloaded { bindings }) => assert_eq!(bindings, 10),
            other => panic!("unexpected response {:?}", other),
        }

        assert!(zone.handle(Packet::Moved { position: Vec3::ZERO }).await.is_none());
    }
}
