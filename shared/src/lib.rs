use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Manhattan distance under which a move is refused because another physical
/// object is in the way.
pub const COLLISION_RADIUS: f32 = 3.0;
pub const DEFAULT_CHARACTER_SPEED: f32 = 5.0;
pub const MAX_ZONE_OBJECT_MESSAGE_COUNT: usize = 1000;
pub const MAX_DICE_AMOUNT: u32 = 100;

pub const CLIENT_NETWORK_FPS: u64 = 10;
pub const UPDATE_INTERVAL_MS: u64 = 1000 / CLIENT_NETWORK_FPS;
pub const MAX_FRAME_SKIP: u32 = 5;

pub const MASTER_ZONE_SERVER_PORT: u16 = 1236;
pub const ZONE_START_PORT: u16 = 1300;
pub const ZONE_END_PORT: u16 = 1400;
pub const ZONE_STARTUP_SECS: u64 = 10;

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

/// Largest datagram either side will send or accept.
pub const MAX_PACKET_SIZE: usize = 65_507;

pub type ObjectId = u64;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };
    pub const ONE: Vec3 = Vec3 {
        x: 1.0,
        y: 1.0,
        z: 1.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn add(&self, other: &Vec3) -> Vec3 {
        Vec3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    pub fn sub(&self, other: &Vec3) -> Vec3 {
        Vec3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    pub fn scale(&self, scalar: f32) -> Vec3 {
        Vec3::new(self.x * scalar, self.y * scalar, self.z * scalar)
    }

    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn normalize(&self) -> Vec3 {
        let mag = self.magnitude();
        if mag == 0.0 {
            Vec3::ZERO
        } else {
            self.scale(1.0 / mag)
        }
    }

    pub fn manhattan_distance(&self, other: &Vec3) -> f32 {
        (self.x - other.x).abs() + (self.y - other.y).abs() + (self.z - other.z).abs()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub enum ObjectKind {
    Prop,
    Character { speed: f32 },
}

/// An entity simulated inside one zone.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WorldObject {
    /// Assigned by the zone's store; 0 until inserted.
    pub id: ObjectId,
    pub name: String,
    pub resource: String,
    /// `None` until the object has been placed or moved for the first time.
    pub position: Option<Vec3>,
    pub rotation: Vec3,
    pub scale: Vec3,
    pub velocity: Vec3,
    pub states: Vec<String>,
    pub scripts: Vec<String>,
    pub physical: bool,
    pub last_modified: u64,
    pub owner: Option<String>,
    pub kind: ObjectKind,
}

impl WorldObject {
    pub fn new(name: &str, resource: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            resource: resource.to_string(),
            position: None,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
            velocity: Vec3::ZERO,
            states: Vec::new(),
            scripts: Vec::new(),
            physical: false,
            last_modified: get_timestamp(),
            owner: None,
            kind: ObjectKind::Prop,
        }
    }

    pub fn character(name: &str, owner: Option<&str>, speed: f32) -> Self {
        let mut object = WorldObject::new(name, "character");
        object.owner = owner.map(str::to_string);
        object.kind = ObjectKind::Character { speed };
        object.physical = true;
        object
    }

    pub fn at(mut self, position: Vec3) -> Self {
        self.position = Some(position);
        self
    }

    pub fn physical(mut self, physical: bool) -> Self {
        self.physical = physical;
        self
    }

    pub fn with_states(mut self, states: &[&str]) -> Self {
        for state in states {
            self.add_state(state);
        }
        self
    }

    pub fn with_scripts(mut self, scripts: &[&str]) -> Self {
        self.scripts = scripts.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Movement multiplier; props move one unit per requested unit.
    pub fn speed(&self) -> f32 {
        match self.kind {
            ObjectKind::Character { speed } => speed,
            ObjectKind::Prop => 1.0,
        }
    }

    pub fn is_character(&self) -> bool {
        matches!(self.kind, ObjectKind::Character { .. })
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    pub fn add_state(&mut self, state: &str) {
        if !self.has_state(state) {
            self.states.push(state.to_string());
        }
    }

    pub fn remove_state(&mut self, state: &str) {
        self.states.retain(|s| s != state);
    }

    /// Drops repeated tags, keeping first occurrences in order.
    pub fn dedup_states(&mut self) {
        let mut seen: Vec<String> = Vec::with_capacity(self.states.len());
        for state in self.states.drain(..) {
            if !seen.contains(&state) {
                seen.push(state);
            }
        }
        self.states = seen;
    }

    pub fn touch(&mut self) {
        self.last_modified = get_timestamp();
    }
}

/// Filters for a store lookup. Unset fields do not filter.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ObjectQuery {
    /// Only objects modified at or after this timestamp (ms).
    pub since: Option<u64>,
    pub physical: Option<bool>,
    pub has_scripts: Option<bool>,
    pub owner: Option<String>,
}

impl ObjectQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn physical(mut self, physical: bool) -> Self {
        self.physical = Some(physical);
        self
    }

    pub fn has_scripts(mut self, has_scripts: bool) -> Self {
        self.has_scripts = Some(has_scripts);
        self
    }

    pub fn owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn matches(&self, object: &WorldObject) -> bool {
        if let Some(since) = self.since {
            if object.last_modified < since {
                return false;
            }
        }
        if let Some(physical) = self.physical {
            if object.physical != physical {
                return false;
            }
        }
        if let Some(has_scripts) = self.has_scripts {
            if object.scripts.is_empty() == has_scripts {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if object.owner.as_deref() != Some(owner.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A world-visible chat line emitted by a player or by an object's script.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ZoneMessage {
    pub id: u64,
    pub sender: String,
    pub body: String,
    pub position: Option<Vec3>,
    pub player_generated: bool,
    pub sent_at: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum ScriptOutcome {
    Activated,
    Ignored,
    Failed(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ScriptResult {
    pub script: String,
    pub outcome: ScriptOutcome,
}

#[derive(Debug, Error, PartialEq)]
pub enum ZoneIdError {
    #[error("zone id `{0}` must look like instancetype-zonename-owner")]
    Malformed(String),
    #[error("zone id `{id}` has an invalid {part}")]
    InvalidPart { id: String, part: &'static str },
}

/// Identifies one running zone: `instancetype-zonename-owner`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZoneId {
    pub instance_type: String,
    pub zone_name: String,
    pub owner: String,
}

impl ZoneId {
    pub fn new(instance_type: &str, zone_name: &str, owner: &str) -> Result<Self, ZoneIdError> {
        format!("{}-{}-{}", instance_type, zone_name, owner).parse()
    }
}

fn is_ident(part: &str) -> bool {
    part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl FromStr for ZoneId {
    type Err = ZoneIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '-');
        let (instance_type, zone_name, owner) = match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(n), Some(o)) if !t.is_empty() && !n.is_empty() && !o.is_empty() => {
                (t, n, o)
            }
            _ => return Err(ZoneIdError::Malformed(s.to_string())),
        };

        if !is_ident(instance_type) {
            return Err(ZoneIdError::InvalidPart {
                id: s.to_string(),
                part: "instance type",
            });
        }
        if !is_ident(zone_name) {
            return Err(ZoneIdError::InvalidPart {
                id: s.to_string(),
                part: "zone name",
            });
        }
        if owner.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ZoneIdError::InvalidPart {
                id: s.to_string(),
                part: "owner",
            });
        }

        Ok(ZoneId {
            instance_type: instance_type.to_string(),
            zone_name: zone_name.to_string(),
            owner: owner.to_string(),
        })
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.instance_type, self.zone_name, self.owner)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    // Liveness probe
    Ping,
    Pong {
        zone_id: String,
        tick: u64,
    },

    // Zone worker requests
    Move {
        object_id: ObjectId,
        dx: i32,
        dy: i32,
        dz: i32,
    },
    SetStatus {
        object_id: ObjectId,
        status: String,
    },
    Activate {
        object_id: ObjectId,
        actor: String,
    },
    EnsureCharacter {
        name: String,
        owner: String,
    },
    FindObjects {
        query: ObjectQuery,
    },
    ReloadScripts,

    // Zone worker responses
    Moved {
        position: Vec3,
    },
    StatusSet {
        object: WorldObject,
    },
    Activated {
        results: Vec<ScriptResult>,
    },
    CharacterReady {
        object_id: ObjectId,
    },
    Objects {
        objects: Vec<WorldObject>,
    },
    ScriptsReloaded {
        bindings: usize,
    },
    Rejected {
        reason: String,
    },

    // Master zone server
    Resolve {
        zone_id: String,
    },
    CharacterZone {
        credentials: String,
        character: String,
    },
    Resolved {
        zone_id: String,
        endpoint: String,
    },
    ResolveFailed {
        reason: String,
        retriable: bool,
    },
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
