//! Movement and status authority for a zone's objects
//!
//! Every position change requested from outside the zone goes through
//! [`MovementAuthority::attempt_move`]. The collision scan and the resulting
//! write happen under a single store write guard, so no other write can slip
//! in between the check and the commit.

use crate::store::WorldStore;
use log::{debug, info};
use shared::{
    ObjectId, Vec3, WorldObject, COLLISION_RADIUS, DEFAULT_CHARACTER_SPEED, STATUS_OFFLINE,
    STATUS_ONLINE,
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveRejection {
    Collision { blocker: ObjectId },
    UnknownObject,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MoveOutcome {
    Moved(WorldObject),
    Rejected(MoveRejection),
}

impl MoveOutcome {
    pub fn is_moved(&self) -> bool {
        matches!(self, MoveOutcome::Moved(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusRejection {
    InvalidStatus(String),
    UnknownObject,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    Updated(WorldObject),
    Rejected(StatusRejection),
}

pub struct MovementAuthority {
    store: Arc<WorldStore>,
    collision_radius: f32,
}

impl MovementAuthority {
    pub fn new(store: Arc<WorldStore>) -> Self {
        Self::with_radius(store, COLLISION_RADIUS)
    }

    pub fn with_radius(store: Arc<WorldStore>, collision_radius: f32) -> Self {
        Self {
            store,
            collision_radius,
        }
    }

    pub fn collision_radius(&self) -> f32 {
        self.collision_radius
    }

    /// Moves an object by `(dx, dy, dz)` scaled by its speed.
    ///
    /// Objects without a position start from the origin. The move is refused
    /// when the destination lies within the collision radius (Manhattan) of
    /// any other physical object; the store is left untouched in that case.
    pub fn attempt_move(&self, object_id: ObjectId, dx: i32, dy: i32, dz: i32) -> MoveOutcome {
        let radius = self.collision_radius;

        self.store.with_objects_mut(|objects| {
            let (origin, speed) = match objects.get(&object_id) {
                Some(object) => (object.position.unwrap_or(Vec3::ZERO), object.speed()),
                None => return MoveOutcome::Rejected(MoveRejection::UnknownObject),
            };

            let delta = Vec3::new(dx as f32, dy as f32, dz as f32).scale(speed);
            let candidate = origin.add(&delta);

            let blocker = objects
                .values()
                .filter(|other| other.id != object_id && other.physical)
                .filter_map(|other| other.position.map(|position| (other.id, position)))
                .find(|(_, position)| position.manhattan_distance(&candidate) < radius)
                .map(|(id, _)| id);

            if let Some(blocker) = blocker {
                debug!(
                    "Move of object {} to {:?} blocked by object {}",
                    object_id, candidate, blocker
                );
                return MoveOutcome::Rejected(MoveRejection::Collision { blocker });
            }

            match objects.get_mut(&object_id) {
                Some(object) => {
                    object.position = Some(candidate);
                    object.touch();
                    MoveOutcome::Moved(object.clone())
                }
                None => MoveOutcome::Rejected(MoveRejection::UnknownObject),
            }
        })
    }

    /// Marks an object "online" or "offline"; the two tags never coexist.
    pub fn set_status(&self, object_id: ObjectId, status: &str) -> StatusOutcome {
        let opposite = match status {
            STATUS_ONLINE => STATUS_OFFLINE,
            STATUS_OFFLINE => STATUS_ONLINE,
            other => {
                return StatusOutcome::Rejected(StatusRejection::InvalidStatus(other.to_string()))
            }
        };

        let updated = self.store.update(object_id, |object| {
            object.add_state(status);
            object.remove_state(opposite);
            object.dedup_states();
            object.touch();
            object.clone()
        });

        match updated {
            Some(object) => {
                info!("Object {} ({}) is now {}", object.id, object.name, status);
                StatusOutcome::Updated(object)
            }
            None => StatusOutcome::Rejected(StatusRejection::UnknownObject),
        }
    }

    /// Returns the id of the character called `name`, creating it on first use.
    pub fn ensure_character(&self, name: &str, owner: &str) -> ObjectId {
        let (id, created) = self.store.find_or_insert(
            |object| object.name == name && object.is_character(),
            || WorldObject::character(name, Some(owner), DEFAULT_CHARACTER_SPEED),
        );
        if created {
            info!("Created character {} ({}) for {}", name, id, owner);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<WorldStore>, MovementAuthority) {
        let store = Arc::new(WorldStore::new());
        let authority = MovementAuthority::with_radius(Arc::clone(&store), 3.0);
        (store, authority)
    }

    fn mover(store: &WorldStore, speed: f32, position: Option<Vec3>) -> ObjectId {
        let mut object = WorldObject::character("Mover", Some("user"), speed);
        object.position = position;
        store.insert(object)
    }

    #[test]
    fn test_move_rejected_by_nearby_physical_object() {
        let (store, authority) = setup();
        let id = mover(&store, 1.0, Some(Vec3::ZERO));
        let blocker = store.insert(
            WorldObject::new("Rock", "rock")
                .physical(true)
                .at(Vec3::new(1.0, 0.0, 0.0)),
        );

        let outcome = authority.attempt_move(id, 1, 0, 0);

        assert_eq!(
            outcome,
            MoveOutcome::Rejected(MoveRejection::Collision { blocker })
        );
        assert_eq!(store.get(id).unwrap().position, Some(Vec3::ZERO));
    }

    #[test]
    fn test_move_accepted_when_far_from_others() {
        let (store, authority) = setup();
        let id = mover(&store, 1.0, Some(Vec3::ZERO));
        store.insert(
            WorldObject::new("Far", "rock")
                .physical(true)
                .at(Vec3::new(10.0, 10.0, 10.0)),
        );

        match authority.attempt_move(id, 1, 0, 0) {
            MoveOutcome::Moved(object) => {
                assert_eq!(object.position, Some(Vec3::new(1.0, 0.0, 0.0)));
            }
            other => panic!("Expected move, got {:?}", other),
        }
        assert_eq!(
            store.get(id).unwrap().position,
            Some(Vec3::new(1.0, 0.0, 0.0))
        );
    }

    #[test]
    fn test_move_without_position_starts_at_origin() {
        let (store, authority) = setup();
        let id = mover(&store, 2.0, None);

        match authority.attempt_move(id, 1, 2, 3) {
            MoveOutcome::Moved(object) => {
                assert_eq!(object.position, Some(Vec3::new(2.0, 4.0, 6.0)));
            }
            other => panic!("Expected move, got {:?}", other),
        }
    }

    #[test]
    fn test_non_physical_and_unplaced_objects_do_not_block() {
        let (store, authority) = setup();
        let id = mover(&store, 1.0, Some(Vec3::ZERO));
        store.insert(WorldObject::new("Ghost", "ghost").at(Vec3::new(1.0, 0.0, 0.0)));
        store.insert(WorldObject::new("Nowhere", "rock").physical(true));

        assert!(authority.attempt_move(id, 1, 0, 0).is_moved());
    }

    #[test]
    fn test_move_updates_last_modified() {
        let (store, authority) = setup();
        let id = mover(&store, 1.0, Some(Vec3::ZERO));
        store.update(id, |object| object.last_modified = 0);

        assert!(authority.attempt_move(id, 0, 1, 0).is_moved());
        assert!(store.get(id).unwrap().last_modified > 0);
    }

    #[test]
    fn test_move_unknown_object() {
        let (_store, authority) = setup();
        assert_eq!(
            authority.attempt_move(404, 1, 0, 0),
            MoveOutcome::Rejected(MoveRejection::UnknownObject)
        );
    }

    #[test]
    fn test_collision_rejections_never_mutate() {
        let (store, authority) = setup();
        let id = mover(&store, 1.0, Some(Vec3::ZERO));
        store.insert(
            WorldObject::new("Wall", "wall")
                .physical(true)
                .at(Vec3::new(0.0, 2.0, 0.0)),
        );

        for (dx, dy, dz) in [(0, 1, 0), (0, 2, 0), (1, 1, 0), (0, 3, 0), (-1, 2, 0)] {
            let before = store.get(id).unwrap();
            let outcome = authority.attempt_move(id, dx, dy, dz);
            assert!(!outcome.is_moved(), "move {:?} should collide", (dx, dy, dz));
            assert_eq!(store.get(id).unwrap(), before);
        }
    }

    #[test]
    fn test_set_status_mutually_exclusive() {
        let (store, authority) = setup();
        let id = mover(&store, 1.0, None);

        for status in ["online", "offline", "offline", "online", "online"] {
            match authority.set_status(id, status) {
                StatusOutcome::Updated(object) => {
                    assert!(object.has_state(status));
                    let both = object.has_state("online") && object.has_state("offline");
                    assert!(!both);
                    assert_eq!(
                        object.states.iter().filter(|s| s.as_str() == status).count(),
                        1
                    );
                }
                other => panic!("Expected update, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_set_status_keeps_other_tags() {
        let (store, authority) = setup();
        let id = store.insert(
            WorldObject::character("Groxnor", Some("user"), 5.0).with_states(&["alive", "online"]),
        );

        authority.set_status(id, "offline");
        let object = store.get(id).unwrap();
        assert_eq!(object.states, vec!["alive".to_string(), "offline".to_string()]);
    }

    #[test]
    fn test_set_status_invalid_value_does_not_mutate() {
        let (store, authority) = setup();
        let id = mover(&store, 1.0, None);
        authority.set_status(id, "online");
        let before = store.get(id).unwrap();

        for status in ["alive", "ONLINE", "", "online offline"] {
            assert_eq!(
                authority.set_status(id, status),
                StatusOutcome::Rejected(StatusRejection::InvalidStatus(status.to_string()))
            );
            assert_eq!(store.get(id).unwrap(), before);
        }
    }

    #[test]
    fn test_ensure_character_is_idempotent() {
        let (store, authority) = setup();
        let first = authority.ensure_character("Groxnor", "user");
        let second = authority.ensure_character("Groxnor", "user");
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);

        let character = store.get(first).unwrap();
        assert_eq!(character.speed(), DEFAULT_CHARACTER_SPEED);
        assert_eq!(character.owner.as_deref(), Some("user"));
        assert_eq!(character.position, None);
    }
}
