//! Authoritative object storage for a single zone
//!
//! The store owns every `WorldObject` in the zone together with the zone's
//! message log. All other components read snapshots (clones) and mutate
//! through closures that run under the store's write guard, which makes each
//! mutation atomic with respect to every other reader and writer.

use shared::{get_timestamp, ObjectId, ObjectQuery, Vec3, WorldObject, ZoneMessage};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct WorldStore {
    objects: RwLock<HashMap<ObjectId, WorldObject>>,
    messages: RwLock<VecDeque<ZoneMessage>>,
    next_object_id: AtomicU64,
    next_message_id: AtomicU64,
}

impl Default for WorldStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            messages: RwLock::new(VecDeque::new()),
            next_object_id: AtomicU64::new(1),
            next_message_id: AtomicU64::new(1),
        }
    }

    // Scripts may panic while a guard is held; poisoned guards are recovered.
    fn read_objects(&self) -> RwLockReadGuard<'_, HashMap<ObjectId, WorldObject>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_objects(&self) -> RwLockWriteGuard<'_, HashMap<ObjectId, WorldObject>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_messages(&self) -> RwLockWriteGuard<'_, VecDeque<ZoneMessage>> {
        self.messages.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts an object and returns its id.
    ///
    /// Objects arriving with id 0 get the next free id. A non-zero id is kept
    /// unless it is already taken, in which case a fresh one is assigned so
    /// ids stay unique within the zone.
    pub fn insert(&self, object: WorldObject) -> ObjectId {
        let mut objects = self.write_objects();
        self.insert_locked(&mut objects, object)
    }

    /// Returns the lowest id matching `existing`, or inserts `make()` if
    /// nothing matches. Lookup and insert happen under one write guard.
    pub fn find_or_insert<P, F>(&self, existing: P, make: F) -> (ObjectId, bool)
    where
        P: Fn(&WorldObject) -> bool,
        F: FnOnce() -> WorldObject,
    {
        let mut objects = self.write_objects();
        let found = objects
            .values()
            .filter(|object| existing(object))
            .map(|object| object.id)
            .min();

        match found {
            Some(id) => (id, false),
            None => (self.insert_locked(&mut objects, make()), true),
        }
    }

    fn insert_locked(
        &self,
        objects: &mut HashMap<ObjectId, WorldObject>,
        mut object: WorldObject,
    ) -> ObjectId {
        if object.id == 0 || objects.contains_key(&object.id) {
            let mut id = self.next_object_id.fetch_add(1, Ordering::SeqCst);
            while objects.contains_key(&id) {
                id = self.next_object_id.fetch_add(1, Ordering::SeqCst);
            }
            object.id = id;
        } else {
            self.next_object_id
                .fetch_max(object.id + 1, Ordering::SeqCst);
        }

        object.dedup_states();
        object.touch();
        let id = object.id;
        objects.insert(id, object);
        id
    }

    pub fn get(&self, id: ObjectId) -> Option<WorldObject> {
        self.read_objects().get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<WorldObject> {
        self.read_objects()
            .values()
            .filter(|object| object.name == name)
            .min_by_key(|object| object.id)
            .cloned()
    }

    /// Returns every object matching the query, ordered by id.
    pub fn find(&self, query: &ObjectQuery) -> Vec<WorldObject> {
        let mut found: Vec<WorldObject> = self
            .read_objects()
            .values()
            .filter(|object| query.matches(object))
            .cloned()
            .collect();
        found.sort_by_key(|object| object.id);
        found
    }

    /// Runs `f` against one object under the write guard.
    ///
    /// Returns None if the object does not exist. The closure decides whether
    /// to touch `last_modified`.
    pub fn update<F, R>(&self, id: ObjectId, f: F) -> Option<R>
    where
        F: FnOnce(&mut WorldObject) -> R,
    {
        let mut objects = self.write_objects();
        objects.get_mut(&id).map(f)
    }

    /// Runs `f` with exclusive access to the whole zone.
    ///
    /// Used where a decision depends on other objects and must be committed
    /// without any interleaving write.
    pub fn with_objects_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut HashMap<ObjectId, WorldObject>) -> R,
    {
        let mut objects = self.write_objects();
        f(&mut objects)
    }

    pub fn len(&self) -> usize {
        self.read_objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_objects().is_empty()
    }

    pub fn post_message(
        &self,
        sender: &str,
        body: &str,
        position: Option<Vec3>,
        player_generated: bool,
    ) -> ZoneMessage {
        let message = ZoneMessage {
            id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
            sender: sender.to_string(),
            body: body.to_string(),
            position,
            player_generated,
            sent_at: get_timestamp(),
        };
        self.write_messages().push_back(message.clone());
        message
    }

    /// All retained messages, oldest first.
    pub fn messages(&self) -> Vec<ZoneMessage> {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Deletes the oldest object-authored messages until at most `keep` remain.
    ///
    /// Player messages are never removed. Returns the number deleted.
    pub fn trim_script_messages(&self, keep: usize) -> usize {
        let mut messages = self.write_messages();
        let scripted = messages.iter().filter(|m| !m.player_generated).count();
        if scripted <= keep {
            return 0;
        }

        let mut excess = scripted - keep;
        let removed = excess;
        messages.retain(|message| {
            if excess > 0 && !message.player_generated {
                excess -= 1;
                false
            } else {
                true
            }
        });
        removed
    }
}
