//! Behavior script engine
//!
//! Objects name the behaviors they run in their `scripts` list. At load time
//! each name is looked up in an explicit [`ScriptRegistry`] and paired with
//! the object as a [`BehaviorBinding`]. Bindings carry no state of their own:
//! a fresh [`ScriptContext`] is handed to every call, and anything that must
//! survive a tick lives on the `WorldObject`.
//!
//! ## Scheduling
//!
//! [`ScriptEngine::run_tick`] runs one cycle. Bindings are grouped by object;
//! groups run concurrently, and every group holds its object's lock while it
//! runs, so two ticks (or a tick and an activation) never overlap on the same
//! object.
//!
//! ## Reloading
//!
//! [`ScriptEngine::reload`] rebuilds the binding map and swaps it in under a
//! short write lock, bumping a generation counter. Ticks already executing
//! finish against the old bindings; a cycle that began before the swap does
//! not start any further binding once the generation has moved on.
//!
//! ## Failure isolation
//!
//! An error or panic inside a script is logged and counted. It never aborts
//! the cycle and never reaches the tick loop.

mod behaviors;
mod context;

pub use behaviors::{ChatBot, Chicken, Greeter, Linnea};
pub use context::ScriptContext;

use crate::movement::MovementAuthority;
use crate::store::WorldStore;
use log::{debug, error, info, warn};
use shared::{ObjectId, ObjectQuery, ScriptOutcome, ScriptResult, WorldObject};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::task::JoinSet;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("object {0} no longer exists")]
    MissingObject(ObjectId),
    #[error("invalid dice expression `{0}`")]
    InvalidDice(String),
    #[error("script failed: {0}")]
    Failed(String),
    #[error("script panicked: {0}")]
    Panicked(String),
}

/// A named unit of per-object logic.
pub trait BehaviorScript: Send + Sync {
    /// Called once per simulation tick for every object carrying the script.
    fn tick(&self, ctx: &mut ScriptContext<'_>) -> Result<(), ScriptError>;

    /// Called when a character interacts with the object.
    fn activate(
        &self,
        _ctx: &mut ScriptContext<'_>,
        _actor: &str,
    ) -> Result<ScriptOutcome, ScriptError> {
        Ok(ScriptOutcome::Ignored)
    }

    /// Builds a new object that carries this script, if the script has a
    /// template.
    fn create(&self, _index: usize) -> Option<WorldObject> {
        None
    }
}

/// Maps script names to their implementations.
#[derive(Default, Clone)]
pub struct ScriptRegistry {
    scripts: HashMap<String, Arc<dyn BehaviorScript>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every script shipped with the server.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register(Chicken::NAME, Chicken)
            .register(ChatBot::NAME, ChatBot)
            .register(Linnea::NAME, Linnea)
            .register(Greeter::NAME, Greeter::default());
        registry
    }

    pub fn register<S>(&mut self, name: &str, script: S) -> &mut Self
    where
        S: BehaviorScript + 'static,
    {
        self.scripts.insert(name.to_string(), Arc::new(script));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BehaviorScript>> {
        self.scripts.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scripts.keys().cloned().collect();
        names.sort();
        names
    }

    /// Builds an object from the named script's template.
    pub fn create(&self, name: &str, index: usize) -> Option<WorldObject> {
        self.scripts.get(name).and_then(|script| script.create(index))
    }
}

#[derive(Clone)]
pub struct BehaviorBinding {
    pub script_name: String,
    pub object_id: ObjectId,
    script: Arc<dyn BehaviorScript>,
}

impl std::fmt::Debug for BehaviorBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorBinding")
            .field("script_name", &self.script_name)
            .field("object_id", &self.object_id)
            .finish()
    }
}

pub type BindingMap = HashMap<String, Vec<BehaviorBinding>>;

#[derive(Default)]
struct LoadedBindings {
    generation: u64,
    by_script: BindingMap,
    /// Same bindings grouped per object, in each object's script order.
    by_object: Vec<(ObjectId, Vec<BehaviorBinding>)>,
}

impl LoadedBindings {
    fn binding_count(&self) -> usize {
        self.by_object.iter().map(|(_, b)| b.len()).sum()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub ran: usize,
    pub failed: usize,
    /// Bindings not started because a reload happened mid-cycle.
    pub skipped: usize,
    pub messages_trimmed: usize,
}

impl TickReport {
    fn merge(&mut self, other: TickReport) {
        self.ran += other.ran;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

pub struct ScriptEngine {
    zone_id: String,
    registry: ScriptRegistry,
    store: Arc<WorldStore>,
    movement: Arc<MovementAuthority>,
    loaded: RwLock<Arc<LoadedBindings>>,
    generation: AtomicU64,
    object_locks: Mutex<HashMap<ObjectId, Arc<tokio::sync::Mutex<()>>>>,
    tick_count: AtomicU64,
    max_messages: usize,
}

impl ScriptEngine {
    pub fn new(
        zone_id: &str,
        registry: ScriptRegistry,
        store: Arc<WorldStore>,
        movement: Arc<MovementAuthority>,
        max_messages: usize,
    ) -> Self {
        Self {
            zone_id: zone_id.to_string(),
            registry,
            store,
            movement,
            loaded: RwLock::new(Arc::new(LoadedBindings::default())),
            generation: AtomicU64::new(0),
            object_locks: Mutex::new(HashMap::new()),
            tick_count: AtomicU64::new(0),
            max_messages,
        }
    }

    pub fn registry(&self) -> &ScriptRegistry {
        &self.registry
    }

    pub fn ticks_run(&self) -> u64 {
        self.tick_count.load(Ordering::SeqCst)
    }

    /// Builds a binding for every (script, object) pair in the zone.
    ///
    /// Script names missing from the registry are logged and skipped.
    pub fn load_scripts(&self) -> BindingMap {
        let mut bindings: BindingMap = HashMap::new();

        for object in self.store.find(&ObjectQuery::all().has_scripts(true)) {
            for name in &object.scripts {
                match self.registry.get(name) {
                    Some(script) => bindings
                        .entry(name.clone())
                        .or_default()
                        .push(BehaviorBinding {
                            script_name: name.clone(),
                            object_id: object.id,
                            script,
                        }),
                    None => warn!(
                        "Zone {}: object {} ({}) names unknown script `{}`",
                        self.zone_id, object.id, object.name, name
                    ),
                }
            }
        }

        bindings
    }

    /// Reloads bindings from the store and swaps them in atomically.
    ///
    /// Returns the number of bindings now active.
    pub fn reload(&self) -> usize {
        let by_script = self.load_scripts();

        let mut per_object: HashMap<ObjectId, Vec<BehaviorBinding>> = HashMap::new();
        for binding in by_script.values().flatten() {
            per_object
                .entry(binding.object_id)
                .or_default()
                .push(binding.clone());
        }

        let mut by_object = Vec::with_capacity(per_object.len());
        for (object_id, mut bindings) in per_object {
            if let Some(object) = self.store.get(object_id) {
                bindings.sort_by_key(|b| {
                    object
                        .scripts
                        .iter()
                        .position(|name| *name == b.script_name)
                        .unwrap_or(usize::MAX)
                });
            }
            by_object.push((object_id, bindings));
        }
        by_object.sort_by_key(|(object_id, _)| *object_id);

        let mut loaded = self.loaded.write().unwrap_or_else(PoisonError::into_inner);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *loaded = Arc::new(LoadedBindings {
            generation,
            by_script,
            by_object,
        });

        let count = loaded.binding_count();
        info!(
            "Zone {}: loaded {} script bindings (generation {})",
            self.zone_id, count, generation
        );
        count
    }

    fn current(&self) -> Arc<LoadedBindings> {
        Arc::clone(&self.loaded.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Snapshot of the active binding map.
    pub fn bindings(&self) -> BindingMap {
        self.current().by_script.clone()
    }

    fn object_lock(&self, object_id: ObjectId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .object_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(object_id).or_default())
    }

    /// Drops the map's entry for `object_id` once no other caller holds or
    /// waits on `lock`. Clones are only taken under the map mutex, so the
    /// count cannot grow while it is checked.
    fn release_object_lock(&self, object_id: ObjectId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .object_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&object_id);
        }
    }

    #[cfg(test)]
    fn object_lock_count(&self) -> usize {
        self.object_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Runs one tick cycle over every active binding.
    pub async fn run_tick(self: &Arc<Self>) -> TickReport {
        let tick = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;
        let loaded = self.current();

        let mut tasks = JoinSet::new();
        for (object_id, bindings) in loaded.by_object.iter().cloned() {
            let engine = Arc::clone(self);
            let generation = loaded.generation;
            tasks.spawn(async move {
                engine
                    .tick_object(object_id, bindings, generation, tick)
                    .await
            });
        }

        let mut report = TickReport {
            tick,
            ..TickReport::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(object_report) => report.merge(object_report),
                Err(e) => {
                    error!("Zone {}: script task failed to complete: {}", self.zone_id, e);
                    report.failed += 1;
                }
            }
        }

        report.messages_trimmed = self.store.trim_script_messages(self.max_messages);
        if report.messages_trimmed > 0 {
            debug!(
                "Zone {}: trimmed {} old script messages",
                self.zone_id, report.messages_trimmed
            );
        }
        report
    }

    async fn tick_object(
        &self,
        object_id: ObjectId,
        bindings: Vec<BehaviorBinding>,
        generation: u64,
        tick: u64,
    ) -> TickReport {
        let lock = self.object_lock(object_id);
        let guard = lock.lock().await;

        let mut report = TickReport::default();
        for binding in &bindings {
            if self.generation.load(Ordering::SeqCst) != generation {
                report.skipped += 1;
                continue;
            }

            match self.invoke_tick(binding, tick) {
                Ok(()) => report.ran += 1,
                Err(e) => {
                    error!(
                        "Zone {}: script `{}` on object {} failed on tick {}: {}",
                        self.zone_id, binding.script_name, object_id, tick, e
                    );
                    report.failed += 1;
                }
            }
        }

        drop(guard);
        self.release_object_lock(object_id, lock);
        report
    }

    fn invoke_tick(&self, binding: &BehaviorBinding, tick: u64) -> Result<(), ScriptError> {
        let mut ctx = ScriptContext::new(&self.store, &self.movement, binding.object_id, tick);
        catch_unwind(AssertUnwindSafe(|| binding.script.tick(&mut ctx)))
            .unwrap_or_else(|panic| Err(ScriptError::Panicked(panic_message(panic))))
    }

    fn invoke_activate(
        &self,
        binding: &BehaviorBinding,
        actor: &str,
    ) -> Result<ScriptOutcome, ScriptError> {
        let mut ctx = ScriptContext::new(&self.store, &self.movement, binding.object_id, 0);
        catch_unwind(AssertUnwindSafe(|| binding.script.activate(&mut ctx, actor)))
            .unwrap_or_else(|panic| Err(ScriptError::Panicked(panic_message(panic))))
    }

    /// Runs every script bound to `object_id` in response to an interaction.
    ///
    /// Independent of the tick clock; waits only for that object's lock.
    pub async fn activate(&self, object_id: ObjectId, actor: &str) -> Vec<ScriptResult> {
        let bindings: Vec<BehaviorBinding> = self
            .current()
            .by_object
            .iter()
            .find(|(id, _)| *id == object_id)
            .map(|(_, bindings)| bindings.clone())
            .unwrap_or_default();

        if bindings.is_empty() {
            return Vec::new();
        }

        let lock = self.object_lock(object_id);
        let guard = lock.lock().await;

        let results = bindings
            .iter()
            .map(|binding| {
                let outcome = match self.invoke_activate(binding, actor) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(
                            "Zone {}: activating `{}` on object {} for {} failed: {}",
                            self.zone_id, binding.script_name, object_id, actor, e
                        );
                        ScriptOutcome::Failed(e.to_string())
                    }
                };
                ScriptResult {
                    script: binding.script_name.clone(),
                    outcome,
                }
            })
            .collect();

        drop(guard);
        self.release_object_lock(object_id, lock);
        results
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Vec3;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    fn engine_with(registry: ScriptRegistry) -> (Arc<WorldStore>, Arc<ScriptEngine>) {
        let store = Arc::new(WorldStore::new());
        let movement = Arc::new(MovementAuthority::new(Arc::clone(&store)));
        let engine = Arc::new(ScriptEngine::new(
            "playerinstance-Meadow-Alice",
            registry,
            Arc::clone(&store),
            movement,
            10,
        ));
        (store, engine)
    }

    /// Counts its ticks and fails on one chosen tick.
    struct FlakyGreeter {
        calls: Arc<AtomicUsize>,
        fail_on: u64,
        panic: bool,
    }

    impl BehaviorScript for FlakyGreeter {
        fn tick(&self, ctx: &mut ScriptContext<'_>) -> Result<(), ScriptError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if ctx.tick() == self.fail_on {
                if self.panic {
                    panic!("greeter tripped on tick {}", ctx.tick());
                }
                return Err(ScriptError::Failed(format!("simulated failure on tick {}", ctx.tick())));
            }
            Ok(())
        }
    }

    /// Records overlapping ticks on the same object.
    struct Overlap {
        active: Arc<AtomicUsize>,
        overlaps: Arc<AtomicUsize>,
    }

    impl BehaviorScript for Overlap {
        fn tick(&self, _ctx: &mut ScriptContext<'_>) -> Result<(), ScriptError> {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(2));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Reports when its tick starts, then holds the tick until released.
    struct Gate {
        started: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Gate {
        fn new() -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (started_tx, started_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            let gate = Gate {
                started: Mutex::new(started_tx),
                release: Mutex::new(release_rx),
            };
            (gate, started_rx, release_tx)
        }
    }

    impl BehaviorScript for Gate {
        fn tick(&self, _ctx: &mut ScriptContext<'_>) -> Result<(), ScriptError> {
            let _ = self.started.lock().unwrap().send(());
            let _ = self
                .release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5));
            Ok(())
        }
    }

    struct Waver;

    impl BehaviorScript for Waver {
        fn tick(&self, _ctx: &mut ScriptContext<'_>) -> Result<(), ScriptError> {
            Ok(())
        }

        fn activate(
            &self,
            _ctx: &mut ScriptContext<'_>,
            _actor: &str,
        ) -> Result<ScriptOutcome, ScriptError> {
            Ok(ScriptOutcome::Activated)
        }
    }

    struct Chatter;

    impl BehaviorScript for Chatter {
        fn tick(&self, ctx: &mut ScriptContext<'_>) -> Result<(), ScriptError> {
            ctx.say(&format!("tick {}", ctx.tick()))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_tick_is_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ScriptRegistry::new();
        registry.register(
            "Greeter",
            FlakyGreeter {
                calls: Arc::clone(&calls),
                fail_on: 50,
                panic: false,
            },
        );
        let (store, engine) = engine_with(registry);
        store.insert(WorldObject::new("Greeter", "villager").with_scripts(&["Greeter"]));
        assert_eq!(engine.reload(), 1);

        for expected_tick in 1..=100u64 {
            let report = engine.run_tick().await;
            assert_eq!(report.tick, expected_tick);
            if expected_tick == 50 {
                assert_eq!(report.failed, 1);
                assert_eq!(report.ran, 0);
            } else {
                assert_eq!(report.failed, 0);
                assert_eq!(report.ran, 1);
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn test_panicking_script_does_not_abort_cycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ScriptRegistry::new();
        registry
            .register(
                "Greeter",
                FlakyGreeter {
                    calls: Arc::clone(&calls),
                    fail_on: 1,
                    panic: true,
                },
            )
            .register("chatter", Chatter);
        let (store, engine) = engine_with(registry);
        store.insert(WorldObject::new("Greeter", "villager").with_scripts(&["Greeter", "chatter"]));
        store.insert(WorldObject::new("Parrot", "parrot").with_scripts(&["chatter"]));
        engine.reload();

        let report = engine.run_tick().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.ran, 2);

        let report = engine.run_tick().await;
        assert_eq!(report.failed, 0);
        assert_eq!(report.ran, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ticks_on_one_object_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let mut registry = ScriptRegistry::new();
        registry
            .register(
                "first",
                Overlap {
                    active: Arc::clone(&active),
                    overlaps: Arc::clone(&overlaps),
                },
            )
            .register(
                "second",
                Overlap {
                    active: Arc::clone(&active),
                    overlaps: Arc::clone(&overlaps),
                },
            );
        let (store, engine) = engine_with(registry);
        store.insert(WorldObject::new("Busy", "npc").with_scripts(&["first", "second"]));
        engine.reload();

        let a = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run_tick().await }
        });
        let b = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run_tick().await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(a.ran + b.ran, 4);
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reload_mid_cycle_skips_remaining_bindings() {
        let (gate, started, release) = Gate::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ScriptRegistry::new();
        registry.register("gate", gate).register(
            "counter",
            FlakyGreeter {
                calls: Arc::clone(&calls),
                fail_on: u64::MAX,
                panic: false,
            },
        );
        let (store, engine) = engine_with(registry);
        store.insert(WorldObject::new("Sentry", "npc").with_scripts(&["gate", "counter"]));
        assert_eq!(engine.reload(), 2);

        let cycle = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run_tick().await }
        });
        started.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(engine.reload(), 2);
        release.send(()).unwrap();

        let report = cycle.await.unwrap();
        assert_eq!(report.ran, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // The next cycle runs under the new generation.
        release.send(()).unwrap();
        let report = engine.run_tick().await;
        assert_eq!((report.ran, report.skipped), (2, 0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_activate_is_not_blocked_by_slow_tick_elsewhere() {
        let (gate, started, release) = Gate::new();
        let mut registry = ScriptRegistry::new();
        registry.register("gate", gate).register("waver", Waver);
        let (store, engine) = engine_with(registry);
        store.insert(WorldObject::new("Sentry", "npc").with_scripts(&["gate"]));
        let waver = store.insert(WorldObject::new("Waver", "npc").with_scripts(&["waver"]));
        engine.reload();

        let cycle = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run_tick().await }
        });
        started.recv_timeout(Duration::from_secs(5)).unwrap();

        let results = tokio::time::timeout(Duration::from_secs(1), engine.activate(waver, "Alice"))
            .await
            .expect("activation waited on another object's tick");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, ScriptOutcome::Activated);
        assert!(!cycle.is_finished());

        release.send(()).unwrap();
        let report = cycle.await.unwrap();
        assert_eq!(report.ran, 2);
        assert_eq!(engine.object_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_object_locks_are_released_after_use() {
        let (store, engine) = engine_with(ScriptRegistry::builtin());
        let mut ids = Vec::new();
        for i in 0..5 {
            if let Some(chicken) = engine.registry().create("chicken", i) {
                ids.push(store.insert(chicken));
            }
        }
        engine.reload();

        engine.run_tick().await;
        assert_eq!(engine.object_lock_count(), 0);

        for id in ids {
            engine.activate(id, "Alice").await;
        }
        assert_eq!(engine.object_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_load_scripts_skips_unknown_names() {
        let (store, engine) = engine_with(ScriptRegistry::builtin());
        let id = store.insert(
            WorldObject::new("Odd", "thing").with_scripts(&["chicken", "games.objects.missing"]),
        );
        store.insert(WorldObject::new("Plain", "rock"));

        let bindings = engine.load_scripts();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings["chicken"].len(), 1);
        assert_eq!(bindings["chicken"][0].object_id, id);
    }

    #[tokio::test]
    async fn test_reload_swaps_bindings() {
        let mut registry = ScriptRegistry::new();
        registry.register("chatter", Chatter);
        let (store, engine) = engine_with(registry);
        store.insert(WorldObject::new("Parrot", "parrot").with_scripts(&["chatter"]));
        assert_eq!(engine.reload(), 1);

        store.insert(WorldObject::new("Parrot 2", "parrot").with_scripts(&["chatter"]));
        assert_eq!(engine.run_tick().await.ran, 1);

        assert_eq!(engine.reload(), 2);
        assert_eq!(engine.run_tick().await.ran, 2);
        assert_eq!(engine.bindings()["chatter"].len(), 2);
    }

    #[tokio::test]
    async fn test_message_history_is_bounded_per_cycle() {
        let mut registry = ScriptRegistry::new();
        registry.register("chatter", Chatter);
        let (store, engine) = engine_with(registry);
        for i in 0..4 {
            store.insert(WorldObject::new(&format!("Parrot {}", i), "parrot").with_scripts(&["chatter"]));
        }
        store.post_message("Alice", "hello parrots", None, true);
        engine.reload();

        for _ in 0..5 {
            engine.run_tick().await;
        }

        let messages = store.messages();
        let scripted: Vec<_> = messages.iter().filter(|m| !m.player_generated).collect();
        assert_eq!(scripted.len(), 10);
        assert!(scripted.iter().all(|m| m.body != "tick 1" && m.body != "tick 2"));
        assert!(messages.iter().any(|m| m.player_generated));
    }

    #[tokio::test]
    async fn test_activate_collects_results() {
        let (store, engine) = engine_with(ScriptRegistry::builtin());
        let id = store.insert(
            WorldObject::new("Helper", "npc")
                .at(Vec3::ZERO)
                .with_scripts(&["linnea", "chicken", "greeter"]),
        );
        engine.reload();

        let results = engine.activate(id, "Groxnor").await;
        let outcomes: Vec<(String, ScriptOutcome)> = results
            .into_iter()
            .map(|r| (r.script, r.outcome))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                ("linnea".to_string(), ScriptOutcome::Activated),
                ("chicken".to_string(), ScriptOutcome::Ignored),
                ("greeter".to_string(), ScriptOutcome::Activated),
            ]
        );

        assert!(engine.activate(9_999, "Groxnor").await.is_empty());
    }

    #[test]
    fn test_builtin_registry_names() {
        let registry = ScriptRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec!["chatbot", "chicken", "greeter", "linnea"]
        );
        assert!(registry.create("chicken", 1).is_some());
        assert!(registry.create("unknown", 1).is_none());
    }
}
