//! Ambient physics for physical objects
//!
//! The integrator keeps its own spatial simulation next to the store. Each
//! cycle it pulls in objects changed since the previous cycle, steps the
//! simulation a fixed number of sub-steps, and writes back only the objects
//! the simulation actually moved. A write-back is dropped if the stored
//! position changed after it was synced in, so the simulation never
//! overrides a move committed by the movement authority.

use crate::store::WorldStore;
use log::debug;
use shared::{get_timestamp, ObjectId, ObjectQuery, Vec3, WorldObject};
use std::collections::HashMap;
use std::sync::Arc;

pub const SUBSTEP_DT: f32 = 1.0 / 60.0;
pub const DEFAULT_SUBSTEPS: u32 = 10;
pub const BODY_MASS: f32 = 10.0;
pub const BODY_RADIUS: f32 = 0.5;
/// Fraction of velocity kept per second.
pub const DAMPING: f32 = 0.5;
/// Position changes smaller than this are not written back.
pub const SYNC_EPSILON: f32 = 1e-3;

/// Narrow contract the integrator needs from a physics backend.
pub trait SpatialSimulation: Send {
    /// Adds or refreshes bodies for the given objects.
    fn sync_in(&mut self, objects: &[WorldObject]);
    fn step(&mut self, dt: f32);
    /// Bodies whose position moved since they were last synced in or out.
    fn sync_out(&mut self) -> Vec<(ObjectId, Vec3)>;
}

/// A simulated sphere.
#[derive(Debug, Clone, Copy)]
pub struct Body {
    pub position: Vec3,
    pub velocity: Vec3,
    pub mass: f32,
    pub radius: f32,
    /// Position at the last sync, used to detect divergence.
    synced: Vec3,
}

impl Body {
    fn from_object(object: &WorldObject, position: Vec3) -> Self {
        let extent = object.scale.x.max(object.scale.y).max(object.scale.z).abs();
        Self {
            position,
            velocity: object.velocity,
            mass: BODY_MASS,
            radius: BODY_RADIUS * extent.max(0.1),
            synced: position,
        }
    }

    /// Integrates velocity with damping.
    pub fn simulate(&mut self, dt: f32) {
        self.velocity = self.velocity.scale(DAMPING.powf(dt));
        self.position = self.position.add(&self.velocity.scale(dt));
    }

    /// Pushes two overlapping spheres apart along the line between them,
    /// splitting the overlap by mass, and exchanges their velocity along it.
    pub fn resolve_collision(&mut self, other: &mut Body) -> bool {
        let delta = other.position.sub(&self.position);
        let distance = delta.magnitude();
        let min_distance = self.radius + other.radius;

        if distance >= min_distance {
            return false;
        }

        let normal = if distance < 1e-4 {
            Vec3::new(1.0, 0.0, 0.0)
        } else {
            delta.scale(1.0 / distance)
        };
        let overlap = min_distance - distance;
        let total_mass = self.mass + other.mass;

        self.position = self
            .position
            .sub(&normal.scale(overlap * other.mass / total_mass));
        other.position = other
            .position
            .add(&normal.scale(overlap * self.mass / total_mass));

        let along_self = dot(&self.velocity, &normal);
        let along_other = dot(&other.velocity, &normal);
        if along_self - along_other > 0.0 {
            self.velocity = self
                .velocity
                .add(&normal.scale(along_other - along_self));
            other.velocity = other
                .velocity
                .add(&normal.scale(along_self - along_other));
        }
        true
    }
}

fn dot(a: &Vec3, b: &Vec3) -> f32 {
    a.x * b.x + a.y * b.y + a.z * b.z
}

/// Zero-gravity space of spheres.
#[derive(Debug, Default)]
pub struct SphereSpace {
    bodies: HashMap<ObjectId, Body>,
}

impl SphereSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(&self, id: ObjectId) -> Option<&Body> {
        self.bodies.get(&id)
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    fn handle_collisions(&mut self) {
        let mut ids: Vec<ObjectId> = self.bodies.keys().copied().collect();
        ids.sort_unstable();

        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                if let (Some(mut a), Some(mut b)) =
                    (self.bodies.get(&ids[i]).copied(), self.bodies.get(&ids[j]).copied())
                {
                    if a.resolve_collision(&mut b) {
                        self.bodies.insert(ids[i], a);
                        self.bodies.insert(ids[j], b);
                    }
                }
            }
        }
    }
}

impl SpatialSimulation for SphereSpace {
    fn sync_in(&mut self, objects: &[WorldObject]) {
        for object in objects {
            if !object.physical {
                self.bodies.remove(&object.id);
                continue;
            }
            let Some(position) = object.position else {
                self.bodies.remove(&object.id);
                continue;
            };
            // Our own write-backs come round again; keep the body's momentum.
            if let Some(body) = self.bodies.get(&object.id) {
                if body.synced == position {
                    continue;
                }
            }
            self.bodies
                .insert(object.id, Body::from_object(object, position));
        }
    }

    fn step(&mut self, dt: f32) {
        for body in self.bodies.values_mut() {
            body.simulate(dt);
        }
        self.handle_collisions();
    }

    fn sync_out(&mut self) -> Vec<(ObjectId, Vec3)> {
        let mut changed = Vec::new();
        for (id, body) in self.bodies.iter_mut() {
            if body.position.manhattan_distance(&body.synced) > SYNC_EPSILON {
                body.synced = body.position;
                changed.push((*id, body.position));
            }
        }
        changed.sort_by_key(|(id, _)| *id);
        changed
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PhysicsReport {
    pub synced_in: usize,
    pub written_back: usize,
    /// Write-backs dropped because the object moved meanwhile.
    pub superseded: usize,
}

pub struct PhysicsIntegrator<S: SpatialSimulation> {
    store: Arc<WorldStore>,
    simulation: S,
    substeps: u32,
    last_sync: Option<u64>,
    /// Position each body was synced in from, per object.
    baseline: HashMap<ObjectId, Vec3>,
}

impl<S: SpatialSimulation> PhysicsIntegrator<S> {
    pub fn new(store: Arc<WorldStore>, simulation: S, substeps: u32) -> Self {
        Self {
            store,
            simulation,
            substeps: substeps.max(1),
            last_sync: None,
            baseline: HashMap::new(),
        }
    }

    pub fn simulation(&self) -> &S {
        &self.simulation
    }

    pub fn run_cycle(&mut self) -> PhysicsReport {
        let mut report = PhysicsReport::default();

        // Sync in everything changed since the previous cycle began.
        let started = get_timestamp();
        let mut query = ObjectQuery::all();
        if let Some(since) = self.last_sync {
            query = query.since(since);
        }
        let changed = self.store.find(&query);
        for object in &changed {
            match object.position {
                Some(position) if object.physical => {
                    self.baseline.insert(object.id, position);
                }
                _ => {
                    self.baseline.remove(&object.id);
                }
            }
        }
        self.simulation.sync_in(&changed);
        report.synced_in = changed.len();
        self.last_sync = Some(started);

        for _ in 0..self.substeps {
            self.simulation.step(SUBSTEP_DT);
        }

        for (id, simulated) in self.simulation.sync_out() {
            let Some(baseline) = self.baseline.get(&id).copied() else {
                continue;
            };

            let applied = self.store.update(id, |object| {
                if object.position != Some(baseline) {
                    return false;
                }
                object.position = Some(simulated);
                object.touch();
                true
            });

            match applied {
                Some(true) => {
                    self.baseline.insert(id, simulated);
                    report.written_back += 1;
                }
                Some(false) => report.superseded += 1,
                None => {
                    self.baseline.remove(&id);
                }
            }
        }

        if report.written_back > 0 || report.superseded > 0 {
            debug!(
                "Physics: {} synced in, {} settled, {} superseded",
                report.synced_in, report.written_back, report.superseded
            );
        }
        report
    }
}
