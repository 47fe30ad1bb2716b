//! # Zone Worker Library
//!
//! One worker process runs exactly one zone: a region of the world identified
//! by `(instance type, zone name, owner)`. The worker owns the zone's objects
//! and is the only party allowed to change them. The master server starts
//! workers on demand and finds them again through its instance registry.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! All objects of the zone live in the [`store::WorldStore`]. Requests coming
//! in over the network never write to it directly; they go through the
//! [`movement::MovementAuthority`] (positions, online/offline status) or the
//! [`scripts::ScriptEngine`] (activation).
//!
//! ### Simulation
//! A fixed-rate tick loop ([`scheduler::TickScheduler`]) drives the zone. Each
//! tick runs every bound behavior script, then one physics cycle
//! ([`physics::PhysicsIntegrator`]). When the worker falls behind it catches
//! up a bounded number of ticks and drops the rest.
//!
//! ### Request Handling
//! Requests arrive as bincode-encoded `shared::Packet` datagrams. Each one is
//! answered on its own task, independent of the tick loop, so a slow tick does
//! not delay a move request.
//!
//! ## Module Organization
//!
//! - `store`: objects, temporal queries and the zone's message history
//! - `movement`: collision-checked moves, status changes, lazy characters
//! - `scripts`: the script registry, per-object bindings and built-in behaviors
//! - `physics`: the spatial simulation seam and its sphere implementation
//! - `scheduler`: frame accounting and the tick loop
//! - `templates`: the objects a zone starts with
//! - `zone`: the aggregate tying the above together, request dispatch
//! - `network`: the UDP socket, receiver task and worker lifecycle
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::ZoneWorker;
//! use server::scripts::ScriptRegistry;
//! use server::zone::WorkerConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let zone_id = "playerinstance-GhibliHills-alice".parse()?;
//!     let config = WorkerConfig::new(zone_id, "127.0.0.1", 1300);
//!
//!     let worker = ZoneWorker::bind(config, ScriptRegistry::builtin()).await?;
//!     worker.run().await;
//!
//!     Ok(())
//! }
//! ```

pub mod movement;
pub mod network;
pub mod physics;
pub mod scheduler;
pub mod scripts;
pub mod store;
pub mod templates;
pub mod zone;
