//! # Master Zone Server Library
//!
//! Keeps track of which zone worker serves which zone and starts workers on
//! demand. A caller asks for a zone id such as
//! `playerinstance-GhibliHills-alice` and gets back the `host:port` of a
//! worker that has just answered a liveness probe.
//!
//! ## Module Organization
//!
//! - `config`: launcher settings and their validation
//! - `registry`: zone id to endpoint map, optionally persisted as JSON
//! - `supervisor`: starting and stopping worker processes
//! - `probe`: the liveness probe and a request/response client for workers
//! - `launcher`: resolve, single-flight launching and the periodic sweep
//! - `directory`: authentication and character ownership collaborators
//! - `network`: the UDP service answering zone lookups

pub mod config;
pub mod directory;
pub mod launcher;
pub mod network;
pub mod probe;
pub mod registry;
pub mod supervisor;
