//! Simulated beamline device server.
//!
//! This crate serves a registry of named, bounded process variables and
//! a handful of motion-controlled axes over a colon-delimited line
//! protocol on TCP. Sensor PVs evolve on a fixed simulation tick (noisy
//! ring current, log-normal vacuum pressure, drifting hutch temperature,
//! detectors proportional to the ring current); motors sweep their
//! readbacks linearly toward commanded targets. Clients read and write
//! PVs, command moves, discover the namespace with glob patterns, and
//! subscribe to periodic value pushes.
//!
//! The intended deployment is the `beamsim` binary, but the server can
//! be embedded directly:
//!
//! ```no_run
//! use beamsim::{ServerBuilder, catalog};
//!
//! # async fn run() -> std::io::Result<()> {
//! let mut server = ServerBuilder::new(catalog::beamline()).port(5064).start().await?;
//! server.join().await
//! # }
//! ```

pub mod catalog;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod utils;

pub use registry::Registry;
pub use server::{ServerBuilder, ServerHandle};
