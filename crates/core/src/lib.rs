//! bootscope-core
//!
//! Static recovery of UEFI Boot Services calls and the protocol GUIDs passed
//! to them, from a disassembled firmware module.
//!
//! This crate defines the data model, the service tables and GUID databases,
//! the disassembly facade with its backends, the analysis stages, annotation
//! planning, reporting and the run-history database.
//!
//! All substantive logic lives here so it is fully testable and reusable from
//! multiple frontends.

pub mod model;
pub mod tables;
pub mod config;
pub mod guids;
pub mod facade;
pub mod header;
pub mod analysis;
pub mod annotate;
pub mod report;
pub mod db;
pub mod backends;

/// Returns the library version as encoded at compile time.
///
/// Useful for tests and for frontends to report consistent version info.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
