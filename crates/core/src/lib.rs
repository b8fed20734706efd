//! callpatch-core
//!
//! Core library for rewriting library call sites in already-analyzed binaries.
//!
//! The crate defines the IR (model), the host image and encoder seams
//! (services), concrete hosts for tests and ELF files (services::backends),
//! and the locate / resolve / patch pipeline (patch).
//!
//! All substantive logic lives here so it is fully testable and reusable from
//! multiple frontends (CLI, disassembler plugins, etc.).

pub mod config;
pub mod model;
pub mod patch;
pub mod services;

/// Returns the library version as encoded at compile time.
///
/// Useful for tests and for frontends to report consistent version info.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
