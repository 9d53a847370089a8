//! Sandbox policy resolution for Tau gateway agent runs.
//!
//! Layers agent-specific, global, and built-in sandbox settings into one
//! `SandboxContext` with per-field provenance, and derives a stable config
//! hash that keys any cached execution environment.

mod config_hash;
mod sandbox_config;
mod sandbox_policy;

pub use config_hash::{compute_config_hash, normalize_for_hash};
pub use sandbox_config::*;
pub use sandbox_policy::*;
