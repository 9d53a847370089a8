//! Context budget governance for Tau gateway sessions.
//!
//! Estimates token cost of journal history, prunes the oldest chunks to fit
//! a share of the context window, decides when a pre-compaction memory flush
//! turn is due, enforces the reserve-token floor, and tracks prompt-cache TTL
//! markers for providers that expire cached prefixes.

mod cache_ttl;
mod context_budget;
mod history_pruning;
mod memory_flush;
mod reserve_floor;
mod token_estimate;

pub use cache_ttl::*;
pub use context_budget::*;
pub use history_pruning::*;
pub use memory_flush::*;
pub use reserve_floor::*;
pub use token_estimate::*;
