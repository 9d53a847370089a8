//! Credential rotation and resilience for Tau gateway agent runs.
//!
//! Includes the per-scope auth profile store, reason-specific cooldowns,
//! OAuth refresh against provider token endpoints, and the resolver that
//! rotates profiles and falls back to the parent scope when a refresh fails.

mod auth_profile_store;
mod cooldown_policy;
mod credential_resolver;
mod oauth_refresh;
mod types;

pub use auth_profile_store::*;
pub use cooldown_policy::CooldownPolicy;
pub use credential_resolver::*;
pub use oauth_refresh::*;
pub use types::*;
