use std::sync::Arc;

use anyhow::{Context, Result};
use tau_dispatch::{DispatchEvent, DispatchEventSink};
use tau_provider::{AuthProfileResolver, HttpOAuthRefresher};
use tau_session::{SessionIndexStore, SessionJournalStore};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::gateway_config::{GatewayConfig, GatewayPaths};

pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

pub(crate) fn build_credential_resolver(
    config: &GatewayConfig,
    paths: &GatewayPaths,
) -> Result<AuthProfileResolver> {
    let mut resolver = AuthProfileResolver::new(&paths.auth_store)
        .with_cooldown_policy(config.auth.cooldown);
    if let Some(parent) = &paths.parent_auth_store {
        resolver = resolver.with_parent_store(parent);
    }
    if !config.auth.oauth.endpoints.is_empty() {
        let refresher = HttpOAuthRefresher::new(&config.auth.oauth)
            .context("failed to build oauth refresh client")?;
        resolver = resolver.with_refresher(Arc::new(refresher));
    }
    Ok(resolver)
}

pub(crate) fn build_session_stores(paths: &GatewayPaths) -> (SessionJournalStore, SessionIndexStore) {
    (
        SessionJournalStore::new(&paths.sessions_dir),
        SessionIndexStore::new(&paths.session_index),
    )
}

/// Event sink that renders each dispatch event as one JSON line on stdout.
pub(crate) fn json_lines_event_sink() -> DispatchEventSink {
    Arc::new(|event: &DispatchEvent| match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(error) => tracing::warn!("failed to render dispatch event: {error}"),
    })
}
