use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `AuthFailureReason` values.
pub enum AuthFailureReason {
    Auth,
    Format,
    RateLimit,
    Billing,
    Timeout,
    Unknown,
}

impl AuthFailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthFailureReason::Auth => "auth",
            AuthFailureReason::Format => "format",
            AuthFailureReason::RateLimit => "rate_limit",
            AuthFailureReason::Billing => "billing",
            AuthFailureReason::Timeout => "timeout",
            AuthFailureReason::Unknown => "unknown",
        }
    }

    /// Failures worth retrying silently once the cooldown has passed.
    pub fn is_retryable(self) -> bool {
        matches!(self, AuthFailureReason::RateLimit | AuthFailureReason::Timeout)
    }

    /// Maps an HTTP status from a provider to a failure reason.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => AuthFailureReason::Auth,
            402 => AuthFailureReason::Billing,
            408 | 504 => AuthFailureReason::Timeout,
            429 => AuthFailureReason::RateLimit,
            400 | 422 => AuthFailureReason::Format,
            _ => AuthFailureReason::Unknown,
        }
    }
}

impl std::fmt::Display for AuthFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
/// Enumerates supported `CredentialError` values.
pub enum CredentialError {
    #[error("auth profile '{profile_id}' not found")]
    ProfileMissing { profile_id: String },
    #[error("token for auth profile '{profile_id}' ({provider}) has expired; re-authenticate")]
    StaticTokenExpired {
        profile_id: String,
        provider: String,
    },
    #[error("OAuth token refresh failed for {provider}: {message}")]
    TokenRefreshFailed {
        provider: String,
        profile_id: String,
        message: String,
    },
    #[error("no available auth profile for provider '{provider}'{}", describe_retry(.reason, .retry_at_ms))]
    NoAvailableProfile {
        provider: String,
        reason: Option<AuthFailureReason>,
        retry_at_ms: Option<u64>,
    },
    #[error("credential store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl CredentialError {
    pub fn reason(&self) -> AuthFailureReason {
        match self {
            CredentialError::ProfileMissing { .. }
            | CredentialError::StaticTokenExpired { .. }
            | CredentialError::TokenRefreshFailed { .. } => AuthFailureReason::Auth,
            CredentialError::NoAvailableProfile { reason, .. } => {
                reason.unwrap_or(AuthFailureReason::Auth)
            }
            CredentialError::Store(_) => AuthFailureReason::Unknown,
        }
    }
}

fn describe_retry(reason: &Option<AuthFailureReason>, retry_at_ms: &Option<u64>) -> String {
    match (reason, retry_at_ms) {
        (Some(reason), Some(at)) => format!(" (all profiles cooling down, soonest {reason} until {at})"),
        (Some(reason), None) => format!(" ({reason})"),
        _ => String::new(),
    }
}

#[derive(Debug, Error)]
/// Enumerates supported `OAuthRefreshError` values.
pub enum OAuthRefreshError {
    #[error("no OAuth token endpoint configured for provider '{0}'")]
    UnknownProvider(String),
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),
    #[error("token endpoint returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("token endpoint request failed: {0}")]
    Transport(String),
    #[error("malformed token endpoint response: {0}")]
    MalformedResponse(String),
}
