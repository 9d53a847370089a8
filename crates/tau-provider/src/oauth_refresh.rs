//! OAuth refresh-token exchange against provider token endpoints.
use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::auth_profile_store::normalize_provider_id;
use crate::types::OAuthRefreshError;

const DEFAULT_REFRESH_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Tokens returned by a successful refresh.
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in_secs: Option<u64>,
}

#[async_trait]
/// Trait contract for `OAuthRefresher` behavior.
pub trait OAuthRefresher: Send + Sync {
    async fn refresh(
        &self,
        provider: &str,
        refresh_token: &str,
    ) -> Result<OAuthTokens, OAuthRefreshError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Token endpoint for one provider.
pub struct OAuthEndpointConfig {
    pub token_url: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct OAuthRefreshConfig {
    pub timeout_ms: u64,
    pub endpoints: BTreeMap<String, OAuthEndpointConfig>,
}

impl Default for OAuthRefreshConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_REFRESH_TIMEOUT_MS,
            endpoints: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Form-encoded `refresh_token` grant over `reqwest`.
pub struct HttpOAuthRefresher {
    client: reqwest::Client,
    endpoints: BTreeMap<String, OAuthEndpointConfig>,
}

impl HttpOAuthRefresher {
    pub fn new(config: &OAuthRefreshConfig) -> Result<Self, OAuthRefreshError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .map_err(|error| OAuthRefreshError::Transport(error.to_string()))?;
        let endpoints = config
            .endpoints
            .iter()
            .map(|(provider, endpoint)| (normalize_provider_id(provider), endpoint.clone()))
            .collect();
        Ok(Self { client, endpoints })
    }
}

#[async_trait]
impl OAuthRefresher for HttpOAuthRefresher {
    async fn refresh(
        &self,
        provider: &str,
        refresh_token: &str,
    ) -> Result<OAuthTokens, OAuthRefreshError> {
        let endpoint = self
            .endpoints
            .get(&normalize_provider_id(provider))
            .ok_or_else(|| OAuthRefreshError::UnknownProvider(provider.to_string()))?;

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", endpoint.client_id.as_str()),
        ];
        if let Some(secret) = endpoint.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        tracing::debug!(provider, token_url = %endpoint.token_url, "refreshing oauth token");
        let response = self
            .client
            .post(&endpoint.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|error| OAuthRefreshError::Transport(error.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| OAuthRefreshError::Transport(error.to_string()))?;

        if !status.is_success() {
            if let Ok(parsed) = serde_json::from_str::<TokenErrorResponse>(&body) {
                if parsed.error == "invalid_grant" {
                    return Err(OAuthRefreshError::InvalidGrant(
                        parsed.error_description.unwrap_or(parsed.error),
                    ));
                }
            }
            return Err(OAuthRefreshError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|error| OAuthRefreshError::MalformedResponse(error.to_string()))?;
        let access_token = parsed
            .access_token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                OAuthRefreshError::MalformedResponse("missing access_token".to_string())
            })?;
        Ok(OAuthTokens {
            access_token,
            refresh_token: parsed
                .refresh_token
                .filter(|token| !token.trim().is_empty()),
            expires_in_secs: parsed.expires_in,
        })
    }
}
