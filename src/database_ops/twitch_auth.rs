//! App access tokens from the Twitch OAuth endpoint. IGDB and Helix both
//! accept the same client-credentials token.

use crate::errors::SourceError;
use crate::util::env::env_req;
use anyhow::Result;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const TWITCH_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";

/// Refresh this long before the advertised expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct TwitchCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for TwitchCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwitchCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .finish()
    }
}

impl TwitchCredentials {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            client_id: env_req("TWITCH_CLIENT_ID")?,
            client_secret: env_req("TWITCH_CLIENT_SECRET")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Cheap to clone; clones share the cached token.
#[derive(Debug, Clone)]
pub struct TokenCache {
    http: Client,
    credentials: TwitchCredentials,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl TokenCache {
    pub fn new(http: Client, credentials: TwitchCredentials) -> Self {
        Self {
            http,
            credentials,
            token: Arc::new(Mutex::new(None)),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.credentials.client_id
    }

    /// A valid bearer token, requesting a new one when missing or about to expire.
    pub async fn bearer(&self) -> Result<String, SourceError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.expires_at > Instant::now() + EXPIRY_MARGIN {
                return Ok(token.access_token.clone());
            }
        }
        let fresh = self.request_new_token().await?;
        let access_token = fresh.access_token.clone();
        *guard = Some(fresh);
        Ok(access_token)
    }

    /// Drop the cached token after the API answered 401.
    pub async fn invalidate(&self) {
        warn!(target = "twitch", "access token rejected; will re-authenticate");
        *self.token.lock().await = None;
    }

    async fn request_new_token(&self) -> Result<CachedToken, SourceError> {
        let response = self
            .http
            .post(TWITCH_TOKEN_URL)
            .query(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(SourceError::transient(format!("token endpoint status {status}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SourceError::Auth {
                message: format!("token request failed (status={status}): {text}"),
            });
        }
        let token: TokenResponse = response.json().await.map_err(|err| SourceError::Auth {
            message: format!("unreadable token response: {err}"),
        })?;
        let ttl = token.expires_in.max(EXPIRY_MARGIN.as_secs() * 2);
        debug!(target = "twitch", ttl_secs = ttl, "obtained app access token");
        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(ttl),
        })
    }
}
