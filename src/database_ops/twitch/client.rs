use crate::database_ops::status_error;
use crate::database_ops::throttle::{RateLimitSettings, RequestThrottle};
use crate::database_ops::twitch_auth::TokenCache;
use crate::errors::{MalformedRecord, SourceError};
use crate::sources::{EventPage, PlatformGame, StreamSource};
use crate::streamers::model::{StreamEvent, StreamerProfile};
use crate::util::env::env_parse;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const HELIX_BASE: &str = "https://api.twitch.tv/helix";
/// Helix caps `first` and repeated `id` parameters at 100.
pub const HELIX_MAX_BATCH: usize = 100;
const BOX_ART_SIZE: &str = "285x380";

#[derive(Debug, Clone)]
pub struct TwitchClientConfig {
    pub reqs_per_min: u32,
    pub page_size: usize,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub request_timeout: Duration,
}

impl Default for TwitchClientConfig {
    fn default() -> Self {
        Self {
            reqs_per_min: 800,
            page_size: HELIX_MAX_BATCH,
            max_retries: 3,
            backoff_ms: 1000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl TwitchClientConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            reqs_per_min: env_parse("TWITCH_REQS_PER_MIN", default.reqs_per_min),
            page_size: env_parse("TWITCH_PAGE_SIZE", default.page_size).clamp(1, HELIX_MAX_BATCH),
            max_retries: env_parse("TWITCH_MAX_RETRIES", default.max_retries),
            backoff_ms: env_parse("TWITCH_BACKOFF_MS", default.backoff_ms),
            request_timeout: default.request_timeout,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixEnvelope {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    pagination: Option<Pagination>,
    #[serde(default)]
    total: Option<u64>,
}

impl HelixEnvelope {
    fn cursor(&self) -> Option<String> {
        self.pagination
            .as_ref()
            .and_then(|p| p.cursor.clone())
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct HelixStream {
    id: String,
    user_id: String,
    #[serde(default)]
    game_id: Option<String>,
    #[serde(default)]
    game_name: Option<String>,
    #[serde(default)]
    language: Option<String>,
    started_at: DateTime<Utc>,
    #[serde(default)]
    viewer_count: u64,
}

#[derive(Debug, Deserialize)]
struct HelixVideo {
    id: String,
    user_id: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
    id: String,
    login: String,
    display_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    profile_image_url: Option<String>,
    #[serde(default)]
    view_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct HelixGame {
    id: String,
    name: String,
    #[serde(default)]
    box_art_url: Option<String>,
}

fn decode<T: DeserializeOwned>(kind: &'static str, raw: Value) -> Result<T, MalformedRecord> {
    let hint = raw.get("id").cloned().unwrap_or(Value::Null);
    serde_json::from_value(raw).map_err(|err| MalformedRecord::new(kind, format!("id={hint}: {err}")))
}

fn parse_user_id(kind: &'static str, raw: &str) -> Result<i64, MalformedRecord> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| MalformedRecord::new(kind, format!("non-numeric user id '{raw}'")))
}

fn stream_event(raw: Value) -> Result<StreamEvent, MalformedRecord> {
    let s: HelixStream = decode("stream", raw)?;
    let streamer_id = parse_user_id("stream", &s.user_id)?;
    Ok(StreamEvent::live(s.id, streamer_id, s.started_at, s.viewer_count)
        .with_game(s.game_id.as_deref(), s.game_name.as_deref())
        .with_language(s.language.as_deref()))
}

fn video_event(raw: Value) -> Result<StreamEvent, MalformedRecord> {
    let v: HelixVideo = decode("video", raw)?;
    let streamer_id = parse_user_id("video", &v.user_id)?;
    Ok(StreamEvent::video(v.id, streamer_id, v.created_at).with_language(v.language.as_deref()))
}

fn profile(raw: Value) -> Result<StreamerProfile, MalformedRecord> {
    let u: HelixUser = decode("user", raw)?;
    Ok(StreamerProfile {
        id: parse_user_id("user", &u.id)?,
        login: u.login,
        display_name: u.display_name,
        profile_image_url: u.profile_image_url.filter(|s| !s.is_empty()),
        total_views: u.view_count.unwrap_or(0),
        description: u.description.filter(|s| !s.trim().is_empty()),
    })
}

/// Fill Twitch's `{width}x{height}` box-art template.
pub fn sized_box_art(template: &str) -> String {
    template.replace("{width}x{height}", BOX_ART_SIZE)
}

fn platform_game(raw: Value) -> Result<PlatformGame, MalformedRecord> {
    let g: HelixGame = decode("game", raw)?;
    Ok(PlatformGame {
        id: g.id,
        name: g.name,
        box_art_url: g.box_art_url.filter(|s| !s.is_empty()).map(|s| sized_box_art(&s)),
    })
}

/// Parse every row, logging and counting the ones that fail.
fn parse_rows<T>(
    rows: Vec<Value>,
    parse: fn(Value) -> Result<T, MalformedRecord>,
) -> (Vec<T>, usize) {
    let mut parsed = Vec::with_capacity(rows.len());
    let mut malformed = 0usize;
    for row in rows {
        match parse(row) {
            Ok(item) => parsed.push(item),
            Err(err) => {
                warn!(target = "twitch", error = %err, "skipping malformed payload");
                malformed += 1;
            }
        }
    }
    (parsed, malformed)
}

/// Twitch Helix adapter. Retries transient failures and 429s itself.
pub struct HelixClient {
    cfg: TwitchClientConfig,
    http: Client,
    auth: TokenCache,
    throttle: RequestThrottle,
}

impl HelixClient {
    pub fn new(cfg: TwitchClientConfig, auth: TokenCache) -> Result<Self> {
        let http = Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .context("failed to construct Twitch HTTP client")?;
        let throttle = RequestThrottle::new(RateLimitSettings::per_minute(cfg.reqs_per_min));
        Ok(Self {
            cfg,
            http,
            auth,
            throttle,
        })
    }

    async fn get_once(&self, path: &str, query: &[(&str, String)]) -> Result<HelixEnvelope, SourceError> {
        self.throttle.wait().await;
        let token = self.auth.bearer().await?;
        let response = self
            .http
            .get(format!("{HELIX_BASE}/{path}"))
            .header("Client-ID", self.auth.client_id())
            .header("Authorization", format!("Bearer {}", token))
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.auth.invalidate().await;
            return Err(SourceError::transient("helix rejected the access token"));
        }
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &headers, &text));
        }
        response.json::<HelixEnvelope>().await.map_err(|err| SourceError::Rejected {
            status: status.as_u16(),
            message: format!("unreadable helix envelope: {err}"),
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<HelixEnvelope, SourceError> {
        let mut attempt = 0u32;
        loop {
            match self.get_once(path, query).await {
                Ok(envelope) => return Ok(envelope),
                Err(err) if err.is_retryable() && attempt < self.cfg.max_retries => {
                    let wait = err
                        .retry_after()
                        .unwrap_or_else(|| Duration::from_millis(self.cfg.backoff_ms * (attempt as u64 + 1)));
                    debug!(target = "twitch", path, attempt, error = %err, "retrying helix request");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn page_query(&self, cursor: Option<&str>) -> Vec<(&'static str, String)> {
        let mut query = vec![("first", self.cfg.page_size.to_string())];
        if let Some(cursor) = cursor {
            query.push(("after", cursor.to_string()));
        }
        query
    }
}

#[async_trait]
impl StreamSource for HelixClient {
    async fn list_live_events(&self, cursor: Option<&str>) -> Result<EventPage, SourceError> {
        let envelope = self.get("streams", &self.page_query(cursor)).await?;
        let next_cursor = envelope.cursor();
        let (events, malformed) = parse_rows(envelope.data, stream_event);
        Ok(EventPage {
            events,
            malformed,
            next_cursor,
        })
    }

    async fn list_videos(
        &self,
        streamer_id: i64,
        cursor: Option<&str>,
    ) -> Result<EventPage, SourceError> {
        let mut query = self.page_query(cursor);
        query.push(("user_id", streamer_id.to_string()));
        query.push(("type", "archive".to_string()));
        let envelope = self.get("videos", &query).await?;
        let next_cursor = envelope.cursor();
        let (events, malformed) = parse_rows(envelope.data, video_event);
        Ok(EventPage {
            events,
            malformed,
            next_cursor,
        })
    }

    async fn fetch_profiles(&self, ids: &[i64]) -> Result<Vec<StreamerProfile>, SourceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let query: Vec<(&str, String)> = ids
            .iter()
            .take(HELIX_MAX_BATCH)
            .map(|id| ("id", id.to_string()))
            .collect();
        let envelope = self.get("users", &query).await?;
        Ok(parse_rows(envelope.data, profile).0)
    }

    async fn follower_count(&self, streamer_id: i64) -> Result<u64, SourceError> {
        let query = [
            ("broadcaster_id", streamer_id.to_string()),
            ("first", "1".to_string()),
        ];
        let envelope = self.get("channels/followers", &query).await?;
        envelope.total.ok_or_else(|| SourceError::Rejected {
            status: 200,
            message: format!("follower response for {streamer_id} has no total"),
        })
    }

    async fn fetch_games(&self, ids: &[String]) -> Result<Vec<PlatformGame>, SourceError> {
        let query: Vec<(&str, String)> = ids
            .iter()
            .filter(|id| !id.trim().is_empty())
            .take(HELIX_MAX_BATCH)
            .map(|id| ("id", id.clone()))
            .collect();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let envelope = self.get("games", &query).await?;
        Ok(parse_rows(envelope.data, platform_game).0)
    }
}
