use crate::database_ops::status_error;
use crate::database_ops::throttle::{RateLimitSettings, RequestThrottle};
use crate::database_ops::twitch_auth::TokenCache;
use crate::errors::SourceError;
use crate::sources::{CatalogSource, IdRange, RecordPage, PAGE_MAX};
use crate::util::env::{env_opt, env_parse};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

const IGDB_GAMES_ENDPOINT: &str = "https://api.igdb.com/v4/games";

/// Every column a catalog record is built from. Reference fields are expanded
/// to `{id, name}` so lookup tables fill as a side effect of the harvest.
const GAME_FIELDS: &str = "id,name,rating,total_rating,popularity,first_release_date,category,\
genres.name,keywords.name,themes.name,platforms.name,game_modes.name,\
player_perspectives.name,age_ratings.rating,collection.name,similar_games,\
time_to_beat,cover.url,cover.image_id";

#[derive(Debug, Clone)]
pub struct IgdbClientConfig {
    pub reqs_per_min: u32,
    /// Largest `offset` the endpoint accepts.
    pub offset_ceiling: usize,
    pub user_agent: String,
    pub request_timeout: Duration,
}

impl Default for IgdbClientConfig {
    fn default() -> Self {
        Self {
            reqs_per_min: 240,
            offset_ceiling: 5_000,
            user_agent: "stream-catalog/0.1".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl IgdbClientConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            reqs_per_min: env_parse("IGDB_REQS_PER_MIN", default.reqs_per_min),
            offset_ceiling: env_parse("CATALOG_OFFSET_CEILING", default.offset_ceiling),
            user_agent: env_opt("IGDB_USER_AGENT").unwrap_or(default.user_agent),
            request_timeout: Duration::from_secs(env_parse(
                "CATALOG_REQUEST_TIMEOUT_SECS",
                default.request_timeout.as_secs(),
            )),
        }
    }
}

fn bounds_query(ascending: bool) -> String {
    let order = if ascending { "asc" } else { "desc" };
    format!("fields id; sort id {order}; limit 1;")
}

fn range_query(range: IdRange, offset: usize, limit: usize) -> String {
    format!(
        "fields {GAME_FIELDS}; where id >= {} & id <= {}; sort id asc; limit {limit}; offset {offset};",
        range.low, range.high
    )
}

fn search_query(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
    format!("search \"{escaped}\"; fields id,name; limit 10;")
}

/// Prefer an exact (case-insensitive) title among search hits, else the first hit.
fn pick_search_hit(name: &str, hits: &[Value]) -> Option<i64> {
    let wanted = name.trim().to_lowercase();
    let exact = hits.iter().find(|hit| {
        hit.get("name")
            .and_then(Value::as_str)
            .is_some_and(|n| n.trim().to_lowercase() == wanted)
    });
    exact
        .or_else(|| hits.first())
        .and_then(|hit| hit.get("id"))
        .and_then(Value::as_i64)
}

/// Catalog source backed by the IGDB v4 `games` endpoint. Performs a single
/// attempt per call; retries belong to the harvester.
pub struct IgdbClient {
    cfg: IgdbClientConfig,
    http: Client,
    auth: TokenCache,
    throttle: RequestThrottle,
}

impl IgdbClient {
    pub fn new(cfg: IgdbClientConfig, auth: TokenCache) -> Result<Self> {
        let http = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .build()
            .context("failed to construct IGDB HTTP client")?;
        let throttle = RequestThrottle::new(RateLimitSettings::per_minute(cfg.reqs_per_min));
        Ok(Self {
            cfg,
            http,
            auth,
            throttle,
        })
    }

    /// POST an apicalypse body; returns the JSON rows and the `X-Count` total.
    async fn post_query(&self, body: String) -> Result<(Vec<Value>, Option<usize>), SourceError> {
        self.throttle.wait().await;
        let token = self.auth.bearer().await?;
        let response = self
            .http
            .post(IGDB_GAMES_ENDPOINT)
            .header("Client-ID", self.auth.client_id())
            .header("Content-Type", "text/plain")
            .header("Authorization", format!("Bearer {}", token))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.auth.invalidate().await;
            return Err(SourceError::transient("igdb rejected the access token"));
        }
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &headers, &text));
        }

        let total = response
            .headers()
            .get("x-count")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        let text = response.text().await?;
        let rows: Vec<Value> = serde_json::from_str(&text).map_err(|err| SourceError::Rejected {
            status: status.as_u16(),
            message: format!("failed to parse IGDB payload ({err})"),
        })?;
        Ok((rows, total))
    }

    async fn edge_id(&self, ascending: bool) -> Result<Option<i64>, SourceError> {
        let (rows, _) = self.post_query(bounds_query(ascending)).await?;
        Ok(rows.first().and_then(|row| row.get("id")).and_then(Value::as_i64))
    }
}

#[async_trait]
impl CatalogSource for IgdbClient {
    #[instrument(skip(self))]
    async fn id_bounds(&self) -> Result<Option<IdRange>, SourceError> {
        let low = self.edge_id(true).await?;
        let high = self.edge_id(false).await?;
        let bounds = match (low, high) {
            (Some(low), Some(high)) if low <= high => Some(IdRange::new(low, high)),
            _ => None,
        };
        debug!(target = "igdb", ?bounds, "catalog id bounds");
        Ok(bounds)
    }

    async fn list_records(
        &self,
        range: IdRange,
        offset: usize,
        limit: usize,
    ) -> Result<RecordPage, SourceError> {
        if limit > PAGE_MAX {
            return Err(SourceError::PageSizeExceeded {
                requested: limit,
                max: PAGE_MAX,
            });
        }
        if offset > self.cfg.offset_ceiling {
            return Err(SourceError::OffsetCeilingExceeded {
                offset,
                ceiling: self.cfg.offset_ceiling,
            });
        }
        let (records, total) = self.post_query(range_query(range, offset, limit)).await?;
        let has_more = match total {
            Some(total) => offset + records.len() < total,
            None => records.len() >= limit,
        };
        debug!(
            target = "igdb",
            %range,
            offset,
            got = records.len(),
            has_more,
            "listed catalog page"
        );
        Ok(RecordPage { records, has_more })
    }

    async fn search_by_name(&self, name: &str) -> Result<Option<i64>, SourceError> {
        if name.trim().is_empty() {
            return Ok(None);
        }
        let (hits, _) = self.post_query(search_query(name)).await?;
        Ok(pick_search_hit(name, &hits))
    }
}
