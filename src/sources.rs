//! Contracts of the two remote collaborators. The HTTP adapters live in
//! `database_ops`; tests use in-memory fakes.

use crate::errors::SourceError;
use crate::streamers::model::{StreamEvent, StreamerProfile};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

/// Hard page size limit of the catalog listing endpoint.
pub const PAGE_MAX: usize = 500;

/// Inclusive id range `[low, high]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdRange {
    pub low: i64,
    pub high: i64,
}

impl IdRange {
    pub fn new(low: i64, high: i64) -> Self {
        debug_assert!(low <= high, "empty id range {low}..={high}");
        Self { low, high }
    }

    /// `high - low`; zero for a single-id range.
    pub fn span(&self) -> u64 {
        self.high.abs_diff(self.low)
    }

    /// Number of ids the range can hold.
    pub fn width(&self) -> u64 {
        self.span() + 1
    }

    pub fn contains(&self, id: i64) -> bool {
        self.low <= id && id <= self.high
    }

    /// Split at the midpoint into `[low, mid]` and `[mid + 1, high]`.
    /// Returns `None` for a single-id range.
    pub fn bisect(&self) -> Option<(IdRange, IdRange)> {
        if self.low >= self.high {
            return None;
        }
        let mid = self.low + ((self.high - self.low) / 2);
        Some((IdRange::new(self.low, mid), IdRange::new(mid + 1, self.high)))
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.low, self.high)
    }
}

/// One page of raw catalog payloads, ascending by id.
#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub records: Vec<Value>,
    pub has_more: bool,
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Smallest and largest id in the collection, `None` when empty.
    async fn id_bounds(&self) -> Result<Option<IdRange>, SourceError>;

    /// Records whose id falls in `range`, ascending, skipping `offset` of them.
    /// Implementations reject `offset` above their ceiling and `limit > PAGE_MAX`.
    async fn list_records(
        &self,
        range: IdRange,
        offset: usize,
        limit: usize,
    ) -> Result<RecordPage, SourceError>;

    /// Best catalog id for a game name, used to grow the identifier bridge.
    async fn search_by_name(&self, _name: &str) -> Result<Option<i64>, SourceError> {
        Ok(None)
    }
}

/// One page of stream or video events.
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<StreamEvent>,
    /// Payloads on this page that failed to parse.
    pub malformed: usize,
    pub next_cursor: Option<String>,
}

/// An entry of the streaming platform's game directory.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformGame {
    pub id: String,
    pub name: String,
    pub box_art_url: Option<String>,
}

#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Currently live streams. Eventually consistent: pages may repeat events.
    async fn list_live_events(&self, cursor: Option<&str>) -> Result<EventPage, SourceError>;

    /// Archived videos of one streamer, newest first.
    async fn list_videos(
        &self,
        streamer_id: i64,
        cursor: Option<&str>,
    ) -> Result<EventPage, SourceError>;

    /// Profiles for up to 100 streamer ids; unknown ids are omitted.
    async fn fetch_profiles(&self, ids: &[i64]) -> Result<Vec<StreamerProfile>, SourceError>;

    async fn follower_count(&self, streamer_id: i64) -> Result<u64, SourceError>;

    /// Game directory entries for up to 100 platform game ids.
    async fn fetch_games(&self, ids: &[String]) -> Result<Vec<PlatformGame>, SourceError>;
}
