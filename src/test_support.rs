//! In-memory sources for tests.

use crate::errors::SourceError;
use crate::sources::{
    CatalogSource, EventPage, IdRange, PlatformGame, RecordPage, StreamSource, PAGE_MAX,
};
use crate::streamers::model::{StreamEvent, StreamerProfile};
use crate::util::cancel::CancelFlag;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Catalog that behaves like the remote listing endpoint: ascending pages,
/// a hard page maximum and an offset ceiling.
pub struct FakeCatalog {
    ids: Vec<i64>,
    ceiling: usize,
    names: HashMap<String, i64>,
    flaky_calls: usize,
    dead_range: Option<IdRange>,
    malformed: Option<fn(i64) -> bool>,
    cancel_after: Option<(usize, CancelFlag)>,
    list_calls: AtomicUsize,
    rejected: AtomicUsize,
    max_offset: AtomicUsize,
}

impl FakeCatalog {
    pub fn with_ids(ids: Vec<i64>, ceiling: usize) -> Self {
        let ids: BTreeSet<i64> = ids.into_iter().collect();
        Self {
            ids: ids.into_iter().collect(),
            ceiling,
            names: HashMap::new(),
            flaky_calls: 0,
            dead_range: None,
            malformed: None,
            cancel_after: None,
            list_calls: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            max_offset: AtomicUsize::new(0),
        }
    }

    pub fn dense(ids: RangeInclusive<i64>, ceiling: usize) -> Self {
        Self::with_ids(ids.collect(), ceiling)
    }

    /// The first `n` list requests fail transiently.
    pub fn with_flaky_calls(mut self, n: usize) -> Self {
        self.flaky_calls = n;
        self
    }

    /// Requests confined to `range` always fail.
    pub fn with_dead_range(mut self, range: IdRange) -> Self {
        self.dead_range = Some(range);
        self
    }

    /// Ids matching `pred` are served without a name.
    pub fn with_malformed(mut self, pred: fn(i64) -> bool) -> Self {
        self.malformed = Some(pred);
        self
    }

    /// Trip `flag` once `n` list requests have been served.
    pub fn cancel_after(mut self, n: usize, flag: CancelFlag) -> Self {
        self.cancel_after = Some((n, flag));
        self
    }

    pub fn with_name(mut self, name: &str, id: i64) -> Self {
        self.names.insert(name.to_lowercase(), id);
        self
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn max_offset_seen(&self) -> usize {
        self.max_offset.load(Ordering::SeqCst)
    }

    fn payload(&self, id: i64) -> Value {
        if self.malformed.is_some_and(|pred| pred(id)) {
            return json!({ "id": id });
        }
        let genre = id % 5 + 1;
        json!({
            "id": id,
            "name": format!("Game {id}"),
            "genres": [{ "id": genre, "name": format!("Genre {genre}") }],
            "platforms": [6],
        })
    }
}

#[async_trait]
impl CatalogSource for FakeCatalog {
    async fn id_bounds(&self) -> Result<Option<IdRange>, SourceError> {
        Ok(match (self.ids.first(), self.ids.last()) {
            (Some(low), Some(high)) => Some(IdRange::new(*low, *high)),
            _ => None,
        })
    }

    async fn list_records(
        &self,
        range: IdRange,
        offset: usize,
        limit: usize,
    ) -> Result<RecordPage, SourceError> {
        let call = self.list_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if limit > PAGE_MAX {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(SourceError::PageSizeExceeded {
                requested: limit,
                max: PAGE_MAX,
            });
        }
        if offset > self.ceiling {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(SourceError::OffsetCeilingExceeded {
                offset,
                ceiling: self.ceiling,
            });
        }
        if call <= self.flaky_calls {
            return Err(SourceError::transient("connection reset"));
        }
        if let Some(dead) = self.dead_range {
            if dead.contains(range.low) && dead.contains(range.high) {
                return Err(SourceError::transient("upstream unavailable"));
            }
        }
        self.max_offset.fetch_max(offset, Ordering::SeqCst);

        let in_range: Vec<i64> = self
            .ids
            .iter()
            .copied()
            .filter(|id| range.contains(*id))
            .collect();
        let records: Vec<Value> = in_range
            .iter()
            .skip(offset)
            .take(limit)
            .map(|id| self.payload(*id))
            .collect();
        let has_more = offset + records.len() < in_range.len();

        if let Some((n, flag)) = &self.cancel_after {
            if call >= *n {
                flag.cancel();
            }
        }
        Ok(RecordPage { records, has_more })
    }

    async fn search_by_name(&self, name: &str) -> Result<Option<i64>, SourceError> {
        Ok(self.names.get(&name.to_lowercase()).copied())
    }
}

/// Streaming platform backed by fixed pages and maps.
#[derive(Default)]
pub struct FakeStreams {
    pub live_pages: Vec<EventPage>,
    pub videos: HashMap<i64, Vec<StreamEvent>>,
    pub profiles: HashMap<i64, StreamerProfile>,
    pub followers: HashMap<i64, u64>,
    pub games: HashMap<String, PlatformGame>,
    /// Video pages are cut to this many events.
    pub video_page_size: usize,
    pub profile_batches: Mutex<Vec<usize>>,
}

impl FakeStreams {
    pub fn new() -> Self {
        Self {
            video_page_size: 2,
            ..Default::default()
        }
    }
}

fn cursor_index(cursor: Option<&str>) -> Result<usize, SourceError> {
    match cursor {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| SourceError::Rejected {
            status: 400,
            message: format!("bad cursor {raw}"),
        }),
    }
}

#[async_trait]
impl StreamSource for FakeStreams {
    async fn list_live_events(&self, cursor: Option<&str>) -> Result<EventPage, SourceError> {
        let idx = cursor_index(cursor)?;
        Ok(self.live_pages.get(idx).cloned().unwrap_or_default())
    }

    async fn list_videos(
        &self,
        streamer_id: i64,
        cursor: Option<&str>,
    ) -> Result<EventPage, SourceError> {
        let start = cursor_index(cursor)?;
        let all = self.videos.get(&streamer_id).cloned().unwrap_or_default();
        let size = self.video_page_size.max(1);
        let events: Vec<StreamEvent> = all.iter().skip(start).take(size).cloned().collect();
        let next = start + events.len();
        Ok(EventPage {
            events,
            malformed: 0,
            next_cursor: (next < all.len()).then(|| next.to_string()),
        })
    }

    async fn fetch_profiles(&self, ids: &[i64]) -> Result<Vec<StreamerProfile>, SourceError> {
        if let Ok(mut batches) = self.profile_batches.lock() {
            batches.push(ids.len());
        }
        Ok(ids
            .iter()
            .filter_map(|id| self.profiles.get(id).cloned())
            .collect())
    }

    async fn follower_count(&self, streamer_id: i64) -> Result<u64, SourceError> {
        self.followers
            .get(&streamer_id)
            .copied()
            .ok_or_else(|| SourceError::Rejected {
                status: 404,
                message: format!("no user {streamer_id}"),
            })
    }

    async fn fetch_games(&self, ids: &[String]) -> Result<Vec<PlatformGame>, SourceError> {
        Ok(ids.iter().filter_map(|id| self.games.get(id).cloned()).collect())
    }
}
