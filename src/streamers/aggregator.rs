//! Rolls transient stream and video events into per-streamer history.

use crate::bridge::{IdentifierBridge, Resolution};
use crate::errors::MalformedRecord;
use crate::streamers::model::{
    GameKey, StreamEvent, StreamKind, StreamerProfile, StreamerRecord,
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoldResult {
    pub streamer_id: i64,
    pub game: GameKey,
    /// The streamer had no record before this event.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldSummary {
    pub folded: usize,
    pub created: usize,
    pub unresolved: usize,
    pub skipped_malformed: usize,
}

impl FoldSummary {
    pub fn absorb(&mut self, other: FoldSummary) {
        self.folded += other.folded;
        self.created += other.created;
        self.unresolved += other.unresolved;
        self.skipped_malformed += other.skipped_malformed;
    }

    fn count(&mut self, result: &FoldResult) {
        self.folded += 1;
        if result.created {
            self.created += 1;
        }
        if result.game == GameKey::Unknown {
            self.unresolved += 1;
        }
    }
}

fn validate(event: &StreamEvent) -> Result<(), MalformedRecord> {
    if event.id.trim().is_empty() {
        return Err(MalformedRecord::new("stream", "empty event id"));
    }
    if event.streamer_id <= 0 {
        return Err(MalformedRecord::new(
            "stream",
            format!("event {}: invalid streamer id {}", event.id, event.streamer_id),
        ));
    }
    if event.kind == StreamKind::Video && event.view_count != 0 {
        return Err(MalformedRecord::new(
            "stream",
            format!("video {} carries a live view count", event.id),
        ));
    }
    Ok(())
}

fn resolve_game(bridge: &IdentifierBridge, event: &StreamEvent) -> GameKey {
    let foreign_id = event.foreign_game_id.as_deref().unwrap_or("");
    let name = event.game_name.as_deref();
    if foreign_id.is_empty() && name.is_none() {
        return GameKey::Unknown;
    }
    match bridge.resolve(foreign_id, name) {
        Resolution::Resolved { canonical_id, .. } => GameKey::Catalog(canonical_id),
        Resolution::NotFound => {
            debug!(
                target = "aggregate",
                event_id = %event.id,
                foreign_id,
                name = ?name,
                "game not in bridge; folding into unknown bucket"
            );
            GameKey::Unknown
        }
    }
}

/// Fold one already validated event into `record`.
fn apply(record: &mut StreamerRecord, game: GameKey, event: StreamEvent) {
    let entry = record.history.entry(game).or_default();
    entry.times_played += 1;
    match event.kind {
        StreamKind::Live => entry.view_accumulator += event.view_count,
        StreamKind::Video => entry.video_count += 1,
    }
    entry.dates.push(event.start_time);
    if let Some(language) = event.language.filter(|l| !l.trim().is_empty()) {
        record.language = Some(language);
    }
}

fn fold_group(
    bridge: &IdentifierBridge,
    mut record: StreamerRecord,
    mut created: bool,
    events: Vec<StreamEvent>,
) -> (StreamerRecord, FoldSummary) {
    let mut summary = FoldSummary::default();
    for event in events {
        let game = resolve_game(bridge, &event);
        let result = FoldResult {
            streamer_id: record.id,
            game,
            created,
        };
        apply(&mut record, game, event);
        summary.count(&result);
        created = false;
    }
    (record, summary)
}

pub struct StreamAggregator {
    bridge: Arc<IdentifierBridge>,
    records: BTreeMap<i64, StreamerRecord>,
}

impl StreamAggregator {
    pub fn new(bridge: Arc<IdentifierBridge>) -> Self {
        Self {
            bridge,
            records: BTreeMap::new(),
        }
    }

    /// Resume from persisted records.
    pub fn from_records(
        bridge: Arc<IdentifierBridge>,
        records: impl IntoIterator<Item = StreamerRecord>,
    ) -> Self {
        Self {
            bridge,
            records: records.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    pub fn bridge(&self) -> &Arc<IdentifierBridge> {
        &self.bridge
    }

    /// Fold a single event, creating the streamer on first sight.
    pub fn fold(&mut self, event: StreamEvent) -> Result<FoldResult, MalformedRecord> {
        validate(&event)?;
        let game = resolve_game(&self.bridge, &event);
        let streamer_id = event.streamer_id;
        let mut created = false;
        let record = self.records.entry(streamer_id).or_insert_with(|| {
            created = true;
            StreamerRecord::new(streamer_id)
        });
        apply(record, game, event);
        Ok(FoldResult {
            streamer_id,
            game,
            created,
        })
    }

    /// Fold a batch. Events of one streamer are applied in arrival order;
    /// different streamers are folded in parallel.
    pub fn fold_batch(&mut self, events: Vec<StreamEvent>) -> FoldSummary {
        let mut summary = FoldSummary::default();
        let mut groups: IndexMap<i64, Vec<StreamEvent>> = IndexMap::new();
        for event in events {
            match validate(&event) {
                Ok(()) => groups.entry(event.streamer_id).or_default().push(event),
                Err(err) => {
                    warn!(target = "aggregate", error = %err, "skipping malformed event");
                    summary.skipped_malformed += 1;
                }
            }
        }

        let work: Vec<(StreamerRecord, bool, Vec<StreamEvent>)> = groups
            .into_iter()
            .map(|(id, events)| match self.records.remove(&id) {
                Some(record) => (record, false, events),
                None => (StreamerRecord::new(id), true, events),
            })
            .collect();

        let bridge = self.bridge.as_ref();
        let folded: Vec<(StreamerRecord, FoldSummary)> = work
            .into_par_iter()
            .map(|(record, created, events)| fold_group(bridge, record, created, events))
            .collect();

        for (record, group_summary) in folded {
            summary.absorb(group_summary);
            self.records.insert(record.id, record);
        }
        debug!(
            target = "aggregate",
            folded = summary.folded,
            created = summary.created,
            unresolved = summary.unresolved,
            skipped = summary.skipped_malformed,
            "batch folded"
        );
        summary
    }

    /// Upsert identity fields and sample lifetime views. Returns true when the
    /// streamer was new.
    pub fn apply_profile(&mut self, profile: &StreamerProfile, at: DateTime<Utc>) -> bool {
        let mut created = false;
        let record = self.records.entry(profile.id).or_insert_with(|| {
            created = true;
            StreamerRecord::new(profile.id)
        });
        record.apply_profile(profile, at);
        created
    }

    /// Append a follower sample. Unknown streamers are ignored.
    pub fn record_followers(&mut self, streamer_id: i64, followers: u64, at: DateTime<Utc>) -> bool {
        match self.records.get_mut(&streamer_id) {
            Some(record) => {
                record.record_followers(followers, at);
                true
            }
            None => {
                info!(target = "aggregate", streamer_id, "follower count for unknown streamer ignored");
                false
            }
        }
    }

    /// Streamers whose history has no video folded into it yet, ascending.
    pub fn ids_without_video_data(&self) -> Vec<i64> {
        self.records
            .values()
            .filter(|r| !r.has_video_data())
            .map(|r| r.id)
            .collect()
    }

    /// Streamers with no follower sample taken on `now`'s calendar day, ascending.
    pub fn ids_missing_recent_followers(&self, now: DateTime<Utc>) -> Vec<i64> {
        let today = now.date_naive();
        self.records
            .values()
            .filter(|r| {
                r.last_follower_sample()
                    .map_or(true, |s| s.measured_at.date_naive() != today)
            })
            .map(|r| r.id)
            .collect()
    }

    pub fn get(&self, streamer_id: i64) -> Option<&StreamerRecord> {
        self.records.get(&streamer_id)
    }

    pub fn contains(&self, streamer_id: i64) -> bool {
        self.records.contains_key(&streamer_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &StreamerRecord> {
        self.records.values()
    }

    pub fn into_records(self) -> Vec<StreamerRecord> {
        self.records.into_values().collect()
    }
}
