//! The four scrape jobs: games, streamers, videos and followers.
//!
//! Each job loads the tables it touches, drives the core components against
//! the remote sources, and writes full snapshots back at the end.

use crate::bridge::{BridgeConfig, IdentifierBridge, IdentifierMapping, MatchKind, Resolution};
use crate::catalog::{CatalogHarvester, CatalogRecord, HarvestConfig, HarvestOutcome};
use crate::database_ops::twitch::HELIX_MAX_BATCH;
use crate::errors::SourceError;
use crate::lookup::LookupTableSet;
use crate::sources::{CatalogSource, StreamSource};
use crate::storage::{RuntimeEntry, TableStore};
use crate::streamers::{FoldSummary, StreamAggregator, StreamEvent};
use crate::util::cancel::CancelFlag;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Shared by every job of one run.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub store: TableStore,
    pub bridge_cfg: BridgeConfig,
    pub cancel: CancelFlag,
}

impl JobContext {
    pub fn new(store: TableStore, bridge_cfg: BridgeConfig, cancel: CancelFlag) -> Self {
        Self {
            store,
            bridge_cfg,
            cancel,
        }
    }

    fn load_bridge(&self) -> Result<Arc<IdentifierBridge>> {
        let mappings = self
            .store
            .load_mappings()
            .context("loading identifier mappings")?;
        Ok(Arc::new(IdentifierBridge::from_mappings(
            self.bridge_cfg.clone(),
            mappings,
        )))
    }

    fn load_aggregator(&self) -> Result<StreamAggregator> {
        let bridge = self.load_bridge()?;
        let records = self.store.load_streamers().context("loading streamers")?;
        Ok(StreamAggregator::from_records(bridge, records))
    }

    fn save_aggregator(&self, aggregator: &StreamAggregator) -> Result<()> {
        self.store
            .save_streamers(aggregator.records())
            .context("writing streamers")?;
        self.store
            .save_mappings(&aggregator.bridge().mappings())
            .context("writing identifier mappings")?;
        Ok(())
    }
}

/// Wall-clock durations of the requests one job awaited, in milliseconds.
#[derive(Debug, Default)]
struct RequestTimings {
    millis: Vec<f64>,
}

impl RequestTimings {
    async fn time<T>(&mut self, request: impl Future<Output = T>) -> T {
        let started = Instant::now();
        let out = request.await;
        self.millis.push(started.elapsed().as_secs_f64() * 1000.0);
        out
    }

    fn len(&self) -> usize {
        self.millis.len()
    }

    /// `(min, max, mean, sample std dev)`, rounded to two decimals.
    fn stats(&self) -> Option<(f64, f64, f64, f64)> {
        let n = self.millis.len();
        if n == 0 {
            return None;
        }
        let min = self.millis.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.millis.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = self.millis.iter().sum::<f64>() / n as f64;
        let var = if n > 1 {
            self.millis.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / (n - 1) as f64
        } else {
            0.0
        };
        let round = |v: f64| (v * 100.0).round() / 100.0;
        Some((round(min), round(max), round(mean), round(var.sqrt())))
    }
}

/// Append the job's row to the runtime log. A failed write only warns: the
/// job's tables are already saved.
fn record_runtime(
    ctx: &JobContext,
    content_type: &str,
    started_at: DateTime<Utc>,
    num_items: usize,
    requests: usize,
    timings: Option<&RequestTimings>,
) {
    let stats = timings.and_then(RequestTimings::stats);
    let entry = RuntimeEntry {
        started_at,
        ended_at: Utc::now(),
        content_type: content_type.to_string(),
        num_items,
        requests,
        min_request_ms: stats.map(|s| s.0),
        max_request_ms: stats.map(|s| s.1),
        mean_request_ms: stats.map(|s| s.2),
        std_dev_request_ms: stats.map(|s| s.3),
    };
    if let Err(err) = ctx.store.append_runtime(&entry) {
        warn!(target = "storage", content_type, error = %err, "runtime log not written");
    }
}

/// Resolve through the bridge; on a miss with a known name, search the catalog
/// and remember the answer.
pub async fn resolve_or_fetch(
    bridge: &IdentifierBridge,
    catalog: &dyn CatalogSource,
    foreign_id: &str,
    foreign_name: Option<&str>,
) -> Result<Resolution, SourceError> {
    let resolution = bridge.resolve(foreign_id, foreign_name);
    if resolution != Resolution::NotFound {
        return Ok(resolution);
    }
    let Some(name) = foreign_name.filter(|n| !n.trim().is_empty()) else {
        return Ok(Resolution::NotFound);
    };
    match catalog.search_by_name(name).await? {
        Some(canonical_id) => {
            if !foreign_id.trim().is_empty() {
                bridge.insert(IdentifierMapping::new(foreign_id.trim(), Some(name), canonical_id));
            }
            Ok(Resolution::Resolved {
                canonical_id,
                via: MatchKind::CatalogSearch,
            })
        }
        None => Ok(Resolution::NotFound),
    }
}

#[derive(Debug, Clone, Default)]
pub struct GamesReport {
    pub harvested: usize,
    pub total_games: usize,
    pub box_art_attached: usize,
    pub complete: bool,
}

/// Harvest the whole catalog and merge it into `games.csv`.
#[instrument(skip_all)]
pub async fn harvest_games(
    ctx: &JobContext,
    catalog: Arc<dyn CatalogSource>,
    streams: Option<&dyn StreamSource>,
    cfg: HarvestConfig,
) -> Result<(GamesReport, HarvestOutcome)> {
    let started_at = Utc::now();
    let lookups = Arc::new(LookupTableSet::new());
    ctx.store
        .load_lookups(&lookups)
        .context("loading lookup tables")?;
    let mut games: BTreeMap<i64, CatalogRecord> = ctx
        .store
        .load_games()
        .context("loading games")?
        .into_iter()
        .map(|g| (g.id, g))
        .collect();

    let harvester = CatalogHarvester::new(catalog, lookups.clone(), cfg)?;
    let outcome = harvester
        .harvest_all(&ctx.cancel)
        .await
        .context("catalog id bounds query failed")?;

    for (id, mut record) in outcome.records.clone() {
        // The catalog never supplies Twitch art; keep what an earlier run attached.
        if let Some(previous) = games.get(&id) {
            record.twitch_box_art_url.clone_from(&previous.twitch_box_art_url);
        }
        games.insert(id, record);
    }

    let mut box_art_attached = 0;
    if let Some(streams) = streams {
        let bridge = ctx.load_bridge()?;
        box_art_attached = attach_platform_box_art(streams, &bridge, &mut games).await;
    }

    ctx.store
        .save_games(games.values())
        .context("writing games")?;
    ctx.store
        .save_lookups(&lookups)
        .context("writing lookup tables")?;

    let report = GamesReport {
        harvested: outcome.records.len(),
        total_games: games.len(),
        box_art_attached,
        complete: outcome.is_complete(),
    };
    info!(
        target = "harvest",
        harvested = report.harvested,
        total = report.total_games,
        box_art = report.box_art_attached,
        complete = report.complete,
        "games job finished"
    );
    // Harvest requests overlap on the worker pool, so only the count is kept.
    record_runtime(ctx, "games", started_at, report.total_games, outcome.requests, None);
    Ok((report, outcome))
}

/// Copy Twitch box art onto games that have a mapping but no art yet.
async fn attach_platform_box_art(
    streams: &dyn StreamSource,
    bridge: &IdentifierBridge,
    games: &mut BTreeMap<i64, CatalogRecord>,
) -> usize {
    let wanted: Vec<IdentifierMapping> = bridge
        .mappings()
        .into_iter()
        .filter(|m| {
            games
                .get(&m.canonical_id)
                .is_some_and(|g| g.twitch_box_art_url.is_none())
        })
        .collect();
    let canonical: BTreeMap<String, i64> = wanted
        .iter()
        .map(|m| (m.foreign_id.clone(), m.canonical_id))
        .collect();

    let mut attached = 0;
    for chunk in wanted.chunks(HELIX_MAX_BATCH) {
        let ids: Vec<String> = chunk.iter().map(|m| m.foreign_id.clone()).collect();
        let found = match streams.fetch_games(&ids).await {
            Ok(found) => found,
            Err(err) => {
                warn!(target = "twitch", error = %err, batch = ids.len(), "game directory lookup failed");
                continue;
            }
        };
        for game in found {
            let (Some(url), Some(id)) = (game.box_art_url, canonical.get(&game.id)) else {
                continue;
            };
            if let Some(record) = games.get_mut(id) {
                record.twitch_box_art_url = Some(url);
                attached += 1;
            }
        }
    }
    attached
}

#[derive(Debug, Clone, Default)]
pub struct StreamersReport {
    pub pages: usize,
    pub events: usize,
    pub duplicate_events: usize,
    pub malformed_events: usize,
    pub page_errors: usize,
    pub new_mappings: usize,
    pub lookup_failures: usize,
    pub profiles: usize,
    pub fold: FoldSummary,
}

/// Page through live streams, fold them into streamer history and refresh profiles.
#[instrument(skip_all, fields(limit = ?limit))]
pub async fn compile_streamers(
    ctx: &JobContext,
    streams: &dyn StreamSource,
    catalog: &dyn CatalogSource,
    limit: Option<usize>,
) -> Result<StreamersReport> {
    let started_at = Utc::now();
    let mut timings = RequestTimings::default();
    let mut aggregator = ctx.load_aggregator()?;
    let mut report = StreamersReport::default();

    let mut seen: HashSet<String> = HashSet::new();
    let mut events: Vec<StreamEvent> = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        if ctx.cancel.is_cancelled() || limit.is_some_and(|l| events.len() >= l) {
            break;
        }
        let page = match timings.time(streams.list_live_events(cursor.as_deref())).await {
            Ok(page) => page,
            Err(err) => {
                warn!(target = "twitch", error = %err, pages = report.pages, "live stream paging stopped early");
                report.page_errors += 1;
                break;
            }
        };
        report.pages += 1;
        report.malformed_events += page.malformed;

        let mut fresh = 0usize;
        for event in page.events {
            if !seen.insert(event.id.clone()) {
                report.duplicate_events += 1;
                continue;
            }
            if limit.is_some_and(|l| events.len() >= l) {
                break;
            }
            events.push(event);
            fresh += 1;
        }
        // The listing is eventually consistent; a page of repeats means we wrapped.
        if fresh == 0 {
            break;
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    report.events = events.len();

    let bridge = Arc::clone(aggregator.bridge());
    let before = bridge.len();
    let unresolved: BTreeSet<(String, String)> = events
        .iter()
        .filter_map(|e| {
            let name = e.game_name.clone()?;
            let id = e.foreign_game_id.clone().unwrap_or_default();
            (bridge.resolve(&id, Some(&name)) == Resolution::NotFound).then_some((id, name))
        })
        .collect();
    for (foreign_id, name) in &unresolved {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let resolved = timings
            .time(resolve_or_fetch(&bridge, catalog, foreign_id, Some(name)))
            .await;
        if let Err(err) = resolved {
            warn!(target = "bridge", foreign_id = %foreign_id, name = %name, error = %err, "catalog search failed");
            report.lookup_failures += 1;
        }
    }
    report.new_mappings = bridge.len().saturating_sub(before);

    let streamer_ids: Vec<i64> = events
        .iter()
        .map(|e| e.streamer_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    for chunk in streamer_ids.chunks(HELIX_MAX_BATCH) {
        if ctx.cancel.is_cancelled() {
            break;
        }
        match timings.time(streams.fetch_profiles(chunk)).await {
            Ok(profiles) => {
                let fetched_at = Utc::now();
                for profile in &profiles {
                    aggregator.apply_profile(profile, fetched_at);
                }
                report.profiles += profiles.len();
            }
            Err(err) => warn!(target = "twitch", error = %err, batch = chunk.len(), "profile lookup failed"),
        }
    }

    report.fold = aggregator.fold_batch(events);
    report.malformed_events += report.fold.skipped_malformed;
    ctx.save_aggregator(&aggregator)?;

    info!(
        target = "aggregate",
        pages = report.pages,
        events = report.events,
        duplicates = report.duplicate_events,
        malformed = report.malformed_events,
        unresolved = report.fold.unresolved,
        new_mappings = report.new_mappings,
        profiles = report.profiles,
        streamers = aggregator.len(),
        "streamers job finished"
    );
    record_runtime(ctx, "streamers", started_at, report.events, timings.len(), Some(&timings));
    Ok(report)
}

#[derive(Debug, Clone, Default)]
pub struct VideosReport {
    pub streamers: usize,
    pub videos: usize,
    pub malformed_events: usize,
    pub failures: usize,
    pub fold: FoldSummary,
}

/// Fold archived videos of streamers that have none recorded yet.
#[instrument(skip_all, fields(max_streamers = ?max_streamers))]
pub async fn add_videos(
    ctx: &JobContext,
    streams: &dyn StreamSource,
    max_streamers: Option<usize>,
) -> Result<VideosReport> {
    let started_at = Utc::now();
    let mut timings = RequestTimings::default();
    let mut aggregator = ctx.load_aggregator()?;
    let mut report = VideosReport::default();
    let targets = aggregator.ids_without_video_data();

    for streamer_id in targets.into_iter().take(max_streamers.unwrap_or(usize::MAX)) {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let mut videos = Vec::new();
        let mut cursor: Option<String> = None;
        let mut failed = false;
        loop {
            match timings.time(streams.list_videos(streamer_id, cursor.as_deref())).await {
                Ok(page) => {
                    report.malformed_events += page.malformed;
                    let empty = page.events.is_empty();
                    videos.extend(page.events);
                    match page.next_cursor {
                        Some(next) if !empty => cursor = Some(next),
                        _ => break,
                    }
                }
                Err(err) => {
                    warn!(target = "twitch", streamer_id, error = %err, "video listing failed");
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            report.failures += 1;
            continue;
        }
        report.streamers += 1;
        report.videos += videos.len();
        report.fold.absorb(aggregator.fold_batch(videos));
    }
    report.malformed_events += report.fold.skipped_malformed;
    ctx.save_aggregator(&aggregator)?;

    info!(
        target = "aggregate",
        streamers = report.streamers,
        videos = report.videos,
        failures = report.failures,
        "videos job finished"
    );
    record_runtime(ctx, "videos", started_at, report.videos, timings.len(), Some(&timings));
    Ok(report)
}

#[derive(Debug, Clone, Default)]
pub struct FollowersReport {
    pub sampled: usize,
    pub failures: usize,
}

/// Take today's follower sample for streamers that lack one.
#[instrument(skip_all, fields(max_streamers = ?max_streamers))]
pub async fn add_followers(
    ctx: &JobContext,
    streams: &dyn StreamSource,
    max_streamers: Option<usize>,
    now: DateTime<Utc>,
) -> Result<FollowersReport> {
    let started_at = Utc::now();
    let mut timings = RequestTimings::default();
    let mut aggregator = ctx.load_aggregator()?;
    let mut report = FollowersReport::default();
    let targets = aggregator.ids_missing_recent_followers(now);

    for streamer_id in targets.into_iter().take(max_streamers.unwrap_or(usize::MAX)) {
        if ctx.cancel.is_cancelled() {
            break;
        }
        match timings.time(streams.follower_count(streamer_id)).await {
            Ok(count) => {
                aggregator.record_followers(streamer_id, count, now);
                report.sampled += 1;
            }
            Err(err) => {
                warn!(target = "twitch", streamer_id, error = %err, "follower count failed");
                report.failures += 1;
            }
        }
    }
    ctx.save_aggregator(&aggregator)?;

    info!(
        target = "aggregate",
        sampled = report.sampled,
        failures = report.failures,
        "followers job finished"
    );
    record_runtime(ctx, "followers", started_at, report.sampled, timings.len(), Some(&timings));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::LookupCategory;
    use crate::sources::{EventPage, PlatformGame};
    use crate::streamers::{GameKey, StreamerProfile};
    use crate::test_support::{FakeCatalog, FakeStreams};
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn ctx(dir: &tempfile::TempDir) -> JobContext {
        JobContext::new(
            TableStore::new(dir.path()),
            BridgeConfig::default(),
            CancelFlag::new(),
        )
    }

    fn profile(id: i64, login: &str) -> StreamerProfile {
        StreamerProfile {
            id,
            login: login.into(),
            display_name: login.to_uppercase(),
            total_views: 10,
            ..Default::default()
        }
    }

    fn live_streams() -> FakeStreams {
        let mut streams = FakeStreams::new();
        streams.live_pages = vec![
            EventPage {
                events: vec![
                    StreamEvent::live("a", 1, at(100), 50).with_game(Some("33214"), Some("Fortnite")),
                    StreamEvent::live("b", 2, at(110), 7).with_game(Some("999"), Some("Obscure")),
                ],
                malformed: 1,
                next_cursor: Some("1".into()),
            },
            EventPage {
                events: vec![
                    StreamEvent::live("a", 1, at(100), 50).with_game(Some("33214"), Some("Fortnite")),
                    StreamEvent::live("c", 3, at(120), 3).with_language(Some("de")),
                ],
                malformed: 0,
                next_cursor: Some("2".into()),
            },
        ];
        streams.profiles.insert(1, profile(1, "one"));
        streams.profiles.insert(2, profile(2, "two"));
        streams
    }

    #[tokio::test]
    async fn streamers_job_dedups_resolves_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        let streams = live_streams();
        let catalog = FakeCatalog::with_ids(vec![1905], 1000).with_name("Fortnite", 1905);

        let report = compile_streamers(&ctx, &streams, &catalog, None).await.unwrap();
        assert_eq!(report.pages, 3);
        assert_eq!(report.events, 3);
        assert_eq!(report.duplicate_events, 1);
        assert_eq!(report.malformed_events, 1);
        assert_eq!(report.new_mappings, 1);
        assert_eq!(report.profiles, 2);
        assert_eq!(report.fold.unresolved, 2);

        let loaded = ctx.store.load_streamers().unwrap();
        assert_eq!(loaded.len(), 3);
        let one = &loaded[0];
        assert_eq!(one.login, "one");
        assert_eq!(one.history[&GameKey::Catalog(1905)].view_accumulator, 50);
        assert_eq!(one.view_history.len(), 1);
        assert_eq!(one.view_history[0].views, 10);
        assert_eq!(loaded[2].language.as_deref(), Some("de"));

        let mappings = ctx.store.load_mappings().unwrap();
        assert_eq!(mappings, vec![IdentifierMapping::new("33214", Some("Fortnite"), 1905)]);
        assert_eq!(*streams.profile_batches.lock().unwrap(), vec![3]);

        // Three pages, two catalog searches and one profile batch.
        let runtime = ctx.store.load_runtime().unwrap();
        assert_eq!(runtime.len(), 1);
        assert_eq!(runtime[0].content_type, "streamers");
        assert_eq!(runtime[0].num_items, 3);
        assert_eq!(runtime[0].requests, 6);
        assert!(runtime[0].mean_request_ms.is_some());
        assert!(runtime[0].started_at <= runtime[0].ended_at);
    }

    #[test]
    fn request_timing_stats() {
        let timings = RequestTimings {
            millis: vec![10.0, 20.0, 30.0],
        };
        assert_eq!(timings.stats(), Some((10.0, 30.0, 20.0, 10.0)));
        let single = RequestTimings { millis: vec![4.567] };
        assert_eq!(single.stats(), Some((4.57, 4.57, 4.57, 0.0)));
        assert_eq!(RequestTimings::default().stats(), None);
    }

    #[tokio::test]
    async fn streamers_job_honours_limit() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        let catalog = FakeCatalog::with_ids(vec![], 1000);
        let report = compile_streamers(&ctx, &live_streams(), &catalog, Some(1))
            .await
            .unwrap();
        assert_eq!(report.events, 1);
        assert_eq!(report.pages, 1);
    }

    #[tokio::test]
    async fn videos_job_pages_and_folds() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        let catalog = FakeCatalog::with_ids(vec![], 1000);
        compile_streamers(&ctx, &live_streams(), &catalog, None).await.unwrap();
        let unknown_of_two = |ctx: &JobContext| {
            ctx.store
                .load_streamers()
                .unwrap()
                .into_iter()
                .find(|s| s.id == 2)
                .unwrap()
                .history[&GameKey::Unknown]
                .clone()
        };
        // The unresolved live stream "b" already landed in the unknown bucket.
        let before = unknown_of_two(&ctx);
        assert_eq!(before.view_accumulator, 7);
        assert_eq!(before.video_count, 0);

        let mut streams = FakeStreams::new();
        streams.videos.insert(
            2,
            (0..5).map(|i| StreamEvent::video(format!("v{i}"), 2, at(1000 + i))).collect(),
        );
        let report = add_videos(&ctx, &streams, None).await.unwrap();
        assert_eq!(report.streamers, 3);
        assert_eq!(report.videos, 5);

        let after = unknown_of_two(&ctx);
        assert_eq!(after.video_count, 5);
        assert_eq!(after.view_accumulator, before.view_accumulator);

        let again = add_videos(&ctx, &streams, None).await.unwrap();
        assert_eq!(again.streamers, 2);
        assert_eq!(again.videos, 0);
    }

    #[tokio::test]
    async fn followers_job_samples_once_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        let catalog = FakeCatalog::with_ids(vec![], 1000);
        compile_streamers(&ctx, &live_streams(), &catalog, None).await.unwrap();

        let mut streams = FakeStreams::new();
        streams.followers.insert(1, 500);
        streams.followers.insert(2, 20);
        let now = at(86_400 * 30);
        let report = add_followers(&ctx, &streams, None, now).await.unwrap();
        assert_eq!(report.sampled, 2);
        assert_eq!(report.failures, 1);

        let again = add_followers(&ctx, &streams, None, now + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(again.sampled, 0);
        assert_eq!(again.failures, 1);

        let loaded = ctx.store.load_streamers().unwrap();
        assert_eq!(loaded[0].follower_count, Some(500));
        assert_eq!(loaded[0].follower_history.len(), 1);
    }

    #[tokio::test]
    async fn games_job_writes_games_lookups_and_box_art() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        ctx.store
            .save_mappings(&[IdentifierMapping::new("33214", Some("Fortnite"), 7)])
            .unwrap();
        let mut streams = FakeStreams::new();
        streams.games.insert(
            "33214".into(),
            PlatformGame {
                id: "33214".into(),
                name: "Fortnite".into(),
                box_art_url: Some("https://static-cdn.jtvnw.net/ttv-boxart/33214-285x380.jpg".into()),
            },
        );

        let cfg = HarvestConfig {
            page_size: 10,
            offset_ceiling: 20,
            min_partition_width: 10,
            backoff_ms: 1,
            request_timeout: Duration::from_secs(5),
            ..HarvestConfig::default()
        };
        let (report, outcome) = harvest_games(
            &ctx,
            Arc::new(FakeCatalog::dense(1..=120, 20)),
            Some(&streams),
            cfg,
        )
        .await
        .unwrap();

        assert!(report.complete);
        assert_eq!(report.harvested, 120);
        assert_eq!(report.box_art_attached, 1);
        assert!(outcome.failed_ranges.is_empty());

        let games = ctx.store.load_games().unwrap();
        assert_eq!(games.len(), 120);
        assert!(games[6].twitch_box_art_url.is_some());

        let lookups = LookupTableSet::new();
        ctx.store.load_lookups(&lookups).unwrap();
        assert_eq!(lookups.len(LookupCategory::Genre), 5);

        let runtime = ctx.store.load_runtime().unwrap();
        assert_eq!(runtime.len(), 1);
        assert_eq!(runtime[0].content_type, "games");
        assert_eq!(runtime[0].num_items, 120);
        assert_eq!(runtime[0].requests, outcome.requests);
        assert_eq!(runtime[0].mean_request_ms, None);
    }

    #[tokio::test]
    async fn resolve_or_fetch_learns_new_mapping() {
        let bridge = IdentifierBridge::new(BridgeConfig::default());
        let catalog = FakeCatalog::with_ids(vec![], 10).with_name("Hades", 113112);
        let res = resolve_or_fetch(&bridge, &catalog, "460630", Some("Hades"))
            .await
            .unwrap();
        assert_eq!(
            res,
            Resolution::Resolved {
                canonical_id: 113112,
                via: MatchKind::CatalogSearch
            }
        );
        assert_eq!(bridge.resolve("460630", None).canonical_id(), Some(113112));
        assert_eq!(
            resolve_or_fetch(&bridge, &catalog, "1", Some("Unknown Game")).await.unwrap(),
            Resolution::NotFound
        );
    }
}
