//! Exhaustive catalog enumeration under an offset ceiling.
//!
//! The catalog only pages by offset and refuses offsets above a fixed ceiling,
//! so plain offset increment silently stops short of large collections. The
//! harvester instead partitions the id space: a range whose first page comes
//! back full is bisected and both halves go back on the work queue; a range
//! that is narrow enough (or whose first page is partial) is paged through by
//! offset. Narrow ranges hold few enough ids that their offsets stay under the
//! ceiling.
//!
//! Partition fetches run on a bounded pool of tokio tasks. The coordinator is
//! the only writer: it parses, deduplicates and merges each finished partition
//! and pushes split ranges back onto the queue.

use crate::catalog::record::{CatalogRecord, ParsedRecord};
use crate::errors::SourceError;
use crate::lookup::LookupTableSet;
use crate::sources::{CatalogSource, IdRange, RecordPage, PAGE_MAX};
use crate::util::cancel::CancelFlag;
use crate::util::env::env_parse;
use anyhow::{bail, Result};
use futures::Stream;
use rand::Rng;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub page_size: usize,
    pub offset_ceiling: usize,
    /// Ranges with `high - low` at or below this are paged by offset instead of split.
    pub min_partition_width: u64,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub request_timeout: Duration,
    /// Capacity of the channel feeding [`CatalogHarvester::stream`].
    pub stream_buffer: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        let page_size = PAGE_MAX;
        let offset_ceiling = 5_000;
        Self {
            page_size,
            offset_ceiling,
            min_partition_width: default_min_width(page_size, offset_ceiling),
            concurrency: 4,
            max_attempts: 5,
            backoff_ms: 1000,
            request_timeout: Duration::from_secs(30),
            stream_buffer: 1024,
        }
    }
}

fn default_min_width(page_size: usize, offset_ceiling: usize) -> u64 {
    if offset_ceiling >= page_size {
        page_size as u64
    } else {
        page_size.saturating_sub(1) as u64
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        let page_size = env_parse("CATALOG_PAGE_SIZE", default.page_size).clamp(1, PAGE_MAX);
        let offset_ceiling = env_parse("CATALOG_OFFSET_CEILING", default.offset_ceiling);
        Self {
            page_size,
            offset_ceiling,
            min_partition_width: env_parse(
                "CATALOG_MIN_PARTITION_WIDTH",
                default_min_width(page_size, offset_ceiling),
            ),
            concurrency: env_parse("CATALOG_CONCURRENCY", default.concurrency).max(1),
            max_attempts: env_parse("CATALOG_MAX_ATTEMPTS", default.max_attempts).max(1),
            backoff_ms: env_parse("CATALOG_BACKOFF_MS", default.backoff_ms),
            request_timeout: Duration::from_secs(
                env_parse("CATALOG_REQUEST_TIMEOUT_SECS", 30u64).max(1),
            ),
            stream_buffer: env_parse("CATALOG_STREAM_BUFFER", default.stream_buffer).max(1),
        }
    }

    /// Offset of the last page a leaf partition may need. A leaf spans at most
    /// `min_partition_width + 1` ids and paging stops once every id is
    /// accounted for, so a full last page never triggers a further request.
    pub fn max_leaf_offset(&self) -> u64 {
        (self.min_partition_width / self.page_size as u64) * self.page_size as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > PAGE_MAX {
            bail!("page_size must be within 1..={PAGE_MAX}, got {}", self.page_size);
        }
        if self.max_leaf_offset() > self.offset_ceiling as u64 {
            bail!(
                "min_partition_width {} needs offset {} which exceeds the offset ceiling {}",
                self.min_partition_width,
                self.max_leaf_offset(),
                self.offset_ceiling
            );
        }
        if self.concurrency == 0 || self.max_attempts == 0 {
            bail!("concurrency and max_attempts must be at least 1");
        }
        Ok(())
    }

    /// Linear backoff with up to 25% jitter.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.backoff_ms.saturating_mul(attempt as u64);
        let jitter = if base >= 4 {
            rand::thread_rng().gen_range(0..=base / 4)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}

/// A partition that could not be harvested.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedRange {
    pub range: IdRange,
    pub error: SourceError,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct HarvestOutcome {
    pub run_id: Uuid,
    /// Harvested records keyed (and therefore deduplicated) by catalog id.
    pub records: BTreeMap<i64, CatalogRecord>,
    pub failed_ranges: Vec<FailedRange>,
    /// Ranges still queued or in flight when the run was cancelled.
    pub unharvested_ranges: Vec<IdRange>,
    /// Ids of payloads that failed to parse (payloads without an id are only counted).
    pub malformed_ids: BTreeSet<i64>,
    pub malformed_without_id: usize,
    /// Records seen again on an overlapping page and dropped.
    pub duplicates: usize,
    pub requests: usize,
    pub splits: usize,
    pub leaves: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl HarvestOutcome {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            records: BTreeMap::new(),
            failed_ranges: Vec::new(),
            unharvested_ranges: Vec::new(),
            malformed_ids: BTreeSet::new(),
            malformed_without_id: 0,
            duplicates: 0,
            requests: 0,
            splits: 0,
            leaves: 0,
            cancelled: false,
            elapsed: Duration::ZERO,
        }
    }

    pub fn malformed(&self) -> usize {
        self.malformed_ids.len() + self.malformed_without_id
    }

    /// Every partition was exhausted: no failures and no cancellation.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failed_ranges.is_empty() && self.unharvested_ranges.is_empty()
    }
}

enum RetryError {
    Cancelled,
    Exhausted { error: SourceError, attempts: u32 },
}

/// Issue `op` until it succeeds, fails permanently, or runs out of attempts.
/// Rate-limit errors wait for the source's mandated delay.
async fn retry_request<T, F, Fut>(
    cfg: &HarvestConfig,
    cancel: &CancelFlag,
    what: &str,
    requests: &mut usize,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;
        *requests += 1;
        let result = match tokio::time::timeout(cfg.request_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::transient(format!(
                "request timed out after {:?}",
                cfg.request_timeout
            ))),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < cfg.max_attempts => {
                let wait = err.retry_after().unwrap_or_else(|| cfg.backoff_for(attempt));
                warn!(
                    target = "harvest",
                    what,
                    attempt,
                    max_attempts = cfg.max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "request failed; retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                }
            }
            Err(error) => {
                return Err(RetryError::Exhausted {
                    error,
                    attempts: attempt,
                })
            }
        }
    }
}

enum PartitionOutcome {
    Split(IdRange, IdRange),
    Exhausted,
    Failed { error: SourceError, attempts: u32 },
    Cancelled,
}

struct PartitionReport {
    range: IdRange,
    records: Vec<Value>,
    requests: usize,
    outcome: PartitionOutcome,
}

fn is_full(page: &RecordPage, limit: usize) -> bool {
    page.records.len() >= limit || (page.has_more && !page.records.is_empty())
}

/// Fetches one partition on a pool task. Holds no shared mutable state.
struct PartitionWorker {
    source: Arc<dyn CatalogSource>,
    cfg: HarvestConfig,
    cancel: CancelFlag,
}

impl PartitionWorker {
    async fn fetch(self, range: IdRange) -> PartitionReport {
        let limit = self.cfg.page_size;
        let mut records = Vec::new();
        let mut requests = 0usize;
        let mut offset = 0usize;

        let outcome = loop {
            if offset > self.cfg.offset_ceiling {
                // Unreachable while `HarvestConfig::validate` holds.
                error!(
                    target = "harvest",
                    %range,
                    offset,
                    ceiling = self.cfg.offset_ceiling,
                    "partition too wide to page under the offset ceiling"
                );
                break PartitionOutcome::Failed {
                    error: SourceError::OffsetCeilingExceeded {
                        offset,
                        ceiling: self.cfg.offset_ceiling,
                    },
                    attempts: 0,
                };
            }

            let source = &self.source;
            let page = match retry_request(&self.cfg, &self.cancel, "list_records", &mut requests, || {
                source.list_records(range, offset, limit)
            })
            .await
            {
                Ok(page) => page,
                Err(RetryError::Cancelled) => break PartitionOutcome::Cancelled,
                Err(RetryError::Exhausted { error, attempts }) => {
                    break PartitionOutcome::Failed { error, attempts }
                }
            };

            let full = is_full(&page, limit);
            let got = page.records.len();
            records.extend(page.records);
            if !full || got == 0 {
                break PartitionOutcome::Exhausted;
            }
            // Ids are unique, so a range never holds more records than ids.
            if (offset + got) as u64 >= range.width() {
                break PartitionOutcome::Exhausted;
            }
            if offset == 0 && range.span() > self.cfg.min_partition_width {
                if let Some((lower, upper)) = range.bisect() {
                    break PartitionOutcome::Split(lower, upper);
                }
            }
            offset += got;
        };

        PartitionReport {
            range,
            records,
            requests,
            outcome,
        }
    }
}

pub struct CatalogHarvester {
    source: Arc<dyn CatalogSource>,
    lookups: Arc<LookupTableSet>,
    cfg: HarvestConfig,
}

impl CatalogHarvester {
    pub fn new(
        source: Arc<dyn CatalogSource>,
        lookups: Arc<LookupTableSet>,
        cfg: HarvestConfig,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            source,
            lookups,
            cfg,
        })
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.cfg
    }

    /// Harvest the whole collection. Each call starts a fresh run.
    ///
    /// Only a failure of the preliminary id-bounds query is returned as an
    /// error; partition failures are reported in the outcome.
    pub async fn harvest_all(&self, cancel: &CancelFlag) -> Result<HarvestOutcome, SourceError> {
        self.run(cancel, None).await
    }

    /// Harvest as a stream of newly merged records. The channel is bounded, so
    /// a slow consumer holds back the merge stage. The handle yields the
    /// outcome once the stream has ended.
    pub fn stream(
        self: Arc<Self>,
        cancel: CancelFlag,
    ) -> (
        impl Stream<Item = CatalogRecord> + Send + 'static,
        JoinHandle<Result<HarvestOutcome, SourceError>>,
    ) {
        let (tx, rx) = mpsc::channel(self.cfg.stream_buffer);
        let handle = tokio::spawn(async move { self.run(&cancel, Some(tx)).await });
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|record| (record, rx))
        });
        (stream, handle)
    }

    #[instrument(skip(self, cancel, sink))]
    async fn run(
        &self,
        cancel: &CancelFlag,
        mut sink: Option<mpsc::Sender<CatalogRecord>>,
    ) -> Result<HarvestOutcome, SourceError> {
        let started = Instant::now();
        let mut outcome = HarvestOutcome::new(Uuid::new_v4());

        let source = &self.source;
        let bounds = match retry_request(
            &self.cfg,
            cancel,
            "id_bounds",
            &mut outcome.requests,
            || source.id_bounds(),
        )
        .await
        {
            Ok(bounds) => bounds,
            Err(RetryError::Cancelled) => {
                outcome.cancelled = true;
                outcome.elapsed = started.elapsed();
                return Ok(outcome);
            }
            Err(RetryError::Exhausted { error, .. }) => return Err(error),
        };
        let Some(full_range) = bounds else {
            info!(target = "harvest", run_id = %outcome.run_id, "catalog is empty");
            outcome.elapsed = started.elapsed();
            return Ok(outcome);
        };

        info!(
            target = "harvest",
            run_id = %outcome.run_id,
            range = %full_range,
            page_size = self.cfg.page_size,
            offset_ceiling = self.cfg.offset_ceiling,
            min_partition_width = self.cfg.min_partition_width,
            concurrency = self.cfg.concurrency,
            "harvest starting"
        );

        // LIFO so the lower half of a split is fetched first.
        let mut pending: Vec<IdRange> = vec![full_range];
        let mut running: JoinSet<PartitionReport> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, IdRange> = HashMap::new();

        loop {
            while running.len() < self.cfg.concurrency && !cancel.is_cancelled() {
                let Some(range) = pending.pop() else {
                    break;
                };
                let worker = PartitionWorker {
                    source: Arc::clone(&self.source),
                    cfg: self.cfg.clone(),
                    cancel: cancel.clone(),
                };
                let handle = running.spawn(worker.fetch(range));
                in_flight.insert(handle.id(), range);
            }

            let Some(joined) = running.join_next_with_id().await else {
                break;
            };
            match joined {
                Ok((id, report)) => {
                    in_flight.remove(&id);
                    self.merge(report, &mut outcome, &mut pending, &mut sink).await;
                }
                Err(join_err) => {
                    let range = in_flight.remove(&join_err.id());
                    error!(target = "harvest", ?range, error = %join_err, "partition task panicked");
                    if let Some(range) = range {
                        outcome.failed_ranges.push(FailedRange {
                            range,
                            error: SourceError::transient(format!("task failed: {join_err}")),
                            attempts: 0,
                        });
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            outcome.cancelled = true;
            outcome.unharvested_ranges.extend(pending.drain(..));
            outcome.unharvested_ranges.sort();
            warn!(
                target = "harvest",
                run_id = %outcome.run_id,
                kept = outcome.records.len(),
                unharvested = outcome.unharvested_ranges.len(),
                "harvest cancelled; keeping partial results"
            );
        }
        if !outcome.failed_ranges.is_empty() {
            let ranges: Vec<String> = outcome
                .failed_ranges
                .iter()
                .map(|f| f.range.to_string())
                .collect();
            warn!(
                target = "harvest",
                run_id = %outcome.run_id,
                failed = ?ranges,
                "harvest finished with incomplete coverage"
            );
        }

        outcome.elapsed = started.elapsed();
        info!(
            target = "harvest",
            run_id = %outcome.run_id,
            records = outcome.records.len(),
            requests = outcome.requests,
            splits = outcome.splits,
            leaves = outcome.leaves,
            duplicates = outcome.duplicates,
            malformed = outcome.malformed(),
            failed_partitions = outcome.failed_ranges.len(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "harvest finished"
        );
        Ok(outcome)
    }

    async fn merge(
        &self,
        report: PartitionReport,
        outcome: &mut HarvestOutcome,
        pending: &mut Vec<IdRange>,
        sink: &mut Option<mpsc::Sender<CatalogRecord>>,
    ) {
        outcome.requests += report.requests;
        let fetched = report.records.len();

        for raw in report.records {
            let hint = raw.get("id").and_then(Value::as_i64);
            if let Some(id) = hint {
                if outcome.records.contains_key(&id) {
                    outcome.duplicates += 1;
                    continue;
                }
            }
            match CatalogRecord::from_raw(raw) {
                Ok(ParsedRecord { record, references }) => {
                    for r in &references {
                        self.lookups.upsert(r.category, r.id, &r.name);
                    }
                    if let Some(tx) = sink.as_ref() {
                        if tx.send(record.clone()).await.is_err() {
                            debug!(target = "harvest", "stream consumer dropped; collecting only");
                            *sink = None;
                        }
                    }
                    outcome.records.insert(record.id, record);
                }
                Err(err) => {
                    let first_seen = match hint {
                        Some(id) => outcome.malformed_ids.insert(id),
                        None => {
                            outcome.malformed_without_id += 1;
                            true
                        }
                    };
                    if first_seen {
                        warn!(target = "harvest", error = %err, "skipping malformed record");
                    }
                }
            }
        }

        match report.outcome {
            PartitionOutcome::Split(lower, upper) => {
                outcome.splits += 1;
                debug!(
                    target = "harvest",
                    range = %report.range,
                    %lower,
                    %upper,
                    "full page; bisecting"
                );
                pending.push(upper);
                pending.push(lower);
            }
            PartitionOutcome::Exhausted => {
                outcome.leaves += 1;
                debug!(
                    target = "harvest",
                    range = %report.range,
                    fetched,
                    requests = report.requests,
                    "partition exhausted"
                );
            }
            PartitionOutcome::Failed { error, attempts } => {
                if matches!(error, SourceError::OffsetCeilingExceeded { .. }) {
                    error!(
                        target = "harvest",
                        range = %report.range,
                        error = %error,
                        "offset ceiling hit inside a partition; coverage of this range is lost"
                    );
                } else {
                    warn!(
                        target = "harvest",
                        range = %report.range,
                        attempts,
                        error = %error,
                        "partition failed after retries"
                    );
                }
                outcome.failed_ranges.push(FailedRange {
                    range: report.range,
                    error,
                    attempts,
                });
            }
            PartitionOutcome::Cancelled => {
                outcome.unharvested_ranges.push(report.range);
            }
        }
    }
}
