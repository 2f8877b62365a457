//! Flat CSV tables, written as full snapshots at the end of a run.
//!
//! Layout under the data directory:
//! `streamers.csv`, `games.csv`, `identifier_mappings.csv`, one
//! `lookups/<category>.csv` per lookup dictionary and the append-only
//! `logs/runtime.csv`. Nested values (history,
//! follower samples, id lists) are JSON inside a single column.

use crate::bridge::IdentifierMapping;
use crate::catalog::CatalogRecord;
use crate::errors::StorageError;
use crate::lookup::{LookupCategory, LookupEntry, LookupTableSet};
use crate::streamers::model::{FollowerSample, GameHistory, GameKey, StreamerRecord, ViewSample};
use crate::util::env::data_dir;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const STREAMERS_TABLE: &str = "streamers.csv";
const GAMES_TABLE: &str = "games.csv";
const MAPPINGS_TABLE: &str = "identifier_mappings.csv";
const LOOKUPS_DIR: &str = "lookups";
const LOGS_DIR: &str = "logs";
const RUNTIME_TABLE: &str = "runtime.csv";

/// One finished job. Timing columns are empty when the job's requests were
/// not timed individually.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEntry {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub content_type: String,
    pub num_items: usize,
    pub requests: usize,
    pub min_request_ms: Option<f64>,
    pub max_request_ms: Option<f64>,
    pub mean_request_ms: Option<f64>,
    pub std_dev_request_ms: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamerRow {
    id: i64,
    login: String,
    display_name: String,
    profile_image_url: Option<String>,
    total_views: u64,
    view_history: String,
    description: Option<String>,
    follower_count: Option<u64>,
    follower_history: String,
    language: Option<String>,
    history: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GameRow {
    id: i64,
    name: String,
    genres: String,
    keywords: String,
    themes: String,
    platforms: String,
    game_modes: String,
    player_perspectives: String,
    age_ratings: String,
    rating: Option<f64>,
    popularity: Option<f64>,
    release_date: Option<i64>,
    category: Option<i64>,
    collection_id: Option<i64>,
    time_to_beat: Option<i64>,
    similar_games: String,
    igdb_box_art_url: Option<String>,
    twitch_box_art_url: Option<String>,
}

fn to_json<T: Serialize>(value: &T) -> String {
    // Plain data (maps with string keys, vecs of numbers) always serializes.
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Tables rooted at one directory.
#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Self {
        Self::new(data_dir())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lookup_path(&self, category: LookupCategory) -> PathBuf {
        self.root
            .join(LOOKUPS_DIR)
            .join(format!("{}.csv", category.table_name()))
    }

    pub fn save_streamers<'a>(
        &self,
        records: impl IntoIterator<Item = &'a StreamerRecord>,
    ) -> Result<usize, StorageError> {
        let rows = records.into_iter().map(|r| StreamerRow {
            id: r.id,
            login: r.login.clone(),
            display_name: r.display_name.clone(),
            profile_image_url: r.profile_image_url.clone(),
            total_views: r.total_views,
            view_history: to_json(&r.view_history),
            description: r.description.clone(),
            follower_count: r.follower_count,
            follower_history: to_json(&r.follower_history),
            language: r.language.clone(),
            history: to_json(&r.history),
        });
        write_table(&self.root.join(STREAMERS_TABLE), rows)
    }

    pub fn load_streamers(&self) -> Result<Vec<StreamerRecord>, StorageError> {
        let path = self.root.join(STREAMERS_TABLE);
        let rows: Vec<StreamerRow> = read_table(&path)?;
        rows.into_iter()
            .enumerate()
            .map(|(idx, row)| {
                let history: BTreeMap<GameKey, GameHistory> =
                    parse_json(&path, idx, "history", &row.history)?;
                let view_history: Vec<ViewSample> =
                    parse_json(&path, idx, "view_history", &row.view_history)?;
                let follower_history: Vec<FollowerSample> =
                    parse_json(&path, idx, "follower_history", &row.follower_history)?;
                Ok(StreamerRecord {
                    id: row.id,
                    login: row.login,
                    display_name: row.display_name,
                    profile_image_url: row.profile_image_url,
                    total_views: row.total_views,
                    view_history,
                    description: row.description,
                    follower_count: row.follower_count,
                    follower_history,
                    language: row.language,
                    history,
                })
            })
            .collect()
    }

    pub fn save_games<'a>(
        &self,
        records: impl IntoIterator<Item = &'a CatalogRecord>,
    ) -> Result<usize, StorageError> {
        let rows = records.into_iter().map(|g| GameRow {
            id: g.id,
            name: g.name.clone(),
            genres: to_json(&g.genres),
            keywords: to_json(&g.keywords),
            themes: to_json(&g.themes),
            platforms: to_json(&g.platforms),
            game_modes: to_json(&g.game_modes),
            player_perspectives: to_json(&g.player_perspectives),
            age_ratings: to_json(&g.age_ratings),
            rating: g.rating,
            popularity: g.popularity,
            release_date: g.release_date,
            category: g.category,
            collection_id: g.collection_id,
            time_to_beat: g.time_to_beat,
            similar_games: to_json(&g.similar_games),
            igdb_box_art_url: g.igdb_box_art_url.clone(),
            twitch_box_art_url: g.twitch_box_art_url.clone(),
        });
        write_table(&self.root.join(GAMES_TABLE), rows)
    }

    pub fn load_games(&self) -> Result<Vec<CatalogRecord>, StorageError> {
        let path = self.root.join(GAMES_TABLE);
        let rows: Vec<GameRow> = read_table(&path)?;
        rows.into_iter()
            .enumerate()
            .map(|(idx, row)| {
                let ids = |column: &'static str, raw: &str| -> Result<Vec<i64>, StorageError> {
                    parse_json(&path, idx, column, raw)
                };
                Ok(CatalogRecord {
                    id: row.id,
                    name: row.name,
                    genres: ids("genres", &row.genres)?,
                    keywords: ids("keywords", &row.keywords)?,
                    themes: ids("themes", &row.themes)?,
                    platforms: ids("platforms", &row.platforms)?,
                    game_modes: ids("game_modes", &row.game_modes)?,
                    player_perspectives: ids("player_perspectives", &row.player_perspectives)?,
                    age_ratings: ids("age_ratings", &row.age_ratings)?,
                    rating: row.rating,
                    popularity: row.popularity,
                    release_date: row.release_date,
                    category: row.category,
                    collection_id: row.collection_id,
                    time_to_beat: row.time_to_beat,
                    similar_games: ids("similar_games", &row.similar_games)?,
                    igdb_box_art_url: row.igdb_box_art_url,
                    twitch_box_art_url: row.twitch_box_art_url,
                })
            })
            .collect()
    }

    pub fn save_mappings(&self, mappings: &[IdentifierMapping]) -> Result<usize, StorageError> {
        write_table(&self.root.join(MAPPINGS_TABLE), mappings.iter())
    }

    pub fn load_mappings(&self) -> Result<Vec<IdentifierMapping>, StorageError> {
        read_table(&self.root.join(MAPPINGS_TABLE))
    }

    /// Append a job row, keeping every earlier one.
    pub fn append_runtime(&self, entry: &RuntimeEntry) -> Result<usize, StorageError> {
        let mut entries = self.load_runtime()?;
        entries.push(entry.clone());
        write_table(&self.runtime_path(), entries.iter())
    }

    pub fn load_runtime(&self) -> Result<Vec<RuntimeEntry>, StorageError> {
        read_table(&self.runtime_path())
    }

    fn runtime_path(&self) -> PathBuf {
        self.root.join(LOGS_DIR).join(RUNTIME_TABLE)
    }

    /// One file per category, including empty ones.
    pub fn save_lookups(&self, lookups: &LookupTableSet) -> Result<usize, StorageError> {
        let mut total = 0;
        for category in LookupCategory::ALL {
            total += write_table(&self.lookup_path(category), lookups.entries(category).iter())?;
        }
        Ok(total)
    }

    /// Merge persisted dictionaries into `lookups`; returns the number of rows read.
    pub fn load_lookups(&self, lookups: &LookupTableSet) -> Result<usize, StorageError> {
        let mut total = 0;
        for category in LookupCategory::ALL {
            let entries: Vec<LookupEntry> = read_table(&self.lookup_path(category))?;
            total += entries.len();
            for entry in entries {
                lookups.upsert(category, entry.id, &entry.name);
            }
        }
        Ok(total)
    }
}

fn parse_json<T: DeserializeOwned>(
    path: &Path,
    idx: usize,
    column: &'static str,
    raw: &str,
) -> Result<T, StorageError> {
    let raw = if raw.trim().is_empty() { "[]" } else { raw };
    serde_json::from_str(raw).map_err(|err| StorageError::BadColumn {
        path: path.display().to_string(),
        // Header is line 1.
        row: idx + 2,
        column,
        message: err.to_string(),
    })
}

/// Write all rows to `<path>.tmp`, then rename over `path`.
fn write_table<T, I>(path: &Path, rows: I) -> Result<usize, StorageError>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let path_str = path.display().to_string();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StorageError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let tmp = path.with_extension("csv.tmp");
    let csv_err = |source| StorageError::Csv {
        path: path_str.clone(),
        source,
    };

    let mut count = 0usize;
    {
        let mut writer = csv::Writer::from_path(&tmp).map_err(csv_err)?;
        for row in rows {
            writer.serialize(row).map_err(csv_err)?;
            count += 1;
        }
        writer.flush().map_err(|source| StorageError::Io {
            path: path_str.clone(),
            source,
        })?;
    }
    fs::rename(&tmp, path).map_err(|source| StorageError::Io {
        path: path_str.clone(),
        source,
    })?;
    info!(target = "storage", path = %path_str, rows = count, "table written");
    Ok(count)
}

/// Read a whole table; a missing file is an empty table.
fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    let path_str = path.display().to_string();
    if !path.exists() {
        debug!(target = "storage", path = %path_str, "table missing; starting empty");
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path).map_err(|source| StorageError::Csv {
        path: path_str.clone(),
        source,
    })?;
    let rows = reader
        .deserialize()
        .collect::<Result<Vec<T>, csv::Error>>()
        .map_err(|source| StorageError::Csv {
            path: path_str.clone(),
            source,
        })?;
    debug!(target = "storage", path = %path_str, rows = rows.len(), "table read");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn streamer() -> StreamerRecord {
        let mut record = StreamerRecord::new(101051819);
        record.login = "afro".into();
        record.display_name = "Afro, \"The\" Streamer".into();
        record.record_views(1100, Utc.timestamp_opt(50, 0).unwrap());
        record.record_views(1200, Utc.timestamp_opt(90_000, 0).unwrap());
        record.language = Some("es".into());
        record.history.insert(
            GameKey::Catalog(1020),
            GameHistory {
                times_played: 2,
                view_accumulator: 50,
                video_count: 1,
                dates: vec![
                    Utc.timestamp_opt(100, 0).unwrap(),
                    Utc.timestamp_opt(200, 0).unwrap(),
                ],
            },
        );
        record.history.insert(GameKey::Unknown, GameHistory::default());
        record.record_followers(77, Utc.timestamp_opt(300, 0).unwrap());
        record
    }

    #[test]
    fn streamer_table_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let record = streamer();
        assert_eq!(store.save_streamers([&record]).unwrap(), 1);
        assert!(!dir.path().join("streamers.csv.tmp").exists());

        let loaded = store.load_streamers().unwrap();
        assert_eq!(loaded[0].view_history.len(), 2);
        assert_eq!(loaded, vec![record]);
    }

    #[test]
    fn runtime_rows_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let entry = RuntimeEntry {
            started_at: Utc.timestamp_opt(1_000, 0).unwrap(),
            ended_at: Utc.timestamp_opt(1_060, 0).unwrap(),
            content_type: "games".into(),
            num_items: 120,
            requests: 14,
            min_request_ms: None,
            max_request_ms: None,
            mean_request_ms: None,
            std_dev_request_ms: None,
        };
        store.append_runtime(&entry).unwrap();
        let second = RuntimeEntry {
            content_type: "followers".into(),
            min_request_ms: Some(12.5),
            max_request_ms: Some(40.0),
            mean_request_ms: Some(21.25),
            std_dev_request_ms: Some(3.1),
            ..entry.clone()
        };
        assert_eq!(store.append_runtime(&second).unwrap(), 2);
        assert!(dir.path().join("logs").join("runtime.csv").exists());
        assert_eq!(store.load_runtime().unwrap(), vec![entry, second]);
    }

    #[test]
    fn missing_tables_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path().join("nothing-here"));
        assert!(store.load_streamers().unwrap().is_empty());
        assert!(store.load_games().unwrap().is_empty());
        assert!(store.load_mappings().unwrap().is_empty());
        assert!(store.load_runtime().unwrap().is_empty());
        let lookups = LookupTableSet::new();
        assert_eq!(store.load_lookups(&lookups).unwrap(), 0);
    }

    #[test]
    fn games_keep_optional_columns_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let game = CatalogRecord {
            id: 1942,
            name: "The Witcher 3: Wild Hunt".into(),
            genres: vec![12, 31],
            keywords: vec![],
            themes: vec![1],
            platforms: vec![6, 48],
            game_modes: vec![1],
            player_perspectives: vec![2],
            age_ratings: vec![],
            rating: Some(93.5),
            popularity: None,
            release_date: Some(1431993600),
            category: Some(0),
            collection_id: None,
            time_to_beat: None,
            similar_games: vec![472],
            igdb_box_art_url: None,
            twitch_box_art_url: Some("https://static-cdn.jtvnw.net/ttv-boxart/x-285x380.jpg".into()),
        };
        store.save_games([&game]).unwrap();
        assert_eq!(store.load_games().unwrap(), vec![game]);
    }

    #[test]
    fn mappings_and_lookups_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        let mappings = vec![
            IdentifierMapping::new("33214", Some("Fortnite"), 1905),
            IdentifierMapping::new("27471", None, 121),
        ];
        store.save_mappings(&mappings).unwrap();
        assert_eq!(store.load_mappings().unwrap(), mappings);

        let lookups = LookupTableSet::new();
        lookups.upsert(LookupCategory::Genre, 5, "Shooter");
        lookups.upsert(LookupCategory::Platform, 6, "PC (Microsoft Windows)");
        assert_eq!(store.save_lookups(&lookups).unwrap(), 2);
        assert!(dir.path().join("lookups/collections.csv").exists());

        let reloaded = LookupTableSet::new();
        assert_eq!(store.load_lookups(&reloaded).unwrap(), 2);
        assert_eq!(reloaded.get(LookupCategory::Genre, 5).as_deref(), Some("Shooter"));
    }

    #[test]
    fn malformed_json_column_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::new(dir.path());
        store.save_streamers([&streamer()]).unwrap();
        let path = dir.path().join(STREAMERS_TABLE);
        let text = fs::read_to_string(&path).unwrap().replace("\"{\"\"1020\"\"", "\"{\"\"x\"\"");
        fs::write(&path, text).unwrap();

        let err = store.load_streamers().unwrap_err();
        assert!(matches!(err, StorageError::BadColumn { column: "history", row: 2, .. }));
    }
}
