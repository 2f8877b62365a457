use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Live,
    Video,
}

/// One broadcast or archived video as reported by the streaming platform.
/// Consumed once by the aggregator and never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub id: String,
    pub streamer_id: i64,
    pub foreign_game_id: Option<String>,
    pub game_name: Option<String>,
    pub language: Option<String>,
    pub start_time: DateTime<Utc>,
    /// Always 0 for videos.
    pub view_count: u64,
    pub kind: StreamKind,
}

impl StreamEvent {
    pub fn live(id: impl Into<String>, streamer_id: i64, start_time: DateTime<Utc>, view_count: u64) -> Self {
        Self {
            id: id.into(),
            streamer_id,
            foreign_game_id: None,
            game_name: None,
            language: None,
            start_time,
            view_count,
            kind: StreamKind::Live,
        }
    }

    pub fn video(id: impl Into<String>, streamer_id: i64, start_time: DateTime<Utc>) -> Self {
        Self {
            kind: StreamKind::Video,
            ..Self::live(id, streamer_id, start_time, 0)
        }
    }

    pub fn with_game(mut self, foreign_id: Option<&str>, name: Option<&str>) -> Self {
        self.foreign_game_id = non_empty(foreign_id);
        self.game_name = non_empty(name);
        self
    }

    pub fn with_language(mut self, language: Option<&str>) -> Self {
        self.language = non_empty(language);
        self
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Key of a streamer's per-game history: a catalog id, or the bucket for
/// games the bridge could not resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GameKey {
    Catalog(i64),
    Unknown,
}

impl fmt::Display for GameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameKey::Catalog(id) => write!(f, "{id}"),
            GameKey::Unknown => f.write_str("unknown"),
        }
    }
}

impl FromStr for GameKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "unknown" => Ok(GameKey::Unknown),
            other => other
                .parse::<i64>()
                .map(GameKey::Catalog)
                .map_err(|_| format!("invalid game key '{other}'")),
        }
    }
}

// String form so the key works as a JSON object key.
impl Serialize for GameKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GameKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameHistory {
    pub times_played: u64,
    /// Sum of live viewer counts. Videos never add to it.
    pub view_accumulator: u64,
    pub video_count: u64,
    /// Start times in processing order, not necessarily chronological.
    pub dates: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowerSample {
    pub followers: u64,
    pub measured_at: DateTime<Utc>,
}

/// Lifetime channel views at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSample {
    pub views: u64,
    pub measured_at: DateTime<Utc>,
}

/// A view sample younger than this is overwritten rather than appended to.
pub const VIEW_SAMPLE_WINDOW_HOURS: i64 = 24;

/// Identity fields of a streamer as returned by the platform's user lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamerProfile {
    pub id: i64,
    pub login: String,
    pub display_name: String,
    pub profile_image_url: Option<String>,
    pub total_views: u64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamerRecord {
    pub id: i64,
    pub login: String,
    pub display_name: String,
    pub profile_image_url: Option<String>,
    pub total_views: u64,
    pub view_history: Vec<ViewSample>,
    pub description: Option<String>,
    pub follower_count: Option<u64>,
    pub follower_history: Vec<FollowerSample>,
    pub language: Option<String>,
    pub history: BTreeMap<GameKey, GameHistory>,
}

impl StreamerRecord {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            login: String::new(),
            display_name: String::new(),
            profile_image_url: None,
            total_views: 0,
            view_history: Vec::new(),
            description: None,
            follower_count: None,
            follower_history: Vec::new(),
            language: None,
            history: BTreeMap::new(),
        }
    }

    pub fn apply_profile(&mut self, profile: &StreamerProfile, measured_at: DateTime<Utc>) {
        self.login.clone_from(&profile.login);
        self.display_name.clone_from(&profile.display_name);
        self.profile_image_url.clone_from(&profile.profile_image_url);
        self.description.clone_from(&profile.description);
        self.record_views(profile.total_views, measured_at);
    }

    /// Keeps at most one view sample per day: a sample taken within
    /// [`VIEW_SAMPLE_WINDOW_HOURS`] of the latest one replaces it.
    pub fn record_views(&mut self, views: u64, measured_at: DateTime<Utc>) {
        self.total_views = views;
        let sample = ViewSample { views, measured_at };
        match self.view_history.last_mut() {
            Some(last)
                if measured_at.signed_duration_since(last.measured_at)
                    <= Duration::hours(VIEW_SAMPLE_WINDOW_HOURS) =>
            {
                *last = sample;
            }
            _ => self.view_history.push(sample),
        }
    }

    pub fn record_followers(&mut self, followers: u64, measured_at: DateTime<Utc>) {
        self.follower_count = Some(followers);
        self.follower_history.push(FollowerSample {
            followers,
            measured_at,
        });
    }

    pub fn has_video_data(&self) -> bool {
        self.history.values().any(|h| h.video_count > 0)
    }

    pub fn last_follower_sample(&self) -> Option<&FollowerSample> {
        self.follower_history.last()
    }
}
