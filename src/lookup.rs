//! Small id→name dictionaries referenced by catalog records (genres, themes, …).
//!
//! One [`LookupTableSet`] lives for the duration of a harvest run: it is created
//! (or loaded from disk) at start, grows as records reference new ids, and is
//! written out as one CSV table per category at the end.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupCategory {
    Genre,
    Keyword,
    Theme,
    Platform,
    GameMode,
    PlayerPerspective,
    AgeRating,
    Collection,
}

impl LookupCategory {
    pub const ALL: [LookupCategory; 8] = [
        LookupCategory::Genre,
        LookupCategory::Keyword,
        LookupCategory::Theme,
        LookupCategory::Platform,
        LookupCategory::GameMode,
        LookupCategory::PlayerPerspective,
        LookupCategory::AgeRating,
        LookupCategory::Collection,
    ];

    /// Table name used for the persisted CSV file.
    pub fn table_name(self) -> &'static str {
        match self {
            LookupCategory::Genre => "genres",
            LookupCategory::Keyword => "keywords",
            LookupCategory::Theme => "themes",
            LookupCategory::Platform => "platforms",
            LookupCategory::GameMode => "game_modes",
            LookupCategory::PlayerPerspective => "player_perspectives",
            LookupCategory::AgeRating => "age_ratings",
            LookupCategory::Collection => "collections",
        }
    }
}

impl fmt::Display for LookupCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for LookupCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LookupCategory::ALL
            .into_iter()
            .find(|c| c.table_name() == s.trim())
            .ok_or_else(|| format!("unknown lookup category: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupEntry {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Same id already present with the same name.
    Unchanged,
    /// Same id already present under another name; the new name was discarded.
    ConflictDiscarded,
}

#[derive(Debug, Default)]
pub struct LookupTableSet {
    tables: RwLock<HashMap<LookupCategory, BTreeMap<i64, String>>>,
}

impl LookupTableSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `(id, name)` into `category` unless the id is already known.
    /// First-seen name wins.
    pub fn upsert(&self, category: LookupCategory, id: i64, name: &str) -> UpsertOutcome {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let table = tables.entry(category).or_default();
        match table.get(&id) {
            None => {
                table.insert(id, name.to_string());
                UpsertOutcome::Inserted
            }
            Some(existing) if existing == name => UpsertOutcome::Unchanged,
            Some(existing) => {
                warn!(
                    target = "harvest",
                    %category,
                    id,
                    kept = %existing,
                    discarded = %name,
                    "lookup name conflict; keeping first-seen name"
                );
                UpsertOutcome::ConflictDiscarded
            }
        }
    }

    pub fn get(&self, category: LookupCategory, id: i64) -> Option<String> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.get(&category).and_then(|t| t.get(&id).cloned())
    }

    pub fn len(&self, category: LookupCategory) -> usize {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.get(&category).map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.values().all(|t| t.is_empty())
    }

    /// Snapshot of one dictionary, ascending by id.
    pub fn entries(&self, category: LookupCategory) -> Vec<LookupEntry> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables
            .get(&category)
            .map(|t| {
                t.iter()
                    .map(|(id, name)| LookupEntry {
                        id: *id,
                        name: name.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_seen_name_wins() {
        let set = LookupTableSet::new();
        assert_eq!(
            set.upsert(LookupCategory::Genre, 5, "Shooter"),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            set.upsert(LookupCategory::Genre, 5, "Shooter"),
            UpsertOutcome::Unchanged
        );
        assert_eq!(
            set.upsert(LookupCategory::Genre, 5, "FPS"),
            UpsertOutcome::ConflictDiscarded
        );
        assert_eq!(set.get(LookupCategory::Genre, 5).as_deref(), Some("Shooter"));
        assert_eq!(set.len(LookupCategory::Genre), 1);
    }

    #[test]
    fn categories_are_disjoint() {
        let set = LookupTableSet::new();
        set.upsert(LookupCategory::Genre, 1, "Adventure");
        set.upsert(LookupCategory::Theme, 1, "Horror");
        assert_eq!(set.get(LookupCategory::Genre, 1).as_deref(), Some("Adventure"));
        assert_eq!(set.get(LookupCategory::Theme, 1).as_deref(), Some("Horror"));
        assert_eq!(set.get(LookupCategory::Keyword, 1), None);
    }

    #[test]
    fn entries_are_sorted_by_id() {
        let set = LookupTableSet::new();
        set.upsert(LookupCategory::Platform, 48, "PlayStation 4");
        set.upsert(LookupCategory::Platform, 6, "PC (Microsoft Windows)");
        let ids: Vec<i64> = set
            .entries(LookupCategory::Platform)
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![6, 48]);
    }

    #[test]
    fn category_round_trips_through_table_name() {
        for category in LookupCategory::ALL {
            assert_eq!(category.table_name().parse::<LookupCategory>(), Ok(category));
        }
    }
}
