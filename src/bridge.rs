//! Foreign (streaming platform) game identifiers → canonical catalog ids.
//!
//! The bridge is a monotonically growing mapping table. Lookups go by the
//! platform's game id first and fall back to the game name, which is matched
//! exactly after normalization and then fuzzily with Jaro-Winkler.

use crate::util::env::env_parse;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use strsim::jaro_winkler;
use tracing::{debug, info};

/// Minimum Jaro-Winkler score for a name to count as the same game.
pub const DEFAULT_MIN_NAME_SIMILARITY: f64 = 0.92;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub min_name_similarity: f64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            min_name_similarity: DEFAULT_MIN_NAME_SIMILARITY,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            min_name_similarity: env_parse(
                "BRIDGE_MIN_NAME_SIMILARITY",
                default.min_name_similarity,
            )
            .clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifierMapping {
    pub foreign_id: String,
    #[serde(default)]
    pub foreign_name: Option<String>,
    pub canonical_id: i64,
}

impl IdentifierMapping {
    pub fn new(foreign_id: impl Into<String>, foreign_name: Option<&str>, canonical_id: i64) -> Self {
        Self {
            foreign_id: foreign_id.into(),
            foreign_name: foreign_name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            canonical_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchKind {
    ForeignId,
    ExactName,
    FuzzyName { score: f64 },
    /// Found by a live catalog search and inserted by the caller.
    CatalogSearch,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution {
    Resolved { canonical_id: i64, via: MatchKind },
    NotFound,
}

impl Resolution {
    pub fn canonical_id(&self) -> Option<i64> {
        match self {
            Resolution::Resolved { canonical_id, .. } => Some(*canonical_id),
            Resolution::NotFound => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Unchanged,
    /// The foreign id previously pointed elsewhere and was overwritten.
    Corrected { previous: i64 },
}

/// Lowercase alphanumeric tokens joined by '-', so "Half-Life: Alyx" and
/// "half life alyx" compare equal.
pub fn normalize_game_name(raw: &str) -> String {
    raw.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Default)]
struct BridgeState {
    by_foreign: BTreeMap<String, IdentifierMapping>,
    by_name: BTreeMap<String, i64>,
}

impl BridgeState {
    fn index_name(&mut self, name: Option<&str>, canonical_id: i64) {
        if let Some(name) = name {
            let key = normalize_game_name(name);
            if !key.is_empty() {
                self.by_name.insert(key, canonical_id);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct IdentifierBridge {
    cfg: BridgeConfig,
    state: RwLock<BridgeState>,
}

impl IdentifierBridge {
    pub fn new(cfg: BridgeConfig) -> Self {
        Self {
            cfg,
            state: RwLock::new(BridgeState::default()),
        }
    }

    /// Build a bridge from a persisted table. Later rows win on conflict.
    pub fn from_mappings(cfg: BridgeConfig, mappings: impl IntoIterator<Item = IdentifierMapping>) -> Self {
        let bridge = Self::new(cfg);
        for mapping in mappings {
            bridge.insert(mapping);
        }
        bridge
    }

    pub fn resolve(&self, foreign_id: &str, foreign_name: Option<&str>) -> Resolution {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());

        let foreign_id = foreign_id.trim();
        if !foreign_id.is_empty() {
            if let Some(mapping) = state.by_foreign.get(foreign_id) {
                return Resolution::Resolved {
                    canonical_id: mapping.canonical_id,
                    via: MatchKind::ForeignId,
                };
            }
        }

        let Some(name) = foreign_name else {
            return Resolution::NotFound;
        };
        let key = normalize_game_name(name);
        if key.is_empty() {
            return Resolution::NotFound;
        }
        if let Some(canonical_id) = state.by_name.get(&key) {
            return Resolution::Resolved {
                canonical_id: *canonical_id,
                via: MatchKind::ExactName,
            };
        }

        // Ties go to the lowest canonical id so repeated runs agree.
        let mut best: Option<(f64, i64)> = None;
        for (candidate, canonical_id) in &state.by_name {
            let score = jaro_winkler(&key, candidate);
            if score < self.cfg.min_name_similarity {
                continue;
            }
            best = match best {
                Some((s, id)) if s > score || (s == score && id <= *canonical_id) => Some((s, id)),
                _ => Some((score, *canonical_id)),
            };
        }
        match best {
            Some((score, canonical_id)) => {
                debug!(target = "bridge", name, canonical_id, score, "fuzzy name match");
                Resolution::Resolved {
                    canonical_id,
                    via: MatchKind::FuzzyName { score },
                }
            }
            None => Resolution::NotFound,
        }
    }

    /// Idempotent insert; a conflicting canonical id overwrites and is logged.
    pub fn insert(&self, mut mapping: IdentifierMapping) -> InsertOutcome {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let previous = state
            .by_foreign
            .get(&mapping.foreign_id)
            .map(|m| (m.canonical_id, m.foreign_name.clone()));

        match previous {
            Some((canonical_id, known_name)) if canonical_id == mapping.canonical_id => {
                // Same pair: only learn a name we did not have yet.
                if known_name.is_none() && mapping.foreign_name.is_some() {
                    state.index_name(mapping.foreign_name.as_deref(), canonical_id);
                    if let Some(existing) = state.by_foreign.get_mut(&mapping.foreign_id) {
                        existing.foreign_name = mapping.foreign_name;
                    }
                }
                InsertOutcome::Unchanged
            }
            Some((previous_id, known_name)) => {
                info!(
                    target = "bridge",
                    foreign_id = %mapping.foreign_id,
                    previous = previous_id,
                    corrected = mapping.canonical_id,
                    "identifier mapping corrected"
                );
                if let Some(old) = known_name.as_deref().map(normalize_game_name) {
                    if state.by_name.get(&old) == Some(&previous_id) {
                        state.by_name.remove(&old);
                    }
                }
                // A nameless correction keeps the name learned earlier.
                if mapping.foreign_name.is_none() {
                    mapping.foreign_name = known_name;
                }
                state.index_name(mapping.foreign_name.as_deref(), mapping.canonical_id);
                state.by_foreign.insert(mapping.foreign_id.clone(), mapping);
                InsertOutcome::Corrected {
                    previous: previous_id,
                }
            }
            None => {
                state.index_name(mapping.foreign_name.as_deref(), mapping.canonical_id);
                state.by_foreign.insert(mapping.foreign_id.clone(), mapping);
                InsertOutcome::Inserted
            }
        }
    }

    pub fn len(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.by_foreign.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the table, ascending by foreign id.
    pub fn mappings(&self) -> Vec<IdentifierMapping> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.by_foreign.values().cloned().collect()
    }
}
