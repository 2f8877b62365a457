use crate::errors::MalformedRecord;
use crate::lookup::LookupCategory;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const IGDB_IMAGE_BASE: &str = "https://images.igdb.com/igdb/image/upload";
const IGDB_COVER_SIZE: &str = "t_cover_big";

/// A fully parsed game from the catalog. List fields hold sorted, deduplicated ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: i64,
    pub name: String,
    pub genres: Vec<i64>,
    pub keywords: Vec<i64>,
    pub themes: Vec<i64>,
    pub platforms: Vec<i64>,
    pub game_modes: Vec<i64>,
    pub player_perspectives: Vec<i64>,
    pub age_ratings: Vec<i64>,
    pub rating: Option<f64>,
    pub popularity: Option<f64>,
    /// First release, unix seconds.
    pub release_date: Option<i64>,
    pub category: Option<i64>,
    pub collection_id: Option<i64>,
    /// Typical completion time in seconds.
    pub time_to_beat: Option<i64>,
    pub similar_games: Vec<i64>,
    pub igdb_box_art_url: Option<String>,
    pub twitch_box_art_url: Option<String>,
}

/// A lookup pair discovered while parsing, e.g. `(Genre, 5, "Shooter")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRef {
    pub category: LookupCategory,
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub record: CatalogRecord,
    pub references: Vec<LookupRef>,
}

/// Reference fields arrive either as bare ids or as expanded `{id, name}` objects,
/// depending on the `fields` clause of the query.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRef {
    Id(i64),
    Expanded {
        id: i64,
        #[serde(default)]
        name: Option<String>,
        /// Age ratings carry an enum code instead of a name.
        #[serde(default)]
        rating: Option<i64>,
    },
}

impl RawRef {
    fn id(&self) -> i64 {
        match self {
            RawRef::Id(id) | RawRef::Expanded { id, .. } => *id,
        }
    }

    fn name(&self) -> Option<&str> {
        match self {
            RawRef::Expanded { name: Some(n), .. } if !n.trim().is_empty() => Some(n.trim()),
            RawRef::Expanded {
                rating: Some(code), ..
            } => age_rating_label(*code),
            _ => None,
        }
    }
}

/// Board and grade for an IGDB age-rating code.
fn age_rating_label(code: i64) -> Option<&'static str> {
    const LABELS: [&str; 39] = [
        "PEGI 3", "PEGI 7", "PEGI 12", "PEGI 16", "PEGI 18",
        "ESRB RP", "ESRB EC", "ESRB E", "ESRB E10+", "ESRB T", "ESRB M", "ESRB AO",
        "CERO A", "CERO B", "CERO C", "CERO D", "CERO Z",
        "USK 0", "USK 6", "USK 12", "USK 16", "USK 18",
        "GRAC All", "GRAC 12", "GRAC 15", "GRAC 18", "GRAC Testing",
        "ClassInd L", "ClassInd 10", "ClassInd 12", "ClassInd 14", "ClassInd 16", "ClassInd 18",
        "ACB G", "ACB PG", "ACB M", "ACB MA15+", "ACB R18+", "ACB RC",
    ];
    let idx = usize::try_from(code).ok()?.checked_sub(1)?;
    LABELS.get(idx).copied()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTimeToBeat {
    Seconds(i64),
    Detailed {
        #[serde(default)]
        normally: Option<i64>,
        #[serde(default)]
        hastly: Option<i64>,
        #[serde(default)]
        completely: Option<i64>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCover {
    Id(#[allow(dead_code)] i64),
    Expanded {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        image_id: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawGame {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    genres: Option<Vec<RawRef>>,
    #[serde(default)]
    keywords: Option<Vec<RawRef>>,
    #[serde(default)]
    themes: Option<Vec<RawRef>>,
    #[serde(default)]
    platforms: Option<Vec<RawRef>>,
    #[serde(default)]
    game_modes: Option<Vec<RawRef>>,
    #[serde(default)]
    player_perspectives: Option<Vec<RawRef>>,
    #[serde(default)]
    age_ratings: Option<Vec<RawRef>>,
    #[serde(default)]
    similar_games: Option<Vec<RawRef>>,
    #[serde(default)]
    collection: Option<RawRef>,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    total_rating: Option<f64>,
    #[serde(default)]
    popularity: Option<f64>,
    #[serde(default)]
    first_release_date: Option<i64>,
    #[serde(default)]
    category: Option<i64>,
    #[serde(default)]
    time_to_beat: Option<RawTimeToBeat>,
    #[serde(default)]
    cover: Option<RawCover>,
}

fn normalize_url(raw: &str) -> String {
    if raw.starts_with("//") {
        format!("https:{}", raw)
    } else {
        raw.to_string()
    }
}

fn cover_url(cover: &RawCover) -> Option<String> {
    match cover {
        RawCover::Expanded {
            image_id: Some(image_id),
            ..
        } if !image_id.is_empty() => Some(format!(
            "{}/{}/{}.jpg",
            IGDB_IMAGE_BASE, IGDB_COVER_SIZE, image_id
        )),
        RawCover::Expanded { url: Some(url), .. } if !url.is_empty() => Some(normalize_url(url)),
        _ => None,
    }
}

fn collect_ids(
    refs: Option<Vec<RawRef>>,
    category: Option<LookupCategory>,
    references: &mut Vec<LookupRef>,
) -> Vec<i64> {
    let Some(refs) = refs else {
        return Vec::new();
    };
    let mut ids = Vec::with_capacity(refs.len());
    for r in &refs {
        ids.push(r.id());
        if let (Some(category), Some(name)) = (category, r.name()) {
            references.push(LookupRef {
                category,
                id: r.id(),
                name: name.to_string(),
            });
        }
    }
    ids.sort_unstable();
    ids.dedup();
    ids
}

impl CatalogRecord {
    /// Parse one raw catalog payload. Fails without side effects if the payload
    /// is not an object, lacks a positive id or a name, or has mistyped fields.
    pub fn from_raw(raw: Value) -> Result<ParsedRecord, MalformedRecord> {
        let hint = raw.get("id").cloned().unwrap_or(Value::Null);
        let game: RawGame = serde_json::from_value(raw)
            .map_err(|err| MalformedRecord::new("catalog", format!("id={hint}: {err}")))?;

        let id = match game.id {
            Some(id) if id > 0 => id,
            Some(id) => return Err(MalformedRecord::new("catalog", format!("non-positive id {id}"))),
            None => return Err(MalformedRecord::new("catalog", "missing id")),
        };
        let name = match game.name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => return Err(MalformedRecord::new("catalog", format!("id={id}: missing name"))),
        };

        let mut references = Vec::new();
        let genres = collect_ids(game.genres, Some(LookupCategory::Genre), &mut references);
        let keywords = collect_ids(game.keywords, Some(LookupCategory::Keyword), &mut references);
        let themes = collect_ids(game.themes, Some(LookupCategory::Theme), &mut references);
        let platforms = collect_ids(game.platforms, Some(LookupCategory::Platform), &mut references);
        let game_modes = collect_ids(game.game_modes, Some(LookupCategory::GameMode), &mut references);
        let player_perspectives = collect_ids(
            game.player_perspectives,
            Some(LookupCategory::PlayerPerspective),
            &mut references,
        );
        let age_ratings =
            collect_ids(game.age_ratings, Some(LookupCategory::AgeRating), &mut references);
        let similar_games = collect_ids(game.similar_games, None, &mut references);

        let collection_id = game.collection.as_ref().map(|c| {
            if let Some(name) = c.name() {
                references.push(LookupRef {
                    category: LookupCategory::Collection,
                    id: c.id(),
                    name: name.to_string(),
                });
            }
            c.id()
        });

        let time_to_beat = game.time_to_beat.and_then(|t| match t {
            RawTimeToBeat::Seconds(s) => Some(s),
            RawTimeToBeat::Detailed {
                normally,
                hastly,
                completely,
            } => normally.or(hastly).or(completely),
        });

        let record = CatalogRecord {
            id,
            name,
            genres,
            keywords,
            themes,
            platforms,
            game_modes,
            player_perspectives,
            age_ratings,
            rating: game.rating.or(game.total_rating),
            popularity: game.popularity,
            release_date: game.first_release_date,
            category: game.category,
            collection_id,
            time_to_beat,
            similar_games,
            igdb_box_art_url: game.cover.as_ref().and_then(cover_url),
            twitch_box_art_url: None,
        };
        Ok(ParsedRecord { record, references })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_expanded_references() {
        let parsed = CatalogRecord::from_raw(json!({
            "id": 1942,
            "name": "The Witcher 3: Wild Hunt",
            "genres": [{"id": 12, "name": "Role-playing (RPG)"}, {"id": 31, "name": "Adventure"}],
            "themes": [1, 17],
            "platforms": [{"id": 6, "name": "PC (Microsoft Windows)"}, 48, 6],
            "collection": {"id": 262, "name": "The Witcher"},
            "first_release_date": 1431993600,
            "rating": 93.4,
            "time_to_beat": {"normally": 183600},
            "cover": {"image_id": "co1wyy", "url": "//images.igdb.com/x.jpg"},
            "similar_games": [1877, 1877, 472]
        }))
        .unwrap();

        let r = &parsed.record;
        assert_eq!(r.id, 1942);
        assert_eq!(r.genres, vec![12, 31]);
        assert_eq!(r.themes, vec![1, 17]);
        assert_eq!(r.platforms, vec![6, 48]);
        assert_eq!(r.similar_games, vec![472, 1877]);
        assert_eq!(r.collection_id, Some(262));
        assert_eq!(r.time_to_beat, Some(183600));
        assert_eq!(r.release_date, Some(1431993600));
        assert_eq!(r.keywords, Vec::<i64>::new());
        assert_eq!(r.popularity, None);
        assert_eq!(
            r.igdb_box_art_url.as_deref(),
            Some("https://images.igdb.com/igdb/image/upload/t_cover_big/co1wyy.jpg")
        );

        let pairs: Vec<(LookupCategory, i64)> = parsed
            .references
            .iter()
            .map(|r| (r.category, r.id))
            .collect();
        assert!(pairs.contains(&(LookupCategory::Genre, 12)));
        assert!(pairs.contains(&(LookupCategory::Platform, 6)));
        assert!(pairs.contains(&(LookupCategory::Collection, 262)));
        assert!(!pairs.iter().any(|(c, _)| *c == LookupCategory::Theme));
    }

    #[test]
    fn age_ratings_are_named_from_their_code() {
        let parsed = CatalogRecord::from_raw(json!({
            "id": 1020,
            "name": "Grand Theft Auto V",
            "age_ratings": [{"id": 5211, "rating": 5}, {"id": 5212, "rating": 11}, {"id": 9, "rating": 99}]
        }))
        .unwrap();
        assert_eq!(parsed.record.age_ratings, vec![9, 5211, 5212]);
        let named: Vec<(i64, &str)> = parsed
            .references
            .iter()
            .filter(|r| r.category == LookupCategory::AgeRating)
            .map(|r| (r.id, r.name.as_str()))
            .collect();
        assert_eq!(named, vec![(5211, "PEGI 18"), (5212, "ESRB M")]);
        assert_eq!(age_rating_label(0), None);
        assert_eq!(age_rating_label(39), Some("ACB RC"));
    }

    #[test]
    fn protocol_relative_cover_url_gets_https() {
        let parsed =
            CatalogRecord::from_raw(json!({"id": 7, "name": "x", "cover": {"url": "//img/a.jpg"}}))
                .unwrap();
        assert_eq!(
            parsed.record.igdb_box_art_url.as_deref(),
            Some("https://img/a.jpg")
        );
    }

    #[test]
    fn rejects_missing_id_or_name() {
        assert!(CatalogRecord::from_raw(json!({"name": "No Id"})).is_err());
        assert!(CatalogRecord::from_raw(json!({"id": 5})).is_err());
        assert!(CatalogRecord::from_raw(json!({"id": 0, "name": "zero"})).is_err());
        assert!(CatalogRecord::from_raw(json!([1, 2, 3])).is_err());
    }

    #[test]
    fn rejects_mistyped_fields() {
        let err = CatalogRecord::from_raw(json!({"id": 9, "name": "x", "genres": "rpg"}))
            .unwrap_err();
        assert_eq!(err.kind, "catalog");
        assert!(err.reason.contains("id=9"));
    }
}
