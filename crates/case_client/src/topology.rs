//! Location graph and suspect placement derived from a session's narrative
//! payload.
//!
//! Placement is a heuristic: a suspect stays wherever their earliest timeline
//! entry puts them. Only the player moves during play.

use std::collections::{BTreeSet, HashMap};

use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Narrative {
    #[serde(default, deserialize_with = "lenient_list")]
    pub suspects: Vec<SuspectProfile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SuspectProfile {
    #[serde(default, deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_list")]
    pub timeline: Vec<TimelineEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimelineEntry {
    #[serde(default, deserialize_with = "lenient")]
    pub time: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub location: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub action: Option<String>,
}

// A field of the wrong shape (null, a number where text belongs) reads as
// absent instead of failing the whole payload.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

// Keeps the well-formed elements of a list and drops the rest.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let Value::Array(items) = Value::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| T::deserialize(item).ok())
        .collect())
}

/// Accepts the payload either as a JSON object or as a string holding the
/// serialized object. Anything else is treated as absent.
pub fn parse_narrative(payload: &Value) -> Option<Narrative> {
    let parsed = match payload {
        Value::Object(_) => Narrative::deserialize(payload),
        Value::String(raw) => serde_json::from_str::<Narrative>(raw),
        _ => return None,
    };
    match parsed {
        Ok(narrative) => Some(narrative),
        Err(err) => {
            tracing::debug!("topology: narrative payload did not parse: {err}");
            None
        }
    }
}

pub fn extract_locations(payload: &Value) -> BTreeSet<String> {
    parse_narrative(payload)
        .map(|narrative| locations_of(&narrative))
        .unwrap_or_default()
}

pub fn build_placement_index(payload: &Value) -> PlacementIndex {
    parse_narrative(payload)
        .map(|narrative| PlacementIndex::from_narrative(&narrative))
        .unwrap_or_default()
}

pub fn suspects_at<'a>(index: &'a PlacementIndex, location: Option<&str>) -> &'a [String] {
    index.suspects_at(location)
}

fn locations_of(narrative: &Narrative) -> BTreeSet<String> {
    narrative
        .suspects
        .iter()
        .flat_map(|suspect| suspect.timeline.iter())
        .filter_map(|entry| entry.location.clone())
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementIndex {
    by_location: HashMap<String, Vec<String>>,
}

impl PlacementIndex {
    fn from_narrative(narrative: &Narrative) -> Self {
        let mut by_location: HashMap<String, Vec<String>> = HashMap::new();
        for suspect in &narrative.suspects {
            let Some(name) = suspect.name.as_deref() else {
                continue;
            };
            let Some(location) = suspect
                .timeline
                .first()
                .and_then(|entry| entry.location.as_deref())
            else {
                continue;
            };
            by_location
                .entry(location.to_string())
                .or_default()
                .push(name.to_string());
        }
        Self { by_location }
    }

    pub fn suspects_at(&self, location: Option<&str>) -> &[String] {
        location
            .and_then(|location| self.by_location.get(location))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.by_location.is_empty()
    }
}

/// Everything the player can act on, resolved in one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub locations: BTreeSet<String>,
    pub suspects: Vec<String>,
    pub placement: PlacementIndex,
}

impl Topology {
    pub fn resolve(payload: &Value) -> Self {
        let Some(narrative) = parse_narrative(payload) else {
            return Self::default();
        };
        Self {
            locations: locations_of(&narrative),
            suspects: narrative
                .suspects
                .iter()
                .filter_map(|suspect| suspect.name.clone())
                .collect(),
            placement: PlacementIndex::from_narrative(&narrative),
        }
    }

    pub fn suspects_at(&self, location: Option<&str>) -> &[String] {
        self.placement.suspects_at(location)
    }

    pub fn has_location(&self, location: &str) -> bool {
        self.locations.contains(location)
    }
}
