//! Core row model and payload helpers for Media Follower.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Closed set of remote systems the ingestion core knows how to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
pub enum ProviderTag {
    #[serde(rename = "blu-ray-com-physical-release")]
    #[sqlx(rename = "blu-ray-com-physical-release")]
    BluRayComPhysicalRelease,
    #[serde(rename = "itunes-music-release")]
    #[sqlx(rename = "itunes-music-release")]
    ItunesMusicRelease,
    #[serde(rename = "steam-games-free-promos")]
    #[sqlx(rename = "steam-games-free-promos")]
    SteamGamesFreePromos,
}

impl ProviderTag {
    pub const ALL: [ProviderTag; 3] = [
        ProviderTag::BluRayComPhysicalRelease,
        ProviderTag::ItunesMusicRelease,
        ProviderTag::SteamGamesFreePromos,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderTag::BluRayComPhysicalRelease => "blu-ray-com-physical-release",
            ProviderTag::ItunesMusicRelease => "itunes-music-release",
            ProviderTag::SteamGamesFreePromos => "steam-games-free-promos",
        }
    }
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown provider `{0}` (expected one of: blu-ray-com-physical-release, itunes-music-release, steam-games-free-promos)")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderTag {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s.trim())
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

/// Persisted tracked entity. Unique by `(id, provider)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SourceRow {
    pub id: String,
    pub provider: ProviderTag,
    /// Serialized snapshot of the remote entity (JSON text).
    pub raw: String,
}

impl SourceRow {
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.id)
    }
}

/// Persisted release item owned by a source. Unique by `(id, input_id, provider)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutputRow {
    pub id: String,
    pub input_id: String,
    pub provider: ProviderTag,
    /// Serialized item payload (JSON text).
    pub raw: String,
}

impl OutputRow {
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.provider, self.input_id, self.id)
    }
}

/// Apply a JSON merge patch (RFC 7396) to `target` in place.
///
/// Field presence rules:
/// - a key absent from `patch` leaves the stored value untouched,
/// - a key present with `null` removes the stored key,
/// - a key present with an object merges recursively,
/// - any other value (arrays and scalars included) replaces the stored value.
///
/// A non-object patch replaces the whole target.
pub fn merge_patch(target: &mut JsonValue, patch: &JsonValue) {
    let JsonValue::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = JsonValue::Object(Map::new());
    }
    let Some(target_map) = target.as_object_mut() else {
        return;
    };

    for (key, value) in patch_map {
        if value.is_null() {
            target_map.shift_remove(key);
            continue;
        }
        let slot = target_map.entry(key.clone()).or_insert(JsonValue::Null);
        merge_patch(slot, value);
    }
}

/// Merge a serialized patch into a serialized document.
///
/// Returns the new JSON text, or `None` when the patch leaves the document unchanged.
/// Key order of the stored document is kept; new keys are appended.
pub fn merge_patch_str(stored: &str, patch: &str) -> serde_json::Result<Option<String>> {
    let original: JsonValue = serde_json::from_str(stored)?;
    let patch: JsonValue = serde_json::from_str(patch)?;
    let mut doc = original.clone();
    merge_patch(&mut doc, &patch);
    if doc == original {
        return Ok(None);
    }
    serde_json::to_string(&doc).map(Some)
}
