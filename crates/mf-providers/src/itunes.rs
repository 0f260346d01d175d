//! iTunes music releases, tracked per artist through the public lookup API.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mf_core::{OutputRow, ProviderTag, SourceRow};
use mf_storage::HttpFetch;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    decode_raw, encode_raw, ensure_row_provider, output_row, Item, Provider, ProviderError, Source,
};

const TAG: ProviderTag = ProviderTag::ItunesMusicRelease;
const LOOKUP_URL: &str = "https://itunes.apple.com/lookup";
const RELEASE_LIMIT: u32 = 50;
pub const PLACEHOLDER_IMAGE: &str = "https://placehold.co/256";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupEntity {
    Song,
    Album,
}

impl LookupEntity {
    fn as_str(self) -> &'static str {
        match self {
            LookupEntity::Song => "song",
            LookupEntity::Album => "album",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtistEntry {
    pub wrapper_type: String,
    pub artist_type: String,
    pub artist_name: String,
    pub artist_link_url: String,
    pub artist_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amg_artist_id: Option<u64>,
    pub primary_genre_name: String,
    pub primary_genre_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtistExtra {
    pub artist_image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    #[serde(flatten)]
    pub entry: ArtistEntry,
    pub extra: ArtistExtra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Album {
    pub collection_type: String,
    pub artist_id: u64,
    pub collection_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amg_artist_id: Option<u64>,
    pub artist_name: String,
    pub collection_name: String,
    pub collection_censored_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist_view_url: Option<String>,
    pub collection_view_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_url60: Option<String>,
    pub artwork_url100: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_price: Option<f64>,
    pub collection_explicitness: String,
    pub track_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copyright: Option<String>,
    pub country: String,
    pub currency: String,
    #[serde(default = "Utc::now")]
    pub release_date: DateTime<Utc>,
    pub primary_genre_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_advisory_rating: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    pub kind: String,
    pub artist_id: u64,
    pub collection_id: u64,
    pub track_id: u64,
    pub artist_name: String,
    pub collection_name: String,
    pub track_name: String,
    pub collection_censored_name: String,
    pub track_censored_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_artist_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_artist_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist_view_url: Option<String>,
    pub collection_view_url: String,
    pub track_view_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_url30: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_url60: Option<String>,
    pub artwork_url100: String,
    #[serde(default = "Utc::now")]
    pub release_date: DateTime<Utc>,
    pub collection_explicitness: String,
    pub track_explicitness: String,
    pub disc_count: u32,
    pub disc_number: u32,
    pub track_count: u32,
    pub track_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_time_millis: Option<u64>,
    pub country: String,
    pub currency: String,
    pub primary_genre_name: String,
    #[serde(default)]
    pub is_streamable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_advisory_rating: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "wrapperType")]
pub enum Release {
    #[serde(rename = "collection")]
    Album(Album),
    #[serde(rename = "track")]
    Song(Song),
}

impl Release {
    pub fn id(&self) -> u64 {
        match self {
            Release::Album(album) => album.collection_id,
            Release::Song(song) => song.track_id,
        }
    }

    pub fn release_date(&self) -> DateTime<Utc> {
        match self {
            Release::Album(album) => album.release_date,
            Release::Song(song) => song.release_date,
        }
    }
}

/// Compilations, DJ mixes and tracks that cannot be streamed are not tracked.
///
/// Works on the raw lookup entry, before it is parsed into a [`Release`].
pub fn is_usable(entry: &JsonValue) -> bool {
    let text = |key: &str| {
        entry
            .get(key)
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_lowercase()
    };
    let is_track = text("wrapperType") == "track";

    let credited = if is_track {
        text("collectionArtistName")
    } else {
        text("artistName")
    };
    let is_compilation = credited.contains("various artists");
    let is_dj_mix = text("collectionName").contains("dj mix") || text("collectionCensoredName").contains("dj mix");
    let is_streamable = !is_track
        || entry
            .get("isStreamable")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);

    !is_compilation && !is_dj_mix && is_streamable
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    #[serde(default)]
    results: Vec<JsonValue>,
}

/// Swap the file name of an artwork URL for its 256x256 rendition.
pub fn resize_artwork(url: &str) -> Option<String> {
    let (base, file) = url.rsplit_once('/')?;
    let extension = file.split('.').nth(1)?;
    Some(format!("{base}/256x256.{extension}"))
}

fn pattern(source: &str) -> Result<Regex, ProviderError> {
    Regex::new(source).map_err(|e| ProviderError::Schema(format!("pattern `{source}`: {e}")))
}

pub struct ItunesProvider {
    http: Arc<dyn HttpFetch>,
}

impl ItunesProvider {
    pub fn new(http: Arc<dyn HttpFetch>) -> Self {
        Self { http }
    }

    async fn lookup(&self, url: &str) -> Result<Vec<JsonValue>, ProviderError> {
        let body = self.http.fetch_json(url, &[]).await?;
        let response: LookupResponse = serde_json::from_value(body)?;
        Ok(response.results)
    }

    /// Read the artist page only up to its `og:image` tag or the end of `<head>`.
    async fn artist_image(&self, page_url: &str) -> Result<Option<String>, ProviderError> {
        let stop = pattern(r#"(?i)<meta property="og:image".*>|</head>"#)?;
        let og_image = pattern(r#"(?i)<meta\s+property="og:image"\s+content="([^"]*)""#)?;

        let mut stream = self.http.fetch_stream(page_url, &[]).await?;
        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            if stop.is_match(&String::from_utf8_lossy(&buffer)) {
                break;
            }
        }

        let html = String::from_utf8_lossy(&buffer);
        let image = og_image
            .captures(&html)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string());
        Ok(image
            .filter(|url| !url.contains("apple-music-"))
            .and_then(|url| resize_artwork(&url)))
    }

    async fn latest_releases(&self, artist_id: u64, entity: LookupEntity) -> Result<Vec<Release>, ProviderError> {
        let url = format!(
            "{LOOKUP_URL}?id={artist_id}&entity={}&media=music&sort=recent&limit={RELEASE_LIMIT}",
            entity.as_str()
        );
        let results = self.lookup(&url).await?;

        // first result is the artist itself
        let mut releases = Vec::new();
        for value in results.into_iter().skip(1).filter(is_usable) {
            releases.push(serde_json::from_value(value)?);
        }
        Ok(releases)
    }
}

#[async_trait]
impl Provider for ItunesProvider {
    fn tag(&self) -> ProviderTag {
        TAG
    }

    fn release_date_path(&self) -> &'static str {
        "$.releaseDate"
    }

    async fn resolve(&self, term: &str) -> Result<Option<Source>, ProviderError> {
        let term = term.trim();
        if term.is_empty() || !term.chars().all(|c| c.is_ascii_digit()) {
            return Ok(None);
        }

        let url = format!("{LOOKUP_URL}?id={term}");
        let Some(first) = self.lookup(&url).await?.into_iter().next() else {
            return Ok(None);
        };
        let wrapper_type = first.get("wrapperType").and_then(JsonValue::as_str).unwrap_or_default();
        if wrapper_type != "artist" {
            debug!(term, wrapper_type, "lookup did not return an artist");
            return Ok(None);
        }
        let entry: ArtistEntry = serde_json::from_value(first)?;

        let artist_image = self
            .artist_image(&entry.artist_link_url)
            .await?
            .unwrap_or_else(|| PLACEHOLDER_IMAGE.to_string());
        Ok(Some(Source::Itunes(Artist {
            entry,
            extra: ArtistExtra { artist_image },
        })))
    }

    async fn refresh(&self, row: &SourceRow) -> Result<Source, ProviderError> {
        let Source::Itunes(artist) = self.from_persisted_source(row)? else {
            return Err(ProviderError::wrong_variant(TAG, row.provider));
        };
        self.resolve(&artist.entry.artist_id.to_string())
            .await?
            .ok_or_else(|| ProviderError::Missing(row.key()))
    }

    async fn fetch_items(&self, source: &Source) -> Result<Vec<Item>, ProviderError> {
        let Source::Itunes(artist) = source else {
            return Err(ProviderError::wrong_variant(TAG, source.tag()));
        };
        let artist_id = artist.entry.artist_id;
        let (songs, albums) = futures::future::try_join(
            self.latest_releases(artist_id, LookupEntity::Song),
            self.latest_releases(artist_id, LookupEntity::Album),
        )
        .await?;

        Ok(songs.into_iter().chain(albums).map(Item::Itunes).collect())
    }

    fn to_persisted_source(&self, source: &Source) -> Result<SourceRow, ProviderError> {
        let Source::Itunes(artist) = source else {
            return Err(ProviderError::wrong_variant(TAG, source.tag()));
        };
        Ok(SourceRow {
            id: artist.entry.artist_id.to_string(),
            provider: TAG,
            raw: encode_raw(artist)?,
        })
    }

    fn from_persisted_source(&self, row: &SourceRow) -> Result<Source, ProviderError> {
        ensure_row_provider(TAG, row.provider)?;
        Ok(Source::Itunes(decode_raw(&row.raw)?))
    }

    fn to_persisted_output(&self, owner: &SourceRow, item: &Item) -> Result<OutputRow, ProviderError> {
        let Item::Itunes(release) = item else {
            return Err(ProviderError::wrong_variant(TAG, item.tag()));
        };
        output_row(owner, TAG, release.id().to_string(), encode_raw(release)?)
    }

    /// The release date is left out so a later lookup cannot move a known date.
    fn to_persisted_patch(&self, owner: &SourceRow, item: &Item) -> Result<OutputRow, ProviderError> {
        let Item::Itunes(release) = item else {
            return Err(ProviderError::wrong_variant(TAG, item.tag()));
        };
        let mut value = serde_json::to_value(release)?;
        if let Some(fields) = value.as_object_mut() {
            fields.shift_remove("releaseDate");
        }
        output_row(owner, TAG, release.id().to_string(), encode_raw(&value)?)
    }

    fn from_persisted_output(&self, row: &OutputRow) -> Result<Item, ProviderError> {
        ensure_row_provider(TAG, row.provider)?;
        Ok(Item::Itunes(decode_raw(&row.raw)?))
    }
}
