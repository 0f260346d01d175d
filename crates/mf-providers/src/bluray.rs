//! blu-ray.com physical releases, tracked per catalogue country.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use mf_core::{OutputRow, ProviderTag, SourceRow};
use mf_storage::HttpFetch;
use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    de, decode_raw, element_text, encode_raw, ensure_row_provider, js_literal, last_child_text,
    output_row, select_all, Item, Provider, ProviderError, Source, DESKTOP_USER_AGENT,
};

const TAG: ProviderTag = ProviderTag::BluRayComPhysicalRelease;
const HOME_URL: &str = "https://www.blu-ray.com";
const MOVIE_ENTRY_PATTERN: &str = r"(?i)movies\[[0-9]+\]\s*=\s*(\{.*\})";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseKind {
    Bluray,
    Dvd,
}

impl ReleaseKind {
    fn listing_url(self, year: i32, month: u32) -> String {
        let section = match self {
            ReleaseKind::Bluray => "movies",
            ReleaseKind::Dvd => "dvd",
        };
        format!("{HOME_URL}/{section}/releasedates.php?year={year}&month={month}")
    }
}

/// One `movies[n] = {...}` entry of a release-dates page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieEntry {
    #[serde(deserialize_with = "de::id_or_text")]
    pub id: u64,
    #[serde(default, deserialize_with = "de::blank_as_none", skip_serializing_if = "Option::is_none")]
    pub casing: Option<String>,
    #[serde(default, deserialize_with = "de::blank_as_none", skip_serializing_if = "Option::is_none")]
    pub artworkurl: Option<String>,
    #[serde(deserialize_with = "de::trimmed")]
    pub title_sort: String,
    #[serde(deserialize_with = "de::trimmed")]
    pub title: String,
    #[serde(default, deserialize_with = "de::blank_as_none", skip_serializing_if = "Option::is_none")]
    pub edition: Option<String>,
    #[serde(default, deserialize_with = "de::blank_as_none", skip_serializing_if = "Option::is_none")]
    pub extended: Option<String>,
    #[serde(deserialize_with = "de::trimmed")]
    pub title_keywords: String,
    #[serde(default, deserialize_with = "de::blank_as_none", skip_serializing_if = "Option::is_none")]
    pub studio: Option<String>,
    #[serde(deserialize_with = "de::int_or_text")]
    pub year: i64,
    #[serde(deserialize_with = "de::int_or_text")]
    pub yearend: i64,
    #[serde(deserialize_with = "de::timestamp")]
    pub releasedate: DateTime<Utc>,
    pub popularity: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseExtra {
    #[serde(rename = "artworkUrl")]
    pub artwork_url: String,
    #[serde(rename = "type")]
    pub kind: ReleaseKind,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    #[serde(flatten)]
    pub entry: MovieEntry,
    pub extra: ReleaseExtra,
}

impl Release {
    pub fn from_entry(entry: MovieEntry, kind: ReleaseKind) -> Self {
        let link = format!(
            "{HOME_URL}/movies/{}-Blu-ray/{}/",
            entry.title_keywords, entry.id
        );
        let artwork_url = entry.artworkurl.clone().unwrap_or_else(|| {
            format!("https://images.blu-ray.com/movies/covers/{}_medium.jpg", entry.id)
        });
        Self {
            entry,
            extra: ReleaseExtra {
                artwork_url,
                kind,
                link,
            },
        }
    }
}

pub fn parse_countries(html: &str) -> Result<Vec<Country>, ProviderError> {
    let document = Html::parse_document(html);
    let items = select_all(&document, "#search_locale #search_locale_list>ul>li")?;
    Ok(items
        .into_iter()
        .filter_map(|li| {
            let code = li.value().id()?.trim().trim_start_matches("country_").trim();
            if code.is_empty() {
                return None;
            }
            Some(Country {
                code: code.to_string(),
                name: last_child_text(li).unwrap_or_default(),
            })
        })
        .collect())
}

/// Releases listed by the `movielist()` script of a release-dates page.
pub fn parse_releases(html: &str, kind: ReleaseKind) -> Result<Vec<Release>, ProviderError> {
    let document = Html::parse_document(html);
    let Some(script) = select_all(&document, "script")?
        .into_iter()
        .map(element_text)
        .find(|text| text.contains("function movielist()"))
    else {
        return Ok(Vec::new());
    };

    let pattern = Regex::new(MOVIE_ENTRY_PATTERN)
        .map_err(|e| ProviderError::Schema(format!("movie entry pattern: {e}")))?;

    pattern
        .captures_iter(&script)
        .filter_map(|caps| caps.get(1))
        .map(|literal| {
            let value = js_literal::parse(literal.as_str().trim())
                .map_err(|e| ProviderError::Schema(format!("movie entry: {e}")))?;
            let entry: MovieEntry = serde_json::from_value(value)?;
            Ok(Release::from_entry(entry, kind))
        })
        .collect()
}

pub struct BluRayComProvider {
    http: Arc<dyn HttpFetch>,
}

impl BluRayComProvider {
    pub fn new(http: Arc<dyn HttpFetch>) -> Self {
        Self { http }
    }

    async fn fetch_page(&self, url: &str, country: &str) -> Result<String, ProviderError> {
        let cookie = format!("country={country}");
        let headers = [("User-Agent", DESKTOP_USER_AGENT), ("Cookie", cookie.as_str())];
        Ok(self.http.fetch_text(url, &headers).await?)
    }
}

#[async_trait]
impl Provider for BluRayComProvider {
    fn tag(&self) -> ProviderTag {
        TAG
    }

    fn release_date_path(&self) -> &'static str {
        "$.releasedate"
    }

    async fn resolve(&self, term: &str) -> Result<Option<Source>, ProviderError> {
        let html = self.fetch_page(HOME_URL, "all").await?;
        let term = term.trim();
        Ok(parse_countries(&html)?
            .into_iter()
            .find(|country| country.code == term)
            .map(Source::BluRay))
    }

    async fn refresh(&self, row: &SourceRow) -> Result<Source, ProviderError> {
        let Source::BluRay(country) = self.from_persisted_source(row)? else {
            return Err(ProviderError::wrong_variant(TAG, row.provider));
        };
        self.resolve(&country.code)
            .await?
            .ok_or_else(|| ProviderError::Missing(row.key()))
    }

    async fn fetch_items(&self, source: &Source) -> Result<Vec<Item>, ProviderError> {
        let Source::BluRay(country) = source else {
            return Err(ProviderError::wrong_variant(TAG, source.tag()));
        };
        let now = Utc::now();
        let bluray_url = ReleaseKind::Bluray.listing_url(now.year(), now.month());
        let dvd_url = ReleaseKind::Dvd.listing_url(now.year(), now.month());

        let (blurays, dvds) = futures::future::try_join(
            self.fetch_page(&bluray_url, &country.code),
            self.fetch_page(&dvd_url, &country.code),
        )
        .await?;

        let mut items = parse_releases(&blurays, ReleaseKind::Bluray)?;
        items.extend(parse_releases(&dvds, ReleaseKind::Dvd)?);
        debug!(country = %country.code, items = items.len(), "blu-ray.com releases parsed");
        Ok(items.into_iter().map(Item::BluRay).collect())
    }

    fn to_persisted_source(&self, source: &Source) -> Result<SourceRow, ProviderError> {
        let Source::BluRay(country) = source else {
            return Err(ProviderError::wrong_variant(TAG, source.tag()));
        };
        Ok(SourceRow {
            id: country.code.clone(),
            provider: TAG,
            raw: encode_raw(country)?,
        })
    }

    fn from_persisted_source(&self, row: &SourceRow) -> Result<Source, ProviderError> {
        ensure_row_provider(TAG, row.provider)?;
        Ok(Source::BluRay(decode_raw(&row.raw)?))
    }

    fn to_persisted_output(&self, owner: &SourceRow, item: &Item) -> Result<OutputRow, ProviderError> {
        let Item::BluRay(release) = item else {
            return Err(ProviderError::wrong_variant(TAG, item.tag()));
        };
        output_row(owner, TAG, release.entry.id.to_string(), encode_raw(release)?)
    }

    fn to_persisted_patch(&self, owner: &SourceRow, item: &Item) -> Result<OutputRow, ProviderError> {
        self.to_persisted_output(owner, item)
    }

    fn from_persisted_output(&self, row: &OutputRow) -> Result<Item, ProviderError> {
        ensure_row_provider(TAG, row.provider)?;
        Ok(Item::BluRay(decode_raw(&row.raw)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHttp;
    use crate::ErrorKind;
    use serde_json::{json, Value as JsonValue};

    const HOME_HTML: &str = r#"<html><body>
        <div id="search_locale"><div id="search_locale_list"><ul>
          <li id="country_all"><img src="/flags/all.png"> All countries</li>
          <li id="country_fr"><img src="/flags/fr.png"> France</li>
          <li id="country_us"><img src="/flags/us.png"> United States</li>
        </ul></div></div>
    </body></html>"#;

    const BLURAY_HTML: &str = r#"<html><head><script>
        var movies = new Array();
        function movielist() {
        movies[0] = {id: 367311, casing: '', artworkurl: '', title_sort: 'Alien Romulus', title: 'Alien: Romulus ', edition: '', extended: '4K', title_keywords: 'Alien-Romulus-4K', studio: '20th Century Studios', year: '2024', yearend: '0', releasedate: '2025-10-07', popularity: 812, width: 135, height: 170};
        movies[1] = {id: 99, casing: 'slipcover', artworkurl: 'https://images.blu-ray.com/custom/99.jpg', title_sort: 'Nosferatu', title: 'Nosferatu', edition: 'Collector\'s', extended: '', title_keywords: 'Nosferatu', studio: '', year: 2024, yearend: 0, releasedate: '2025-10-14', popularity: 5, width: 135, height: 170};
        }
    </script></head><body></body></html>"#;

    const DVD_HTML: &str = r#"<html><head><script>
        function movielist() {
        movies[0] = {id: 555, title_sort: 'Heat', title: 'Heat', title_keywords: 'Heat', year: 1995, yearend: 0, releasedate: '2025-10-21', popularity: 1, width: 135, height: 190};
        }
    </script></head><body></body></html>"#;

    fn provider(http: FakeHttp) -> BluRayComProvider {
        BluRayComProvider::new(Arc::new(http))
    }

    fn france_row() -> SourceRow {
        SourceRow {
            id: "fr".into(),
            provider: TAG,
            raw: r#"{"code":"fr","name":"France"}"#.into(),
        }
    }

    #[test]
    fn countries_come_from_the_locale_menu() {
        let countries = parse_countries(HOME_HTML).unwrap();
        assert_eq!(countries.len(), 3);
        assert_eq!(
            countries[1],
            Country {
                code: "fr".into(),
                name: "France".into()
            }
        );
    }

    #[test]
    fn release_entries_get_links_and_artwork() {
        let releases = parse_releases(BLURAY_HTML, ReleaseKind::Bluray).unwrap();
        assert_eq!(releases.len(), 2);

        let first = &releases[0];
        assert_eq!(first.entry.title, "Alien: Romulus");
        assert_eq!(first.entry.year, 2024);
        assert_eq!(first.entry.casing, None);
        assert_eq!(first.entry.extended.as_deref(), Some("4K"));
        assert_eq!(
            first.extra.link,
            "https://www.blu-ray.com/movies/Alien-Romulus-4K-Blu-ray/367311/"
        );
        assert_eq!(
            first.extra.artwork_url,
            "https://images.blu-ray.com/movies/covers/367311_medium.jpg"
        );
        assert_eq!(releases[1].extra.artwork_url, "https://images.blu-ray.com/custom/99.jpg");
        assert_eq!(releases[1].entry.edition.as_deref(), Some("Collector's"));
    }

    #[test]
    fn pages_without_the_movielist_script_have_no_releases() {
        let releases = parse_releases("<html><script>var x = 1;</script></html>", ReleaseKind::Dvd).unwrap();
        assert!(releases.is_empty());
    }

    #[test]
    fn malformed_entries_are_schema_violations() {
        let html = "<script>function movielist() { movies[0] = {id: 1, title: 'x'}; }</script>";
        let err = parse_releases(html, ReleaseKind::Bluray).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaViolation);
    }

    #[tokio::test]
    async fn resolve_matches_the_country_code() {
        let http = FakeHttp::new().route(HOME_URL, HOME_HTML);
        let p = provider(http);

        let Some(Source::BluRay(country)) = p.resolve("us").await.unwrap() else {
            panic!("expected a country");
        };
        assert_eq!(country.name, "United States");
        assert!(p.resolve("zz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_fails_when_the_country_disappears() {
        let http = FakeHttp::new().route(HOME_URL, "<html></html>");
        let err = provider(http).refresh(&france_row()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Missing(ref key) if key.ends_with(":fr")));
        assert_eq!(err.kind(), ErrorKind::FetchFailure);
    }

    #[tokio::test]
    async fn fetch_items_reads_both_formats_with_the_country_cookie() {
        let http = Arc::new(
            FakeHttp::new()
                .route("https://www.blu-ray.com/movies/releasedates.php", BLURAY_HTML)
                .route("https://www.blu-ray.com/dvd/releasedates.php", DVD_HTML),
        );
        let p = BluRayComProvider::new(http.clone());
        let source = p.from_persisted_source(&france_row()).unwrap();

        let items = p.fetch_items(&source).await.unwrap();

        assert_eq!(items.len(), 3);
        let Item::BluRay(dvd) = &items[2] else {
            panic!("expected a blu-ray.com item");
        };
        assert_eq!(dvd.extra.kind, ReleaseKind::Dvd);
        for (_, headers) in http.requests() {
            assert!(headers.contains(&("Cookie".to_string(), "country=fr".to_string())));
        }
    }

    #[tokio::test]
    async fn fetch_failures_surface_as_fetch_errors() {
        let http = FakeHttp::new()
            .route("https://www.blu-ray.com/movies/releasedates.php", BLURAY_HTML)
            .fail("https://www.blu-ray.com/dvd/releasedates.php", 503);
        let p = provider(http);
        let source = p.from_persisted_source(&france_row()).unwrap();

        let err = p.fetch_items(&source).await.unwrap_err();
        assert!(matches!(err, ProviderError::Fetch(_)));
    }

    #[test]
    fn outputs_round_trip_through_rows() {
        let p = provider(FakeHttp::new());
        let release = parse_releases(BLURAY_HTML, ReleaseKind::Bluray).unwrap().remove(0);
        let item = Item::BluRay(release);

        let row = p.to_persisted_output(&france_row(), &item).unwrap();
        assert_eq!((row.id.as_str(), row.input_id.as_str()), ("367311", "fr"));

        let raw: JsonValue = serde_json::from_str(&row.raw).unwrap();
        assert_eq!(raw["releasedate"], json!("2025-10-07T00:00:00Z"));
        assert_eq!(raw["extra"]["type"], json!("bluray"));
        assert!(raw.get("casing").is_none());

        assert_eq!(p.from_persisted_output(&row).unwrap(), item);
    }

    #[test]
    fn foreign_variants_are_rejected() {
        let p = provider(FakeHttp::new());
        let steam = Source::Steam(crate::steam::Listing::default());
        let err = p.to_persisted_source(&steam).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaViolation);

        let mut row = france_row();
        row.provider = ProviderTag::ItunesMusicRelease;
        assert!(p.from_persisted_source(&row).is_err());
    }
}
