//! Provider contract and the three remote-source implementations.

use std::sync::Arc;

use async_trait::async_trait;
use mf_core::{OutputRow, ProviderTag, SourceRow};
use mf_storage::{FetchError, HttpFetch, RetryDisposition};
use scraper::{ElementRef, Html, Node, Selector};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub mod bluray;
mod de;
pub mod itunes;
mod js_literal;
pub mod steam;

pub use bluray::BluRayComProvider;
pub use itunes::ItunesProvider;
pub use steam::SteamFreePromosProvider;

pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Resolved tracked entity, one variant per provider.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    BluRay(bluray::Country),
    Itunes(itunes::Artist),
    Steam(steam::Listing),
}

impl Source {
    pub fn tag(&self) -> ProviderTag {
        match self {
            Source::BluRay(_) => ProviderTag::BluRayComPhysicalRelease,
            Source::Itunes(_) => ProviderTag::ItunesMusicRelease,
            Source::Steam(_) => ProviderTag::SteamGamesFreePromos,
        }
    }
}

/// Candidate release item, one variant per provider.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    BluRay(bluray::Release),
    Itunes(itunes::Release),
    Steam(steam::Promo),
}

impl Item {
    pub fn tag(&self) -> ProviderTag {
        match self {
            Item::BluRay(_) => ProviderTag::BluRayComPhysicalRelease,
            Item::Itunes(_) => ProviderTag::ItunesMusicRelease,
            Item::Steam(_) => ProviderTag::SteamGamesFreePromos,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    FetchFailure,
    SchemaViolation,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::FetchFailure => "fetch_failure",
            ErrorKind::SchemaViolation => "schema_violation",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("remote has no entry for {0}")]
    Missing(String),
    #[error("schema violation: {0}")]
    Schema(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Fetch(_) | ProviderError::Missing(_) => ErrorKind::FetchFailure,
            ProviderError::Schema(_) => ErrorKind::SchemaViolation,
        }
    }

    /// Whether the next scheduled run may succeed without any change on our side.
    pub fn retryable(&self) -> bool {
        match self {
            ProviderError::Fetch(err) => err.disposition() == RetryDisposition::Retryable,
            ProviderError::Missing(_) | ProviderError::Schema(_) => false,
        }
    }

    pub(crate) fn wrong_variant(expected: ProviderTag, got: ProviderTag) -> Self {
        ProviderError::Schema(format!("expected a {expected} payload, got {got}"))
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Schema(err.to_string())
    }
}

/// Capability set every remote source implements.
///
/// The `to_persisted_*` and `from_persisted_*` methods are pure. Network work
/// happens only in `resolve`, `refresh` and `fetch_items`, none of which retry.
#[async_trait]
pub trait Provider: Send + Sync {
    fn tag(&self) -> ProviderTag;

    /// JSON path of the release date inside an output payload, used for listing order.
    fn release_date_path(&self) -> &'static str;

    async fn resolve(&self, term: &str) -> Result<Option<Source>, ProviderError>;

    async fn refresh(&self, row: &SourceRow) -> Result<Source, ProviderError>;

    async fn fetch_items(&self, source: &Source) -> Result<Vec<Item>, ProviderError>;

    fn to_persisted_source(&self, source: &Source) -> Result<SourceRow, ProviderError>;

    fn from_persisted_source(&self, row: &SourceRow) -> Result<Source, ProviderError>;

    fn to_persisted_output(&self, owner: &SourceRow, item: &Item) -> Result<OutputRow, ProviderError>;

    /// Like [`Provider::to_persisted_output`] but limited to the fields that may overwrite stored data.
    fn to_persisted_patch(&self, owner: &SourceRow, item: &Item) -> Result<OutputRow, ProviderError>;

    fn from_persisted_output(&self, row: &OutputRow) -> Result<Item, ProviderError>;
}

pub fn provider_for(tag: ProviderTag, http: Arc<dyn HttpFetch>) -> Box<dyn Provider> {
    match tag {
        ProviderTag::BluRayComPhysicalRelease => Box::new(BluRayComProvider::new(http)),
        ProviderTag::ItunesMusicRelease => Box::new(ItunesProvider::new(http)),
        ProviderTag::SteamGamesFreePromos => Box::new(SteamFreePromosProvider::new(http)),
    }
}

pub(crate) fn ensure_row_provider(expected: ProviderTag, got: ProviderTag) -> Result<(), ProviderError> {
    if expected == got {
        Ok(())
    } else {
        Err(ProviderError::wrong_variant(expected, got))
    }
}

pub(crate) fn decode_raw<T: DeserializeOwned>(raw: &str) -> Result<T, ProviderError> {
    Ok(serde_json::from_str(raw)?)
}

pub(crate) fn encode_raw<T: Serialize>(value: &T) -> Result<String, ProviderError> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn output_row(owner: &SourceRow, tag: ProviderTag, id: String, raw: String) -> Result<OutputRow, ProviderError> {
    ensure_row_provider(tag, owner.provider)?;
    Ok(OutputRow {
        id,
        input_id: owner.id.clone(),
        provider: tag,
        raw,
    })
}

pub(crate) fn selector(css: &str) -> Result<Selector, ProviderError> {
    Selector::parse(css).map_err(|e| ProviderError::Schema(format!("invalid selector `{css}`: {e}")))
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

/// Text of the last child node of `element`, whether a text node or an element.
pub(crate) fn last_child_text(element: ElementRef<'_>) -> Option<String> {
    let last = element.children().last()?;
    match last.value() {
        Node::Text(text) => text_or_none(text),
        Node::Element(_) => ElementRef::wrap(last).and_then(|el| text_or_none(&element_text(el))),
        _ => None,
    }
}

pub(crate) fn select_first<'a>(scope: ElementRef<'a>, css: &str) -> Result<Option<ElementRef<'a>>, ProviderError> {
    let sel = selector(css)?;
    Ok(scope.select(&sel).next())
}

pub(crate) fn select_all<'a>(document: &'a Html, css: &str) -> Result<Vec<ElementRef<'a>>, ProviderError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).collect())
}


#[cfg(test)]
mod tests {
    use super::*;
    use testing::FakeHttp;

    #[test]
    fn factory_returns_a_provider_per_tag() {
        let http: Arc<dyn HttpFetch> = Arc::new(FakeHttp::new());
        for tag in ProviderTag::ALL {
            assert_eq!(provider_for(tag, http.clone()).tag(), tag);
        }
    }

    #[test]
    fn error_kinds_follow_the_taxonomy() {
        let fetch = ProviderError::Fetch(FetchError::HttpStatus {
            status: 500,
            url: "https://www.blu-ray.com".into(),
        });
        assert_eq!(fetch.kind(), ErrorKind::FetchFailure);
        assert_eq!(ProviderError::Missing("x".into()).kind(), ErrorKind::FetchFailure);

        let schema: ProviderError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(schema.kind(), ErrorKind::SchemaViolation);
        assert_eq!(schema.kind().as_str(), "schema_violation");
    }

    #[test]
    fn only_transient_fetch_failures_are_retryable() {
        let throttled = ProviderError::Fetch(FetchError::HttpStatus {
            status: 429,
            url: "https://steamdb.info/upcoming/free/".into(),
        });
        let gone = ProviderError::Fetch(FetchError::HttpStatus {
            status: 404,
            url: "https://steamdb.info/upcoming/free/".into(),
        });
        assert!(throttled.retryable());
        assert!(!gone.retryable());
        assert!(!ProviderError::Missing("x".into()).retryable());
        assert!(!ProviderError::Schema("x".into()).retryable());
    }

    #[test]
    fn last_child_text_reads_trailing_text_nodes() {
        let html = Html::parse_fragment(r#"<ul><li id="country_fr"><img src="x.png"> France </li></ul>"#);
        let li = select_all(&html, "li").unwrap();
        assert_eq!(last_child_text(li[0]).as_deref(), Some("France"));
    }
}
