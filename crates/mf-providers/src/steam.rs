//! Free Steam promotions listed on SteamDB. There is a single fixed source.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mf_core::{OutputRow, ProviderTag, SourceRow};
use mf_storage::HttpFetch;
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};

use crate::{
    de, decode_raw, element_text, encode_raw, ensure_row_provider, output_row, select_all,
    select_first, text_or_none, Item, Provider, ProviderError, Source, DESKTOP_USER_AGENT,
};

const TAG: ProviderTag = ProviderTag::SteamGamesFreePromos;
pub const LISTING_URL: &str = "https://steamdb.info/upcoming/free/";
const STORE_APP_PREFIX: &str = "https://store.steampowered.com/app";
/// Counter-Strike is permanently free to play and is always listed.
const EXCLUDED_APP_ID: &str = "730";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub url: String,
}

impl Default for Listing {
    fn default() -> Self {
        Self {
            url: LISTING_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromoType {
    FreeToPlay,
    FreeToKeep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Promo {
    #[serde(deserialize_with = "de::id_or_text")]
    pub id: u64,
    pub image: String,
    pub link: String,
    pub name: String,
    pub promo_type: PromoType,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

fn required<T>(value: Option<T>, app_id: &str, field: &str) -> Result<T, ProviderError> {
    value.ok_or_else(|| ProviderError::Schema(format!("steam promo {app_id}: missing {field}")))
}

fn attr(element: ElementRef<'_>, name: &str) -> Option<String> {
    element.value().attr(name).and_then(text_or_none)
}

fn parse_panel(panel: ElementRef<'_>, app_id: &str) -> Result<Promo, ProviderError> {
    let promo_type = select_first(panel, "div.cat")?.and_then(|cat| {
        let classes = cat.value().attr("class").unwrap_or_default();
        if classes.contains("cat-free-to-keep") {
            Some(PromoType::FreeToKeep)
        } else if classes.contains("cat-play-for-free") {
            Some(PromoType::FreeToPlay)
        } else {
            None
        }
    });

    let times = select_all_in(panel, "div.panel-sale-time relative-time")?;
    let mut dates: Vec<DateTime<Utc>> = times
        .into_iter()
        .filter_map(|el| attr(el, "datetime"))
        .map(|text| {
            de::parse_timestamp(&text)
                .ok_or_else(|| ProviderError::Schema(format!("steam promo {app_id}: bad date `{text}`")))
        })
        .collect::<Result<_, _>>()?;
    dates.sort();
    let mut dates = dates.into_iter();

    let link = match select_first(panel, "div.app-history-type")? {
        Some(history) => history
            .children()
            .filter_map(ElementRef::wrap)
            .filter_map(|el| attr(el, "href"))
            .find(|href| href.starts_with(STORE_APP_PREFIX)),
        None => None,
    };

    Ok(Promo {
        id: app_id
            .parse()
            .map_err(|_| ProviderError::Schema(format!("steam promo: invalid app id `{app_id}`")))?,
        image: required(
            select_first(panel, "img.sale-image")?.and_then(|img| attr(img, "src")),
            app_id,
            "image",
        )?,
        link: required(link, app_id, "store link")?,
        name: required(
            select_first(panel, "h4.panel-sale-name a")?.and_then(|a| text_or_none(&element_text(a))),
            app_id,
            "name",
        )?,
        promo_type: required(promo_type, app_id, "promo type")?,
        start_date: required(dates.next(), app_id, "start date")?,
        end_date: required(dates.next(), app_id, "end date")?,
    })
}

fn select_all_in<'a>(scope: ElementRef<'a>, css: &str) -> Result<Vec<ElementRef<'a>>, ProviderError> {
    let sel = crate::selector(css)?;
    Ok(scope.select(&sel).collect())
}

/// Promotions on the listing page, minus the excluded app, first occurrence per app id.
pub fn parse_promos(html: &str) -> Result<Vec<Promo>, ProviderError> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut promos = Vec::new();
    for panel in select_all(&document, "#main .container .row .panel-sale")? {
        let app_id = attr(panel, "data-appid").unwrap_or_default();
        if app_id == EXCLUDED_APP_ID {
            continue;
        }
        let promo = parse_panel(panel, &app_id)?;
        if seen.insert(promo.id) {
            promos.push(promo);
        }
    }
    Ok(promos)
}

pub struct SteamFreePromosProvider {
    http: Arc<dyn HttpFetch>,
}

impl SteamFreePromosProvider {
    pub fn new(http: Arc<dyn HttpFetch>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Provider for SteamFreePromosProvider {
    fn tag(&self) -> ProviderTag {
        TAG
    }

    fn release_date_path(&self) -> &'static str {
        "$.startDate"
    }

    async fn resolve(&self, _term: &str) -> Result<Option<Source>, ProviderError> {
        Ok(Some(Source::Steam(Listing::default())))
    }

    async fn refresh(&self, row: &SourceRow) -> Result<Source, ProviderError> {
        ensure_row_provider(TAG, row.provider)?;
        Ok(Source::Steam(Listing::default()))
    }

    async fn fetch_items(&self, source: &Source) -> Result<Vec<Item>, ProviderError> {
        let Source::Steam(listing) = source else {
            return Err(ProviderError::wrong_variant(TAG, source.tag()));
        };
        let headers = [("User-Agent", DESKTOP_USER_AGENT)];
        let html = self.http.fetch_text(&listing.url, &headers).await?;
        Ok(parse_promos(&html)?.into_iter().map(Item::Steam).collect())
    }

    fn to_persisted_source(&self, source: &Source) -> Result<SourceRow, ProviderError> {
        let Source::Steam(listing) = source else {
            return Err(ProviderError::wrong_variant(TAG, source.tag()));
        };
        Ok(SourceRow {
            id: listing.url.clone(),
            provider: TAG,
            raw: encode_raw(listing)?,
        })
    }

    fn from_persisted_source(&self, row: &SourceRow) -> Result<Source, ProviderError> {
        ensure_row_provider(TAG, row.provider)?;
        Ok(Source::Steam(decode_raw(&row.raw)?))
    }

    fn to_persisted_output(&self, owner: &SourceRow, item: &Item) -> Result<OutputRow, ProviderError> {
        let Item::Steam(promo) = item else {
            return Err(ProviderError::wrong_variant(TAG, item.tag()));
        };
        output_row(owner, TAG, promo.id.to_string(), encode_raw(promo)?)
    }

    fn to_persisted_patch(&self, owner: &SourceRow, item: &Item) -> Result<OutputRow, ProviderError> {
        self.to_persisted_output(owner, item)
    }

    fn from_persisted_output(&self, row: &OutputRow) -> Result<Item, ProviderError> {
        ensure_row_provider(TAG, row.provider)?;
        Ok(Item::Steam(decode_raw(&row.raw)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHttp;
    use crate::ErrorKind;

    fn panel(app_id: &str, name: &str, cat: &str, start: &str, end: &str) -> String {
        format!(
            r#"<div class="panel-sale" data-appid=" {app_id} ">
                <div class="cat {cat}">promo</div>
                <a href="/app/{app_id}/"><img class="sale-image" src="https://cdn.steamstatic.com/{app_id}.jpg"></a>
                <h4 class="panel-sale-name"><a href="/app/{app_id}/"> {name} </a></h4>
                <div class="app-history-type"><a href="https://steamdb.info/app/{app_id}/history/">history</a><a href="https://store.steampowered.com/app/{app_id}/">store</a></div>
                <div class="panel-sale-time"><relative-time datetime="{end}">later</relative-time></div>
                <div class="panel-sale-time"><relative-time datetime="{start}">now</relative-time></div>
            </div>"#
        )
    }

    fn listing_page(panels: &[String]) -> String {
        format!(
            r#"<html><body><div id="main"><div class="container"><div class="row">{}</div></div></div></body></html>"#,
            panels.concat()
        )
    }

    fn sample_page() -> String {
        listing_page(&[
            panel("440", "Team Fortress 2", "cat-play-for-free", "2025-10-13T17:00:00+00:00", "2025-10-20T17:00:00+00:00"),
            panel("730", "Counter-Strike 2", "cat-play-for-free", "2025-10-13T17:00:00+00:00", "2025-10-20T17:00:00+00:00"),
            panel("1091500", "Cyberpunk 2077", "cat-free-to-keep", "2025-10-16T15:00:00+00:00", "2025-10-23T15:00:00+00:00"),
            panel("440", "Team Fortress 2", "cat-play-for-free", "2025-10-27T17:00:00+00:00", "2025-11-03T17:00:00+00:00"),
        ])
    }

    #[test]
    fn panels_become_deduplicated_promos() {
        let promos = parse_promos(&sample_page()).unwrap();
        assert_eq!(promos.len(), 2);

        let tf2 = &promos[0];
        assert_eq!(tf2.id, 440);
        assert_eq!(tf2.name, "Team Fortress 2");
        assert_eq!(tf2.promo_type, PromoType::FreeToPlay);
        assert_eq!(tf2.link, "https://store.steampowered.com/app/440/");
        assert_eq!(tf2.image, "https://cdn.steamstatic.com/440.jpg");
        assert!(tf2.start_date < tf2.end_date);
        assert_eq!(tf2.start_date.to_rfc3339(), "2025-10-13T17:00:00+00:00");

        assert_eq!(promos[1].promo_type, PromoType::FreeToKeep);
        assert!(promos.iter().all(|p| p.id != 730));
    }

    #[test]
    fn panels_missing_required_fields_are_schema_violations() {
        let page = listing_page(&[panel("10", "Broken", "cat-unknown", "2025-10-13T17:00:00Z", "2025-10-20T17:00:00Z")]);
        let err = parse_promos(&page).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaViolation);
    }

    #[tokio::test]
    async fn resolve_and_refresh_return_the_fixed_listing() {
        let p = SteamFreePromosProvider::new(Arc::new(FakeHttp::new()));
        let source = p.resolve("anything").await.unwrap().unwrap();
        let row = p.to_persisted_source(&source).unwrap();
        assert_eq!(row.id, LISTING_URL);
        assert_eq!(p.refresh(&row).await.unwrap(), source);
    }

    #[tokio::test]
    async fn fetch_items_sends_a_browser_user_agent() {
        let http = Arc::new(FakeHttp::new().route(LISTING_URL, &sample_page()));
        let p = SteamFreePromosProvider::new(http.clone());

        let items = p.fetch_items(&Source::Steam(Listing::default())).await.unwrap();

        assert_eq!(items.len(), 2);
        let requests = http.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1[0].0, "User-Agent");
    }

    #[test]
    fn promo_rows_are_keyed_by_app_id() {
        let p = SteamFreePromosProvider::new(Arc::new(FakeHttp::new()));
        let owner = p.to_persisted_source(&Source::Steam(Listing::default())).unwrap();
        let item = Item::Steam(parse_promos(&sample_page()).unwrap().remove(1));

        let row = p.to_persisted_output(&owner, &item).unwrap();
        assert_eq!(row.id, "1091500");
        assert_eq!(row.input_id, LISTING_URL);
        assert!(row.raw.contains(r#""promoType":"free-to-keep""#));
        assert_eq!(p.from_persisted_output(&row).unwrap(), item);
        assert_eq!(p.to_persisted_patch(&owner, &item).unwrap(), row);
    }
}
