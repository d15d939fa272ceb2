//! Bundle store pages, fetched plainly or after client-side rendering.

use std::collections::BTreeSet;

use bundlewatch_core::{BundleId, BundleRecord, GameRef, Price};
use scraper::{ElementRef, Html, Selector};

use crate::money::{currency_code, parse_minor_units};
use crate::{AdapterError, MapperContext, PayloadKind, PayloadMapper};

const NAME_SELECTORS: &[&str] = &[".pageheader", "h2.pageheader", ".bundle_title", "h1"];
const FINAL_PRICE_SELECTOR: &str = ".discount_final_price, .game_purchase_price";
const ORIGINAL_PRICE_SELECTOR: &str = ".discount_original_price";
const DISCOUNT_SELECTOR: &str = ".discount_pct";
const GAME_ITEM_SELECTOR: &str = ".tab_item, .bundle_item";
const GAME_NAME_SELECTOR: &str = ".tab_item_name, .game_name, .title";
const GAME_LINK_SELECTOR: &str = "a[data-ds-appid]";
const IMAGE_SELECTOR: &str = r#"meta[property="og:image"]"#;

/// Purchase-area elements that, without a resolvable price, mark a
/// collection-style bundle whose price is computed in the browser.
const DYNAMIC_PRICE_SELECTORS: &[&str] = &[".game_area_purchase_game", ".discount_block"];
const DYNAMIC_PRICE_PHRASES: &[&str] = &["complete your collection", "based on games you own"];

const STORE_ORIGIN: &str = "https://store.steampowered.com";

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_first_attr(document: &Html, css: &str, attr: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn extract_name(document: &Html) -> Result<Option<String>, AdapterError> {
    for css in NAME_SELECTORS {
        if let Some(name) = select_first_text(document, css)? {
            return Ok(Some(name));
        }
    }
    Ok(None)
}

fn parse_game(element: ElementRef<'_>, name_sel: &Selector, link_sel: &Selector) -> Option<GameRef> {
    let name = element
        .select(name_sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))?;
    let link = element.select(link_sel).next();
    let app_id = link
        .and_then(|l| l.value().attr("data-ds-appid"))
        .or_else(|| element.value().attr("data-ds-appid"))
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());
    let url = link.and_then(|l| l.value().attr("href")).map(|href| {
        if href.starts_with("http") {
            href.to_string()
        } else {
            format!("{STORE_ORIGIN}{href}")
        }
    });
    Some(GameRef {
        app_id,
        name: Some(name),
        url,
    })
}

fn extract_games(document: &Html) -> Result<Vec<GameRef>, AdapterError> {
    let item_sel = selector(GAME_ITEM_SELECTOR)?;
    let name_sel = selector(GAME_NAME_SELECTOR)?;
    let link_sel = selector(GAME_LINK_SELECTOR)?;
    Ok(document
        .select(&item_sel)
        .filter_map(|el| parse_game(el, &name_sel, &link_sel))
        .collect())
}

fn extract_claimed_discount(document: &Html) -> Result<Option<u8>, AdapterError> {
    Ok(select_first_text(document, DISCOUNT_SELECTOR)?.and_then(|text| {
        text.trim_matches(|c: char| c == '-' || c == '%' || c.is_whitespace())
            .parse::<u8>()
            .ok()
    }))
}

/// Whether the page computes its price client-side.
pub fn has_dynamic_price_markers(document: &Html) -> Result<bool, AdapterError> {
    for css in DYNAMIC_PRICE_SELECTORS {
        if document.select(&selector(css)?).next().is_some() {
            return Ok(true);
        }
    }
    let text = document.root_element().text().collect::<String>().to_lowercase();
    Ok(DYNAMIC_PRICE_PHRASES.iter().any(|p| text.contains(p)))
}

/// Result of reading the purchase area of one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagePrice {
    Resolved(Price),
    /// Price text absent or zero, but the page computes it in the browser.
    NeedsRendering,
    /// Explicit zero price with no dynamic markers.
    Ghost,
    Unresolved,
}

pub fn extract_price(document: &Html, ctx: &MapperContext) -> Result<PagePrice, AdapterError> {
    let final_text = select_first_text(document, FINAL_PRICE_SELECTOR)?;
    let final_amount = final_text.as_deref().and_then(parse_minor_units);
    let original_amount = select_first_text(document, ORIGINAL_PRICE_SELECTOR)?
        .as_deref()
        .and_then(parse_minor_units);

    match final_amount {
        Some(amount) if amount > 0 => {
            let currency = final_text
                .as_deref()
                .map(|t| currency_code(t, &ctx.fallback_currency))
                .unwrap_or_else(|| ctx.fallback_currency.clone());
            let claimed = extract_claimed_discount(document)?;
            Ok(PagePrice::Resolved(Price::from_parts(amount, original_amount, claimed, currency)))
        }
        _ if has_dynamic_price_markers(document)? => Ok(PagePrice::NeedsRendering),
        Some(_) if original_amount.unwrap_or(0) == 0 => Ok(PagePrice::Ghost),
        Some(amount) => Ok(PagePrice::Resolved(Price::from_parts(
            amount,
            original_amount,
            None,
            final_text
                .as_deref()
                .map(|t| currency_code(t, &ctx.fallback_currency))
                .unwrap_or_else(|| ctx.fallback_currency.clone()),
        ))),
        None => Ok(PagePrice::Unresolved),
    }
}

/// Maps one store page to at most one record. Needs the bundle id as a hint.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlPageMapper;

impl HtmlPageMapper {
    pub fn map_page(&self, html: &str, id: BundleId, ctx: &MapperContext) -> Result<Option<BundleRecord>, AdapterError> {
        let document = Html::parse_document(html);
        let Some(name) = extract_name(&document)? else {
            return Ok(None);
        };

        let mut record = BundleRecord::candidate(id, ctx.observed_at);
        record.name = Some(name);
        match extract_price(&document, ctx)? {
            PagePrice::Resolved(price) => record.current_price = Some(price),
            PagePrice::NeedsRendering => record.flags.needs_rendering_fallback = true,
            PagePrice::Ghost | PagePrice::Unresolved => return Ok(None),
        }
        record.games = extract_games(&document)?;
        record.image_url = select_first_attr(&document, IMAGE_SELECTOR, "content")?;
        record.refresh_validity();
        Ok(Some(record))
    }
}

fn require_hint(hint: Option<BundleId>) -> Result<BundleId, AdapterError> {
    hint.ok_or_else(|| AdapterError::Message("html payload needs a bundle id".to_string()))
}

impl PayloadMapper for HtmlPageMapper {
    fn kind(&self) -> PayloadKind {
        PayloadKind::RenderedHtml
    }

    fn map(&self, body: &str, hint: Option<BundleId>, ctx: &MapperContext) -> Result<Vec<BundleRecord>, AdapterError> {
        let id = require_hint(hint)?;
        Ok(self.map_page(body, id, ctx)?.into_iter().collect())
    }

    fn confirmed_ids(&self, body: &str, hint: Option<BundleId>) -> Result<BTreeSet<BundleId>, AdapterError> {
        let id = require_hint(hint)?;
        let document = Html::parse_document(body);
        Ok(extract_name(&document)?.map(|_| id).into_iter().collect())
    }
}
