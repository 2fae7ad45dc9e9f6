use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::fetch::BASE_URL;

/// Orders shown per result page, fixed by the site.
pub const PAGE_SIZE: u32 = 10;

static COUNT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)").unwrap());
static YEAR_FILTER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^year-(\d+)$").unwrap());

/// Top-level selectors the page reader uses to locate orders on a listing
/// page. Swappable so tests (and eventual layout changes) can supply their
/// own.
pub struct Selectors {
    pub order_card: Selector,
    pub order_count: Selector,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            order_card: Selector::parse(".order-card").unwrap(),
            order_count: Selector::parse(".num-orders").unwrap(),
        }
    }
}

pub fn orders_url(year: u16, start_index: u32) -> String {
    format!("{BASE_URL}/your-orders/orders?timeFilter=year-{year}&startIndex={start_index}")
}

/// All order cards on the page, in document order.
pub fn order_cards<'a>(doc: &'a Html, selectors: &Selectors) -> Vec<ElementRef<'a>> {
    doc.select(&selectors.order_card).collect()
}

/// Total order count for the selected year, parsed from the count label.
/// 0 when the label is absent or carries no number.
pub fn total_order_count(doc: &Html, selectors: &Selectors) -> u32 {
    doc.select(&selectors.order_count)
        .next()
        .map(|el| el.text().collect::<String>())
        .and_then(|text| COUNT_RE.captures(&text)?.get(1)?.as_str().parse().ok())
        .unwrap_or(0)
}

/// Page index encoded in the `startIndex` query parameter.
pub fn page_index(url: &Url) -> u32 {
    url.query_pairs()
        .find(|(key, _)| key == "startIndex")
        .and_then(|(_, value)| value.parse::<u32>().ok())
        .map(|index| index / PAGE_SIZE)
        .unwrap_or(0)
}

/// Year selected via the `timeFilter=year-<Y>` query parameter, if any.
pub fn year_filter(url: &Url) -> Option<u16> {
    url.query_pairs()
        .find(|(key, _)| key == "timeFilter")
        .and_then(|(_, value)| YEAR_FILTER_RE.captures(&value)?.get(1)?.as_str().parse().ok())
}
