use std::sync::LazyLock;
use std::time::Duration;

use scraper::{ElementRef, Html, Selector};
use tracing::warn;

use super::{clean_text, InvoiceLinks};
use crate::fetch::{full_url, PageSource};

/// Wait before each popover request so a page full of orders does not
/// hammer the site.
const INVOICE_DELAY_MS: u64 = 500;

static POPOVER_SPAN_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(".yohtmlc-order-level-connections span[data-a-popover]").unwrap()
});
static POPOVER_LINK_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[href*="ajax/invoice"]"#).unwrap());
static INVOICE_LINK_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".invoice-list a, ul a").unwrap());

const PRINT_SUMMARY_LABEL: &str = "印刷可能な注文概要";
const INVOICE_LABELS: [&str; 2] = ["明細書", "適格請求書"];
const INVOICE_REQUEST_LABEL: &str = "請求書のリクエスト";

type PopoverStrategy = fn(ElementRef) -> Option<String>;

/// The site has shipped two popover layouts; try them in order, first
/// success wins.
const POPOVER_STRATEGIES: &[PopoverStrategy] = &[from_popover_attr, from_direct_link];

/// Invoice-popover URL for one order card, if the card has one.
pub fn resolve_popover_url(card: ElementRef) -> Option<String> {
    POPOVER_STRATEGIES.iter().find_map(|strategy| strategy(card))
}

/// Layout A: a JSON payload in a `data-a-popover` attribute carrying the URL.
fn from_popover_attr(card: ElementRef) -> Option<String> {
    let span = card.select(&POPOVER_SPAN_SEL).next()?;
    let raw = span.value().attr("data-a-popover")?;
    let payload: serde_json::Value = serde_json::from_str(raw).ok()?;
    payload
        .get("url")?
        .as_str()
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

/// Layout B: a plain anchor straight to the popover endpoint.
fn from_direct_link(card: ElementRef) -> Option<String> {
    card.select(&POPOVER_LINK_SEL)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(str::to_string)
}

/// Fetch the popover document and pull out the three invoice links. Any
/// failure degrades to empty links; a missing invoice never sinks the order.
pub async fn fetch_invoice_links<S: PageSource>(
    source: &S,
    order_id: &str,
    popover_url: &str,
) -> InvoiceLinks {
    tokio::time::sleep(Duration::from_millis(INVOICE_DELAY_MS)).await;
    match source.fetch_html(&full_url(popover_url)).await {
        Ok(html) => classify_links(&Html::parse_document(&html)),
        Err(e) => {
            warn!("invoice link fetch failed ({order_id}): {e}");
            InvoiceLinks::default()
        }
    }
}

/// Classify popover anchors by their visible label. First match per
/// category wins.
pub fn classify_links(doc: &Html) -> InvoiceLinks {
    let mut links = InvoiceLinks::default();
    for a in doc.select(&INVOICE_LINK_SEL) {
        let text = clean_text(&a.text().collect::<String>());
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        if links.print_summary.is_empty() && text.contains(PRINT_SUMMARY_LABEL) {
            links.print_summary = full_url(href);
        } else if links.invoice.is_empty()
            && INVOICE_LABELS.iter().any(|label| text.contains(label))
        {
            links.invoice = full_url(href);
        } else if links.invoice_request.is_empty() && text.contains(INVOICE_REQUEST_LABEL) {
            links.invoice_request = full_url(href);
        }
    }
    links
}
