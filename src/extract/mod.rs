pub mod invoice;

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};

use crate::fetch::full_url;

static ORDER_ID_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#".yohtmlc-order-id span[dir="ltr"]"#).unwrap());
static ORDER_DATE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".a-column.a-span3 .a-color-secondary.aok-break-word").unwrap());
static ORDER_TOTAL_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".a-column.a-span2 .a-color-secondary.aok-break-word").unwrap());
static RECIPIENT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".yohtmlc-recipient .a-popover-trigger").unwrap());
static DELIVERY_STATUS_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".delivery-box__primary-text").unwrap());
static ORDER_DETAILS_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[href*="order-details"]"#).unwrap());
static PROBLEM_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[href*="/hz/pwo"]"#).unwrap());
static RETURN_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[href*="returns/cart"]"#).unwrap());
static FEEDBACK_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[href*="feedback"]"#).unwrap());
static REVIEW_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[href*="review-your-purchases"]"#).unwrap());

static PRODUCT_TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".yohtmlc-product-title a").unwrap());
static PRODUCT_IMAGE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".product-image img, img").unwrap());
static BUY_AGAIN_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[href*="buyagain"]"#).unwrap());
static VIEW_PRODUCT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[href*="/your-orders/pop"]"#).unwrap());

/// Item containers a product title may sit in, nearest-ancestor first match
/// wins. Layout varies between digital and physical orders.
static ITEM_CONTAINER_SELS: LazyLock<[Selector; 3]> = LazyLock::new(|| {
    [
        Selector::parse(".a-fixed-left-grid").unwrap(),
        Selector::parse(".item-box").unwrap(),
        Selector::parse("li").unwrap(),
    ]
});

/// Catalog id embedded in a product link; the dedup key for line items.
static CATALOG_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/dp/([A-Z0-9]+)").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub year: u16,
    pub order_id: String,
    pub order_date: String,
    pub total: String,
    pub recipient: String,
    pub delivery_status: String,
    pub order_details_link: String,
    pub problem_link: String,
    pub return_link: String,
    pub seller_feedback_link: String,
    pub review_link: String,
    pub invoice_links: InvoiceLinks,
    pub products: Vec<ProductRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceLinks {
    pub print_summary: String,
    pub invoice: String,
    pub invoice_request: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRecord {
    pub product_name: String,
    pub product_link: String,
    pub product_image: String,
    pub buy_again_link: String,
    pub view_product_link: String,
}

/// One extracted order, plus the invoice-popover URL found on its card (the
/// popover itself is fetched separately, and only when asked for).
pub struct ExtractedOrder {
    pub record: OrderRecord,
    pub invoice_popover: Option<String>,
}

/// Extract one order from its card. `None` when the card carries no order
/// id; such cards are recommendation widgets and the like, not orders.
pub fn extract_order(card: ElementRef, year: u16) -> Option<ExtractedOrder> {
    let order_id = select_text(card, &ORDER_ID_SEL);
    if order_id.is_empty() {
        return None;
    }

    let record = OrderRecord {
        year,
        order_id,
        order_date: select_text(card, &ORDER_DATE_SEL),
        total: select_text(card, &ORDER_TOTAL_SEL),
        recipient: select_text(card, &RECIPIENT_SEL),
        delivery_status: select_text(card, &DELIVERY_STATUS_SEL),
        order_details_link: select_href(card, &ORDER_DETAILS_SEL),
        problem_link: select_href(card, &PROBLEM_SEL),
        return_link: select_href(card, &RETURN_SEL),
        seller_feedback_link: select_href(card, &FEEDBACK_SEL),
        review_link: select_href(card, &REVIEW_SEL),
        invoice_links: InvoiceLinks::default(),
        products: extract_products(card),
    };
    let invoice_popover = invoice::resolve_popover_url(card);

    Some(ExtractedOrder {
        record,
        invoice_popover,
    })
}

/// Products in document order, deduplicated by catalog id (falling back to
/// the full link when the id pattern does not match). First occurrence wins.
fn extract_products(card: ElementRef) -> Vec<ProductRecord> {
    let mut products = Vec::new();
    let mut seen = HashSet::new();

    for title in card.select(&PRODUCT_TITLE_SEL) {
        let product_name = text_of(title);
        if product_name.is_empty() {
            continue;
        }
        let product_link = title
            .value()
            .attr("href")
            .map(full_url)
            .unwrap_or_default();
        let key = CATALOG_ID_RE
            .captures(&product_link)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| product_link.clone());
        if !seen.insert(key) {
            continue;
        }

        let container = ITEM_CONTAINER_SELS
            .iter()
            .find_map(|sel| closest(title, sel));
        let (product_image, buy_again_link, view_product_link) = match container {
            Some(container) => (
                container
                    .select(&PRODUCT_IMAGE_SEL)
                    .next()
                    .and_then(|img| img.value().attr("src"))
                    .unwrap_or_default()
                    .to_string(),
                select_href(container, &BUY_AGAIN_SEL),
                select_href(container, &VIEW_PRODUCT_SEL),
            ),
            None => Default::default(),
        };

        products.push(ProductRecord {
            product_name,
            product_link,
            product_image,
            buy_again_link,
            view_product_link,
        });
    }

    products
}

/// Nearest ancestor (or the element itself) matching `selector`.
fn closest<'a>(el: ElementRef<'a>, selector: &Selector) -> Option<ElementRef<'a>> {
    std::iter::successors(Some(el), |el| el.parent().and_then(ElementRef::wrap))
        .find(|el| selector.matches(el))
}

/// Trimmed, whitespace-collapsed text content.
pub(crate) fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_of(el: ElementRef) -> String {
    clean_text(&el.text().collect::<String>())
}

fn select_text(scope: ElementRef, selector: &Selector) -> String {
    scope.select(selector).next().map(text_of).unwrap_or_default()
}

fn select_href(scope: ElementRef, selector: &Selector) -> String {
    scope
        .select(selector)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(full_url)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    const CARD: &str = r#"
      <div class="order-card">
        <div class="a-column a-span3">
          <span class="a-color-secondary aok-break-word">2024年1月15日</span>
        </div>
        <div class="a-column a-span2">
          <span class="a-color-secondary aok-break-word">￥3,480</span>
        </div>
        <div class="yohtmlc-recipient"><span class="a-popover-trigger">山田 太郎</span></div>
        <div class="yohtmlc-order-id">注文番号 <span dir="ltr">249-1234567-0000001</span></div>
        <div class="delivery-box__primary-text">1月17日に配達済み</div>
        <a href="/gp/your-account/order-details?orderID=249-1234567-0000001">注文の詳細</a>
        <a href="/hz/pwo?orderId=249-1234567-0000001">注文に関する問題</a>
        <a href="/spr/returns/cart?orderId=249-1234567-0000001">返品</a>
        <a href="/hz/feedback?orderID=249-1234567-0000001">出品者を評価</a>
        <a href="/review-your-purchases?orderId=249-1234567-0000001">レビュー</a>
        <ul>
          <li>
            <div class="a-fixed-left-grid">
              <div class="product-image"><img src="https://img.example/a.jpg"></div>
              <div class="yohtmlc-product-title">
                <a href="/dp/B000AAA111?ref=ppx">単三電池 20本パック</a>
              </div>
              <a href="/gp/buyagain?asin=B000AAA111">再度購入</a>
              <a href="/your-orders/pop?asin=B000AAA111">商品を表示</a>
            </div>
          </li>
          <li>
            <div class="a-fixed-left-grid">
              <div class="product-image"><img src="https://img.example/a.jpg"></div>
              <div class="yohtmlc-product-title">
                <a href="/dp/B000AAA111?ref=other">単三電池 20本パック</a>
              </div>
            </div>
          </li>
          <li>
            <div class="a-fixed-left-grid">
              <div class="yohtmlc-product-title">
                <a href="/dp/B000BBB222">USBケーブル 1m</a>
              </div>
            </div>
          </li>
        </ul>
      </div>
    "#;

    fn first_card(doc: &Html) -> ElementRef<'_> {
        let sel = Selector::parse(".order-card").unwrap();
        doc.select(&sel).next().unwrap()
    }

    #[test]
    fn header_fields() {
        let doc = Html::parse_document(CARD);
        let order = extract_order(first_card(&doc), 2024).unwrap().record;
        assert_eq!(order.order_id, "249-1234567-0000001");
        assert_eq!(order.order_date, "2024年1月15日");
        assert_eq!(order.total, "￥3,480");
        assert_eq!(order.recipient, "山田 太郎");
        assert_eq!(order.delivery_status, "1月17日に配達済み");
        assert!(order.order_details_link.starts_with("https://www.amazon.co.jp/gp/your-account/"));
        assert!(order.problem_link.contains("/hz/pwo"));
        assert!(order.return_link.contains("returns/cart"));
        assert!(order.seller_feedback_link.contains("feedback"));
        assert!(order.review_link.contains("review-your-purchases"));
    }

    #[test]
    fn products_deduplicated_by_catalog_id() {
        let doc = Html::parse_document(CARD);
        let order = extract_order(first_card(&doc), 2024).unwrap().record;
        // B000AAA111 appears twice with different query strings
        assert_eq!(order.products.len(), 2);
        assert_eq!(order.products[0].product_name, "単三電池 20本パック");
        assert_eq!(order.products[1].product_name, "USBケーブル 1m");
    }

    #[test]
    fn first_product_occurrence_wins() {
        let doc = Html::parse_document(CARD);
        let order = extract_order(first_card(&doc), 2024).unwrap().record;
        // the first duplicate carried the buy-again link, the second did not
        assert!(order.products[0].buy_again_link.contains("buyagain"));
        assert_eq!(order.products[0].product_image, "https://img.example/a.jpg");
    }

    #[test]
    fn aux_fields_resolved_from_item_container() {
        let doc = Html::parse_document(CARD);
        let order = extract_order(first_card(&doc), 2024).unwrap().record;
        assert!(order.products[0].view_product_link.contains("/your-orders/pop"));
        // second product has no image in its container
        assert_eq!(order.products[1].product_image, "");
        assert_eq!(order.products[1].buy_again_link, "");
    }

    #[test]
    fn product_without_name_is_skipped() {
        let html = r#"
          <div class="order-card">
            <div class="yohtmlc-order-id"><span dir="ltr">249-0-1</span></div>
            <div class="yohtmlc-product-title"><a href="/dp/B000CCC333">  </a></div>
          </div>
        "#;
        let doc = Html::parse_document(html);
        let order = extract_order(first_card(&doc), 2024).unwrap().record;
        assert!(order.products.is_empty());
    }

    #[test]
    fn dedup_falls_back_to_full_link() {
        let html = r#"
          <div class="order-card">
            <div class="yohtmlc-order-id"><span dir="ltr">249-0-2</span></div>
            <div class="yohtmlc-product-title"><a href="/gp/digital/item?id=1">電子書籍A</a></div>
            <div class="yohtmlc-product-title"><a href="/gp/digital/item?id=1">電子書籍A</a></div>
            <div class="yohtmlc-product-title"><a href="/gp/digital/item?id=2">電子書籍B</a></div>
          </div>
        "#;
        let doc = Html::parse_document(html);
        let order = extract_order(first_card(&doc), 2024).unwrap().record;
        assert_eq!(order.products.len(), 2);
    }

    #[test]
    fn card_without_order_id_is_not_an_order() {
        let html = r#"<div class="order-card"><div>おすすめ商品</div></div>"#;
        let doc = Html::parse_document(html);
        assert!(extract_order(first_card(&doc), 2024).is_none());
    }

    #[test]
    fn clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  注文\n  番号  "), "注文 番号");
    }
}
