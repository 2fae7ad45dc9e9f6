use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::extract::{OrderRecord, ProductRecord};
use crate::session::{ExportMode, ExportSession};

/// Joins multi-valued product fields in order-grain rows.
const SEPARATOR: &str = " / ";
/// Rendered in place of the product name when an order has no extractable
/// products, so the order itself is never dropped.
const NO_PRODUCT_PLACEHOLDER: &str = "（商品名取得不可）";
/// Spreadsheet apps sniff the byte-order marker to pick UTF-8.
const BOM: &str = "\u{feff}";

const BY_ORDER_HEADERS: [&str; 18] = [
    "Amazon 年",
    "Amazon 注文番号",
    "Amazon 注文日",
    "Amazon 合計金額",
    "Amazon お届け先",
    "Amazon 配送状況",
    "Amazon 商品数",
    "Amazon 商品名",
    "Amazon 商品リンク",
    "Amazon 商品画像URL",
    "Amazon 注文詳細リンク",
    "Amazon 印刷可能な注文概要",
    "Amazon 明細書／適格請求書",
    "Amazon 請求書のリクエスト",
    "Amazon 注文に関する問題",
    "Amazon 返品・交換",
    "Amazon 出品者を評価",
    "Amazon 商品レビュー",
];

const BY_PRODUCT_HEADERS: [&str; 19] = [
    "Amazon 年",
    "Amazon 注文番号",
    "Amazon 注文日",
    "Amazon 合計金額",
    "Amazon お届け先",
    "Amazon 配送状況",
    "Amazon 商品名",
    "Amazon 商品リンク",
    "Amazon 商品画像URL",
    "Amazon 注文詳細リンク",
    "Amazon 印刷可能な注文概要",
    "Amazon 明細書／適格請求書",
    "Amazon 請求書のリクエスト",
    "Amazon 再度購入リンク",
    "Amazon 商品を表示リンク",
    "Amazon 注文に関する問題",
    "Amazon 返品・交換",
    "Amazon 出品者を評価",
    "Amazon 商品レビュー",
];

/// One row per order; product columns joined with the fixed separator.
pub fn by_order_rows(orders: &[OrderRecord]) -> Vec<Vec<String>> {
    orders
        .iter()
        .map(|order| {
            let names = join_field(order, |p| p.product_name.as_str());
            let product_names = if names.is_empty() {
                NO_PRODUCT_PLACEHOLDER.to_string()
            } else {
                names
            };
            let product_links = join_field(order, |p| p.product_link.as_str());
            let product_images = order
                .products
                .iter()
                .map(|p| p.product_image.as_str())
                .filter(|image| !image.is_empty())
                .collect::<Vec<_>>()
                .join(SEPARATOR);

            vec![
                order.year.to_string(),
                order.order_id.clone(),
                order.order_date.clone(),
                order.total.clone(),
                order.recipient.clone(),
                order.delivery_status.clone(),
                order.products.len().to_string(),
                product_names,
                product_links,
                product_images,
                order.order_details_link.clone(),
                order.invoice_links.print_summary.clone(),
                order.invoice_links.invoice.clone(),
                order.invoice_links.invoice_request.clone(),
                order.problem_link.clone(),
                order.return_link.clone(),
                order.seller_feedback_link.clone(),
                order.review_link.clone(),
            ]
        })
        .collect()
}

/// One row per product. An order with no products still emits one row with
/// the placeholder name and blank product columns.
pub fn by_product_rows(orders: &[OrderRecord]) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    for order in orders {
        if order.products.is_empty() {
            rows.push(product_row(
                order,
                NO_PRODUCT_PLACEHOLDER,
                "",
                "",
                "",
                "",
            ));
            continue;
        }
        for product in &order.products {
            rows.push(product_row(
                order,
                &product.product_name,
                &product.product_link,
                &product.product_image,
                &product.buy_again_link,
                &product.view_product_link,
            ));
        }
    }
    rows
}

fn product_row(
    order: &OrderRecord,
    name: &str,
    link: &str,
    image: &str,
    buy_again: &str,
    view_product: &str,
) -> Vec<String> {
    vec![
        order.year.to_string(),
        order.order_id.clone(),
        order.order_date.clone(),
        order.total.clone(),
        order.recipient.clone(),
        order.delivery_status.clone(),
        name.to_string(),
        link.to_string(),
        image.to_string(),
        order.order_details_link.clone(),
        order.invoice_links.print_summary.clone(),
        order.invoice_links.invoice.clone(),
        order.invoice_links.invoice_request.clone(),
        buy_again.to_string(),
        view_product.to_string(),
        order.problem_link.clone(),
        order.return_link.clone(),
        order.seller_feedback_link.clone(),
        order.review_link.clone(),
    ]
}

fn join_field<'a>(order: &'a OrderRecord, field: impl Fn(&'a ProductRecord) -> &'a str) -> String {
    order
        .products
        .iter()
        .map(field)
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

/// Quote a field when it contains the delimiter, a quote, or a newline;
/// embedded quotes are doubled. Plain fields pass through untouched.
pub fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn render(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(headers.join(","));
    for row in rows {
        lines.push(
            row.iter()
                .map(|field| escape_field(field))
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    format!("{BOM}{}", lines.join("\n"))
}

pub fn filename(mode: ExportMode, year: u16) -> String {
    format!("amazon_orders_{}_{year}.csv", mode.grain())
}

/// Project the session's collected orders and write the CSV. Returns the
/// output path and the number of data rows written.
pub fn write_csv(session: &ExportSession, out_dir: &Path) -> io::Result<(PathBuf, usize)> {
    let (headers, rows) = match session.export_mode {
        ExportMode::ByOrder => (BY_ORDER_HEADERS.as_slice(), by_order_rows(&session.orders)),
        ExportMode::ByProduct => (
            BY_PRODUCT_HEADERS.as_slice(),
            by_product_rows(&session.orders),
        ),
    };
    let csv = render(headers, &rows);
    let path = out_dir.join(filename(session.export_mode, session.year));
    fs::write(&path, csv)?;
    Ok((path, rows.len()))
}
