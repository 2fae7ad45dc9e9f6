use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extract::OrderRecord;
use crate::page::PAGE_SIZE;

/// Fixed location of the persisted session record.
pub const SESSION_PATH: &str = "data/export_session.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ExportMode {
    /// One CSV row per order
    ByOrder,
    /// One CSV row per product line item
    ByProduct,
}

impl ExportMode {
    /// Grain label used in the output filename.
    pub fn grain(self) -> &'static str {
        match self {
            Self::ByOrder => "by_order",
            Self::ByProduct => "by_product",
        }
    }
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ByOrder => "by-order",
            Self::ByProduct => "by-product",
        })
    }
}

/// The one record that survives across page navigations. Everything the
/// export has learned so far lives here; a fresh process restores it and
/// picks up at the lowest unprocessed page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSession {
    pub year: u16,
    pub export_mode: ExportMode,
    pub fetch_invoice: bool,
    /// Refreshed from the count label on every page load.
    pub total_orders: u32,
    /// Insertion order is output order; `order_id` is the merge key.
    pub orders: Vec<OrderRecord>,
    pub processed_pages: BTreeSet<u32>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExportSession {
    pub fn new(year: u16, export_mode: ExportMode, fetch_invoice: bool) -> Self {
        let now = Utc::now();
        Self {
            year,
            export_mode,
            fetch_invoice,
            total_orders: 0,
            orders: Vec::new(),
            processed_pages: BTreeSet::new(),
            started_at: now,
            updated_at: now,
        }
    }

    /// A session only ever continues for the exact year/mode it was started
    /// with; anything else starts over.
    pub fn matches(&self, year: u16, mode: ExportMode) -> bool {
        self.year == year && self.export_mode == mode
    }

    pub fn total_pages(&self) -> u32 {
        self.total_orders.div_ceil(PAGE_SIZE)
    }

    /// Merge one page's worth of orders. An order id already collected is a
    /// no-op (first write wins). Returns how many orders were appended.
    pub fn merge_orders(&mut self, incoming: Vec<OrderRecord>) -> usize {
        let mut seen: HashSet<String> =
            self.orders.iter().map(|o| o.order_id.clone()).collect();
        let mut added = 0;
        for order in incoming {
            if seen.insert(order.order_id.clone()) {
                self.orders.push(order);
                added += 1;
            }
        }
        added
    }

    /// Lowest page index not yet scraped. Before the first page load the
    /// total is unknown, so page 0 is always the place to start.
    pub fn next_unprocessed_page(&self) -> Option<u32> {
        if self.total_orders == 0 && self.processed_pages.is_empty() {
            return Some(0);
        }
        (0..self.total_pages()).find(|page| !self.processed_pages.contains(page))
    }

    pub fn all_pages_processed(&self) -> bool {
        self.total_pages() > 0
            && (0..self.total_pages()).all(|page| self.processed_pages.contains(&page))
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// File-backed store for the session record. One whole-file replace per
/// write; removing the file is how a run gets cancelled.
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `None` when no session is persisted, or the record is unreadable (a
    /// broken run must not be resumable).
    pub fn load(&self) -> Option<ExportSession> {
        let data = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&data).ok()
    }

    pub fn save(&self, session: &ExportSession) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(session).map_err(io::Error::from)?;
        fs::write(&self.path, data)
    }

    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::InvoiceLinks;

    fn order(id: &str, total: &str) -> OrderRecord {
        OrderRecord {
            year: 2024,
            order_id: id.to_string(),
            order_date: String::new(),
            total: total.to_string(),
            recipient: String::new(),
            delivery_status: String::new(),
            order_details_link: String::new(),
            problem_link: String::new(),
            return_link: String::new(),
            seller_feedback_link: String::new(),
            review_link: String::new(),
            invoice_links: InvoiceLinks::default(),
            products: Vec::new(),
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let mut session = ExportSession::new(2024, ExportMode::ByOrder, false);
        let page = vec![order("a", "1"), order("b", "2")];
        assert_eq!(session.merge_orders(page.clone()), 2);
        assert_eq!(session.merge_orders(page), 0);
        assert_eq!(session.orders.len(), 2);
    }

    #[test]
    fn merge_first_write_wins() {
        let mut session = ExportSession::new(2024, ExportMode::ByOrder, false);
        session.merge_orders(vec![order("a", "first")]);
        session.merge_orders(vec![order("a", "second")]);
        assert_eq!(session.orders[0].total, "first");
    }

    #[test]
    fn merge_preserves_insertion_order() {
        let mut session = ExportSession::new(2024, ExportMode::ByOrder, false);
        session.merge_orders(vec![order("b", ""), order("a", "")]);
        session.merge_orders(vec![order("c", "")]);
        let ids: Vec<&str> = session.orders.iter().map(|o| o.order_id.as_str()).collect();
        assert_eq!(ids, ["b", "a", "c"]);
    }

    #[test]
    fn page_count_rounds_up() {
        let mut session = ExportSession::new(2024, ExportMode::ByOrder, false);
        session.total_orders = 25;
        assert_eq!(session.total_pages(), 3);
        session.total_orders = 30;
        assert_eq!(session.total_pages(), 3);
        session.total_orders = 31;
        assert_eq!(session.total_pages(), 4);
    }

    #[test]
    fn fresh_session_starts_at_page_zero() {
        let session = ExportSession::new(2024, ExportMode::ByOrder, false);
        assert_eq!(session.next_unprocessed_page(), Some(0));
        assert!(!session.all_pages_processed());
    }

    #[test]
    fn pages_processed_in_any_order_cover_the_range() {
        let mut session = ExportSession::new(2024, ExportMode::ByOrder, false);
        session.total_orders = 25;
        session.processed_pages.insert(2);
        session.processed_pages.insert(0);
        assert_eq!(session.next_unprocessed_page(), Some(1));
        assert!(!session.all_pages_processed());
        session.processed_pages.insert(1);
        assert_eq!(session.next_unprocessed_page(), None);
        assert!(session.all_pages_processed());
    }

    #[test]
    fn mismatched_year_or_mode_forces_fresh_session() {
        let session = ExportSession::new(2024, ExportMode::ByOrder, false);
        assert!(session.matches(2024, ExportMode::ByOrder));
        assert!(!session.matches(2023, ExportMode::ByOrder));
        assert!(!session.matches(2024, ExportMode::ByProduct));
    }

    #[test]
    fn store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        assert!(store.load().is_none());

        let mut session = ExportSession::new(2024, ExportMode::ByProduct, true);
        session.total_orders = 25;
        session.merge_orders(vec![order("a", "¥1,000")]);
        session.processed_pages.insert(0);
        store.save(&session).unwrap();

        let restored = store.load().unwrap();
        assert_eq!(restored.year, 2024);
        assert_eq!(restored.export_mode, ExportMode::ByProduct);
        assert!(restored.fetch_invoice);
        assert_eq!(restored.orders.len(), 1);
        assert!(restored.processed_pages.contains(&0));
    }

    #[test]
    fn clear_removes_and_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        store.clear().unwrap();
        store.save(&ExportSession::new(2024, ExportMode::ByOrder, false)).unwrap();
        store.clear().unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn unreadable_session_is_not_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, "{ not json").unwrap();
        let store = SessionStore::new(path);
        assert!(store.load().is_none());
    }
}
