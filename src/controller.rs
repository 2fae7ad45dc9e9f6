use std::io;
use std::path::PathBuf;
use std::time::Duration;

use scraper::Html;
use thiserror::Error;
use tracing::{info, warn};

use crate::export;
use crate::extract::{self, invoice};
use crate::fetch::{FetchError, PageSource};
use crate::page::{self, Selectors, PAGE_SIZE};
use crate::report::ProgressSink;
use crate::session::{ExportMode, ExportSession, SessionStore};

/// Wait between page navigations so the export stays under the site's
/// rate limits.
const PAGE_DELAY_MS: u64 = 1500;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no orders found for {year}")]
    NoOrders { year: u16 },
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("order page kept loading year {got} instead of {want}")]
    YearMismatch { want: u16, got: u16 },
    #[error("an export is already running")]
    AlreadyRunning,
    #[error("could not persist session: {0}")]
    Store(io::Error),
    #[error("could not write CSV: {0}")]
    Output(io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct ExportRequest {
    pub year: u16,
    pub mode: ExportMode,
    pub fetch_invoice: bool,
}

#[derive(Debug)]
pub enum Outcome {
    Completed { orders: usize, file: PathBuf },
    /// The session vanished from the store mid-run: someone cancelled.
    Cancelled,
    /// Nothing to do: no persisted session to resume.
    Idle,
}

/// The export state machine. One cycle scrapes one result page; the session
/// is persisted between cycles, so a killed process resumes at the lowest
/// unprocessed page instead of starting over.
pub struct Controller<'a, S: PageSource> {
    source: &'a S,
    store: &'a SessionStore,
    selectors: Selectors,
    out_dir: PathBuf,
    page_delay: Duration,
    running: bool,
}

impl<'a, S: PageSource> Controller<'a, S> {
    pub fn new(source: &'a S, store: &'a SessionStore, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            store,
            selectors: Selectors::default(),
            out_dir: out_dir.into(),
            page_delay: Duration::from_millis(PAGE_DELAY_MS),
            running: false,
        }
    }

    /// Explicit start. A live session for the same year/mode is picked up
    /// where it left off (merge semantics); any other session is discarded.
    pub async fn start(
        &mut self,
        request: ExportRequest,
        sink: &dyn ProgressSink,
    ) -> Result<Outcome, ExportError> {
        let session = match self.store.load() {
            Some(existing) if existing.matches(request.year, request.mode) => {
                info!(
                    "resuming export for {} ({} orders collected)",
                    existing.year,
                    existing.orders.len()
                );
                existing
            }
            _ => ExportSession::new(request.year, request.mode, request.fetch_invoice),
        };
        self.run(session, sink).await
    }

    /// Automatic resume: continues a persisted session if one exists.
    pub async fn resume(&mut self, sink: &dyn ProgressSink) -> Result<Outcome, ExportError> {
        match self.store.load() {
            Some(session) => self.run(session, sink).await,
            None => Ok(Outcome::Idle),
        }
    }

    async fn run(
        &mut self,
        session: ExportSession,
        sink: &dyn ProgressSink,
    ) -> Result<Outcome, ExportError> {
        if self.running {
            sink.error("an export is already running");
            return Err(ExportError::AlreadyRunning);
        }
        self.running = true;
        let result = self.drive(session, sink).await;
        self.running = false;

        if let Err(e) = &result {
            // a terminal failure must not leave a session a later resume
            // could resurrect
            let _ = self.store.clear();
            sink.error(&e.to_string());
        }
        result
    }

    async fn drive(
        &mut self,
        mut session: ExportSession,
        sink: &dyn ProgressSink,
    ) -> Result<Outcome, ExportError> {
        sink.progress(
            session.orders.len() as u32,
            session.total_orders,
            Some(&format!("checking orders for {}", session.year)),
        );
        self.store.save(&session).map_err(ExportError::Store)?;

        loop {
            // the cancel command deletes the session file; this re-load is
            // the resume check that then finds nothing and stops
            let Some(current) = self.store.load() else {
                info!("session cleared externally, stopping");
                return Ok(Outcome::Cancelled);
            };
            session = current;

            let Some(page_index) = session.next_unprocessed_page() else {
                break;
            };
            self.scrape_page(&mut session, page_index).await?;

            // a cancel issued while the page was in flight must not be
            // overwritten by this cycle's save
            if self.store.load().is_none() {
                info!("session cleared mid-cycle, stopping");
                return Ok(Outcome::Cancelled);
            }
            self.store.save(&session).map_err(ExportError::Store)?;
            sink.progress(session.orders.len() as u32, session.total_orders, None);

            if session.all_pages_processed() {
                break;
            }
            tokio::time::sleep(self.page_delay).await;
        }

        let (file, _) = export::write_csv(&session, &self.out_dir).map_err(ExportError::Output)?;
        let orders = session.orders.len();
        sink.complete(orders);
        self.store.clear().map_err(ExportError::Store)?;
        info!("export finished: {} orders -> {}", orders, file.display());
        Ok(Outcome::Completed { orders, file })
    }

    /// One cycle: navigate to the page, extract every card, merge, and mark
    /// the page as processed. The session is mutated only after the page's
    /// cards are fully processed.
    async fn scrape_page(
        &self,
        session: &mut ExportSession,
        page_index: u32,
    ) -> Result<(), ExportError> {
        let start_index = page_index * PAGE_SIZE;
        let mut loaded = self.source.load(session.year, start_index).await?;

        // a stale sign-in bounces to the most recent year; renavigate once
        if let Some(got) = page::year_filter(&loaded.url).filter(|&y| y != session.year) {
            warn!("landed on year {} instead of {}, renavigating", got, session.year);
            loaded = self.source.load(session.year, start_index).await?;
            if let Some(still) = page::year_filter(&loaded.url).filter(|&y| y != session.year) {
                return Err(ExportError::YearMismatch {
                    want: session.year,
                    got: still,
                });
            }
        }

        let landed = page::page_index(&loaded.url);
        if landed != page_index {
            warn!("requested page {page_index} but landed on page {landed}");
        }

        let doc = Html::parse_document(&loaded.html);
        let total = page::total_order_count(&doc, &self.selectors);
        if total == 0 {
            return Err(ExportError::NoOrders { year: session.year });
        }
        session.total_orders = total;

        let mut records = Vec::new();
        for card in page::order_cards(&doc, &self.selectors) {
            let Some(mut extracted) = extract::extract_order(card, session.year) else {
                continue;
            };
            if session.fetch_invoice {
                if let Some(popover) = extracted.invoice_popover.as_deref() {
                    extracted.record.invoice_links =
                        invoice::fetch_invoice_links(self.source, &extracted.record.order_id, popover)
                            .await;
                }
            }
            records.push(extracted.record);
        }

        let added = session.merge_orders(records);
        session.processed_pages.insert(page_index);
        session.touch();
        info!(
            "page {} scraped: {} new orders, {}/{} collected",
            page_index,
            added,
            session.orders.len(),
            session.total_orders
        );
        Ok(())
    }
}
