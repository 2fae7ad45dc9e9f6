use indicatif::{ProgressBar, ProgressStyle};

use crate::session::SessionStore;

/// Outbound notification channel. Sinks are best-effort: signatures are
/// infallible and implementations swallow their own delivery problems, so
/// reporting can never affect the export itself.
pub trait ProgressSink {
    fn progress(&self, current: u32, total: u32, message: Option<&str>);
    fn complete(&self, order_count: usize);
    fn error(&self, message: &str);
}

/// Listener-less sink for detached runs and tests.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn progress(&self, _current: u32, _total: u32, _message: Option<&str>) {}
    fn complete(&self, _order_count: usize) {}
    fn error(&self, _message: &str) {}
}

/// Terminal sink: an indicatif bar while running, plain lines at the end.
pub struct ConsoleSink {
    bar: ProgressBar,
}

impl ConsoleSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("=> "),
        );
        Self { bar }
    }
}

impl ProgressSink for ConsoleSink {
    fn progress(&self, current: u32, total: u32, message: Option<&str>) {
        if total > 0 {
            self.bar.set_length(total as u64);
        }
        self.bar.set_position(current as u64);
        if let Some(message) = message {
            self.bar.set_message(message.to_string());
        }
    }

    fn complete(&self, order_count: usize) {
        self.bar.finish_and_clear();
        println!("Export complete: {order_count} orders.");
    }

    fn error(&self, message: &str) {
        self.bar.finish_and_clear();
        eprintln!("Export failed: {message}");
    }
}

/// Synchronous status snapshot for a freshly attached listener.
#[derive(Debug, PartialEq, Eq)]
pub struct Status {
    pub is_running: bool,
    pub collected_count: usize,
}

pub fn status(store: &SessionStore) -> Status {
    match store.load() {
        Some(session) => Status {
            is_running: true,
            collected_count: session.orders.len(),
        },
        None => Status {
            is_running: false,
            collected_count: 0,
        },
    }
}
