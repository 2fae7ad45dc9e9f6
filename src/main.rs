mod controller;
mod export;
mod extract;
mod fetch;
mod page;
mod report;
mod session;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::bail;
use chrono::{Datelike, Utc};
use clap::{Parser, Subcommand};

use controller::{Controller, ExportRequest, Outcome};
use session::{ExportMode, SessionStore, SESSION_PATH};

/// Oldest year the site lets you filter orders by.
const OLDEST_ORDER_YEAR: u16 = 2008;

#[derive(Parser)]
#[command(name = "amzexport", about = "Amazon order history exporter")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Suppress the progress bar
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Export one year of orders to CSV (resumes a matching interrupted run)
    Export {
        /// Order year to export
        #[arg(short, long)]
        year: u16,
        /// Output grain: one row per order, or one row per product
        #[arg(long, value_enum, default_value_t = ExportMode::ByOrder)]
        mode: ExportMode,
        /// Also fetch invoice document links (one extra request per order)
        #[arg(long)]
        fetch_invoice: bool,
    },
    /// Resume an interrupted export
    Resume,
    /// Show whether an export session is active
    Status,
    /// Cancel the active export and clear its session
    Cancel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let store = SessionStore::new(SESSION_PATH);

    let result = match cli.command {
        Commands::Export {
            year,
            mode,
            fetch_invoice,
        } => {
            let current_year = Utc::now().year() as u16;
            if !(OLDEST_ORDER_YEAR..=current_year).contains(&year) {
                bail!("year must be between {OLDEST_ORDER_YEAR} and {current_year}");
            }
            let client = fetch::Client::new()?;
            let sink = make_sink(cli.quiet);
            let mut controller = Controller::new(&client, &store, PathBuf::from("."));
            let outcome = controller
                .start(
                    ExportRequest {
                        year,
                        mode,
                        fetch_invoice,
                    },
                    sink.as_ref(),
                )
                .await?;
            report_outcome(outcome);
            Ok(())
        }
        Commands::Resume => {
            let client = fetch::Client::new()?;
            let sink = make_sink(cli.quiet);
            let mut controller = Controller::new(&client, &store, PathBuf::from("."));
            let outcome = controller.resume(sink.as_ref()).await?;
            report_outcome(outcome);
            Ok(())
        }
        Commands::Status => {
            let status = report::status(&store);
            println!("Running:   {}", if status.is_running { "yes" } else { "no" });
            println!("Collected: {}", status.collected_count);
            Ok(())
        }
        Commands::Cancel => {
            store.clear()?;
            println!("Session cleared.");
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn make_sink(quiet: bool) -> Box<dyn report::ProgressSink> {
    if quiet {
        Box::new(report::NullSink)
    } else {
        Box::new(report::ConsoleSink::new())
    }
}

fn report_outcome(outcome: Outcome) {
    match outcome {
        Outcome::Completed { orders, file } => {
            println!("Wrote {} ({} orders).", file.display(), orders);
        }
        Outcome::Cancelled => println!("Export was cancelled."),
        Outcome::Idle => println!("No session to resume."),
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
