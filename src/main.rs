//! # ToS Monitor CLI (`tosmon`)
//!
//! ## Usage
//!
//! ```bash
//! tosmon --config ./config/tosmon.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tosmon init` | Seed the document list and default prompt in storage |
//! | `tosmon fetch` | Run a fetch cycle |
//! | `tosmon diff <doc>` | Request a diff for one document |
//! | `tosmon diffs` | Run a batch diff cycle |
//! | `tosmon list` | List documents with their current/last/prev snapshots |
//! | `tosmon history <doc>` | Snapshot history of one document |
//! | `tosmon show <doc> [selector]` | Print a snapshot's content |
//! | `tosmon get-diff <doc>` | Print a stored diff |
//! | `tosmon overview` | Newest diff of every configured document |
//! | `tosmon health` | Check storage and the summarizer backend |
//! | `tosmon serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! # Seed storage from a local document list
//! tosmon init --documents ./config/documents.json
//!
//! # Fetch two documents, storing formatting-only changes too
//! tosmon fetch --doc acme-tos --doc 'globex-*' --force
//!
//! # Compare the first snapshot of May with the current one
//! tosmon diff acme-tos --from 2024-05-01 --to current
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;

use tos_monitor::config::{self, Config};
use tos_monitor::diff::DiffRequest;
use tos_monitor::logging;
use tos_monitor::models::{DiffRecord, Selector};
use tos_monitor::monitor::{CycleReport, DocStatus, Monitor, Scope};
use tos_monitor::server;

const DEFAULT_CONFIG: &str = "./config/tosmon.toml";

/// ToS Monitor: snapshot legal documents and summarize what changed.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Without it, `./config/tosmon.toml` is used when present and
/// built-in defaults otherwise.
#[derive(Parser)]
#[command(name = "tosmon", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed `config/documents.json` and `prompts/default_comparison.txt`.
    ///
    /// Existing keys are left alone unless `--overwrite` is given.
    Init {
        /// Local JSON file with `{"documents": [...]}`.
        #[arg(long)]
        documents: Option<PathBuf>,

        #[arg(long)]
        overwrite: bool,
    },

    /// Fetch documents and store the ones that changed.
    Fetch {
        /// Document id or glob; repeatable. Defaults to every document.
        #[arg(long = "doc")]
        docs: Vec<String>,

        /// Also store formatting-only changes.
        #[arg(long)]
        force: bool,

        /// Print the cycle report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Summarize the changes between two snapshots of one document.
    ///
    /// Defaults to comparing `prev` with `last`.
    Diff {
        doc_id: String,

        #[arg(long, value_parser = parse_selector)]
        from: Option<Selector>,

        #[arg(long, value_parser = parse_selector)]
        to: Option<Selector>,

        /// Regenerate even if this pair was already summarized.
        #[arg(long)]
        force: bool,
    },

    /// Summarize `prev` → `last` for every document with new changes.
    Diffs {
        #[arg(long = "doc")]
        docs: Vec<String>,

        #[arg(long)]
        force: bool,

        #[arg(long)]
        json: bool,
    },

    /// List documents with their current, last and prev snapshots.
    List {
        #[arg(long)]
        json: bool,
    },

    /// Show the snapshot history of one document.
    History {
        doc_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Print the content of one snapshot.
    Show {
        doc_id: String,

        /// `current`, `last`, `prev`, `YYYY-MM-DD` or a snapshot timestamp.
        #[arg(default_value = "current", value_parser = parse_selector)]
        selector: Selector,
    },

    /// Print a stored diff. Defaults to the latest one.
    GetDiff {
        doc_id: String,

        #[arg(long, value_parser = parse_selector, requires = "to")]
        from: Option<Selector>,

        #[arg(long, value_parser = parse_selector, requires = "from")]
        to: Option<Selector>,

        #[arg(long)]
        json: bool,
    },

    /// Show the newest diff of every configured document.
    Overview {
        /// Only documents that have a diff.
        #[arg(long)]
        changed: bool,

        #[arg(long)]
        json: bool,
    },

    /// Check storage and the summarizer backend. Exits non-zero when
    /// unhealthy.
    Health {
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

fn parse_selector(s: &str) -> Result<Selector, String> {
    s.parse().map_err(|e: tos_monitor::MonitorError| e.to_string())
}

fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Ok(config::load_config(path)?),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            Ok(config::load_config(Path::new(DEFAULT_CONFIG))?)
        }
        None => Ok(Config::default()),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(title: &str, report: &CycleReport) {
    println!("{}", title);
    for (doc_id, status) in &report.documents {
        let line = match status {
            DocStatus::Stored {
                timestamp, change, ..
            } => format!("stored {} ({})", timestamp, change.as_str()),
            DocStatus::Generated { from, to } => format!("generated {} -> {}", from, to),
            DocStatus::Cached { from, to } => format!("cached {} -> {}", from, to),
            DocStatus::Skipped { reason, .. } => format!("skipped: {}", reason),
            DocStatus::Failed { code, message } => format!("FAILED [{}]: {}", code, message),
        };
        println!("  {}: {}", doc_id, line);
    }
    println!(
        "  processed: {}, succeeded: {}, failed: {}, written: {}",
        report.processed, report.succeeded, report.failed, report.written
    );
    println!("  elapsed: {} ms", report.elapsed_ms);
}

fn print_diff(record: &DiffRecord) {
    let meta = &record.meta;
    println!(
        "diff {} {} -> {}",
        meta.doc_id, meta.from_timestamp, meta.to_timestamp
    );
    println!("  generated: {}", meta.generated_at.to_rfc3339());
    println!("  model: {}", meta.model);
    println!("  prompt: {}", meta.prompt_used);
    println!("  substantive: {}", meta.substantive);
    println!();
    println!("{}", record.summary_text);
}

fn finish(report: &CycleReport) -> anyhow::Result<()> {
    if report.has_failures() {
        bail!("{} of {} document(s) failed", report.failed, report.processed);
    }
    println!("ok");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load(cli.config.as_deref())?;
    logging::init(&cfg.logging);

    if let Commands::Serve = cli.command {
        return server::run_server(&cfg).await;
    }

    let monitor = Monitor::from_config(&cfg)?;

    match cli.command {
        Commands::Init {
            documents,
            overwrite,
        } => {
            let bytes = match &documents {
                Some(path) => Some(
                    std::fs::read(path)
                        .with_context(|| format!("reading {}", path.display()))?,
                ),
                None => None,
            };
            let report = monitor.init(bytes.as_deref(), overwrite).await?;
            println!("init");
            for key in &report.written {
                println!("  wrote: {}", key);
            }
            for key in &report.kept {
                println!("  kept (use --overwrite to replace): {}", key);
            }
            println!("ok");
        }
        Commands::Fetch { docs, force, json } => {
            let report = monitor.run_fetch_cycle(&Scope::new(docs), force).await?;
            if json {
                print_json(&report)?;
            } else {
                print_report("fetch", &report);
            }
            finish(&report)?;
        }
        Commands::Diff {
            doc_id,
            from,
            to,
            force,
        } => {
            let outcome = monitor
                .generate_diff(&doc_id, &DiffRequest { from, to, force })
                .await?;
            if outcome.was_cached() {
                println!("(cached)");
            }
            print_diff(outcome.record());
        }
        Commands::Diffs { docs, force, json } => {
            let report = monitor.run_diff_cycle(&Scope::new(docs), force).await?;
            if json {
                print_json(&report)?;
            } else {
                print_report("diffs", &report);
            }
            finish(&report)?;
        }
        Commands::List { json } => {
            let documents = monitor.list_documents().await?;
            if json {
                print_json(&documents)?;
            } else if documents.is_empty() {
                println!("No documents configured or stored.");
            } else {
                for doc in &documents {
                    let s = &doc.summary;
                    let show = |ts: Option<tos_monitor::models::Timestamp>| {
                        ts.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string())
                    };
                    println!(
                        "{}  {}",
                        s.doc_id,
                        doc.name.as_deref().unwrap_or("(not configured)")
                    );
                    println!(
                        "  snapshots: {}  changed: {}",
                        s.total,
                        if s.changed { "yes" } else { "no" }
                    );
                    println!("  current: {}", show(s.current));
                    println!("  last:    {}", show(s.last));
                    println!("  prev:    {}", show(s.prev));
                }
            }
        }
        Commands::History { doc_id, json } => {
            let detail = monitor.describe_document(&doc_id).await?;
            if json {
                print_json(&detail)?;
            } else {
                println!("{} ({} snapshots)", doc_id, detail.summary.total);
                for meta in &detail.history {
                    let change = meta.change.map(|c| c.as_str()).unwrap_or("-");
                    println!(
                        "  {}  {:>8} chars  {}",
                        meta.timestamp, meta.content_length, change
                    );
                }
                if !detail.diffs.is_empty() {
                    println!("diffs:");
                    for d in &detail.diffs {
                        println!("  {} -> {}", d.from_timestamp, d.to_timestamp);
                    }
                }
            }
        }
        Commands::Show { doc_id, selector } => {
            let snapshot = monitor.get_snapshot(&doc_id, selector).await?;
            println!("{}", snapshot.content);
        }
        Commands::GetDiff {
            doc_id,
            from,
            to,
            json,
        } => {
            let pair = from.zip(to);
            let record = monitor.get_diff(&doc_id, pair).await?;
            if json {
                print_json(&record)?;
            } else {
                print_diff(&record);
            }
        }
        Commands::Overview { changed, json } => {
            let overview = monitor.diff_overview(changed).await?;
            if json {
                print_json(&overview)?;
            } else if overview.is_empty() {
                println!("No diffs stored.");
            } else {
                for doc in &overview {
                    match &doc.latest {
                        Some(d) => println!(
                            "{}  {} -> {}  ({})",
                            doc.doc_id,
                            d.from_timestamp,
                            d.to_timestamp,
                            d.generated_at.to_rfc3339()
                        ),
                        None => println!("{}  -", doc.doc_id),
                    }
                }
            }
        }
        Commands::Health { json } => {
            let report = monitor.health().await;
            if json {
                print_json(&report)?;
            } else {
                println!("tosmon {}", report.version);
                for (name, check) in &report.checks {
                    let detail = check.message.as_deref().or(check.model.as_deref());
                    match detail {
                        Some(detail) => {
                            println!("  {}: {} ({})", name, check.status.as_str(), detail)
                        }
                        None => println!("  {}: {}", name, check.status.as_str()),
                    }
                }
            }
            if !report.is_healthy() {
                bail!("unhealthy");
            }
            if !json {
                println!("ok");
            }
        }
        Commands::Serve => {}
    }

    Ok(())
}
