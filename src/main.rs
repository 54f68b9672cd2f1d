//! # docrelay CLI
//!
//! The `docrelay` binary runs either stage of the pipeline, inspects its
//! state, or serves both stages over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! docrelay --config ./config/docrelay.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docrelay init` | Create the SQLite tables (idempotent) |
//! | `docrelay notify <container> <key>` | Run the notifier for one event |
//! | `docrelay backfill <container>` | Enqueue every qualifying object |
//! | `docrelay work` | Pull work items from the queue and process them |
//! | `docrelay process <container> <key>` | Process one object directly, no queue |
//! | `docrelay get <id-or-locator>` | Print a stored record |
//! | `docrelay dead-letters list\|redrive` | Inspect or re-enqueue dead letters |
//! | `docrelay status` | Queue depth, dead letters, index size |
//! | `docrelay serve` | Push-mode HTTP server |
//! | `docrelay completions <shell>` | Print shell completions |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use docrelay::config;
use docrelay::notifier::NotifyOutcome;
use docrelay::pipeline::Pipeline;
use docrelay::processor::ProcessOutcome;
use docrelay::{backfill, dead_letters, get, migrate, server, stats, telemetry, worker};
use docrelay_core::event::parse_event_type;
use docrelay_core::models::{SourceLocator, StorageEvent, WorkItem};

/// docrelay — event-driven document ingestion into a search index.
///
/// All commands except `completions` accept a `--config` flag pointing to a
/// TOML configuration file. See `config/docrelay.example.toml`.
#[derive(Parser)]
#[command(
    name = "docrelay",
    about = "docrelay — event-driven document ingestion into a search index",
    version,
    long_about = "docrelay turns object-storage notifications into queued work items, then \
    fetches each object, extracts its text (with OCR for images and scanned PDFs), and idempotently \
    upserts one record per object into a search index."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docrelay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the SQLite schema.
    ///
    /// Creates the queue, dead-letter, and index tables used by the sqlite
    /// backends. Safe to run repeatedly. OpenSearch indexes are expected to
    /// exist already.
    Init,

    /// Run the ingest notifier for a single storage event.
    Notify {
        /// Container (bucket) name.
        container: String,
        /// Object key.
        key: String,
        /// Event type: `created`, `removed`, or anything else.
        #[arg(long, default_value = "created")]
        event: String,
    },

    /// Enqueue every qualifying object in a container.
    ///
    /// Lists keys under `--prefix`, applies the notifier's glob filter, and
    /// sends one work item per key. Unchanged objects are skipped later by
    /// the processor, so this is safe to repeat.
    Backfill {
        container: String,
        #[arg(long, default_value = "")]
        prefix: String,
        /// Show counts without enqueueing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Consume the work queue.
    ///
    /// Runs until ctrl-c, or until the queue is empty with `--once`.
    Work {
        /// Number of concurrent receive loops.
        #[arg(long, default_value_t = 1)]
        workers: usize,
        /// Drain the queue and exit.
        #[arg(long)]
        once: bool,
    },

    /// Fetch, extract, and index one object without going through the queue.
    Process { container: String, key: String },

    /// Print a stored record by id or `container/key` locator.
    Get { target: String },

    /// Inspect or redrive dead letters (sqlite backend).
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },

    /// Show queue depth, dead-letter count, and index size.
    Status,

    /// Start the push-mode HTTP server on `[server].bind`.
    Serve,

    /// Print shell completions to stdout.
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// Show the most recent dead letters.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Re-enqueue dead letters with a fresh attempt count.
    Redrive {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "docrelay", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    telemetry::init_tracing(&cfg.logging)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let pipeline = Pipeline::from_config(&cfg).await?;

    match cli.command {
        Commands::Notify {
            container,
            key,
            event,
        } => {
            let notifier = pipeline.notifier(&cfg)?;
            let event = StorageEvent {
                container_name: container,
                object_key: key,
                event_type: parse_event_type(&event),
            };
            match notifier.handle_event(&event).await? {
                NotifyOutcome::Enqueued(item) => {
                    println!("Enqueued {}", item.source_locator);
                }
                NotifyOutcome::Ignored(reason) => {
                    println!("Ignored {}: {}", event.locator(), reason);
                }
            }
        }
        Commands::Backfill {
            container,
            prefix,
            dry_run,
        } => {
            let notifier = pipeline.notifier(&cfg)?;
            backfill::run_backfill(
                pipeline.store.as_ref(),
                &notifier,
                &container,
                &prefix,
                dry_run,
            )
            .await?;
        }
        Commands::Work { workers, once } => {
            let processor = Arc::new(pipeline.processor(&cfg));
            let summary = worker::run_workers(
                pipeline.queue.clone(),
                processor,
                workers,
                cfg.queue.batch_size,
                Duration::from_secs(cfg.queue.wait_secs),
                once,
            )
            .await?;
            println!(
                "Work complete: {} received, {} acked, {} retried, {} dead-lettered",
                summary.received, summary.acked, summary.retried, summary.dead_lettered
            );
        }
        Commands::Process { container, key } => {
            let processor = pipeline.processor(&cfg);
            let item = WorkItem::new(SourceLocator::new(container, key), Utc::now());
            match processor.process(&item).await {
                Ok(ProcessOutcome::Indexed { record_id }) => {
                    println!("Indexed {} as {}", item.source_locator, record_id);
                }
                Ok(ProcessOutcome::Unchanged { record_id }) => {
                    println!("Unchanged {} ({})", item.source_locator, record_id);
                }
                Ok(ProcessOutcome::Superseded { record_id }) => {
                    println!(
                        "Superseded {} ({}): a newer record is stored",
                        item.source_locator, record_id
                    );
                }
                Err(e) => bail!("processing {} failed ({}): {}", item.source_locator, e.kind(), e),
            }
        }
        Commands::Get { target } => {
            get::run_get(pipeline.index.as_ref(), &target).await?;
        }
        Commands::DeadLetters { action } => match action {
            DeadLetterAction::List { limit } => {
                dead_letters::run_list(pipeline.dead_letters.as_ref(), limit).await?;
            }
            DeadLetterAction::Redrive { limit } => {
                dead_letters::run_redrive(
                    pipeline.dead_letters.as_ref(),
                    pipeline.queue.as_ref(),
                    limit,
                )
                .await?;
            }
        },
        Commands::Status => {
            stats::run_status(&cfg, &pipeline).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg, pipeline).await?;
        }
        Commands::Init | Commands::Completions { .. } => {
            // Handled above
            unreachable!()
        }
    }

    Ok(())
}

