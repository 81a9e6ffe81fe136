//! # Hack Timeline CLI (`htl`)
//!
//! ## Usage
//!
//! ```bash
//! htl --config ./config/htl.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `htl init` | Create the SQLite database and run schema migrations |
//! | `htl serve` | Run the scrape scheduler and the HTTP query API |
//! | `htl scrape <kind>` | Run one scrape cycle for `hacking` or `transfer` |
//! | `htl timeline <kind>` | Print the newest records, optionally by tag |
//! | `htl tags` | List every known tag |
//! | `htl watermarks` | Show per-channel scrape progress |
//!
//! Log verbosity follows `RUST_LOG` (default `info,sqlx=warn`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hack_timeline::models::RecordKind;
use hack_timeline::{config, migrate, scheduler, server, timeline};

/// Hack Timeline: scrape exploit and transfer alerts into a tagged timeline.
#[derive(Parser)]
#[command(name = "htl", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/htl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Run the scheduler and serve the query API until Ctrl-C.
    Serve,

    /// Prime watermarks, run one scrape cycle, and persist progress.
    Scrape {
        /// Record kind: `hacking` or `transfer`.
        kind: RecordKind,

        /// Maximum new posts fetched per channel (defaults to `scrape.fetch_limit`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show the newest records, newest first.
    Timeline {
        /// Record kind: `hacking` or `transfer`.
        kind: RecordKind,

        /// Comma-separated tag names; records matching any of them are shown.
        #[arg(long)]
        tags: Option<String>,

        /// Number of records to show.
        #[arg(long, default_value = "20")]
        count: i64,

        /// Only show records with an id below this cursor.
        #[arg(long)]
        before: Option<i64>,
    },

    /// List every known tag.
    Tags,

    /// Show the persisted watermark of every channel.
    Watermarks,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_serve(&cfg).await?;
        }
        Commands::Scrape { kind, limit } => {
            scheduler::run_scrape(&cfg, kind, limit).await?;
        }
        Commands::Timeline {
            kind,
            tags,
            count,
            before,
        } => {
            timeline::run_timeline(&cfg, kind, tags, count, before).await?;
        }
        Commands::Tags => {
            timeline::run_tags(&cfg).await?;
        }
        Commands::Watermarks => {
            timeline::run_watermarks(&cfg).await?;
        }
    }

    Ok(())
}
