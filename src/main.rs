//! # Notion Archive CLI (`notion-archive`)
//!
//! ## Usage
//!
//! ```bash
//! notion-archive [--config PATH] [--db-path PATH] [--model NAME] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `init` | Create the SQLite database and run schema migrations |
//! | `build <export_path>` | Register a Notion HTML export and (re)build the index |
//! | `search "<query>"` | Search indexed pages |
//! | `stats` | Show archive statistics |
//! | `research --query "<q>"` | Deep research grounded in the archive |
//! | `serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! notion-archive build ~/Downloads/Export-2024
//! notion-archive search "quarterly planning" --workspace Engineering --tags okr,planning
//! OPENAI_API_KEY=sk-... notion-archive research --query "What did we decide about pricing?"
//! RUST_LOG=info notion-archive serve
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use notion_archive::archive::NotionArchive;
use notion_archive::config::{self, Config};
use notion_archive::models::SearchFilters;
use notion_archive::research::{self, ResearchOptions};
use notion_archive::search::{self, SearchMode};
use notion_archive::{ingest, server, stats};

/// Searchable local archive of Notion exports, with deep research on top.
#[derive(Parser)]
#[command(name = "notion-archive", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Falls back to `$NOTION_ARCHIVE_CONFIG`, then `./notion-archive.toml`,
    /// then built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override `[db].path`.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Embedding model. `text-embedding-*` names use OpenAI, others run locally.
    #[arg(long)]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Register an export directory and rebuild the index.
    ///
    /// Every registered export is rescanned; unchanged pages are skipped.
    Build {
        /// Directory produced by Notion's "Export → HTML".
        export_path: PathBuf,
    },

    /// Search the archive.
    Search {
        query: String,

        /// Maximum number of results (default: `[retrieval].default_limit`).
        #[arg(long)]
        limit: Option<usize>,

        /// Only pages from this workspace.
        #[arg(long)]
        workspace: Option<String>,

        /// Only pages carrying any of these tags (comma-separated).
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        /// `keyword`, `semantic`, or `hybrid`. Defaults to hybrid when
        /// embeddings are enabled, keyword otherwise.
        #[arg(long)]
        mode: Option<SearchMode>,
    },

    /// Show archive statistics.
    Stats,

    /// Run a deep-research query grounded in the archive.
    ///
    /// Requires an API key in `$OPENAI_API_KEY` (or the variable named by
    /// `[research].api_key_env`). Runs can take several minutes.
    Research {
        #[arg(long)]
        query: String,

        /// Archive snippets to include (default: `[research].top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Deep research model (default: `[research].model`).
        #[arg(long)]
        model: Option<String>,

        /// Register and index this export before researching.
        #[arg(long)]
        export_path: Option<PathBuf>,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cfg = load_effective_config(&cli)?;
    let archive = NotionArchive::open(cfg).await?;

    match cli.command {
        Commands::Init => {
            println!("Database initialized successfully.");
        }
        Commands::Build { export_path } => {
            ingest::run_build(&archive, Some(&export_path)).await?;
        }
        Commands::Search {
            query,
            limit,
            workspace,
            tags,
            mode,
        } => {
            let filters = SearchFilters {
                workspace,
                tags: tags
                    .into_iter()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect(),
            };
            search::run_search(&archive, &query, limit, &filters, mode).await?;
        }
        Commands::Stats => {
            stats::run_stats(&archive).await?;
        }
        Commands::Research {
            query,
            top_k,
            model,
            export_path,
        } => {
            if let Some(path) = export_path {
                ingest::run_build(&archive, Some(&path)).await?;
            }
            let options = ResearchOptions {
                top_k,
                model,
                api_key: None,
            };
            println!("Running deep research (this can take several minutes)...");
            let report =
                research::deep_research(&archive, &query, &options, &archive.config().research)
                    .await?;
            println!();
            println!("{}", "=".repeat(60));
            println!("RESEARCH REPORT");
            println!("{}", "=".repeat(60));
            println!("{}", report);
        }
        Commands::Serve => {
            server::run_server(archive).await?;
            return Ok(());
        }
    }

    archive.close().await;
    Ok(())
}

fn load_effective_config(cli: &Cli) -> Result<Config> {
    let path = config::resolve_config_path(cli.config.as_deref());
    let mut cfg = config::load_config(path.as_deref())?;
    if let Some(path) = &cli.db_path {
        cfg.db.path = path.clone();
    }
    if let Some(model) = &cli.model {
        cfg.embedding.select_model(model);
    }
    config::validate(&cfg)?;
    Ok(cfg)
}
