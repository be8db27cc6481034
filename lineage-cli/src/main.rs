//! Lineage CLI — command-line front end for the lineage graph engine.

mod commands;

use clap::Parser;
use lineage_core::query::{LineageView, Scope};
use lineage_core::ExportFormat;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Lineage: ingest provenance events and query the lineage graph
#[derive(Parser, Debug)]
#[command(name = "lineage", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Ingest newline-delimited JSON relationship events
    Ingest {
        /// File with one event per line
        file: PathBuf,
    },
    /// Traverse lineage from a vertex and print the subgraph as JSON
    Traverse {
        /// Guid of the start vertex
        guid: String,
        /// ultimate-source, ultimate-destination or end-to-end
        #[arg(short, long, default_value = "end-to-end")]
        scope: Scope,
        #[arg(long)]
        max_depth: Option<usize>,
        #[arg(long)]
        max_nodes: Option<usize>,
        /// Condense chains longer than this many hops
        #[arg(short, long)]
        threshold: Option<usize>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// host, table or column (defaults to query.view)
        #[arg(long)]
        view: Option<LineageView>,
    },
    /// Glossary terms of an asset, or the assets and synonyms of a term
    Glossary {
        /// Guid of a glossary term or an asset
        guid: String,
    },
    /// Export the whole graph
    Export {
        /// Output file (defaults to export.path)
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// graphml or json (defaults to export.format)
        #[arg(short, long)]
        format: Option<ExportFormat>,
    },
    /// Generate a synthetic graph into an empty store
    Generate {
        #[arg(long)]
        glossary_terms: usize,
        #[arg(long)]
        flows: usize,
        #[arg(long)]
        processes_per_flow: usize,
        #[arg(long)]
        columns_per_table: usize,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Vertex and edge counts per label
    Stats,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Create a default workspace configuration file
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = lineage_core::config::project_dirs()
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "lineage.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let config = lineage_core::config::load_config_with_file(
        Some(&workspace),
        cli.config.as_deref(),
        None,
    )
    .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    config.validate()?;

    commands::handle_command(cli.command, &workspace, config).await
}
