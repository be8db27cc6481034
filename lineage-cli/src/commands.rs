//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use anyhow::Context;
use lineage_core::config::{LineageConfig, StoreBackend, WORKSPACE_DIR};
use lineage_core::export::GraphExporter;
use lineage_core::generator::{GeneratorParams, GraphGenerator};
use lineage_core::ingest::{IngestReport, IngestWorker};
use lineage_core::query::{LineageQuery, TraversalBudget};
use lineage_core::store::{GraphStore, MemoryGraphStore, SqliteGraphStore};
use lineage_core::{GraphBuilder, RelationshipEvent, persistence};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Rejected events, one per line, written under the workspace directory so
/// `lineage ingest` can replay them.
const FAILED_EVENTS_FILE: &str = "failed-events.jsonl";

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config: LineageConfig,
) -> anyhow::Result<()> {
    if let Commands::Config { action } = command {
        return handle_config(action, workspace, &config);
    }
    match config.store.backend {
        StoreBackend::Sqlite => {
            let path = config.store.resolved_path(workspace);
            let store = SqliteGraphStore::open(&path)
                .with_context(|| format!("Failed to open graph store {}", path.display()))?;
            run_with_store(Arc::new(store), command, workspace, config).await
        }
        StoreBackend::Memory => {
            warn!("using the in-memory store; nothing is kept after this command");
            run_with_store(Arc::new(MemoryGraphStore::new()), command, workspace, config).await
        }
    }
}

async fn run_with_store<S: GraphStore + 'static>(
    store: Arc<S>,
    command: Commands,
    workspace: &Path,
    mut config: LineageConfig,
) -> anyhow::Result<()> {
    match command {
        Commands::Ingest { file } => {
            let report = handle_ingest(store, &file, &config).await?;
            let replay: Vec<&RelationshipEvent> = report.replayable().collect();
            if !replay.is_empty() {
                let path = workspace.join(WORKSPACE_DIR).join(FAILED_EVENTS_FILE);
                persistence::atomic_write_json_lines(&path, replay)?;
                warn!(path = %path.display(), "failed events recorded for redelivery");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Traverse {
            guid,
            scope,
            max_depth,
            max_nodes,
            threshold,
            timeout_secs,
            view,
        } => {
            if let Some(depth) = max_depth {
                config.query.max_depth = depth;
            }
            if let Some(nodes) = max_nodes {
                config.query.max_nodes = nodes;
            }
            if let Some(t) = threshold {
                config.query.condensation_threshold = t;
            }
            if timeout_secs.is_some() {
                config.query.timeout_secs = timeout_secs;
            }
            if let Some(view) = view {
                config.query.view = view;
            }
            config.validate()?;

            let cancel = CancellationToken::new();
            let budget = TraversalBudget::from_config(&config.query).with_cancel(cancel.clone());
            let query = LineageQuery::new(store)
                .with_condensation_threshold(config.query.condensation_threshold)
                .with_view(config.query.view);
            let task = tokio::task::spawn_blocking(move || query.traverse(&guid, scope, &budget));
            let result = tokio::select! {
                joined = task => joined??,
                _ = tokio::signal::ctrl_c() => {
                    cancel.cancel();
                    anyhow::bail!("Traversal interrupted");
                }
            };
            if result.is_truncated() {
                warn!(reason = ?result.truncated, "traversal result is truncated");
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Glossary { guid } => {
            let budget = TraversalBudget::from_config(&config.query);
            let query = LineageQuery::new(store);
            let result =
                tokio::task::spawn_blocking(move || query.glossary(&guid, &budget)).await??;
            if result.truncated.is_some() {
                warn!(reason = ?result.truncated, "glossary result is truncated");
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Export { out, format } => {
            let format = format.unwrap_or(config.export.format);
            let path = out.unwrap_or_else(|| config.export.path.clone());
            let path = if path.is_absolute() {
                path
            } else {
                workspace.join(path)
            };
            let exporter = GraphExporter::new(store);
            let summary = tokio::task::spawn_blocking(move || exporter.export_to_path(&path, format))
                .await??;
            println!(
                "Exported {} vertices and {} edges to {}",
                summary.vertices,
                summary.edges,
                summary.path.display()
            );
            Ok(())
        }
        Commands::Generate {
            glossary_terms,
            flows,
            processes_per_flow,
            columns_per_table,
            seed,
        } => {
            let mut params =
                GeneratorParams::new(glossary_terms, flows, processes_per_flow, columns_per_table);
            if let Some(seed) = seed {
                params = params.with_seed(seed);
            }
            let generator = GraphGenerator::new(store);
            let summary = tokio::task::spawn_blocking(move || generator.generate(&params)).await??;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Stats => {
            let counts = store.counts()?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
            Ok(())
        }
        Commands::Config { action } => handle_config(action, workspace, &config),
    }
}

/// Parse events line by line and feed them through an ingestion worker.
/// Lines that are not valid events count as failures under their line number.
async fn handle_ingest<S: GraphStore + 'static>(
    store: Arc<S>,
    file: &Path,
    config: &LineageConfig,
) -> anyhow::Result<IngestReport> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let cancel = CancellationToken::new();
    let builder = Arc::new(GraphBuilder::new(store));
    let (sender, worker) =
        IngestWorker::new(builder, config.ingest.channel_capacity, cancel.clone());
    let handle = tokio::spawn(worker.run());

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let mut unparsable = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RelationshipEvent>(line) {
            Ok(event) => {
                if sender.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(line = index + 1, error = %e, "skipping unparsable event");
                unparsable.push((format!("line {}", index + 1), e.to_string()));
            }
        }
    }
    drop(sender);

    let mut report = handle.await?;
    for (base_guid, error) in unparsable {
        report.failed.push(lineage_core::ingest::FailedEvent {
            base_guid,
            error,
            event: None,
        });
    }
    info!(file = %file.display(), ingested = report.ingested, "ingest finished");
    Ok(report)
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config: &LineageConfig,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(WORKSPACE_DIR);
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&LineageConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}
