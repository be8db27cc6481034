//! Configuration for the lineage engine.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides. Files are
//! `~/.config/lineage/config.toml` (platform equivalent) and
//! `.lineage/config.toml` in the workspace directory.

use crate::error::LineageError;
use crate::query::LineageView;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Name of the per-workspace configuration directory.
pub const WORKSPACE_DIR: &str = ".lineage";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineageConfig {
    pub store: StoreConfig,
    pub query: QueryConfig,
    pub export: ExportConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    /// Volatile; everything is lost when the process exits.
    Memory,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Sqlite => write!(f, "sqlite"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// SQLite database file. Defaults to `.lineage/graph.db` in the workspace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// The database file to open for a given workspace.
    pub fn resolved_path(&self, workspace: &Path) -> PathBuf {
        match &self.path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => workspace.join(path),
            None => workspace.join(WORKSPACE_DIR).join("graph.db"),
        }
    }
}

/// Traversal defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Chains longer than this many flow hops are condensed.
    pub condensation_threshold: usize,
    pub max_depth: usize,
    pub max_nodes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Granularity of traversal answers: host, table or column.
    pub view: LineageView,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            condensation_threshold: 3,
            max_depth: 64,
            max_nodes: 10_000,
            timeout_secs: None,
            view: LineageView::Column,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Graphml,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Graphml => "graphml",
            ExportFormat::Json => "json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "graphml" | "xml" => Ok(ExportFormat::Graphml),
            "json" => Ok(ExportFormat::Json),
            other => Err(format!("unknown export format '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub path: PathBuf,
    pub format: ExportFormat,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("lineage-graph.graphml"),
            format: ExportFormat::Graphml,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Bound of the ingestion worker's event queue.
    pub channel_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

impl LineageConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), LineageError> {
        let invalid = |msg: &str| Err(LineageError::Config(msg.to_string()));
        if self.query.condensation_threshold == 0 {
            return invalid("query.condensation_threshold must be at least 1");
        }
        if self.query.max_nodes == 0 {
            return invalid("query.max_nodes must be at least 1");
        }
        if self.ingest.channel_capacity == 0 {
            return invalid("ingest.channel_capacity must be at least 1");
        }
        if self.store.backend == StoreBackend::Sqlite
            && self
                .store
                .path
                .as_ref()
                .is_some_and(|p| p.as_os_str().is_empty())
        {
            return invalid("store.path must not be empty");
        }
        Ok(())
    }
}

/// Platform directories for user config and logs.
pub fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "lineage", "lineage")
}

/// Load configuration from all layers.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&LineageConfig>,
) -> Result<LineageConfig, Box<figment::Error>> {
    load_config_with_file(workspace, None, overrides)
}

/// Like [`load_config`], with one more TOML file merged above the
/// workspace file (the CLI's `--config`).
pub fn load_config_with_file(
    workspace: Option<&Path>,
    file: Option<&Path>,
    overrides: Option<&LineageConfig>,
) -> Result<LineageConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(LineageConfig::default()));

    if let Some(dirs) = project_dirs() {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(WORKSPACE_DIR).join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(file) = file {
        figment = figment.merge(Toml::file(file));
    }

    // LINEAGE_QUERY__MAX_DEPTH, LINEAGE_STORE__BACKEND, ...
    figment = figment.merge(Env::prefixed("LINEAGE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = LineageConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.query.condensation_threshold, 3);
        assert_eq!(config.query.max_depth, 64);
        assert_eq!(config.query.max_nodes, 10_000);
        assert_eq!(config.query.view, LineageView::Column);
        assert_eq!(config.export.path, PathBuf::from("lineage-graph.graphml"));
        assert_eq!(config.ingest.channel_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = LineageConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: LineageConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = LineageConfig::default();
        overrides.query.max_depth = 5;
        overrides.store.backend = StoreBackend::Memory;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.query.max_depth, 5);
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws_dir = dir.path().join(WORKSPACE_DIR);
        std::fs::create_dir_all(&ws_dir).unwrap();
        std::fs::write(
            ws_dir.join("config.toml"),
            r#"
[query]
condensation_threshold = 5
view = "table"

[export]
format = "json"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.query.condensation_threshold, 5);
        assert_eq!(config.query.view, LineageView::Table);
        // Untouched keys keep their defaults.
        assert_eq!(config.query.max_nodes, 10_000);
        assert_eq!(config.export.format, ExportFormat::Json);
    }

    #[test]
    fn test_explicit_file_overrides_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws_dir = dir.path().join(WORKSPACE_DIR);
        std::fs::create_dir_all(&ws_dir).unwrap();
        std::fs::write(ws_dir.join("config.toml"), "[query]\nmax_depth = 7\nmax_nodes = 50\n")
            .unwrap();
        let extra = dir.path().join("ci.toml");
        std::fs::write(&extra, "[query]\nmax_depth = 9\n").unwrap();

        let config = load_config_with_file(Some(dir.path()), Some(&extra), None).unwrap();
        assert_eq!(config.query.max_depth, 9);
        assert_eq!(config.query.max_nodes, 50);
    }

    #[test]
    fn test_store_path_resolution() {
        let ws = Path::new("/srv/lineage");
        let mut store = StoreConfig::default();
        assert_eq!(store.resolved_path(ws), ws.join(".lineage/graph.db"));
        store.path = Some(PathBuf::from("data/graph.db"));
        assert_eq!(store.resolved_path(ws), ws.join("data/graph.db"));
        store.path = Some(PathBuf::from("/var/graph.db"));
        assert_eq!(store.resolved_path(ws), PathBuf::from("/var/graph.db"));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = LineageConfig::default();
        config.query.condensation_threshold = 0;
        assert!(matches!(config.validate(), Err(LineageError::Config(_))));
    }

    #[test]
    fn test_export_format_parsing() {
        assert_eq!("GraphML".parse::<ExportFormat>().unwrap(), ExportFormat::Graphml);
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("csv".parse::<ExportFormat>().is_err());
    }
}
