use crate::model::{FileEqualityMode, StructurePolicy};
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::PathBuf;

/// Exclusions applied when a scan request does not override them.
/// `.quarantine` keeps previously staged deletions out of later scans.
pub const DEFAULT_EXCLUDE: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".cache",
    "Thumbs.db",
    ".DS_Store",
    ".quarantine",
];

const MAX_WORKERS: usize = 32;

/// One scan submission, as handed over by the transport layer.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanRequest {
    pub root_path: PathBuf,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
    #[serde(default = "default_equality")]
    pub file_equality: FileEqualityMode,
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_policy")]
    pub structure_policy: StructurePolicy,
    #[serde(default)]
    pub force_case_insensitive: bool,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub deletion_enabled: bool,
}

fn default_exclude() -> Vec<String> {
    DEFAULT_EXCLUDE.iter().map(|s| s.to_string()).collect()
}

fn default_equality() -> FileEqualityMode {
    FileEqualityMode::NameSize
}

fn default_threshold() -> f64 {
    0.80
}

fn default_policy() -> StructurePolicy {
    StructurePolicy::Relative
}

impl ScanRequest {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            include: Vec::new(),
            exclude: default_exclude(),
            file_equality: default_equality(),
            similarity_threshold: default_threshold(),
            structure_policy: default_policy(),
            force_case_insensitive: false,
            concurrency: None,
            deletion_enabled: false,
        }
    }

    /// Worker pool size: `min(requested, min(32, 2×CPU))`, default CPU count.
    pub fn worker_count(&self) -> usize {
        let cpus = num_cpus::get().max(1);
        let ceiling = MAX_WORKERS.min(cpus * 2);
        match self.concurrency {
            Some(requested) => requested.clamp(1, ceiling),
            None => cpus.min(ceiling),
        }
    }
}

/// Engine-level settings: where persisted state lives and how scans are
/// admitted. Loaded from an optional `Dupfold.toml` plus `DUPFOLD_*` env.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub cache_db: Option<PathBuf>,
    #[serde(default = "default_max_active")]
    pub max_active_scans: usize,
    #[serde(default = "default_plan_ttl")]
    pub plan_ttl_minutes: i64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./dupfold-state")
}

fn default_max_active() -> usize {
    1
}

fn default_plan_ttl() -> i64 {
    15
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            cache_db: None,
            max_active_scans: default_max_active(),
            plan_ttl_minutes: default_plan_ttl(),
        }
    }
}

impl AppConfig {
    pub fn cache_db_path(&self) -> PathBuf {
        self.cache_db
            .clone()
            .unwrap_or_else(|| self.state_dir.join("cache.db"))
    }

    pub fn scan_dir(&self, scan_id: &str) -> PathBuf {
        self.state_dir.join("scans").join(scan_id)
    }
}

pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Dupfold").required(false))
        .add_source(Environment::with_prefix("DUPFOLD"))
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_defaults_to_cpu_count() {
        let request = ScanRequest::new("/tmp");
        let cpus = num_cpus::get().max(1);
        assert_eq!(request.worker_count(), cpus.min(MAX_WORKERS.min(cpus * 2)));
    }

    #[test]
    fn worker_count_honors_cap() {
        let mut request = ScanRequest::new("/tmp");
        request.concurrency = Some(1);
        assert_eq!(request.worker_count(), 1);

        request.concurrency = Some(10_000);
        assert!(request.worker_count() <= MAX_WORKERS);
    }

    #[test]
    fn default_excludes_cover_quarantine() {
        let request = ScanRequest::new("/tmp");
        assert!(request.exclude.iter().any(|p| p == ".quarantine"));
    }
}
