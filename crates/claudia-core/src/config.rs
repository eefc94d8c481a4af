//! Configuration
//!
//! Loads settings from `<data_dir>/config.json` with sensible defaults.
//! Every key is optional; missing keys fall back to the values below.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Configuration for the Claudia memory engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    // Database
    pub db_path: Option<PathBuf>,

    // Embedding provider (local inference server)
    pub ollama_host: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,

    // Optional language model for cognitive passes ("" disables them)
    pub language_model: String,

    // Decay and consolidation
    pub decay_rate_daily: f64,
    pub min_importance_threshold: f64,
    pub consolidation_interval_hours: u64,
    pub pattern_detection_interval_hours: u64,

    // Search
    pub max_recall_results: usize,
    pub vector_weight: f64,
    pub importance_weight: f64,
    pub recency_weight: f64,
    pub fts_weight: f64,
    pub enable_rrf: bool,
    pub rrf_k: f64,
    pub graph_proximity_enabled: bool,
    pub graph_proximity_weight: f64,
    pub recency_half_life_days: f64,

    // Consolidation tuning
    pub enable_memory_merging: bool,
    pub similarity_merge_threshold: f64,
    pub enable_entity_summaries: bool,
    pub entity_summary_min_memories: usize,
    pub entity_summary_max_age_days: i64,
    pub enable_auto_dedupe: bool,
    pub auto_dedupe_threshold: f64,
    pub enable_pre_consolidation_backup: bool,
    pub enable_llm_consolidation: bool,
    pub llm_consolidation_batch_size: usize,

    // Verification
    pub verify_batch_size: usize,
    pub verify_interval_seconds: u64,

    // Retention
    pub audit_log_retention_days: i64,
    pub prediction_retention_days: i64,
    pub turn_buffer_retention_days: i64,
    pub metrics_retention_days: i64,
    pub document_dormant_days: i64,
    pub document_archive_days: i64,

    // Daemon
    pub health_port: u16,
    pub log_path: Option<PathBuf>,

    // Vault projection
    pub vault_sync_enabled: bool,
    pub vault_base_dir: Option<PathBuf>,
    pub files_base_dir: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            ollama_host: "http://localhost:11434".to_string(),
            embedding_model: "all-minilm:l6-v2".to_string(),
            embedding_dimensions: 384,
            language_model: "qwen3:4b".to_string(),
            decay_rate_daily: 0.995,
            min_importance_threshold: 0.1,
            consolidation_interval_hours: 6,
            pattern_detection_interval_hours: 24,
            max_recall_results: 20,
            vector_weight: 0.50,
            importance_weight: 0.25,
            recency_weight: 0.10,
            fts_weight: 0.15,
            enable_rrf: true,
            rrf_k: 60.0,
            graph_proximity_enabled: true,
            graph_proximity_weight: 0.15,
            recency_half_life_days: 30.0,
            enable_memory_merging: true,
            similarity_merge_threshold: 0.92,
            enable_entity_summaries: true,
            entity_summary_min_memories: 5,
            entity_summary_max_age_days: 7,
            enable_auto_dedupe: true,
            auto_dedupe_threshold: 0.90,
            enable_pre_consolidation_backup: false,
            enable_llm_consolidation: false,
            llm_consolidation_batch_size: 10,
            verify_batch_size: 20,
            verify_interval_seconds: 300,
            audit_log_retention_days: 90,
            prediction_retention_days: 30,
            turn_buffer_retention_days: 60,
            metrics_retention_days: 90,
            document_dormant_days: 30,
            document_archive_days: 90,
            health_port: 3848,
            log_path: None,
            vault_sync_enabled: false,
            vault_base_dir: None,
            files_base_dir: None,
        }
    }
}

impl MemoryConfig {
    /// Load configuration from `<data_dir>/config.json`.
    ///
    /// A missing or unreadable config file yields the defaults. When a
    /// `project_id` is given the database path is overridden to
    /// `<data_dir>/memory/<project_id>.db` for per-project isolation.
    pub fn load(project_id: Option<&str>) -> Self {
        let data_dir = default_data_dir();
        let mut config = match std::fs::read_to_string(data_dir.join("config.json")) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("config.json is invalid ({}), using defaults", e);
                Self::default()
            }),
            Err(_) => Self::default(),
        };

        if let Some(pid) = project_id {
            config.db_path = Some(data_dir.join("memory").join(format!("{}.db", pid)));
        }

        config
    }

    /// Effective database path: configured path, or
    /// `<data_dir>/memory/claudia.db`.
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("memory").join("claudia.db"))
    }

    /// Effective daemon log path.
    pub fn log_path(&self) -> PathBuf {
        self.log_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("daemon.log"))
    }

    /// Vault root for a project.
    pub fn vault_dir(&self, project_id: Option<&str>) -> PathBuf {
        let base = self
            .vault_base_dir
            .clone()
            .unwrap_or_else(|| default_data_dir().join("vault"));
        base.join(project_id.unwrap_or("claudia"))
    }

    /// Filed-document root for a project.
    pub fn files_dir(&self, project_id: Option<&str>) -> PathBuf {
        let base = self
            .files_base_dir
            .clone()
            .unwrap_or_else(|| default_data_dir().join("files"));
        base.join(project_id.unwrap_or("claudia"))
    }

    /// True when an optional language model is configured.
    pub fn has_language_model(&self) -> bool {
        !self.language_model.is_empty()
    }
}

/// `~/.claudia`, or the current directory when no home is resolvable.
pub fn default_data_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|d| d.home_dir().join(".claudia"))
        .unwrap_or_else(|| PathBuf::from(".claudia"))
}

/// Short stable hash of an absolute project directory path.
///
/// First 12 hex chars of SHA-256: unique enough for per-project database
/// files, short enough to read in file listings.
pub fn project_hash(project_dir: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_dir.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 12)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{:02x}", b);
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = MemoryConfig::default();
        assert_eq!(c.embedding_dimensions, 384);
        assert!((c.decay_rate_daily - 0.995).abs() < f64::EPSILON);
        assert!((c.vector_weight - 0.50).abs() < f64::EPSILON);
        assert!((c.fts_weight - 0.15).abs() < f64::EPSILON);
        assert_eq!(c.health_port, 3848);
        assert!(c.enable_rrf);
        assert_eq!(c.rrf_k, 60.0);
    }

    #[test]
    fn project_hash_is_stable_and_short() {
        let a = project_hash(Path::new("/home/user/projects/acme"));
        let b = project_hash(Path::new("/home/user/projects/acme"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let other = project_hash(Path::new("/home/user/projects/beta"));
        assert_ne!(a, other);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let parsed: MemoryConfig =
            serde_json::from_str(r#"{"embedding_dimensions": 768, "enable_rrf": false}"#).unwrap();
        assert_eq!(parsed.embedding_dimensions, 768);
        assert!(!parsed.enable_rrf);
        // Untouched keys keep their defaults
        assert_eq!(parsed.max_recall_results, 20);
        assert_eq!(parsed.verify_batch_size, 20);
    }
}
