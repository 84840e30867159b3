use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{RecallError, Result};

/// Path value meaning "use an in-memory database".
pub const IN_MEMORY_DATABASE: &str = ":memory:";

/// Top-level configuration for Recall.
///
/// Loaded from `~/.recall/config.toml` by default. Every section is optional
/// in the file and falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl RecallConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RecallConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimensions == 0 {
            return Err(RecallError::Config(
                "embedding.dimensions must be greater than 0".to_string(),
            ));
        }
        if self.embedding.batch_size == 0 {
            return Err(RecallError::Config(
                "embedding.batch_size must be greater than 0".to_string(),
            ));
        }
        if self.chunking.target_size == 0 {
            return Err(RecallError::Config(
                "chunking.target_size must be greater than 0".to_string(),
            ));
        }
        if self.chunking.overlap >= self.chunking.target_size {
            return Err(RecallError::Config(format!(
                "chunking.overlap ({}) must be smaller than chunking.target_size ({})",
                self.chunking.overlap, self.chunking.target_size
            )));
        }
        if self.storage.pool_max == 0 {
            return Err(RecallError::Config(
                "storage.pool_max must be at least 1".to_string(),
            ));
        }
        if self.storage.pool_min > self.storage.pool_max {
            return Err(RecallError::Config(format!(
                "storage.pool_min ({}) exceeds storage.pool_max ({})",
                self.storage.pool_min, self.storage.pool_max
            )));
        }
        if let (Some(partitions), Some(probes)) = (self.index.partitions, self.index.probes) {
            if partitions == 0 || probes == 0 || probes > partitions {
                return Err(RecallError::Config(format!(
                    "index.probes ({}) must be in 1..=index.partitions ({})",
                    probes, partitions
                )));
            }
        }
        if self.search.default_k == 0 {
            return Err(RecallError::Config(
                "search.default_k must be greater than 0".to_string(),
            ));
        }
        if let Some(min) = self.search.default_min_similarity {
            if !(-1.0..=1.0).contains(&min) {
                return Err(RecallError::Config(format!(
                    "search.default_min_similarity ({}) must be within [-1, 1]",
                    min
                )));
            }
        }
        Ok(())
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path.starts_with('~') {
        let home = std::env::var("USERPROFILE")
            .or_else(|_| std::env::var("HOME"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(path.replacen('~', &home, 1))
    } else {
        PathBuf::from(path)
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error. `RUST_LOG` overrides it.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Which embedding backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackendKind {
    /// Sentence-transformer ONNX model.
    #[default]
    Onnx,
    /// Deterministic lexical feature hashing (no model files).
    Hashing,
    /// No backend; every embedding call fails with `EmbeddingUnavailable`.
    Disabled,
}

/// What to do when every inference worker is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaturationPolicy {
    /// Wait (FIFO) for a free worker.
    #[default]
    Queue,
    /// Fail immediately with `Saturated`.
    Reject,
}

/// Embedding generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackendKind,
    /// Model name reported in health checks.
    pub model_name: String,
    /// Directory holding `model.onnx` and `tokenizer.json`.
    pub model_dir: String,
    /// Embedding dimension D. Fixed for the life of a store.
    pub dimensions: usize,
    /// Text prepended to every input before inference.
    pub instruction_prefix: Option<String>,
    /// Maximum texts per inference call.
    pub batch_size: usize,
    /// Inference worker count. 0 means the number of available CPU cores.
    pub workers: usize,
    pub saturation: SaturationPolicy,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackendKind::Onnx,
            model_name: "all-MiniLM-L6-v2".to_string(),
            model_dir: "~/.recall/models/all-MiniLM-L6-v2".to_string(),
            dimensions: 384,
            instruction_prefix: None,
            batch_size: 32,
            workers: 0,
            saturation: SaturationPolicy::Queue,
            intra_threads: 1,
        }
    }
}

impl EmbeddingConfig {
    /// Worker count with `0` resolved to the available parallelism.
    pub fn resolved_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Document chunking settings. Sizes are in characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub target_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_size: 1000,
            overlap: 0,
        }
    }
}

/// Vector store persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file path, or `:memory:`.
    pub database_path: String,
    /// Connections opened eagerly.
    pub pool_min: usize,
    /// Upper bound on concurrent connections.
    pub pool_max: usize,
    /// How long a caller may wait for a connection. `None` waits indefinitely.
    pub acquire_timeout_ms: Option<u64>,
    /// SQLite busy timeout for lock contention between connections.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "~/.recall/data/recall.db".to_string(),
            pool_min: 2,
            pool_max: 10,
            acquire_timeout_ms: None,
            busy_timeout_ms: 5_000,
        }
    }
}

impl StorageConfig {
    pub fn is_in_memory(&self) -> bool {
        self.database_path == IN_MEMORY_DATABASE
    }
}

/// Approximate nearest-neighbor index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Up to this many rows, search is an exact linear scan.
    pub exact_scan_max_rows: usize,
    /// IVF partition count. `None` sizes it from the row count.
    pub partitions: Option<usize>,
    /// Partitions scanned per query. `None` uses sqrt(partitions).
    pub probes: Option<usize>,
    /// k-means iteration cap when training partitions.
    pub kmeans_iterations: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            exact_scan_max_rows: 10_000,
            partitions: None,
            probes: None,
            kmeans_iterations: 20,
        }
    }
}

/// Retrieval defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_k: usize,
    /// No floor unless set.
    pub default_min_similarity: Option<f64>,
    pub default_timeout_ms: Option<u64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_k: 5,
            default_min_similarity: None,
            default_timeout_ms: None,
        }
    }
}
