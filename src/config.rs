use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub clustering: ClusteringConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub thumbnails: ThumbnailConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub providers: ProviderConfig,

    #[serde(default)]
    pub reaper: ReaperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Base idle sleep when the queue is empty; randomised to 0.5x..1.5x.
    #[serde(default = "default_idle_base_ms")]
    pub idle_base_ms: u64,

    #[serde(default = "default_idle_max_ms")]
    pub idle_max_ms: u64,
}

fn default_worker_count() -> usize {
    4
}

fn default_idle_base_ms() -> u64 {
    500
}

fn default_idle_max_ms() -> u64 {
    2000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            idle_base_ms: default_idle_base_ms(),
            idle_max_ms: default_idle_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fraction of the computed delay used as +/- jitter (0.0..=1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_task_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_jitter() -> f64 {
    0.25
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_task_retries: default_max_task_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Maximum cosine distance for a face to join an existing person.
    #[serde(default = "default_cluster_threshold")]
    pub threshold: f32,

    /// Unassigned embedded faces needed before an incremental pass is queued.
    #[serde(default = "default_min_unassigned_faces")]
    pub min_unassigned_faces: usize,

    /// A full recluster is queued each time the person count crosses a multiple of this.
    #[serde(default = "default_recluster_every_persons")]
    pub recluster_every_persons: usize,

    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
}

fn default_cluster_threshold() -> f32 {
    0.35
}

fn default_min_unassigned_faces() -> usize {
    5
}

fn default_recluster_every_persons() -> usize {
    25
}

fn default_batch_limit() -> usize {
    50_000
}

fn default_progress_every() -> usize {
    25
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            threshold: default_cluster_threshold(),
            min_unassigned_faces: default_min_unassigned_faces(),
            recluster_every_persons: default_recluster_every_persons(),
            batch_limit: default_batch_limit(),
            progress_every: default_progress_every(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    #[default]
    Brute,
    Flat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub backend: IndexBackend,

    /// Index blob location for the flat backend; the JSON sidecar sits next to it.
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
}

fn default_index_path() -> PathBuf {
    data_dir().join("vectors.idx")
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::default(),
            path: default_index_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default = "default_thumb_cache_path")]
    pub path: PathBuf,

    #[serde(default = "default_thumb_cache_size")]
    pub size: u32,
}

fn default_thumb_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("darkroom/thumbnails")
}

fn default_thumb_cache_size() -> u32 {
    256
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            path: default_thumb_cache_path(),
            size: default_thumb_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "webp", "bmp", "tiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_video_extensions() -> Vec<String> {
    ["mp4", "mov", "mkv", "webm", "avi"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
            video_extensions: default_video_extensions(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local deterministic providers; no model downloads, no network.
    #[default]
    Placeholder,
    /// OpenAI-compatible HTTP API (LM Studio, Ollama's /v1, OpenAI).
    OpenAI,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,

    #[serde(default = "default_provider_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_caption_model")]
    pub model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider_endpoint() -> String {
    "http://127.0.0.1:1234/v1".to_string()
}

fn default_caption_model() -> String {
    "gemma-3-4b".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-nomic-embed-text-v1.5".to_string()
}

fn default_provider_timeout_secs() -> u64 {
    60
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            endpoint: default_provider_endpoint(),
            model: default_caption_model(),
            embedding_model: default_embedding_model(),
            api_key: None,
            timeout_secs: default_provider_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReaperConfig {
    /// Running tasks whose start is older than this are returned to pending.
    /// Unset disables the sweep. Zero is rejected at load.
    #[serde(default)]
    pub stale_after_secs: Option<u64>,
}

impl ReaperConfig {
    /// `None` when the sweep is disabled. Zero counts as disabled, since it
    /// would return every running task to pending on each sweep.
    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("darkroom")
}

fn default_db_path() -> PathBuf {
    data_dir().join("darkroom.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            workers: WorkerConfig::default(),
            retry: RetryConfig::default(),
            clustering: ClusteringConfig::default(),
            index: IndexConfig::default(),
            thumbnails: ThumbnailConfig::default(),
            ingest: IngestConfig::default(),
            providers: ProviderConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

impl Config {
    /// Load from `DARKROOM_CONFIG` or the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = ?path, "Config file not found, using defaults");
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.reaper.stale_after_secs == Some(0) {
            bail!("reaper.stale_after_secs must be at least 1; leave it unset to disable the reaper");
        }
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("DARKROOM_CONFIG") {
            return PathBuf::from(path);
        }

        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("darkroom")
    }
}
