use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::core::provider::ModelCatalog;
use crate::core::readiness::DEFAULT_LOCATION_TERMS;

pub const CONFIG_FILE_NAME: &str = "mediaflow.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub models: ModelCatalog,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub defaults: GenerationDefaults,

    #[serde(default)]
    pub handoff: HandoffConfig,

    #[serde(default)]
    pub autosave: AutosaveConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_text_to_image_path")]
    pub text_to_image_path: String,
    #[serde(default = "default_image_edit_path")]
    pub image_edit_path: String,
    #[serde(default = "default_image_to_video_path")]
    pub image_to_video_path: String,
    /// Empty or absent disables the batch endpoint.
    #[serde(default = "default_video_batch_path")]
    pub video_batch_path: Option<String>,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:3000/api".to_string()
}
fn default_text_to_image_path() -> String {
    "generate/text-to-image".to_string()
}
fn default_image_edit_path() -> String {
    "generate/image-edit".to_string()
}
fn default_image_to_video_path() -> String {
    "generate/image-to-video".to_string()
}
fn default_video_batch_path() -> Option<String> {
    Some("generate/video-batch".to_string())
}
fn default_api_key_env() -> String {
    "MEDIAFLOW_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            text_to_image_path: default_text_to_image_path(),
            image_edit_path: default_image_edit_path(),
            image_to_video_path: default_image_to_video_path(),
            video_batch_path: default_video_batch_path(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// View types whose collection items start out disabled.
    #[serde(default)]
    pub disabled_view_types: Vec<String>,
    #[serde(default = "default_location_terms")]
    pub location_terms: Vec<String>,
}

fn default_poll_interval_ms() -> u64 {
    500
}
fn default_location_terms() -> Vec<String> {
    DEFAULT_LOCATION_TERMS.iter().map(|t| t.to_string()).collect()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            disabled_view_types: Vec::new(),
            location_terms: default_location_terms(),
        }
    }
}

impl ExecutorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_video_concurrency")]
    pub video_concurrency: usize,
}

fn default_video_concurrency() -> usize {
    4
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            video_concurrency: default_video_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationDefaults {
    #[serde(default = "default_aspect_ratio")]
    pub image_aspect_ratio: String,
    #[serde(default = "default_aspect_ratio")]
    pub video_aspect_ratio: String,
    #[serde(default = "default_video_duration")]
    pub video_duration: u32,
}

fn default_aspect_ratio() -> String {
    "16:9".to_string()
}
fn default_video_duration() -> u32 {
    10
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            image_aspect_ratio: default_aspect_ratio(),
            video_aspect_ratio: default_aspect_ratio(),
            video_duration: default_video_duration(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandoffConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub target_folder: Option<String>,
    /// Wall-clock limit for one bridge invocation.
    #[serde(default = "default_handoff_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_python() -> String {
    "python3".to_string()
}
fn default_handoff_timeout_secs() -> u64 {
    120
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            python: default_python(),
            script: None,
            target_folder: None,
            timeout_secs: default_handoff_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutosaveConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    1000
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl AutosaveConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("invalid mediaflow configuration")
    }

    /// Loads `explicit` when given, otherwise the first `mediaflow.toml`
    /// found in the working directory or the user config directory.
    /// Falls back to defaults when no file exists.
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_locations().into_iter().find(|p| p.exists()),
        };
        let Some(path) = path else {
            info!("No {} found, using default configuration.", CONFIG_FILE_NAME);
            return Ok(Self::default());
        };
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = Self::from_toml(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    fn default_locations() -> Vec<PathBuf> {
        let mut out = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            out.push(dir.join("mediaflow").join(CONFIG_FILE_NAME));
        }
        out
    }
}
