//! Application configuration for DailyBrief.
//!
//! User config lives at `~/.dailybrief/dailybrief.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DailyBriefError, Result};
use crate::types::{Language, Level};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "dailybrief.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".dailybrief";

// ---------------------------------------------------------------------------
// Config structs (matching dailybrief.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Database location.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Feed collection settings.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Configured feed sources.
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,

    /// Image variant settings.
    #[serde(default)]
    pub media: MediaConfig,

    /// Text-generation API settings.
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "var/dailybrief.db".into()
}

/// `[collector]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Maximum items taken from each feed per run.
    #[serde(default = "default_items_per_source")]
    pub items_per_source: usize,

    /// Per-request timeout for feeds, article pages and images.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,

    /// Directory where preview images are staged for the media phase.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,

    /// Largest preview image accepted, in bytes.
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            items_per_source: default_items_per_source(),
            timeout_secs: default_fetch_timeout(),
            staging_dir: default_staging_dir(),
            max_image_bytes: default_max_image_bytes(),
        }
    }
}

fn default_items_per_source() -> usize {
    5
}
fn default_fetch_timeout() -> u64 {
    20
}
fn default_staging_dir() -> String {
    "var/staging".into()
}
fn default_max_image_bytes() -> usize {
    10 * 1024 * 1024
}

/// `[[feeds]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Short feed name used in logs and reports.
    pub name: String,
    /// Feed document URL.
    pub url: String,
}

/// `[media]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Output directory for derived variants.
    #[serde(default = "default_media_dir")]
    pub output_dir: String,

    /// Display variant bounding box.
    #[serde(default = "default_display_width")]
    pub display_max_width: u32,
    #[serde(default = "default_display_height")]
    pub display_max_height: u32,
    /// JPEG quality for the display variant.
    #[serde(default = "default_display_quality")]
    pub display_quality: u8,

    /// Compact variant bounding box.
    #[serde(default = "default_compact_width")]
    pub compact_max_width: u32,
    #[serde(default = "default_compact_height")]
    pub compact_max_height: u32,
    /// Byte ceiling for the compact variant.
    #[serde(default = "default_compact_max_bytes")]
    pub compact_max_bytes: usize,
    /// First JPEG quality tried for the compact variant.
    #[serde(default = "default_compact_quality")]
    pub compact_start_quality: u8,
    /// Lowest JPEG quality the compact variant may be re-encoded at.
    #[serde(default = "default_compact_min_quality")]
    pub compact_min_quality: u8,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            output_dir: default_media_dir(),
            display_max_width: default_display_width(),
            display_max_height: default_display_height(),
            display_quality: default_display_quality(),
            compact_max_width: default_compact_width(),
            compact_max_height: default_compact_height(),
            compact_max_bytes: default_compact_max_bytes(),
            compact_start_quality: default_compact_quality(),
            compact_min_quality: default_compact_min_quality(),
        }
    }
}

fn default_media_dir() -> String {
    "var/media".into()
}
fn default_display_width() -> u32 {
    1200
}
fn default_display_height() -> u32 {
    800
}
fn default_display_quality() -> u8 {
    85
}
fn default_compact_width() -> u32 {
    480
}
fn default_compact_height() -> u32 {
    320
}
fn default_compact_max_bytes() -> usize {
    60 * 1024
}
fn default_compact_quality() -> u8 {
    80
}
fn default_compact_min_quality() -> u8 {
    40
}

/// `[enrichment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// OpenAI-compatible API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used for enrichment.
    #[serde(default = "default_model")]
    pub model: String,

    /// Items sent per request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Retry ceiling before an item is marked permanently failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-request timeout.
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,

    /// Pause before each retry pass over the queue, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Article bodies are truncated to this many characters in prompts.
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,

    /// Reading levels requested for every item.
    #[serde(default = "default_levels")]
    pub levels: Vec<Level>,

    /// Languages requested for every item.
    #[serde(default = "default_languages")]
    pub languages: Vec<Language>,

    /// Levels for which background and argument pairs are requested.
    #[serde(default = "default_context_levels")]
    pub context_levels: Vec<Level>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_api_timeout(),
            retry_delay_ms: default_retry_delay_ms(),
            max_body_chars: default_max_body_chars(),
            levels: default_levels(),
            languages: default_languages(),
            context_levels: default_context_levels(),
        }
    }
}

impl EnrichmentConfig {
    /// Every (level, language) group a complete result must contain.
    pub fn combinations(&self) -> Vec<(Level, Language)> {
        self.levels
            .iter()
            .flat_map(|level| self.languages.iter().map(move |lang| (*level, *lang)))
            .collect()
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_batch_size() -> usize {
    1
}
fn default_max_retries() -> u32 {
    3
}
fn default_api_timeout() -> u64 {
    120
}
fn default_retry_delay_ms() -> u64 {
    30_000
}
fn default_max_body_chars() -> usize {
    6_000
}
fn default_levels() -> Vec<Level> {
    Level::ALL.to_vec()
}
fn default_languages() -> Vec<Language> {
    Language::ALL.to_vec()
}
fn default_context_levels() -> Vec<Level> {
    vec![Level::Mid, Level::Hard]
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.dailybrief/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| DailyBriefError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.dailybrief/dailybrief.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DailyBriefError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        DailyBriefError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DailyBriefError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DailyBriefError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DailyBriefError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

impl AppConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.enrichment.batch_size == 0 {
            return Err(DailyBriefError::config("enrichment.batch_size must be at least 1"));
        }
        if self.enrichment.levels.is_empty() || self.enrichment.languages.is_empty() {
            return Err(DailyBriefError::config(
                "enrichment.levels and enrichment.languages must not be empty",
            ));
        }
        if has_duplicates(&self.enrichment.levels) || has_duplicates(&self.enrichment.languages) {
            return Err(DailyBriefError::config(
                "enrichment.levels and enrichment.languages must not repeat an entry",
            ));
        }
        if self.media.compact_min_quality == 0
            || self.media.compact_min_quality > self.media.compact_start_quality
            || self.media.compact_start_quality > 100
        {
            return Err(DailyBriefError::config(
                "media.compact_min_quality must be in 1..=compact_start_quality <= 100",
            ));
        }
        for feed in &self.feeds {
            url::Url::parse(&feed.url).map_err(|e| {
                DailyBriefError::config(format!("feed '{}' has invalid url: {e}", feed.name))
            })?;
        }
        Ok(())
    }
}

fn has_duplicates<T: PartialEq>(values: &[T]) -> bool {
    values
        .iter()
        .enumerate()
        .any(|(i, v)| values[..i].contains(v))
}

/// Read the enrichment API key from the env var named in config.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.enrichment.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(DailyBriefError::config(format!(
            "enrichment API key not found. Set the {var_name} environment variable."
        ))),
    }
}
