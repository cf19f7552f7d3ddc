//! Shared types, error model, and configuration for DailyBrief.
//!
//! This crate is the foundation depended on by all other DailyBrief crates.
//! It provides:
//! - [`DailyBriefError`] — the unified error type
//! - Domain types ([`WorkItem`], [`MediaStatus`], [`EnrichStatus`], [`EnrichedVersion`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CollectorConfig, EnrichmentConfig, FeedConfig, MediaConfig, StorageConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{DailyBriefError, Result};
pub use types::{
    Argument, EnrichStatus, EnrichedVersion, FeedEntry, Keyword, Language, Level, MediaAsset,
    MediaStatus, MediaVariant, NewWorkItem, QuizQuestion, RunId, WorkItem, canonical_source_key,
};
