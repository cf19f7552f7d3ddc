//! News collection: fetch configured feeds, dedup by source key, insert
//! new work items and stage their preview images.
//!
//! A failing feed is reported and the remaining feeds are still attempted.
//! Only store-level errors abort collection.

mod feed;
mod preview;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dailybrief_shared::{CollectorConfig, DailyBriefError, FeedConfig, NewWorkItem, Result};
use dailybrief_storage::{InsertOutcome, Storage};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

pub use feed::{FeedSource, HttpFeedSource, parse_json_feed};
pub use preview::{PreviewStager, find_og_image};

/// User-Agent string for collector requests.
pub(crate) const USER_AGENT: &str = concat!("DailyBrief/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// FeedReport
// ---------------------------------------------------------------------------

/// Outcome of collecting one feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedReport {
    pub feed: String,
    /// Entries returned by the feed.
    pub fetched: usize,
    /// New items inserted (in dry-run: items that would be inserted).
    pub inserted: usize,
    /// Entries whose source key was already stored.
    pub skipped_duplicate: usize,
    /// Entries dropped because their URL could not be canonicalized.
    pub rejected: usize,
    /// Previews staged for inserted items.
    pub previews_staged: usize,
    /// Set when the feed itself could not be fetched or parsed.
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Collects feed entries into the work item store.
pub struct Collector {
    source: Arc<dyn FeedSource>,
    stager: PreviewStager,
    items_per_source: usize,
}

impl Collector {
    /// Build a collector that reads JSON feeds over HTTP.
    pub fn from_config(config: &CollectorConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let source = Arc::new(HttpFeedSource::new(timeout)?);
        Self::with_source(config, source)
    }

    /// Build a collector around an arbitrary feed source.
    pub fn with_source(config: &CollectorConfig, source: Arc<dyn FeedSource>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DailyBriefError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            source,
            stager: PreviewStager::new(client, &config.staging_dir, config.max_image_bytes),
            items_per_source: config.items_per_source,
        })
    }

    /// Collect every feed in order.
    ///
    /// Returns one report per feed. In dry-run mode nothing is written.
    #[instrument(skip_all, fields(feeds = feeds.len(), dry_run = dry_run))]
    pub async fn collect(
        &self,
        storage: &Storage,
        feeds: &[FeedConfig],
        dry_run: bool,
    ) -> Result<Vec<FeedReport>> {
        let mut reports = Vec::with_capacity(feeds.len());
        // Keys seen during a dry run, standing in for the inserts we skip.
        let mut planned = HashSet::new();

        for feed in feeds {
            let mut report = FeedReport {
                feed: feed.name.clone(),
                ..Default::default()
            };

            let entries = match self.source.fetch(feed, self.items_per_source).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(feed = %feed.name, url = %feed.url, error = %e, "feed failed");
                    report.error = Some(e.to_string());
                    reports.push(report);
                    continue;
                }
            };
            report.fetched = entries.len();

            for entry in &entries {
                let item = match NewWorkItem::from_entry(&feed.name, entry) {
                    Ok(item) => item,
                    Err(e) => {
                        warn!(feed = %feed.name, url = %entry.url, error = %e, "rejecting entry");
                        report.rejected += 1;
                        continue;
                    }
                };

                if dry_run {
                    let exists = storage.find_by_source_key(&item.source_key).await?.is_some();
                    if exists || !planned.insert(item.source_key.clone()) {
                        report.skipped_duplicate += 1;
                    } else {
                        info!(feed = %feed.name, title = %item.title, "would insert");
                        report.inserted += 1;
                    }
                    continue;
                }

                match storage.insert_item(&item).await? {
                    InsertOutcome::Inserted(id) => {
                        report.inserted += 1;
                        debug!(id, title = %item.title, "inserted work item");
                        if self.stage_preview(storage, id, &item).await? {
                            report.previews_staged += 1;
                        }
                    }
                    InsertOutcome::Duplicate(id) => {
                        debug!(id, source_key = %item.source_key, "duplicate, skipping");
                        report.skipped_duplicate += 1;
                    }
                }
            }

            info!(
                feed = %report.feed,
                fetched = report.fetched,
                inserted = report.inserted,
                skipped_duplicate = report.skipped_duplicate,
                "feed collected"
            );
            reports.push(report);
        }

        Ok(reports)
    }

    /// Stage the preview for a new item. Download failures are logged only.
    async fn stage_preview(&self, storage: &Storage, id: i64, item: &NewWorkItem) -> Result<bool> {
        match self
            .stager
            .stage(id, item.image_url.as_deref(), &item.url)
            .await
        {
            Ok(Some(path)) => {
                storage
                    .set_source_image(id, &path.to_string_lossy())
                    .await?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                warn!(id, url = %item.url, error = %e, "preview staging failed");
                Ok(false)
            }
        }
    }
}
