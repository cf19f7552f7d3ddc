//! Media phase: derive display and compact image variants for collected
//! items, resuming from the stored checkpoint.
//!
//! Items are processed one at a time in ascending id. Each recorded variant
//! advances the item's media status, so an interrupted run never re-derives
//! a variant that is already stored.

mod variants;

use std::path::{Path, PathBuf};

use dailybrief_shared::{DailyBriefError, MediaAsset, MediaConfig, MediaVariant, Result, WorkItem};
use dailybrief_storage::Storage;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

pub use variants::{CompactOutcome, Encoded, derive_compact, derive_display, encode_jpeg, fit_within};

/// Counters for one media run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaReport {
    /// Items taken from the queue.
    pub processed: usize,
    pub completed: usize,
    pub skipped: usize,
    /// Variant files written this run.
    pub variants_written: usize,
    /// Items whose compact variant stayed above the byte ceiling.
    pub over_ceiling: Vec<i64>,
}

/// Derives image variants for queued work items.
pub struct MediaProcessor {
    config: MediaConfig,
}

impl MediaProcessor {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }

    /// Process queued items after the checkpoint, at most `max_items` of them.
    #[instrument(skip_all, fields(max_items = ?max_items, dry_run = dry_run))]
    pub async fn process(
        &self,
        storage: &Storage,
        max_items: Option<usize>,
        dry_run: bool,
    ) -> Result<MediaReport> {
        let checkpoint = storage.media_checkpoint().await?;
        let queue = storage.media_queue(checkpoint, max_items).await?;
        info!(checkpoint, queued = queue.len(), "media queue loaded");

        let mut report = MediaReport::default();
        for item in &queue {
            report.processed += 1;

            let img = match load_source(item).await {
                Ok(img) => img,
                Err(reason) => {
                    warn!(id = item.id, %reason, "skipping media");
                    if !dry_run {
                        storage.skip_media(item.id, &reason).await?;
                    }
                    report.skipped += 1;
                    continue;
                }
            };

            if dry_run {
                let display_dims = fit_within(
                    img.width(),
                    img.height(),
                    self.config.display_max_width,
                    self.config.display_max_height,
                );
                let compact_dims = fit_within(
                    img.width(),
                    img.height(),
                    self.config.compact_max_width,
                    self.config.compact_max_height,
                );
                info!(id = item.id, ?display_dims, ?compact_dims, "would derive variants");
                continue;
            }

            self.derive_item(storage, item, &img, &mut report).await?;
            storage.complete_media(item.id).await?;
            report.completed += 1;
        }

        info!(
            processed = report.processed,
            completed = report.completed,
            skipped = report.skipped,
            over_ceiling = report.over_ceiling.len(),
            "media phase finished"
        );
        Ok(report)
    }

    /// Derive every variant not already recorded for the item.
    async fn derive_item(
        &self,
        storage: &Storage,
        item: &WorkItem,
        img: &DynamicImage,
        report: &mut MediaReport,
    ) -> Result<()> {
        let recorded: Vec<MediaVariant> = storage
            .media_assets(item.id)
            .await?
            .into_iter()
            .map(|a| a.variant)
            .collect();

        for variant in MediaVariant::ALL {
            if recorded.contains(&variant) && item.media_status.rank() >= variant.status().rank() {
                debug!(id = item.id, variant = variant.as_str(), "variant already recorded");
                continue;
            }

            let encoded = match variant {
                MediaVariant::Display => derive_display(img, &self.config)?,
                MediaVariant::Compact => {
                    let outcome = derive_compact(img, &self.config)?;
                    if !outcome.under_ceiling {
                        warn!(
                            id = item.id,
                            bytes = outcome.encoded.bytes.len(),
                            ceiling = self.config.compact_max_bytes,
                            "compact variant above byte ceiling"
                        );
                        report.over_ceiling.push(item.id);
                    }
                    outcome.encoded
                }
            };

            let path = self.variant_path(item.id, variant);
            write_variant(&path, &encoded.bytes).await?;
            storage
                .record_media_asset(&MediaAsset {
                    item_id: item.id,
                    variant,
                    path: path.to_string_lossy().into_owned(),
                    width: encoded.width,
                    height: encoded.height,
                    bytes: encoded.bytes.len() as u64,
                    quality: encoded.quality,
                })
                .await?;
            report.variants_written += 1;
            debug!(
                id = item.id,
                variant = variant.as_str(),
                width = encoded.width,
                height = encoded.height,
                bytes = encoded.bytes.len(),
                "variant written"
            );
        }
        Ok(())
    }

    fn variant_path(&self, item_id: i64, variant: MediaVariant) -> PathBuf {
        Path::new(&self.config.output_dir)
            .join(variant.as_str())
            .join(format!("{item_id}.jpg"))
    }
}

/// Read and decode the staged source image. Errors are skip reasons.
async fn load_source(item: &WorkItem) -> std::result::Result<DynamicImage, String> {
    let Some(source) = item.source_image.as_deref() else {
        return Err("no staged source image".into());
    };
    let bytes = tokio::fs::read(source)
        .await
        .map_err(|e| format!("staged image unreadable at {source}: {e}"))?;
    image::load_from_memory(&bytes).map_err(|e| format!("undecodable image: {e}"))
}

async fn write_variant(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DailyBriefError::io(parent, e))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| DailyBriefError::io(path, e))
}
