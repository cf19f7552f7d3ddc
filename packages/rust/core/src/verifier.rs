//! Read-only consistency check over the work item store.
//!
//! Compares each item's recorded statuses with the rows and files that
//! should exist for them.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use dailybrief_shared::{EnrichStatus, Language, Level, MediaStatus, MediaVariant, Result};
use dailybrief_storage::{GroupRowCount, Storage};

/// An item whose state disagrees with the stored data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inconsistency {
    pub item_id: i64,
    pub reason: String,
}

/// An item that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub item_id: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub total_items: u64,
    pub media_complete: u64,
    pub media_skipped: u64,
    pub enrich_pending: u64,
    pub enrich_in_progress: u64,
    pub enrich_done: u64,
    pub enrich_failed: u64,
    pub inconsistent: Vec<Inconsistency>,
    pub failed: Vec<FailedEntry>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.inconsistent.is_empty()
    }
}

/// Check the store against the requested enrichment groups.
#[instrument(skip_all, fields(groups = groups.len()))]
pub async fn verify(storage: &Storage, groups: &[(Level, Language)]) -> Result<VerifyReport> {
    let counts = storage.stage_counts().await?;
    let mut report = VerifyReport {
        total_items: counts.total_items,
        media_complete: counts.media_complete,
        media_skipped: counts.media_skipped,
        enrich_pending: counts.enrich_pending,
        enrich_in_progress: counts.enrich_in_progress,
        enrich_done: counts.enrich_done,
        enrich_failed: counts.enrich_failed,
        ..Default::default()
    };

    let mut rows_by_item: HashMap<i64, Vec<GroupRowCount>> = HashMap::new();
    for row in storage.group_row_counts().await? {
        rows_by_item.entry(row.item_id).or_default().push(row);
    }

    for item in storage.list_items().await? {
        let rows = rows_by_item.get(&item.id).map(Vec::as_slice).unwrap_or(&[]);
        let mut flag = |reason: String| {
            report.inconsistent.push(Inconsistency {
                item_id: item.id,
                reason,
            })
        };

        if item.enrich_status == EnrichStatus::Done {
            for (level, language) in groups {
                let group = rows
                    .iter()
                    .find(|r| r.level == *level && r.language == *language);
                if let Some(missing) = missing_part(group) {
                    flag(format!(
                        "enrichment done but {}/{} has no {missing}",
                        level.as_str(),
                        language.as_str()
                    ));
                }
            }
        } else if !rows.is_empty() {
            flag(format!(
                "enrichment rows present while status is {}",
                item.enrich_status.as_str()
            ));
        }

        // Each status implies the variants at or below its rank exist.
        let media_rank = item.media_status.rank();
        if item.media_status != MediaStatus::Skipped && media_rank > 0 {
            let assets = storage.media_assets(item.id).await?;
            let implied = MediaVariant::ALL
                .into_iter()
                .filter(|v| v.status().rank() <= media_rank);
            for variant in implied {
                match assets.iter().find(|a| a.variant == variant) {
                    None => flag(format!(
                        "media {} but {} asset is not recorded",
                        item.media_status.as_str(),
                        variant.as_str()
                    )),
                    Some(asset) if !Path::new(&asset.path).exists() => flag(format!(
                        "media {} but {} file is missing at {}",
                        item.media_status.as_str(),
                        variant.as_str(),
                        asset.path
                    )),
                    Some(_) => {}
                }
            }
        }
    }

    report.failed = storage
        .failed_items()
        .await?
        .into_iter()
        .map(|f| FailedEntry {
            item_id: f.id,
            last_error: f.last_error,
        })
        .collect();

    for issue in &report.inconsistent {
        warn!(item_id = issue.item_id, reason = %issue.reason, "inconsistent item");
    }
    info!(
        total = report.total_items,
        done = report.enrich_done,
        failed = report.enrich_failed,
        inconsistent = report.inconsistent.len(),
        "verification finished"
    );
    Ok(report)
}

fn missing_part(group: Option<&GroupRowCount>) -> Option<&'static str> {
    match group {
        None => Some("rows"),
        Some(g) if g.summaries == 0 => Some("summary"),
        Some(g) if g.keywords == 0 => Some("keywords"),
        Some(g) if g.questions == 0 => Some("questions"),
        Some(_) => None,
    }
}
