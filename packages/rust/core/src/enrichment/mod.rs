//! Enrichment phase: batch pending items through the external API,
//! validate the structured results and persist them atomically.
//!
//! Per item the state machine is `pending → in_progress → done`, with
//! recoverable failures returning the item to `pending` until its retry
//! ceiling is reached, after which it is `failed`.

pub mod client;
pub mod prompt;
pub mod schema;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use dailybrief_shared::{
    DailyBriefError, EnrichStatus, EnrichedVersion, EnrichmentConfig, Result, WorkItem,
};
use dailybrief_storage::Storage;

use crate::pipeline::ProgressReporter;

pub use client::{ApiError, ChatMessage, EnrichmentApi, OpenRouterClient};
pub use schema::{Rejection, parse_batch, strip_code_fences};

/// Counters for one enrichment run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichReport {
    /// Interrupted claims recovered at the start of the run.
    pub recovered: u64,
    /// Passes over the pending queue.
    pub passes: u32,
    /// API requests sent.
    pub requests: usize,
    /// Item attempts (one per claimed item per request).
    pub attempted: usize,
    pub succeeded: usize,
    /// Failures that returned the item to the queue.
    pub retried: usize,
    /// Failures that exhausted the retry ceiling.
    pub failed: usize,
    /// Hashes of rejected payloads stored this run.
    pub rejected_payloads: Vec<String>,
}

/// Drives enrichment of pending work items.
pub struct EnrichmentProcessor {
    api: Arc<dyn EnrichmentApi>,
    config: EnrichmentConfig,
}

impl EnrichmentProcessor {
    pub fn new(api: Arc<dyn EnrichmentApi>, config: EnrichmentConfig) -> Self {
        Self { api, config }
    }

    /// Passes over the queue per run: one first attempt plus every retry.
    pub fn max_passes(&self) -> u32 {
        self.config.max_retries + 1
    }

    /// Run the enrichment phase to completion.
    ///
    /// Only store errors and credential rejection are returned as errors;
    /// every other failure is recorded against the item.
    #[instrument(skip_all, fields(model = %self.config.model, batch_size = self.config.batch_size))]
    pub async fn process(
        &self,
        storage: &Storage,
        progress: &dyn ProgressReporter,
    ) -> Result<EnrichReport> {
        let mut report = EnrichReport {
            recovered: storage.recover_stuck(self.config.max_retries).await?,
            ..Default::default()
        };
        let batch_size = self.config.batch_size.max(1);

        for pass in 1..=self.max_passes() {
            let pending = storage.pending_items(None).await?;
            if pending.is_empty() {
                break;
            }
            if pass > 1 && self.config.retry_delay_ms > 0 {
                debug!(pass, delay_ms = self.config.retry_delay_ms, "waiting before retry pass");
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }
            report.passes = pass;
            info!(pass, pending = pending.len(), "enrichment pass");

            let total = pending.len();
            let mut done = 0;
            for chunk in pending.chunks(batch_size) {
                let mut claimed = Vec::with_capacity(chunk.len());
                for item in chunk {
                    if storage.claim_for_enrichment(item.id).await? {
                        claimed.push(item.clone());
                    } else {
                        debug!(id = item.id, "item no longer pending, dropped from batch");
                    }
                }
                done += chunk.len();
                progress.item_progress("enrich", done, total);
                if claimed.is_empty() {
                    continue;
                }
                self.run_batch(storage, &claimed, &mut report).await?;
            }
        }

        info!(
            succeeded = report.succeeded,
            retried = report.retried,
            failed = report.failed,
            requests = report.requests,
            "enrichment finished"
        );
        Ok(report)
    }

    /// Send one request for the claimed items and settle each of them.
    ///
    /// If a store error aborts the batch, claims not yet settled are
    /// handed back so no item is left `in_progress`.
    async fn run_batch(
        &self,
        storage: &Storage,
        claimed: &[WorkItem],
        report: &mut EnrichReport,
    ) -> Result<()> {
        let messages = prompt::build_messages(claimed, &self.config);
        report.requests += 1;
        report.attempted += claimed.len();

        let body = match self.api.complete(&messages).await {
            Ok(body) => body,
            Err(e) if e.is_fatal() => {
                release_claims(storage, claimed).await;
                return Err(DailyBriefError::config(e.to_string()));
            }
            Err(e) => {
                warn!(items = claimed.len(), error = %e, "enrichment request failed");
                return self
                    .fail_all(storage, claimed, &e.to_string(), report)
                    .await;
            }
        };

        let ids: Vec<i64> = claimed.iter().map(|i| i.id).collect();
        let groups = self.config.combinations();
        let results = match parse_batch(&body, &ids, &groups) {
            Ok(results) => results,
            Err(rejection) => {
                let error = match self.reject(storage, &ids, &rejection, report).await {
                    Ok(error) => error,
                    Err(e) => {
                        release_claims(storage, claimed).await;
                        return Err(e);
                    }
                };
                return self.fail_all(storage, claimed, &error, report).await;
            }
        };

        for (index, (item, (_, result))) in claimed.iter().zip(results).enumerate() {
            if let Err(e) = self.settle_item(storage, item, result, report).await {
                release_claims(storage, &claimed[index..]).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Persist one item's validated versions, or send it down the failure path.
    ///
    /// A failed write is charged to this item only; an error is returned
    /// when the store cannot record even that.
    async fn settle_item(
        &self,
        storage: &Storage,
        item: &WorkItem,
        result: std::result::Result<Vec<EnrichedVersion>, Rejection>,
        report: &mut EnrichReport,
    ) -> Result<()> {
        match result {
            Ok(versions) => match storage.persist_enrichment(item.id, &versions).await {
                Ok(()) => {
                    report.succeeded += 1;
                    debug!(id = item.id, groups = versions.len(), "enrichment persisted");
                }
                Err(e) => {
                    warn!(id = item.id, error = %e, "persisting enrichment failed");
                    let error = format!("persist failed: {e}");
                    self.record_failure(storage, item, &error, report).await?;
                }
            },
            Err(rejection) => {
                let error = self.reject(storage, &[item.id], &rejection, report).await?;
                self.record_failure(storage, item, &error, report).await?;
            }
        }
        Ok(())
    }

    /// Charge the same failure to every claimed item.
    async fn fail_all(
        &self,
        storage: &Storage,
        claimed: &[WorkItem],
        error: &str,
        report: &mut EnrichReport,
    ) -> Result<()> {
        for (index, item) in claimed.iter().enumerate() {
            if let Err(e) = self.record_failure(storage, item, error, report).await {
                release_claims(storage, &claimed[index..]).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Store a rejected payload and return the error text to record on items.
    async fn reject(
        &self,
        storage: &Storage,
        ids: &[i64],
        rejection: &Rejection,
        report: &mut EnrichReport,
    ) -> Result<String> {
        let hash = payload_hash(&rejection.payload);
        storage
            .record_rejected_payload(&hash, ids, &rejection.reason, &rejection.payload)
            .await?;
        warn!(?ids, payload_hash = %hash, reason = %rejection.reason, "rejected enrichment payload");
        report.rejected_payloads.push(hash.clone());
        Ok(format!("invalid response ({}): {}", &hash[..12], rejection.reason))
    }

    async fn record_failure(
        &self,
        storage: &Storage,
        item: &WorkItem,
        error: &str,
        report: &mut EnrichReport,
    ) -> Result<()> {
        match storage
            .record_enrichment_failure(item.id, error, self.config.max_retries)
            .await?
        {
            EnrichStatus::Failed => {
                warn!(id = item.id, %error, "item failed permanently");
                report.failed += 1;
            }
            _ => report.retried += 1,
        }
        Ok(())
    }
}

/// Hand claims back without charging an attempt. Items already settled
/// are left as they are.
async fn release_claims(storage: &Storage, items: &[WorkItem]) {
    for item in items {
        if let Err(e) = storage.release_claim(item.id).await {
            warn!(id = item.id, error = %e, "could not release enrichment claim");
        }
    }
}

/// Log the pending queue without calling the API.
pub async fn preview_queue(storage: &Storage) -> Result<usize> {
    let pending = storage.pending_items(None).await?;
    for item in &pending {
        info!(id = item.id, title = %item.title, retry_count = item.retry_count, "would enrich");
    }
    Ok(pending.len())
}

/// Hex SHA-256 of a payload.
fn payload_hash(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}
