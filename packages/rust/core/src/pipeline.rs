//! Run orchestration: collect → media → enrich → verify.
//!
//! Phases run strictly in that order. Per-item failures are absorbed by the
//! phases themselves; anything that reaches this module as an error is
//! fatal and stops the remaining phases. A run summary is persisted for
//! every run, including failed and dry runs.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use dailybrief_collector::{Collector, FeedReport, FeedSource};
use dailybrief_media::{MediaProcessor, MediaReport};
use dailybrief_shared::{AppConfig, DailyBriefError, Result, RunId, validate_api_key};
use dailybrief_storage::{StoredRunSummary, Storage};

use crate::enrichment::{
    self, EnrichReport, EnrichmentApi, EnrichmentProcessor, OpenRouterClient,
};
use crate::verifier::{self, FailedEntry, VerifyReport};

// ---------------------------------------------------------------------------
// Phase selection
// ---------------------------------------------------------------------------

/// Which phases a run executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSet {
    pub collect: bool,
    pub media: bool,
    pub enrich: bool,
    pub verify: bool,
}

impl PhaseSet {
    /// Every phase.
    pub fn full() -> Self {
        Self {
            collect: true,
            media: true,
            enrich: true,
            verify: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.collect || self.media || self.enrich || self.verify)
    }

    /// Names of the selected phases in execution order.
    pub fn names(&self) -> Vec<&'static str> {
        [
            (self.collect, "collect"),
            (self.media, "media"),
            (self.enrich, "enrich"),
            (self.verify, "verify"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }
}

/// Options for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub phases: PhaseSet,
    /// Log what would happen without changing items, files or the API.
    pub dry_run: bool,
    /// Cap on items taken from the media queue.
    pub media_max_items: Option<usize>,
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called as items of a phase are worked through.
    fn item_progress(&self, phase: &str, current: usize, total: usize);
    /// Called once the run has finished, fatal or not.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn item_progress(&self, _phase: &str, _current: usize, _total: usize) {}
    fn done(&self, _summary: &RunSummary) {}
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// Everything a run did, persisted as JSON in `run_summaries`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub phases: Vec<String>,
    #[serde(default)]
    pub collect: Vec<FeedReport>,
    pub media: Option<MediaReport>,
    pub enrich: Option<EnrichReport>,
    /// Queue length logged instead of enriching, in dry-run mode.
    pub enrich_previewed: Option<usize>,
    pub verify: Option<VerifyReport>,
    /// Items that exhausted their retries, as of the end of the run.
    #[serde(default)]
    pub failed_items: Vec<FailedEntry>,
    pub fatal_error: Option<String>,
}

/// Result of [`Orchestrator::run`].
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub verify: Option<VerifyReport>,
    /// The error that aborted the run, if any.
    pub fatal: Option<DailyBriefError>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.fatal.is_none()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Sequences the pipeline phases over one store.
pub struct Orchestrator {
    config: AppConfig,
    feed_source: Option<Arc<dyn FeedSource>>,
    enrichment_api: Option<Arc<dyn EnrichmentApi>>,
}

impl Orchestrator {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            feed_source: None,
            enrichment_api: None,
        }
    }

    /// Use `source` instead of fetching JSON feeds over HTTP.
    pub fn with_feed_source(mut self, source: Arc<dyn FeedSource>) -> Self {
        self.feed_source = Some(source);
        self
    }

    /// Use `api` instead of the configured chat-completions endpoint.
    pub fn with_enrichment_api(mut self, api: Arc<dyn EnrichmentApi>) -> Self {
        self.enrichment_api = Some(api);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Run the selected phases and persist the run summary.
    ///
    /// Never returns an error: a fatal error is carried in the outcome
    /// after the summary has been written.
    #[instrument(skip_all, fields(phases = ?options.phases.names(), dry_run = options.dry_run))]
    pub async fn run(
        &self,
        storage: &Storage,
        options: &RunOptions,
        progress: &dyn ProgressReporter,
    ) -> RunOutcome {
        let start = Instant::now();
        let started_at = Utc::now();
        let mut summary = RunSummary {
            run_id: RunId::new(),
            started_at,
            finished_at: started_at,
            dry_run: options.dry_run,
            phases: options.phases.names().into_iter().map(String::from).collect(),
            collect: Vec::new(),
            media: None,
            enrich: None,
            enrich_previewed: None,
            verify: None,
            failed_items: Vec::new(),
            fatal_error: None,
        };
        info!(run_id = %summary.run_id, "starting run");

        let mut fatal = self
            .run_phases(storage, options, progress, &mut summary)
            .await
            .err();
        if let Some(e) = &fatal {
            error!(run_id = %summary.run_id, error = %e, "run aborted");
            summary.fatal_error = Some(e.to_string());
        }

        match storage.failed_items().await {
            Ok(failed) => {
                summary.failed_items = failed
                    .into_iter()
                    .map(|f| FailedEntry {
                        item_id: f.id,
                        last_error: f.last_error,
                    })
                    .collect();
            }
            Err(e) => warn!(error = %e, "could not list failed items"),
        }
        summary.finished_at = Utc::now();

        if let Err(e) = persist_summary(storage, &summary).await {
            error!(run_id = %summary.run_id, error = %e, "failed to persist run summary");
            fatal.get_or_insert(e);
        }

        progress.done(&summary);
        info!(
            run_id = %summary.run_id,
            elapsed_ms = start.elapsed().as_millis(),
            failed_items = summary.failed_items.len(),
            fatal = fatal.is_some(),
            "run finished"
        );

        RunOutcome {
            verify: summary.verify.clone(),
            summary,
            fatal,
        }
    }

    async fn run_phases(
        &self,
        storage: &Storage,
        options: &RunOptions,
        progress: &dyn ProgressReporter,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let phases = options.phases;
        let dry_run = options.dry_run;

        // Missing credentials abort before any phase writes.
        let api = if phases.enrich && !dry_run {
            Some(self.enrichment_api()?)
        } else {
            None
        };

        if phases.collect {
            progress.phase("Collecting feeds");
            let collector = match &self.feed_source {
                Some(source) => Collector::with_source(&self.config.collector, source.clone())?,
                None => Collector::from_config(&self.config.collector)?,
            };
            summary.collect = collector
                .collect(storage, &self.config.feeds, dry_run)
                .await?;
        }

        if phases.media {
            progress.phase("Deriving image variants");
            let processor = MediaProcessor::new(self.config.media.clone());
            summary.media = Some(
                processor
                    .process(storage, options.media_max_items, dry_run)
                    .await?,
            );
        }

        if phases.enrich {
            progress.phase("Enriching items");
            match api {
                Some(api) => {
                    let processor = EnrichmentProcessor::new(api, self.config.enrichment.clone());
                    summary.enrich = Some(processor.process(storage, progress).await?);
                }
                None => {
                    summary.enrich_previewed = Some(enrichment::preview_queue(storage).await?);
                }
            }
        }

        if phases.verify {
            progress.phase("Verifying store");
            let groups = self.config.enrichment.combinations();
            summary.verify = Some(verifier::verify(storage, &groups).await?);
        }

        Ok(())
    }

    fn enrichment_api(&self) -> Result<Arc<dyn EnrichmentApi>> {
        if let Some(api) = &self.enrichment_api {
            return Ok(api.clone());
        }
        let key = validate_api_key(&self.config)?;
        Ok(Arc::new(OpenRouterClient::new(&self.config.enrichment, key)?))
    }
}

async fn persist_summary(storage: &Storage, summary: &RunSummary) -> Result<()> {
    let summary_json = serde_json::to_string(summary)
        .map_err(|e| DailyBriefError::parse(format!("run summary: {e}")))?;
    storage
        .insert_run_summary(&StoredRunSummary {
            id: summary.run_id.to_string(),
            started_at: summary.started_at,
            finished_at: summary.finished_at,
            dry_run: summary.dry_run,
            fatal_error: summary.fatal_error.clone(),
            summary_json,
        })
        .await
}
