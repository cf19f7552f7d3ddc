//! CLI flag definitions, tracing setup, and run dispatch.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser, error::ErrorKind};
use color_eyre::eyre::{Result, WrapErr};
use dailybrief_core::pipeline::{
    Orchestrator, PhaseSet, ProgressReporter, RunOptions, RunOutcome, RunSummary,
};
use dailybrief_shared::{AppConfig, init_config, load_config, load_config_from};
use dailybrief_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// DailyBrief: turn news feeds into graded learning material.
#[derive(Parser)]
#[command(
    name = "dailybrief",
    version,
    about = "Collect news, derive image variants, and enrich articles for language learners.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Run every phase: collect, images, enrich, verify.
    #[arg(long)]
    pub full: bool,

    /// Collect new items from the configured feeds.
    #[arg(long)]
    pub mine: bool,

    /// Derive display and compact image variants.
    #[arg(long)]
    pub images: bool,

    /// Enrich pending items through the text-generation API.
    #[arg(long)]
    pub enrich: bool,

    /// Check the store for inconsistencies.
    #[arg(long)]
    pub verify: bool,

    /// Maximum items taken from each feed (overrides config).
    #[arg(long, value_name = "N")]
    pub items_per_source: Option<usize>,

    /// Maximum items taken from the image queue this run.
    #[arg(long, value_name = "N")]
    pub max_images: Option<usize>,

    /// Log what would happen without changing items, files, or calling the API.
    #[arg(long)]
    pub dry_run: bool,

    /// Config file (defaults to ~/.dailybrief/dailybrief.toml).
    #[arg(long, value_name = "PATH", env = "DAILYBRIEF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database file (overrides config).
    #[arg(long, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Return permanently failed items to the queue (before any selected phase).
    #[arg(long, value_name = "ID,...", value_delimiter = ',')]
    pub reset_failed: Option<Vec<i64>>,

    /// Write a default config file and exit.
    #[arg(long)]
    pub init_config: bool,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text")]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

impl Cli {
    fn phases(&self) -> PhaseSet {
        if self.full {
            return PhaseSet::full();
        }
        PhaseSet {
            collect: self.mine,
            media: self.images,
            enrich: self.enrich,
            verify: self.verify,
        }
    }
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "dailybrief=info",
        1 => "dailybrief=debug",
        _ => "dailybrief=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Run whatever the flags ask for.
pub(crate) async fn run(cli: Cli) -> Result<ExitCode> {
    if cli.init_config {
        let path = init_config()?;
        println!("Config initialized at: {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let phases = cli.phases();
    if phases.is_empty() && cli.reset_failed.is_none() {
        Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "select at least one phase: --full, --mine, --images, --enrich or --verify",
            )
            .exit();
    }

    let config = resolve_config(&cli)?;
    let db_path = PathBuf::from(&config.storage.db_path);
    let storage = Storage::open(&db_path)
        .await
        .wrap_err_with(|| format!("cannot open database at {}", db_path.display()))?;

    if let Some(ids) = &cli.reset_failed {
        match apply_reset(&storage, ids, cli.dry_run).await? {
            Some(reset) => println!("Reset {reset} of {} item(s) to pending.", ids.len()),
            None => println!("Would reset {} item(s) to pending (dry run).", ids.len()),
        }
        if phases.is_empty() {
            return Ok(ExitCode::SUCCESS);
        }
    }

    let options = RunOptions {
        phases,
        dry_run: cli.dry_run,
        media_max_items: cli.max_images,
    };
    info!(
        phases = ?phases.names(),
        dry_run = cli.dry_run,
        db = %db_path.display(),
        "starting dailybrief"
    );

    let reporter = CliProgress::new(matches!(cli.log_format, LogFormat::Json));
    let outcome = Orchestrator::new(config)
        .run(&storage, &options, &reporter)
        .await;
    print_outcome(&outcome);

    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Reset failed items unless this is a dry run. Returns the number reset,
/// or `None` when nothing was written.
async fn apply_reset(storage: &Storage, ids: &[i64], dry_run: bool) -> Result<Option<u64>> {
    if dry_run {
        info!(?ids, "would reset failed items");
        return Ok(None);
    }
    Ok(Some(storage.reset_failed(ids).await?))
}

/// Load the config file and apply flag overrides.
fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(n) = cli.items_per_source {
        config.collector.items_per_source = n;
    }
    if let Some(db) = &cli.db {
        config.storage.db_path = db.to_string_lossy().into_owned();
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_outcome(outcome: &RunOutcome) {
    let summary = &outcome.summary;
    let elapsed = (summary.finished_at - summary.started_at).num_milliseconds() as f64 / 1000.0;

    println!();
    println!(
        "  Run {}{}",
        summary.run_id,
        if summary.dry_run { " (dry run)" } else { "" }
    );
    for feed in &summary.collect {
        match &feed.error {
            Some(error) => println!("  Feed {:<12} failed: {error}", feed.feed),
            None => println!(
                "  Feed {:<12} fetched {}, new {}, duplicate {}, rejected {}",
                feed.feed, feed.fetched, feed.inserted, feed.skipped_duplicate, feed.rejected
            ),
        }
    }
    if let Some(media) = &summary.media {
        println!(
            "  Images:  processed {}, complete {}, skipped {}, over ceiling {}",
            media.processed,
            media.completed,
            media.skipped,
            media.over_ceiling.len()
        );
    }
    if let Some(enrich) = &summary.enrich {
        println!(
            "  Enrich:  done {}, retried {}, failed {} ({} requests)",
            enrich.succeeded, enrich.retried, enrich.failed, enrich.requests
        );
    }
    if let Some(pending) = summary.enrich_previewed {
        println!("  Enrich:  {pending} item(s) would be enriched");
    }
    if let Some(verify) = &outcome.verify {
        println!(
            "  Verify:  {} items, {} done, {} failed, {} inconsistent",
            verify.total_items,
            verify.enrich_done,
            verify.enrich_failed,
            verify.inconsistent.len()
        );
        for issue in &verify.inconsistent {
            println!("    #{}: {}", issue.item_id, issue.reason);
        }
    }
    print_failed(summary);
    if let Some(error) = &summary.fatal_error {
        println!("  Aborted: {error}");
    }
    println!("  Time:    {elapsed:.1}s");
    println!();
}

fn print_failed(summary: &RunSummary) {
    if summary.failed_items.is_empty() {
        return;
    }
    println!("  Failed items ({}):", summary.failed_items.len());
    for item in &summary.failed_items {
        println!(
            "    #{}: {}",
            item.item_id,
            item.last_error.as_deref().unwrap_or("unknown error")
        );
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    /// A hidden spinner keeps JSON log output machine-readable.
    fn new(hidden: bool) -> Self {
        if hidden {
            return Self {
                spinner: ProgressBar::hidden(),
            };
        }
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn item_progress(&self, phase: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("{phase} [{current}/{total}]"));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use dailybrief_shared::{EnrichStatus, FeedEntry, NewWorkItem};

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("dailybrief").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn full_selects_every_phase() {
        assert_eq!(parse(&["--full"]).phases(), PhaseSet::full());
    }

    #[test]
    fn individual_phase_flags() {
        let cli = parse(&["--mine", "--verify", "--dry-run"]);
        let phases = cli.phases();
        assert!(phases.collect && phases.verify);
        assert!(!phases.media && !phases.enrich);
        assert!(cli.dry_run);
    }

    #[test]
    fn no_phase_flag_is_empty() {
        assert!(parse(&[]).phases().is_empty());
    }

    #[test]
    fn reset_failed_takes_a_comma_list() {
        let cli = parse(&["--reset-failed", "3,7,12"]);
        assert_eq!(cli.reset_failed, Some(vec![3, 7, 12]));
    }

    #[test]
    fn overrides_apply_to_config() {
        let config_path = std::env::temp_dir()
            .join(format!("dailybrief_cli_test_{}.toml", std::process::id()));
        std::fs::write(&config_path, "[collector]\nitems_per_source = 9\n").unwrap();
        let cli = parse(&[
            "--mine",
            "--items-per-source",
            "2",
            "--db",
            "/tmp/other.db",
            "--config",
            config_path.to_str().unwrap(),
        ]);
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.collector.items_per_source, 2);
        assert_eq!(Path::new(&config.storage.db_path), Path::new("/tmp/other.db"));
    }

    async fn store_with_failed_item() -> (Storage, i64) {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir()
            .join(format!("dailybrief_cli_reset_{}_{nanos}.db", std::process::id()));
        let storage = Storage::open(&path).await.unwrap();
        let entry = FeedEntry {
            title: "Story".into(),
            body: "Body".into(),
            url: "https://news.example.com/story".into(),
            published_at: None,
            image_url: None,
        };
        let item = NewWorkItem::from_entry("world", &entry).unwrap();
        let id = storage.insert_item(&item).await.unwrap().id();
        assert!(storage.claim_for_enrichment(id).await.unwrap());
        storage.record_enrichment_failure(id, "boom", 0).await.unwrap();
        (storage, id)
    }

    #[tokio::test]
    async fn dry_run_reset_leaves_failed_items_alone() {
        let (storage, id) = store_with_failed_item().await;

        assert_eq!(apply_reset(&storage, &[id], true).await.unwrap(), None);
        let item = storage.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.enrich_status, EnrichStatus::Failed);

        assert_eq!(apply_reset(&storage, &[id], false).await.unwrap(), Some(1));
        let item = storage.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.enrich_status, EnrichStatus::Pending);
    }

    #[test]
    fn verbose_is_repeatable() {
        assert_eq!(parse(&["--verify", "-vv"]).verbose, 2);
    }
}
