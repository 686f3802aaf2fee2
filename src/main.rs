//! Command-line entry point of dataset-fetch

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use clap::Parser;
use dataset_fetch::{
    ConcurrencyLimiter, DownloadManager, DownloadOptions, Error, FileCatalog, ManagerConfig,
    ProviderSettings, Selection, StoreConfig,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// How long an interrupted run waits for its download slots to be released
const RELEASE_GRACE: Duration = Duration::from_secs(10);

/// Download the dataset files selected from a catalog
#[derive(Debug, Parser)]
#[command(name = "dataset-fetch", version, about)]
struct Cli {
    /// JSON file holding the dataset records
    #[arg(long, env = "DATASET_FETCH_CATALOG")]
    catalog: PathBuf,

    /// Destination directory; strftime placeholders (%Y, %m, ...) are expanded with
    /// each dataset's time coverage start
    #[arg(short, long)]
    destination: String,

    /// Start date (YYYY-MM-DD), or hours before now with --relative
    #[arg(short, long)]
    begin: String,

    /// End date (YYYY-MM-DD); ignored with --relative
    #[arg(short, long)]
    end: Option<String>,

    /// Interpret --begin as a number of hours before now and end now
    #[arg(short, long)]
    relative: bool,

    /// Extra selection criteria: a JSON object, or a list of objects merged in order
    #[arg(short, long)]
    query: Option<String>,

    /// Safety limit on the number of selected datasets
    #[arg(short = 'n', long, default_value_t = 100)]
    max_downloads: usize,

    /// Provider settings file (YAML)
    #[arg(short = 'c', long, env = "DATASET_FETCH_PROVIDER_SETTINGS")]
    provider_settings: Option<PathBuf>,

    /// Datasets downloaded at the same time by this process
    #[arg(long, default_value_t = 4)]
    parallelism: usize,

    /// Seconds to wait for a provider download slot
    #[arg(long, default_value_t = 300)]
    slot_timeout: u64,

    /// Retries after the first attempt of a transfer
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    /// Record downloaded paths back into the catalog
    #[arg(long)]
    save_path: bool,
}

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dataset_fetch=info"));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn parse_date(value: &str, flag: &str) -> Result<DateTime<Utc>, Error> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|time| time.and_utc())
        .ok_or_else(|| Error::config(format!("'{value}' is not a YYYY-MM-DD date"), flag))
}

fn time_range(cli: &Cli) -> Result<(DateTime<Utc>, DateTime<Utc>), Error> {
    if cli.relative {
        let hours: i64 = cli
            .begin
            .parse()
            .map_err(|_| Error::config(format!("'{}' is not a number of hours", cli.begin), "begin"))?;
        let now = Utc::now();
        return Ok((now - ChronoDuration::hours(hours.abs()), now));
    }
    let end = cli
        .end
        .as_deref()
        .ok_or_else(|| Error::config("--end is required without --relative", "end"))?;
    Ok((parse_date(&cli.begin, "begin")?, parse_date(end, "end")?))
}

fn build_selection(cli: &Cli) -> Result<Selection, Error> {
    let mut selection = Selection::new();
    if let Some(query) = &cli.query {
        let parsed: serde_json::Value = serde_json::from_str(query)?;
        let parts = match parsed {
            serde_json::Value::Array(parts) => parts,
            object => vec![object],
        };
        for part in parts {
            let part: Selection = serde_json::from_value(part)
                .map_err(|e| Error::config(format!("invalid query: {e}"), "query"))?;
            selection = selection.merge(part);
        }
    }

    let (begin, end) = time_range(cli)?;
    Ok(selection
        .with("time_coverage_start__gte", begin.to_rfc3339())
        .with("time_coverage_end__lte", end.to_rfc3339()))
}

async fn run(cli: Cli) -> Result<bool, Error> {
    let selection = build_selection(&cli)?;
    let settings = match &cli.provider_settings {
        Some(path) => ProviderSettings::from_path(path)?,
        None => ProviderSettings::empty(),
    };

    let mut config = ManagerConfig {
        parallelism: cli.parallelism,
        ..ManagerConfig::default()
    };
    config.retry.max_attempts = cli.max_attempts;
    config.limiter.acquire_timeout = Duration::from_secs(cli.slot_timeout);

    let catalog = Arc::new(FileCatalog::open(&cli.catalog).await?);
    let limiter = ConcurrencyLimiter::connect(StoreConfig::from_env(), config.limiter.clone()).await;
    let manager = DownloadManager::new(catalog, settings, limiter, config)?;

    let options = DownloadOptions::new(cli.destination.clone())
        .with_max_downloads(cli.max_downloads)
        .with_save_path(cli.save_path);

    let finished = tokio::select! {
        result = manager.download(&selection, &options) => Some(result?),
        _ = tokio::signal::ctrl_c() => None,
    };
    // the download future is dropped here, its slots are released in the background
    let Some(outcomes) = finished else {
        tracing::warn!("interrupted, abandoning in-flight downloads");
        if tokio::time::timeout(RELEASE_GRACE, manager.limiter().shutdown())
            .await
            .is_err()
        {
            tracing::warn!("slot releases still pending, they will expire with their lease");
        }
        return Ok(false);
    };

    let mut all_succeeded = true;
    for (dataset_id, outcome) in &outcomes {
        all_succeeded &= outcome.is_success();
        println!("{dataset_id}\t{outcome}");
    }
    Ok(all_succeeded)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e @ Error::SelectionTooLarge { .. }) => {
            tracing::error!("{e}");
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!("Command failed: {}", e);
            ExitCode::from(1)
        }
    }
}
