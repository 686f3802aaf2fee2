//! Download orchestration
//!
//! The [`DownloadManager`] resolves a selection through the catalog, applies the
//! safety limit and then downloads each dataset independently. Its methods are split
//! by concern:
//! - this module: construction, events, the multi-dataset entry points and removal
//! - [`job`] - one dataset, and one URI of it (credentials, slot, retries, rename)
//! - [`paths`] - destination layout

mod job;
mod paths;


use crate::auth::AuthRegistry;
use crate::catalog::{Catalog, Selection};
use crate::config::{DownloadOptions, ManagerConfig, ProviderSettings};
use crate::error::{Error, Result};
use crate::limiter::ConcurrencyLimiter;
use crate::provider::ProviderMatcher;
use crate::transport::{Transport, TransportRegistry};
use crate::types::{DatasetId, Event, Outcome};
use futures::{FutureExt, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Downloads catalog datasets from their providers (cloneable - all fields are Arc-wrapped)
///
/// The manager never downloads the same dataset twice concurrently on its own, but it
/// does not guard against callers doing so: callers that schedule downloads from
/// several tasks or processes must serialize them by dataset id.
#[derive(Clone)]
pub struct DownloadManager {
    /// Dataset lookup
    pub(crate) catalog: Arc<dyn Catalog>,
    /// Provider settings, read-only for the lifetime of the manager
    pub(crate) settings: Arc<ProviderSettings>,
    /// Longest-prefix provider lookup built from `settings`
    pub(crate) matcher: Arc<ProviderMatcher>,
    /// One authenticator per provider, shared by all jobs
    pub(crate) auth: Arc<AuthRegistry>,
    /// Cross-process per-provider slots
    pub(crate) limiter: ConcurrencyLimiter,
    /// Transfer backends by scheme
    pub(crate) transports: Arc<TransportRegistry>,
    /// Construction-time settings
    pub(crate) config: Arc<ManagerConfig>,
    /// Shared HTTP client (transfers and token exchange)
    pub(crate) client: reqwest::Client,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
}

impl DownloadManager {
    /// Create a manager
    ///
    /// `limiter` is usually built once per process with
    /// [`ConcurrencyLimiter::connect`]; pass [`ConcurrencyLimiter::disabled`] to run
    /// without cross-process throttling.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        settings: ProviderSettings,
        limiter: ConcurrencyLimiter,
        config: ManagerConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(concat!("dataset-fetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        // Create broadcast channel with buffer size of 1000 events
        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);

        let transports = TransportRegistry::new(client.clone());
        let mut manager = Self {
            catalog,
            settings: Arc::new(ProviderSettings::empty()),
            matcher: Arc::new(ProviderMatcher::new(&ProviderSettings::empty())),
            auth: Arc::new(AuthRegistry::new(
                client.clone(),
                config.expiry_margin,
                config.retry.clone(),
            )),
            limiter,
            transports: Arc::new(transports),
            config: Arc::new(config),
            client,
            event_tx,
        };
        manager.install_settings(settings);
        Ok(manager)
    }

    /// A manager sharing everything with this one except the provider settings
    ///
    /// Cached credentials are dropped with the old settings.
    #[must_use]
    pub fn with_provider_settings(&self, settings: ProviderSettings) -> Self {
        let mut manager = self.clone();
        manager.install_settings(settings);
        manager
    }

    fn install_settings(&mut self, settings: ProviderSettings) {
        tracing::debug!(providers = settings.len(), "installing provider settings");
        self.matcher = Arc::new(ProviderMatcher::new(&settings));
        self.settings = Arc::new(settings);
        self.auth = Arc::new(AuthRegistry::new(
            self.client.clone(),
            self.config.expiry_margin,
            self.config.retry.clone(),
        ));
    }

    /// Replace all transfer backends
    #[must_use]
    pub fn with_transports(mut self, transports: TransportRegistry) -> Self {
        self.transports = Arc::new(transports);
        self
    }

    /// Handle `scheme` with `transport`, replacing the built-in one if any
    pub fn register_transport(&mut self, scheme: &str, transport: Arc<dyn Transport>) {
        Arc::make_mut(&mut self.transports).register(scheme, transport);
    }

    /// Current provider settings
    pub fn provider_settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// The concurrency limiter in use
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Construction-time settings
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Subscribe to download events
    ///
    /// Every subscriber receives all events published after it subscribed. Slow
    /// subscribers that fall more than 1000 events behind see `RecvError::Lagged`.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    pub(crate) fn emit_event(&self, event: Event) {
        // send() returns Err if there are no receivers, which is fine - we just drop the event
        self.event_tx.send(event).ok();
    }

    /// Download every dataset matched by `selection`
    ///
    /// Fails as a whole only when the catalog cannot resolve the selection or when it
    /// resolves to more than `options.max_downloads` datasets; in the latter case no
    /// provider is contacted and nothing is written. Otherwise every dataset gets an
    /// [`Outcome`], returned in catalog order regardless of completion order.
    ///
    /// Dropping the returned future cancels in-flight transfers: their slots are
    /// released and their temporary files removed.
    pub async fn download(
        &self,
        selection: &Selection,
        options: &DownloadOptions,
    ) -> Result<Vec<(DatasetId, Outcome)>> {
        let records = self.catalog.find_datasets(selection).await?;
        if records.len() > options.max_downloads {
            tracing::error!(
                found = records.len(),
                limit = options.max_downloads,
                "selection exceeds the download safety limit, nothing downloaded"
            );
            return Err(Error::SelectionTooLarge {
                found: records.len(),
                limit: options.max_downloads,
            });
        }
        if records.is_empty() {
            tracing::warn!("selection matched no dataset");
            return Ok(Vec::new());
        }

        tracing::info!(
            datasets = records.len(),
            parallelism = self.config.parallelism,
            directory = %options.download_directory,
            "starting downloads"
        );

        let transfers: Vec<futures::future::BoxFuture<'_, (DatasetId, Outcome)>> = records
            .iter()
            .map(|record| {
                async move { (record.id, self.download_record(record, options).await) }.boxed()
            })
            .collect();
        let outcomes: Vec<(DatasetId, Outcome)> = futures::stream::iter(transfers)
            .buffered(self.config.parallelism.max(1))
            .collect()
            .await;

        let failed = outcomes.iter().filter(|(_, o)| !o.is_success()).count();
        tracing::info!(
            succeeded = outcomes.len() - failed,
            failed,
            "downloads finished"
        );
        Ok(outcomes)
    }

    /// Download a single dataset by id
    ///
    /// Entry point for task-queue workers, which schedule one dataset per task.
    pub async fn download_dataset_by_id(
        &self,
        dataset_id: DatasetId,
        options: &DownloadOptions,
    ) -> Result<Outcome> {
        let records = self
            .catalog
            .find_datasets(&Selection::ids([dataset_id]))
            .await?;
        let record = records
            .into_iter()
            .next()
            .ok_or_else(|| Error::Catalog(format!("dataset {dataset_id} not found")))?;
        Ok(self.download_record(&record, options).await)
    }

    /// Delete the local directories of the datasets matched by `selection`
    ///
    /// Returns the removed directories relative to the (expanded) download directory.
    /// The safety limit applies as for [`download`](Self::download).
    pub async fn remove(
        &self,
        selection: &Selection,
        options: &DownloadOptions,
    ) -> Result<Vec<PathBuf>> {
        let records = self.catalog.find_datasets(selection).await?;
        if records.len() > options.max_downloads {
            return Err(Error::SelectionTooLarge {
                found: records.len(),
                limit: options.max_downloads,
            });
        }

        let mut removed = Vec::new();
        for record in &records {
            let base = paths::expand_directory(
                &options.download_directory,
                record.time_coverage_start,
            )?;
            let relative = paths::dataset_directory(&record.entry_id)?;
            let directory = base.join(&relative);

            match tokio::fs::remove_dir_all(&directory).await {
                Ok(()) => {
                    tracing::info!(dataset_id = %record.id, path = %directory.display(), "removed dataset files");
                    if let Some(parent) = directory.parent() {
                        paths::remove_empty_dirs(parent, &base).await;
                    }
                    removed.push(relative);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(dataset_id = %record.id, "nothing to remove");
                }
                Err(e) => {
                    return Err(Error::DestinationUnwritable {
                        path: directory,
                        source: e,
                    });
                }
            }
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("providers", &self.settings.len())
            .field("limiter", &self.limiter)
            .field("transports", &self.transports)
            .field("config", &self.config)
            .finish()
    }
}
