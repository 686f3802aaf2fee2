//! # dataset-fetch
//!
//! Download orchestration for dataset files referenced by a metadata catalog.
//!
//! Datasets are fetched from heterogeneous providers (HTTP(S) archives, FTP
//! servers, local mounts). Each provider is configured by URL prefix with its
//! own authentication scheme and its own tolerance for parallel downloads.
//!
//! ## Design Philosophy
//!
//! - **Providers are configured, not discovered** - a YAML settings document maps
//!   URL prefixes to credentials and limits; the longest matching prefix wins
//! - **Fleet-wide throttling** - the per-provider download limit is enforced through
//!   a shared store (Redis), so it holds across independent worker processes
//! - **No partial files** - transfers land in a temporary file that is renamed into
//!   place only once complete
//! - **Per-dataset outcomes** - one failing dataset never aborts its siblings; only the
//!   pre-flight safety limit fails a whole call
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use dataset_fetch::{
//!     ConcurrencyLimiter, DownloadManager, DownloadOptions, FileCatalog, ManagerConfig,
//!     ProviderSettings, Selection, StoreConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = Arc::new(FileCatalog::open("catalog.json").await?);
//!     let settings = ProviderSettings::from_path("provider_settings.yml")?;
//!     let config = ManagerConfig::default();
//!     let limiter = ConcurrencyLimiter::connect(StoreConfig::from_env(), config.limiter.clone()).await;
//!
//!     let manager = DownloadManager::new(catalog, settings, limiter, config)?;
//!     let selection = Selection::new().with("entry_id__contains", "S1A_");
//!     let options = DownloadOptions::new("/data/%Y/%m/%d");
//!
//!     for (dataset_id, outcome) in manager.download(&selection, &options).await? {
//!         println!("{dataset_id}: {outcome}");
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Authentication strategies (basic, OAuth2 with optional TOTP)
pub mod auth;
/// Dataset catalog interface and file-backed implementations
pub mod catalog;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Distributed per-provider download limiter
pub mod limiter;
/// Download orchestration
pub mod manager;
/// Provider lookup by URL prefix
pub mod provider;
/// Retry logic with exponential backoff
pub mod retry;
/// Transfer backends (HTTP, FTP, local files)
pub mod transport;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use auth::{AuthRegistry, Authenticator, BasicAuth, Credential, OAuth2Auth, TotpGenerator};
pub use catalog::{Catalog, DatasetRecord, FileCatalog, MemoryCatalog, Selection};
pub use config::{
    AuthenticationConfig, DownloadOptions, LimiterConfig, ManagerConfig, ProviderConfig,
    ProviderSettings, RetryConfig, Secret, StoreConfig, TokenPlacement, UriPolicy,
};
pub use error::{Error, FailureKind, Result};
pub use limiter::{ConcurrencyLimiter, MemorySlotStore, RedisSlotStore, SlotGuard, SlotStore};
pub use manager::DownloadManager;
pub use provider::ProviderMatcher;
pub use retry::{IsRetryable, RetryPolicy, with_retry};
pub use transport::{FetchedFile, Transport, TransportRegistry};
pub use types::{DatasetId, DownloadFailure, DownloadJob, Event, JobStatus, Outcome};
