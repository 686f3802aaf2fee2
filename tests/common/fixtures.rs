//! Catalog records, manager construction and a scripted transport

use async_trait::async_trait;
use dataset_fetch::transport::TransferRequest;
use dataset_fetch::{
    ConcurrencyLimiter, Credential, DatasetRecord, DownloadManager, Error, FetchedFile,
    LimiterConfig, ManagerConfig, MemoryCatalog, ProviderSettings, RetryConfig, Transport,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// One call seen by a [`ScriptedTransport`]
#[derive(Clone, Debug)]
pub struct Call {
    /// Zero-based call number across all URIs
    pub index: usize,
    /// Requested URI
    pub uri: String,
    /// Credential presented
    pub credential: Option<Credential>,
}

type Responder = dyn Fn(&Call) -> Result<Vec<u8>, Error> + Send + Sync;

/// Transport whose answers come from a closure, tracking how many calls overlap
pub struct ScriptedTransport {
    responder: Box<Responder>,
    delay: Duration,
    calls: Mutex<Vec<Call>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedTransport {
    /// Answer every call with the closure's result
    pub fn new(responder: impl Fn(&Call) -> Result<Vec<u8>, Error> + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Serve `body` for every URI
    pub fn serving(body: &'static [u8]) -> Self {
        Self::new(move |_| Ok(body.to_vec()))
    }

    /// Hold each transfer open for `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of transfers that were in progress at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(
        &self,
        request: &TransferRequest<'_>,
        file: &mut tokio::fs::File,
    ) -> dataset_fetch::Result<FetchedFile> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let call = Call {
                index: calls.len(),
                uri: request.uri.to_string(),
                credential: request.credential.cloned(),
            };
            calls.push(call.clone());
            call
        };

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        tokio::time::sleep(self.delay).await;
        let body = (self.responder)(&call)?;
        file.write_all(&body).await?;
        file.flush().await?;

        Ok(FetchedFile {
            file_name: request.uri.rsplit('/').next().unwrap_or("file").to_string(),
            bytes: body.len() as u64,
        })
    }
}

/// `count` datasets `ds1..` with one URI each under `prefix`
pub fn records(prefix: &str, count: i64) -> Vec<DatasetRecord> {
    (1..=count)
        .map(|id| DatasetRecord::new(id, format!("ds{id}"), format!("{prefix}/file{id}.nc")))
        .collect()
}

/// Manager settings with millisecond retry and polling delays
pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        parallelism: 8,
        retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter: false,
        },
        limiter: LimiterConfig {
            acquire_timeout: Duration::from_secs(10),
            lease: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
            max_poll_interval: Duration::from_millis(20),
        },
        ..ManagerConfig::default()
    }
}

/// Manager over an in-memory catalog
pub fn manager(
    records: Vec<DatasetRecord>,
    settings: ProviderSettings,
    limiter: ConcurrencyLimiter,
    config: ManagerConfig,
) -> (DownloadManager, Arc<MemoryCatalog>) {
    let catalog = Arc::new(MemoryCatalog::new(records));
    let manager = DownloadManager::new(catalog.clone(), settings, limiter, config).unwrap();
    (manager, catalog)
}

/// Every regular file below `dir` (empty if it does not exist)
pub fn files_below(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            found.extend(files_below(&path));
        } else {
            found.push(path);
        }
    }
    found
}
