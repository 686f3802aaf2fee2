//! Transfer backends
//!
//! A [`Transport`] moves the bytes of one URI into an already-open destination file.
//! It knows nothing about temporary names, slots or retries: the download manager
//! owns those and calls the transport once per attempt with a truncated file.

mod ftp;
mod http;
mod local;

pub use ftp::FtpTransport;
pub use http::HttpTransport;
pub use local::LocalTransport;

use crate::auth::Credential;
use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Everything a transport needs for one attempt
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest<'a> {
    /// Resource URI
    pub uri: &'a str,
    /// Matched provider, if any
    pub provider: Option<&'a ProviderConfig>,
    /// Credential to present, if the provider requires one
    pub credential: Option<&'a Credential>,
    /// Path of the file being written (for error messages)
    pub destination: &'a Path,
}

/// Result of a successful transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    /// Name the file should be stored under
    pub file_name: String,
    /// Bytes written
    pub bytes: u64,
}

/// Moves one resource into a local file
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transfer `request.uri` into `file`, which is empty and positioned at its start
    async fn fetch(&self, request: &TransferRequest<'_>, file: &mut tokio::fs::File) -> Result<FetchedFile>;
}

/// Transports by URI scheme
#[derive(Clone)]
pub struct TransportRegistry {
    transports: HashMap<String, Arc<dyn Transport>>,
}

impl TransportRegistry {
    /// Registry with the built-in `http`, `https`, `ftp` and `file` transports
    pub fn new(client: reqwest::Client) -> Self {
        let http: Arc<dyn Transport> = Arc::new(HttpTransport::new(client));
        let mut registry = Self::empty();
        registry.register("http", http.clone());
        registry.register("https", http);
        registry.register("ftp", Arc::new(FtpTransport::new()));
        registry.register("file", Arc::new(LocalTransport));
        registry
    }

    /// Registry without any transport
    pub fn empty() -> Self {
        Self {
            transports: HashMap::new(),
        }
    }

    /// Handle `scheme` with `transport`, replacing any previous one
    pub fn register(&mut self, scheme: &str, transport: Arc<dyn Transport>) {
        self.transports.insert(scheme.to_ascii_lowercase(), transport);
    }

    /// Transport for a URI; bare absolute paths use the `file` transport
    pub fn for_uri(&self, uri: &str) -> Result<Arc<dyn Transport>> {
        let scheme = uri_scheme(uri)?;
        self.transports
            .get(&scheme)
            .cloned()
            .ok_or(Error::UnsupportedScheme(scheme))
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<_> = self.transports.keys().collect();
        schemes.sort();
        f.debug_struct("TransportRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}

fn uri_scheme(uri: &str) -> Result<String> {
    if uri.starts_with('/') {
        return Ok("file".to_string());
    }
    url::Url::parse(uri)
        .map(|parsed| parsed.scheme().to_string())
        .map_err(|e| Error::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })
}

/// Map a local write failure to the destination error
pub(crate) fn unwritable(destination: &Path, source: std::io::Error) -> Error {
    Error::DestinationUnwritable {
        path: destination.to_path_buf(),
        source,
    }
}
