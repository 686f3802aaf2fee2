//! FTP transfers
//!
//! The FTP client is synchronous, so each transfer runs on the blocking pool with
//! its own control connection, writing through a duplicate of the destination handle.
//! Dropping the `fetch` future stops the blocking transfer at its next read and
//! closes both connections.

use super::{FetchedFile, TransferRequest, Transport, unwritable};
use crate::auth::Credential;
use crate::error::{Error, Result};
use crate::utils::filename_from_url;
use async_trait::async_trait;
use std::io::{ErrorKind, Read, Write};
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use suppaftp::FtpStream;
use suppaftp::types::FileType;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest a blocked data read goes without checking for cancellation
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Downloads over FTP, anonymously unless a basic credential is supplied
#[derive(Debug, Clone)]
pub struct FtpTransport {
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl Default for FtpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FtpTransport {
    /// Create an FTP transport
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Change the control connection timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Give up on a server that sends nothing for this long
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

struct FtpJob {
    uri: String,
    host: String,
    port: u16,
    path: String,
    login: (String, String),
    connect_timeout: Duration,
    idle_timeout: Duration,
    destination: PathBuf,
    cancel: CancellationToken,
}

#[async_trait]
impl Transport for FtpTransport {
    async fn fetch(&self, request: &TransferRequest<'_>, file: &mut tokio::fs::File) -> Result<FetchedFile> {
        let uri = request.uri;
        let invalid = |reason: &str| Error::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };
        let url = url::Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?.to_string();
        let path = urlencoding::decode(url.path())
            .map_err(|e| invalid(&e.to_string()))?
            .into_owned();
        let file_name = filename_from_url(uri).ok_or_else(|| Error::FileNameUnknown(uri.to_string()))?;

        let login = match request.credential {
            None => ("anonymous".to_string(), "anonymous@".to_string()),
            Some(Credential::Basic { username, password }) => (username.clone(), password.clone()),
            Some(Credential::Bearer { .. }) => {
                return Err(Error::AuthenticationFailed {
                    provider: request
                        .provider
                        .map(|p| p.url_prefix.clone())
                        .unwrap_or_default(),
                    reason: "bearer tokens cannot be used for FTP".into(),
                });
            }
        };

        let cancel = CancellationToken::new();
        let _stop_on_drop = cancel.clone().drop_guard();
        let job = FtpJob {
            uri: uri.to_string(),
            host,
            port: url.port_or_known_default().unwrap_or(21),
            path,
            login,
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
            destination: request.destination.to_path_buf(),
            cancel,
        };
        let output = file
            .try_clone()
            .await
            .map_err(|e| unwritable(request.destination, e))?
            .into_std()
            .await;

        let bytes = tokio::task::spawn_blocking(move || job.run(output))
            .await
            .map_err(|e| Error::Other(format!("FTP transfer task failed: {e}")))??;

        if bytes == 0 {
            return Err(Error::EmptyTransfer(uri.to_string()));
        }
        tracing::debug!(url = %uri, file_name = %file_name, bytes, "FTP transfer complete");
        Ok(FetchedFile { file_name, bytes })
    }
}

impl FtpJob {
    fn run(self, mut output: std::fs::File) -> Result<u64> {
        let address = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| Error::Ftp(format!("cannot resolve {}: {e} (connection failed)", self.host)))?
            .next()
            .ok_or_else(|| Error::Ftp(format!("no address for {} (connection failed)", self.host)))?;

        let mut ftp = FtpStream::connect_timeout(address, self.connect_timeout)?;
        ftp.get_ref()
            .set_read_timeout(Some(self.idle_timeout))
            .map_err(|e| Error::Ftp(format!("cannot configure connection to {}: {e}", self.host)))?;
        self.check_cancelled()?;
        ftp.login(self.login.0.as_str(), self.login.1.as_str())
            .map_err(|e| self.classify(e))?;
        ftp.transfer_type(FileType::Binary)?;

        let expected = ftp.size(&self.path).ok();
        self.check_cancelled()?;
        let mut stream = ftp.retr_as_stream(&self.path).map_err(|e| self.classify(e))?;
        stream
            .get_ref()
            .set_read_timeout(Some(CANCEL_CHECK_INTERVAL.min(self.idle_timeout)))
            .map_err(|e| self.unreadable(e))?;
        let copied = self.copy_to_destination(&mut stream, &mut output);
        if self.cancel.is_cancelled() {
            // dropping the streams closes both connections without waiting on the server
            tracing::debug!(url = %self.uri, "FTP transfer cancelled");
            return copied;
        }
        let finalized = ftp.finalize_retr_stream(stream);
        let _ = ftp.quit();

        let bytes = copied?;
        finalized?;
        if let Some(expected) = expected
            && bytes < expected as u64
        {
            return Err(Error::Truncated {
                url: self.uri,
                received: bytes,
                expected: expected as u64,
            });
        }
        Ok(bytes)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Other(format!("transfer of {} cancelled", self.uri)));
        }
        Ok(())
    }

    /// Login and file replies that mean something beyond a generic FTP failure
    fn classify(&self, error: impl Into<Error>) -> Error {
        match error.into() {
            Error::FtpReply { code: 530, message } => Error::Unauthorized {
                url: self.uri.clone(),
                status: format!("530 {message}"),
            },
            Error::FtpReply { code: 550, message } => Error::ObsoleteUrl {
                url: self.uri.clone(),
                reason: format!("{} does not exist ({message})", self.path),
            },
            other => other,
        }
    }

    fn unreadable(&self, source: std::io::Error) -> Error {
        Error::SourceRead {
            url: self.uri.clone(),
            source,
        }
    }

    fn copy_to_destination(&self, source: &mut impl Read, output: &mut std::fs::File) -> Result<u64> {
        let mut buffer = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        let mut last_data = Instant::now();
        loop {
            self.check_cancelled()?;
            let read = match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // read timeout, the server may just be slow
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if last_data.elapsed() >= self.idle_timeout {
                        return Err(self.unreadable(std::io::Error::new(
                            ErrorKind::TimedOut,
                            format!("no data for {:?}", self.idle_timeout),
                        )));
                    }
                    continue;
                }
                Err(e) => return Err(self.unreadable(e)),
            };
            last_data = Instant::now();
            output
                .write_all(&buffer[..read])
                .map_err(|e| unwritable(&self.destination, e))?;
            total += read as u64;
        }
        output.flush().map_err(|e| unwritable(&self.destination, e))?;
        Ok(total)
    }
}
