//! Retry logic with exponential backoff
//!
//! This module provides configurable retry logic for transient failures.
//! It implements exponential backoff with optional jitter to prevent thundering herd.
//!
//! - [`with_retry`] wraps any async operation (used for token exchanges)
//! - [`RetryPolicy`] hands out delays one attempt at a time, for callers that must act
//!   between attempts (the download job refreshes credentials there)
//!
//! # Example
//!
//! ```no_run
//! use dataset_fetch::retry::{IsRetryable, with_retry};
//! use dataset_fetch::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! with_retry(&config, || async { Ok::<_, MyError>(()) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, rate limiting, connection reset) return `true`.
/// Permanent failures (bad URI, unwritable destination, rejected credentials) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            // request timeout, rate limiting and server-side failures
            Error::HttpStatus { status, .. } => {
                matches!(status, 408 | 425 | 429) || (500..600).contains(status)
            }
            Error::Truncated { .. } => true,
            Error::Io(e) | Error::SourceRead { source: e, .. } => is_transient_io(e),
            // FTP 4xx replies are transient by definition (RFC 959)
            Error::FtpReply { code, .. } => (400..500).contains(code),
            Error::Ftp(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timed out") || msg.contains("connection")
            }
            Error::Store(msg) => msg.contains("timed out") || msg.contains("connection"),
            // Credentials get exactly one refresh from the download job, never a blind retry
            Error::Unauthorized { .. } | Error::AuthenticationFailed { .. } => false,
            Error::SlotUnavailable { .. } => false,
            Error::DestinationUnwritable { .. } => false,
            Error::ObsoleteUrl { .. } => false,
            Error::InvalidUri { .. } | Error::UnsupportedScheme(_) => false,
            Error::EmptyTransfer(_) | Error::FileNameUnknown(_) => false,
            Error::TransferFailed { .. } => false,
            Error::SelectionTooLarge { .. } => false,
            Error::Totp(_) => false,
            Error::Config { .. } | Error::Catalog(_) => false,
            Error::Serialization(_) | Error::Yaml(_) => false,
            Error::Other(_) => false,
        }
    }
}

fn is_transient_io(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::UnexpectedEof
    )
}

/// Execute an async operation with exponential backoff retry logic
///
/// Makes one attempt plus up to `config.max_attempts` retries. Returns the successful
/// result, the first non-retryable error, or the last error once retries run out.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut policy = RetryPolicy::new(config.clone());

    loop {
        match operation().await {
            Ok(result) => {
                if policy.retries() > 0 {
                    tracing::info!(
                        attempts = policy.retries() + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() => match policy.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        error = %e,
                        attempt = policy.retries(),
                        max_attempts = config.max_attempts,
                        delay_ms = delay.as_millis(),
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(
                        error = %e,
                        attempts = policy.retries() + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                    return Err(e);
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Operation failed with non-retryable error");
                return Err(e);
            }
        }
    }
}

/// Bounded retry schedule with exponential backoff
///
/// Each call to [`next_delay`](Self::next_delay) consumes one retry and returns how long
/// to wait before it, or `None` once `max_attempts` retries have been handed out.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    retries: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Start a fresh schedule
    pub fn new(config: RetryConfig) -> Self {
        let delay = config.initial_delay;
        Self {
            config,
            retries: 0,
            delay,
        }
    }

    /// Number of retries handed out so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Total attempts allowed (first try included)
    pub fn max_total_attempts(&self) -> u32 {
        self.config.max_attempts + 1
    }

    /// Consume one retry and return the delay to wait before it
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.config.max_attempts {
            return None;
        }
        self.retries += 1;

        let current = self.delay;
        let next = Duration::from_secs_f64(current.as_secs_f64() * self.config.backoff_multiplier);
        self.delay = next.min(self.config.max_delay);

        Some(if self.config.jitter {
            add_jitter(current)
        } else {
            current
        })
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
pub(crate) fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
