//! Core types for dataset-fetch

use crate::error::FailureKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Unique identifier of a dataset in the catalog
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(pub i64);

impl DatasetId {
    /// Create a new DatasetId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for DatasetId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DatasetId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Status of a download job
///
/// Jobs move `Pending -> Authenticating -> Downloading -> {Succeeded, Failed}`.
/// `Authenticating` is only skipped for providers without credentials.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, nothing done yet
    Pending,
    /// Resolving credentials
    Authenticating,
    /// Holding a slot and transferring
    Downloading,
    /// File complete under its final name
    Succeeded,
    /// Terminal failure
    Failed,
}

impl JobStatus {
    /// Whether no further transition can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Authenticating | Downloading | Failed) => true,
            (Authenticating, Downloading | Failed) => true,
            (Downloading, Succeeded | Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Authenticating => "authenticating",
            JobStatus::Downloading => "downloading",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One dataset download attempt through one URI
///
/// Owned by the manager for the duration of a single download and then discarded.
#[derive(Clone, Debug)]
pub struct DownloadJob {
    /// Dataset being downloaded
    pub dataset_id: DatasetId,
    /// URI chosen for this job
    pub uri: String,
    /// Directory the file is written to
    pub destination: PathBuf,
    /// Current status
    pub status: JobStatus,
    /// Number of transfer attempts made so far
    pub attempt_count: u32,
}

impl DownloadJob {
    /// Create a pending job
    pub fn new(dataset_id: DatasetId, uri: impl Into<String>, destination: PathBuf) -> Self {
        Self {
            dataset_id,
            uri: uri.into(),
            destination,
            status: JobStatus::Pending,
            attempt_count: 0,
        }
    }

    /// Move to `next`, returning false (and leaving the status unchanged) for an
    /// illegal transition
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            tracing::error!(
                dataset_id = %self.dataset_id,
                from = %self.status,
                to = %next,
                "illegal job transition ignored"
            );
            false
        }
    }
}

/// Why a dataset could not be downloaded
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFailure {
    /// Terminal error classification (of the last URI tried)
    pub kind: FailureKind,
    /// Human-readable message
    pub message: String,
    /// One message per URI that was tried
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl std::fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        for error in &self.errors {
            write!(f, "\n  {error}")?;
        }
        Ok(())
    }
}

/// Outcome of one dataset in a download call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    /// The file is present at `path`
    Succeeded {
        /// Final path of the file
        path: PathBuf,
        /// True if it was already present and nothing was transferred
        reused: bool,
    },
    /// The dataset could not be downloaded
    Failed(DownloadFailure),
}

impl Outcome {
    /// Whether the dataset is available locally
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }

    /// The failure classification, if failed
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Succeeded { .. } => None,
            Outcome::Failed(failure) => Some(failure.kind),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Succeeded { path, reused: true } => {
                write!(f, "succeeded (already present) {}", path.display())
            }
            Outcome::Succeeded { path, .. } => write!(f, "succeeded {}", path.display()),
            Outcome::Failed(failure) => write!(f, "failed {failure}"),
        }
    }
}

/// Events published by the download manager
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A job changed status
    JobStatusChanged {
        /// Dataset of the job
        dataset_id: DatasetId,
        /// URI of the job
        uri: String,
        /// New status
        status: JobStatus,
    },
    /// A provider slot was acquired
    SlotAcquired {
        /// Provider key
        provider: String,
    },
    /// A provider slot was released
    SlotReleased {
        /// Provider key
        provider: String,
    },
    /// A slot lease lapsed while the limit was full, so a transfer ran uncounted
    SlotLimitOverrun {
        /// Provider key
        provider: String,
    },
    /// An expired or rejected credential was refreshed
    CredentialRefreshed {
        /// Provider key
        provider: String,
    },
    /// A failed transfer will be retried
    RetryScheduled {
        /// Dataset being retried
        dataset_id: DatasetId,
        /// Retry number (1-based)
        attempt: u32,
        /// Delay before the retry
        #[serde(with = "millis")]
        delay: Duration,
    },
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
