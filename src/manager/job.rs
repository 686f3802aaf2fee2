//! Downloading one dataset
//!
//! A dataset is tried through its candidate URIs (per [`UriPolicy`]). Each URI runs
//! as one [`DownloadJob`]:
//!
//! 1. match the provider and resolve its credential (`authenticating`)
//! 2. take a provider slot
//! 3. transfer into a hidden temporary file next to the destination, retrying
//!    transient failures and refreshing the credential once on rejection
//!    (`downloading`)
//! 4. rename the file into place (`succeeded`) or delete it (`failed`)
//! 5. release the slot
//!
//! The slot guard and the temporary file are both owned by the job future, so a
//! cancelled job drops them and both are cleaned up.

use super::{DownloadManager, paths};
use crate::auth::{Authenticator, Credential};
use crate::catalog::DatasetRecord;
use crate::config::{DownloadOptions, ProviderConfig, UriPolicy};
use crate::error::{Error, Result};
use crate::retry::{IsRetryable, RetryPolicy};
use crate::transport::{FetchedFile, TransferRequest, Transport, unwritable};
use crate::types::{DownloadFailure, DownloadJob, Event, JobStatus, Outcome};
use crate::utils::sanitize_file_name;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncSeekExt;

/// Credential state of one job
struct JobCredential {
    authenticator: Arc<dyn Authenticator>,
    current: Credential,
    refreshed_after_rejection: bool,
}

impl DownloadManager {
    /// Download one dataset, reporting every failure in the outcome
    pub(crate) async fn download_record(
        &self,
        record: &DatasetRecord,
        options: &DownloadOptions,
    ) -> Outcome {
        match self.try_download_record(record, options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(dataset_id = %record.id, error = %e, "dataset download failed");
                Outcome::Failed(DownloadFailure {
                    kind: e.kind(),
                    message: e.to_string(),
                    errors: Vec::new(),
                })
            }
        }
    }

    async fn try_download_record(
        &self,
        record: &DatasetRecord,
        options: &DownloadOptions,
    ) -> Result<Outcome> {
        let base = paths::expand_directory(&options.download_directory, record.time_coverage_start)?;
        let directory = base.join(paths::dataset_directory(&record.entry_id)?);

        if let Some(existing) = paths::find_existing_file(&directory).await? {
            tracing::info!(
                dataset_id = %record.id,
                path = %existing.display(),
                "dataset already downloaded"
            );
            self.save_local_path(record, options, &existing).await;
            return Ok(Outcome::Succeeded {
                path: existing,
                reused: true,
            });
        }

        let candidates: &[String] = match self.config.uri_policy {
            UriPolicy::TryInOrder => &record.uris,
            UriPolicy::FirstOnly => &record.uris[..record.uris.len().min(1)],
        };
        if candidates.is_empty() {
            return Err(Error::Other(format!("dataset {} has no URI", record.id)));
        }

        let mut errors = Vec::with_capacity(candidates.len());
        let mut last_error = None;
        for uri in candidates {
            match self.download_from_uri(record, uri, &directory).await {
                Ok(path) => {
                    tracing::info!(dataset_id = %record.id, uri = %uri, path = %path.display(), "dataset downloaded");
                    self.save_local_path(record, options, &path).await;
                    return Ok(Outcome::Succeeded {
                        path,
                        reused: false,
                    });
                }
                Err(e) => {
                    tracing::warn!(dataset_id = %record.id, uri = %uri, error = %e, "download from URI failed");
                    errors.push(format!("{uri}: {e}"));
                    last_error = Some(e);
                }
            }
        }

        paths::remove_empty_dirs(&directory, &base).await;
        let (kind, message) = match last_error {
            Some(e) => (e.kind(), e.to_string()),
            None => (crate::error::FailureKind::Other, "no URI was tried".to_string()),
        };
        tracing::error!(dataset_id = %record.id, kind = %kind, "dataset download failed");
        Ok(Outcome::Failed(DownloadFailure {
            kind,
            message,
            errors,
        }))
    }

    async fn save_local_path(&self, record: &DatasetRecord, options: &DownloadOptions, path: &Path) {
        if !options.save_path {
            return;
        }
        let absolute = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());
        if let Err(e) = self.catalog.add_local_uri(record.id, &absolute).await {
            tracing::warn!(dataset_id = %record.id, error = %e, "failed to record local path in the catalog");
        }
    }

    /// Run one job for `uri`, returning the final path of the file
    async fn download_from_uri(
        &self,
        record: &DatasetRecord,
        uri: &str,
        directory: &Path,
    ) -> Result<PathBuf> {
        let mut job = DownloadJob::new(record.id, uri, directory.to_path_buf());
        self.emit_status(&job);

        let result = self.run_job(&mut job).await;
        if result.is_err() && !job.status.is_terminal() {
            self.advance(&mut job, JobStatus::Failed);
        }
        result
    }

    async fn run_job(&self, job: &mut DownloadJob) -> Result<PathBuf> {
        let transport = self.transports.for_uri(&job.uri)?;
        let provider = self.matcher.find(&job.uri);

        let authenticator = match provider.as_deref() {
            Some(provider) => self.auth.for_provider(provider)?,
            None => {
                tracing::debug!(uri = %job.uri, "no provider configured, downloading without credentials or limit");
                None
            }
        };

        let mut credential = match authenticator {
            Some(authenticator) => {
                self.advance(job, JobStatus::Authenticating);
                let mut current = authenticator.get_credential().await?;
                if authenticator.is_expired(&current) {
                    tracing::debug!(provider = %authenticator.provider(), "credential expired before first use");
                    current = self.refresh_credential(authenticator.as_ref(), &current).await?;
                }
                Some(JobCredential {
                    authenticator,
                    current,
                    refreshed_after_rejection: false,
                })
            }
            None => None,
        };

        let slot = match provider.as_deref() {
            Some(provider) => Some(
                self.limiter
                    .acquire(&provider.url_prefix, provider.max_parallel_downloads)
                    .await?,
            ),
            None => None,
        };
        if let Some(slot) = &slot
            && !slot.is_noop()
        {
            self.emit_event(Event::SlotAcquired {
                provider: slot.provider().to_string(),
            });
        }

        let result = self
            .transfer_and_persist(job, transport.as_ref(), provider.as_deref(), &mut credential)
            .await;
        let next = if result.is_ok() {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        self.advance(job, next);

        if let Some(slot) = slot {
            let provider = slot.provider().to_string();
            let counted = !slot.is_noop();
            if slot.limit_overrun() {
                self.emit_event(Event::SlotLimitOverrun {
                    provider: provider.clone(),
                });
            }
            if let Err(e) = slot.release().await {
                tracing::warn!(provider = %provider, error = %e, "failed to release download slot, it will expire with its lease");
            }
            if counted {
                self.emit_event(Event::SlotReleased { provider });
            }
        }
        result
    }

    async fn transfer_and_persist(
        &self,
        job: &mut DownloadJob,
        transport: &dyn Transport,
        provider: Option<&ProviderConfig>,
        credential: &mut Option<JobCredential>,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&job.destination)
            .await
            .map_err(|e| unwritable(&job.destination, e))?;
        self.advance(job, JobStatus::Downloading);

        let temporary = tempfile::Builder::new()
            .prefix(".")
            .suffix(paths::PARTIAL_SUFFIX)
            .tempfile_in(&job.destination)
            .map_err(|e| unwritable(&job.destination, e))?;
        let (file, temp_path) = temporary.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let fetched = self
            .transfer_with_retries(job, transport, provider, credential, &mut file, &temp_path)
            .await?;
        file.sync_all()
            .await
            .map_err(|e| unwritable(&temp_path, e))?;
        drop(file);

        let file_name = sanitize_file_name(&fetched.file_name)
            .ok_or_else(|| Error::FileNameUnknown(job.uri.clone()))?;
        let final_path = job.destination.join(file_name);
        temp_path
            .persist(&final_path)
            .map_err(|e| unwritable(&final_path, e.error))?;

        tracing::debug!(
            dataset_id = %job.dataset_id,
            path = %final_path.display(),
            bytes = fetched.bytes,
            attempts = job.attempt_count,
            "file moved into place"
        );
        Ok(final_path)
    }

    async fn transfer_with_retries(
        &self,
        job: &mut DownloadJob,
        transport: &dyn Transport,
        provider: Option<&ProviderConfig>,
        credential: &mut Option<JobCredential>,
        file: &mut tokio::fs::File,
        temp_path: &Path,
    ) -> Result<FetchedFile> {
        let mut policy = RetryPolicy::new(self.config.retry.clone());

        loop {
            if let Some(state) = credential.as_mut()
                && state.authenticator.is_expired(&state.current)
            {
                state.current = self
                    .refresh_credential(state.authenticator.as_ref(), &state.current)
                    .await?;
            }

            // every attempt starts from an empty file
            file.set_len(0).await.map_err(|e| unwritable(temp_path, e))?;
            file.seek(SeekFrom::Start(0))
                .await
                .map_err(|e| unwritable(temp_path, e))?;

            job.attempt_count += 1;
            let request = TransferRequest {
                uri: &job.uri,
                provider,
                credential: credential.as_ref().map(|state| &state.current),
                destination: temp_path,
            };
            let error = match transport.fetch(&request, file).await {
                Ok(fetched) => return Ok(fetched),
                Err(e) => e,
            };

            if error.is_auth_rejection() {
                let provider_key = provider
                    .map(|p| p.url_prefix.clone())
                    .unwrap_or_else(|| job.uri.clone());
                let Some(state) = credential.as_mut() else {
                    return Err(Error::AuthenticationFailed {
                        provider: provider_key,
                        reason: format!("no credentials configured: {error}"),
                    });
                };
                if state.refreshed_after_rejection {
                    return Err(Error::AuthenticationFailed {
                        provider: provider_key,
                        reason: format!("rejected after refreshing the credential: {error}"),
                    });
                }
                tracing::info!(
                    dataset_id = %job.dataset_id,
                    provider = %provider_key,
                    "credential rejected, refreshing once"
                );
                state.refreshed_after_rejection = true;
                state.current = self
                    .refresh_credential(state.authenticator.as_ref(), &state.current)
                    .await?;
                continue;
            }

            if !error.is_retryable() {
                return Err(error);
            }
            let Some(delay) = policy.next_delay() else {
                return Err(Error::TransferFailed {
                    url: job.uri.clone(),
                    attempts: job.attempt_count,
                    reason: error.to_string(),
                });
            };

            tracing::warn!(
                dataset_id = %job.dataset_id,
                attempt = job.attempt_count,
                max_attempts = policy.max_total_attempts(),
                delay_ms = delay.as_millis(),
                error = %error,
                "transient transfer error, retrying"
            );
            self.emit_event(Event::RetryScheduled {
                dataset_id: job.dataset_id,
                attempt: policy.retries(),
                delay,
            });
            tokio::time::sleep(delay).await;
        }
    }

    async fn refresh_credential(
        &self,
        authenticator: &dyn Authenticator,
        stale: &Credential,
    ) -> Result<Credential> {
        let fresh = authenticator.refresh(stale).await?;
        tracing::debug!(provider = %authenticator.provider(), "credential refreshed");
        self.emit_event(Event::CredentialRefreshed {
            provider: authenticator.provider().to_string(),
        });
        Ok(fresh)
    }

    fn advance(&self, job: &mut DownloadJob, next: JobStatus) {
        if job.advance(next) {
            self.emit_status(job);
        }
    }

    fn emit_status(&self, job: &DownloadJob) {
        self.emit_event(Event::JobStatusChanged {
            dataset_id: job.dataset_id,
            uri: job.uri.clone(),
            status: job.status,
        });
    }
}
