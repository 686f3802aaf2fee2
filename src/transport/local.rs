//! Local file copies (`file://` URIs and absolute paths)

use super::{FetchedFile, TransferRequest, Transport, unwritable};
use crate::error::{Error, Result};
use crate::utils::filename_from_url;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Copies files that are already reachable on a local or mounted filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

fn source_path(uri: &str) -> Result<PathBuf> {
    if uri.starts_with('/') {
        return Ok(PathBuf::from(uri));
    }
    url::Url::parse(uri)
        .ok()
        .and_then(|url| url.to_file_path().ok())
        .ok_or_else(|| Error::InvalidUri {
            uri: uri.to_string(),
            reason: "not a local file URI".into(),
        })
}

fn unreadable(uri: &str, source: std::io::Error) -> Error {
    Error::SourceRead {
        url: uri.to_string(),
        source,
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn fetch(&self, request: &TransferRequest<'_>, file: &mut tokio::fs::File) -> Result<FetchedFile> {
        let uri = request.uri;
        let source = source_path(uri)?;
        let file_name = filename_from_url(uri).ok_or_else(|| Error::FileNameUnknown(uri.to_string()))?;

        let mut input = match tokio::fs::File::open(&source).await {
            Ok(input) => input,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ObsoleteUrl {
                    url: uri.to_string(),
                    reason: format!("{} does not exist", source.display()),
                });
            }
            Err(e) => return Err(unreadable(uri, e)),
        };

        let mut buffer = vec![0u8; 64 * 1024];
        let mut bytes = 0u64;
        loop {
            let read = input.read(&mut buffer).await.map_err(|e| unreadable(uri, e))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .await
                .map_err(|e| unwritable(request.destination, e))?;
            bytes += read as u64;
        }
        file.flush()
            .await
            .map_err(|e| unwritable(request.destination, e))?;

        tracing::debug!(source = %source.display(), bytes, "local copy complete");
        Ok(FetchedFile { file_name, bytes })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_file_uri_and_bare_path() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.nc");
        std::fs::write(&source, b"local bytes").unwrap();

        for uri in [
            format!("file://{}", source.display()),
            source.display().to_string(),
        ] {
            let target = dir.path().join("copy.part");
            let mut file = tokio::fs::File::create(&target).await.unwrap();
            let request = TransferRequest {
                uri: &uri,
                provider: None,
                credential: None,
                destination: &target,
            };
            let fetched = LocalTransport.fetch(&request, &mut file).await.unwrap();
            assert_eq!(fetched.file_name, "source.nc");
            assert_eq!(fetched.bytes, 11);
            drop(file);
            assert_eq!(std::fs::read(&target).unwrap(), b"local bytes");
        }
    }

    #[tokio::test]
    async fn missing_source_is_obsolete() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("copy.part");
        let mut file = tokio::fs::File::create(&target).await.unwrap();
        let uri = format!("{}/nope.nc", dir.path().display());
        let request = TransferRequest {
            uri: &uri,
            provider: None,
            credential: None,
            destination: &target,
        };
        let err = LocalTransport.fetch(&request, &mut file).await.unwrap_err();
        assert!(matches!(err, Error::ObsoleteUrl { .. }));
    }

    #[tokio::test]
    async fn unreadable_source_is_a_transfer_failure() {
        let dir = tempfile::tempdir().unwrap();
        // opening a directory works, reading it does not
        let source = dir.path().join("not-a-file.nc");
        std::fs::create_dir(&source).unwrap();
        let target = dir.path().join("copy.part");
        let mut file = tokio::fs::File::create(&target).await.unwrap();
        let uri = source.display().to_string();
        let request = TransferRequest {
            uri: &uri,
            provider: None,
            credential: None,
            destination: &target,
        };

        let err = LocalTransport.fetch(&request, &mut file).await.unwrap_err();
        assert!(matches!(err, Error::SourceRead { .. }), "{err:?}");
        assert_eq!(err.kind(), crate::error::FailureKind::TransferFailed);
        assert!(err.to_string().contains("not-a-file.nc"));
    }
}
