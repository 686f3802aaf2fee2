//! HTTP(S) transfers

use super::{FetchedFile, TransferRequest, Transport, unwritable};
use crate::auth::Credential;
use crate::config::TokenPlacement;
use crate::error::{Error, Result};
use crate::utils::extract_filename_from_response;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

/// Streams HTTP responses into the destination file
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport sharing `client`
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build_request(&self, request: &TransferRequest<'_>) -> Result<reqwest::RequestBuilder> {
        let invalid = |reason: String| Error::InvalidUri {
            uri: request.uri.to_string(),
            reason,
        };
        let mut url = url::Url::parse(request.uri).map_err(|e| invalid(e.to_string()))?;

        if let Some(provider) = request.provider
            && !provider.request_parameters.is_empty()
        {
            url.query_pairs_mut()
                .extend_pairs(provider.request_parameters.iter());
        }

        let mut bearer_header = None;
        let mut basic = None;
        match request.credential {
            None => {}
            Some(Credential::Basic { username, password }) => basic = Some((username, password)),
            Some(Credential::Bearer {
                token,
                placement: TokenPlacement::Header,
                ..
            }) => bearer_header = Some(token),
            Some(Credential::Bearer {
                token,
                placement: TokenPlacement::Url { parameter_name },
                ..
            }) => {
                let insecure_allowed = request
                    .provider
                    .is_some_and(|provider| provider.allow_insecure_transport);
                if url.scheme() != "https" && !insecure_allowed {
                    return Err(invalid(
                        "refusing to put an access token in the query string of a non-HTTPS URL"
                            .into(),
                    ));
                }
                url.query_pairs_mut().append_pair(parameter_name, token);
            }
        }

        let mut builder = self.client.get(url);
        if let Some((username, password)) = basic {
            builder = builder.basic_auth(username, Some(password));
        }
        if let Some(token) = bearer_header {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: &TransferRequest<'_>, file: &mut tokio::fs::File) -> Result<FetchedFile> {
        let uri = request.uri;
        // the request URL may carry a token, keep it out of errors
        let response = self
            .build_request(request)?
            .send()
            .await
            .map_err(|e| Error::Network(e.without_url()))?;
        let status = response.status();

        if let Some(provider) = request.provider
            && let Some(reason) = provider.invalid_status_codes.get(&status.as_u16())
        {
            return Err(Error::ObsoleteUrl {
                url: uri.to_string(),
                reason: format!("{}: {reason}", status.as_u16()),
            });
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::ObsoleteUrl {
                url: uri.to_string(),
                reason: "404: URL does not exist".into(),
            });
        }
        if matches!(
            status,
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN
        ) {
            return Err(Error::Unauthorized {
                url: uri.to_string(),
                status: status.to_string(),
            });
        }
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: uri.to_string(),
                status: status.as_u16(),
            });
        }

        let file_name = extract_filename_from_response(&response, uri)
            .ok_or_else(|| Error::FileNameUnknown(uri.to_string()))?;
        let expected = response.content_length();

        let mut bytes = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::Network(e.without_url()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| unwritable(request.destination, e))?;
            bytes += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| unwritable(request.destination, e))?;

        if bytes == 0 {
            return Err(Error::EmptyTransfer(uri.to_string()));
        }
        if let Some(expected) = expected
            && bytes < expected
        {
            return Err(Error::Truncated {
                url: uri.to_string(),
                received: bytes,
                expected,
            });
        }

        tracing::debug!(url = %uri, file_name = %file_name, bytes, "HTTP transfer complete");
        Ok(FetchedFile { file_name, bytes })
    }
}
