//! OAuth2 resource-owner password exchange, with an optional TOTP second factor

use super::{Authenticator, Credential, TotpGenerator};
use crate::config::{OAuth2Config, RetryConfig};
use crate::error::{Error, Result};
use crate::retry::with_retry;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;

/// Exchanges attempted per token request when the provider rejects a TOTP code
const TOTP_EXCHANGE_TRIES: u32 = 3;

/// Lifetime assumed when the token endpoint does not declare one
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Bearer-token authenticator
///
/// One instance serves every job of a provider in this process. The latest token is
/// cached; jobs reuse it until it falls within the expiry margin, and the token
/// request itself happens under a lock so concurrent jobs do not each run an exchange.
pub struct OAuth2Auth {
    provider: String,
    config: OAuth2Config,
    client: reqwest::Client,
    totp: Option<TotpGenerator>,
    expiry_margin: Duration,
    retry: RetryConfig,
    cached: Mutex<Option<Credential>>,
}

impl OAuth2Auth {
    /// Create an authenticator; fails if a configured TOTP secret cannot be decoded
    pub fn new(provider: impl Into<String>, config: OAuth2Config, client: reqwest::Client) -> Result<Self> {
        let totp = config
            .totp
            .as_ref()
            .map(|totp| TotpGenerator::new(&totp.secret, totp.period))
            .transpose()?;
        Ok(Self {
            provider: provider.into(),
            config,
            client,
            totp,
            expiry_margin: Duration::from_secs(30),
            retry: RetryConfig::default(),
            cached: Mutex::new(None),
        })
    }

    /// Treat tokens as expired this long before their declared expiry
    #[must_use]
    pub fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    /// Retry settings for transient token endpoint failures
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch_token(&self) -> Result<Credential> {
        let password = self
            .config
            .password
            .resolve()
            .ok_or_else(|| self.failed(format!("password not available from {}", self.config.password.source())))?;

        let tries = if self.totp.is_some() { TOTP_EXCHANGE_TRIES } else { 1 };
        let mut last_rejection = String::new();
        for attempt in 1..=tries {
            match with_retry(&self.retry, || self.request_token(&password)).await {
                Ok(credential) => {
                    tracing::info!(provider = %self.provider, "obtained OAuth2 token");
                    return Ok(credential);
                }
                Err(e @ Error::Unauthorized { .. }) => {
                    if attempt < tries {
                        tracing::warn!(
                            provider = %self.provider,
                            attempt,
                            error = %e,
                            "token request rejected, retrying with the next one-time code"
                        );
                    }
                    last_rejection = e.to_string();
                }
                Err(e) => return Err(self.failed(format!("token request failed: {e}"))),
            }
        }
        Err(self.failed(last_rejection))
    }

    /// One token exchange; every call carries its own one-time code
    async fn request_token(&self, password: &str) -> Result<Credential> {
        let token_url = &self.config.token_url;
        let totp_code = match &self.totp {
            Some(totp) => Some(totp.fresh_code().await),
            None => None,
        };
        let mut form = vec![
            ("grant_type", "password"),
            ("username", self.config.username.as_str()),
            ("password", password),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(code) = totp_code.as_deref() {
            form.push(("totp", code));
        }

        tracing::debug!(provider = %self.provider, token_url = %token_url, "requesting OAuth2 token");
        let response = self.client.post(token_url).form(&form).send().await?;
        let status = response.status();

        if matches!(status.as_u16(), 400 | 401 | 403) {
            let body = response.text().await.unwrap_or_default();
            let detail = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(TokenErrorResponse {
                    error,
                    error_description: Some(description),
                }) => format!("{status}: {error} ({description})"),
                Ok(TokenErrorResponse { error, .. }) => format!("{status}: {error}"),
                Err(_) => status.to_string(),
            };
            return Err(Error::Unauthorized {
                url: token_url.clone(),
                status: detail,
            });
        }
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: token_url.clone(),
                status: status.as_u16(),
            });
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = token
            .expires_in
            .as_ref()
            .and_then(|value| match value {
                serde_json::Value::Number(n) => n.as_u64(),
                serde_json::Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .map(Duration::from_secs)
            .unwrap_or_else(|| {
                tracing::warn!(
                    provider = %self.provider,
                    "token response has no usable expires_in, assuming one hour"
                );
                DEFAULT_TOKEN_LIFETIME
            });
        // a year is plenty and keeps the timestamp arithmetic in range
        let lifetime_secs = lifetime.as_secs().min(365 * 24 * 3600) as i64;

        Ok(Credential::Bearer {
            token: token.access_token,
            placement: self.config.placement.clone(),
            expires_at: Utc::now() + chrono::Duration::seconds(lifetime_secs),
        })
    }

    fn failed(&self, reason: String) -> Error {
        Error::AuthenticationFailed {
            provider: self.provider.clone(),
            reason,
        }
    }
}

#[async_trait]
impl Authenticator for OAuth2Auth {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn get_credential(&self) -> Result<Credential> {
        let mut cached = self.cached.lock().await;
        if let Some(credential) = cached.as_ref()
            && !self.is_expired(credential)
        {
            return Ok(credential.clone());
        }
        let credential = self.fetch_token().await?;
        *cached = Some(credential.clone());
        Ok(credential)
    }

    fn is_expired(&self, credential: &Credential) -> bool {
        credential.expires_within(self.expiry_margin)
    }

    async fn refresh(&self, stale: &Credential) -> Result<Credential> {
        let mut cached = self.cached.lock().await;
        // another job may already have replaced the stale token
        if let Some(credential) = cached.as_ref()
            && credential != stale
            && !self.is_expired(credential)
        {
            return Ok(credential.clone());
        }
        tracing::debug!(provider = %self.provider, "refreshing OAuth2 token");
        let credential = self.fetch_token().await?;
        *cached = Some(credential.clone());
        Ok(credential)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Secret, TokenPlacement, TotpConfig};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOTP_SECRET: &str = "JBSWY3DPEHPK3PXP";

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn oauth(server: &MockServer, totp: bool) -> OAuth2Auth {
        let config = OAuth2Config {
            username: "alice".into(),
            password: Secret::Literal("pw".into()),
            client_id: "cli".into(),
            token_url: format!("{}/token", server.uri()),
            totp: totp.then(|| TotpConfig {
                secret: Secret::Literal(TOTP_SECRET.into()),
                period: Duration::from_secs(1),
            }),
            placement: TokenPlacement::Header,
        };
        OAuth2Auth::new("https://portal", config, reqwest::Client::new())
            .unwrap()
            .with_retry(fast_retry())
    }

    fn token(access_token: &str, expires_in: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": access_token,
            "token_type": "Bearer",
            "expires_in": expires_in,
        }))
    }

    fn sent_totp_codes(requests: &[wiremock::Request]) -> Vec<String> {
        requests
            .iter()
            .filter_map(|r| {
                let body = String::from_utf8_lossy(&r.body).to_string();
                body.split('&')
                    .find_map(|pair| pair.strip_prefix("totp=").map(str::to_string))
            })
            .collect()
    }

    #[tokio::test]
    async fn token_is_fetched_once_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=password"))
            .and(body_string_contains("client_id=cli"))
            .respond_with(token("tok-1", serde_json::json!(3600)))
            .expect(1)
            .mount(&server)
            .await;

        let auth = oauth(&server, false);
        let first = auth.get_credential().await.unwrap();
        let second = auth.get_credential().await.unwrap();
        assert_eq!(first, second);
        let Credential::Bearer { token, expires_at, .. } = first else {
            panic!("expected a bearer token");
        };
        assert_eq!(token, "tok-1");
        assert!(expires_at > Utc::now() + chrono::Duration::minutes(59));
    }

    #[tokio::test]
    async fn token_nearing_expiry_is_refreshed_before_reuse() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token("short-lived", serde_json::json!("10")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token("long-lived", serde_json::json!(3600)))
            .mount(&server)
            .await;

        // 10 s lifetime is inside the 30 s margin
        let auth = oauth(&server, false);
        let first = auth.get_credential().await.unwrap();
        assert!(auth.is_expired(&first));

        let second = auth.get_credential().await.unwrap();
        assert!(!auth.is_expired(&second));
        assert!(matches!(second, Credential::Bearer { ref token, .. } if token == "long-lived"));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn refresh_of_an_already_replaced_token_reuses_the_new_one() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token("fresh", serde_json::json!(3600)))
            .expect(1)
            .mount(&server)
            .await;

        let auth = oauth(&server, false);
        let current = auth.get_credential().await.unwrap();
        let stale = Credential::Bearer {
            token: "old".into(),
            placement: TokenPlacement::Header,
            expires_at: Utc::now(),
        };
        assert_eq!(auth.refresh(&stale).await.unwrap(), current);
    }

    #[tokio::test]
    async fn consecutive_refreshes_send_distinct_totp_codes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("totp="))
            .respond_with(token("t", serde_json::json!(3600)))
            .mount(&server)
            .await;

        let auth = oauth(&server, true);
        let first = auth.get_credential().await.unwrap();
        let second = auth.refresh(&first).await.unwrap();
        let _third = auth.refresh(&second).await.unwrap();

        let codes = sent_totp_codes(&server.received_requests().await.unwrap());
        assert_eq!(codes.len(), 3);
        assert_ne!(codes[0], codes[1]);
        assert_ne!(codes[1], codes[2]);
    }

    #[tokio::test]
    async fn rejected_totp_is_retried_with_a_new_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(serde_json::json!({
                    "error": "invalid_grant",
                    "error_description": "Invalid user credentials"
                })),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token("after-retry", serde_json::json!(3600)))
            .mount(&server)
            .await;

        let auth = oauth(&server, true);
        let credential = auth.get_credential().await.unwrap();
        assert!(matches!(credential, Credential::Bearer { ref token, .. } if token == "after-retry"));

        let codes = sent_totp_codes(&server.received_requests().await.unwrap());
        assert_eq!(codes.len(), 2);
        assert_ne!(codes[0], codes[1]);
    }

    #[tokio::test]
    async fn rejected_password_without_totp_fails_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(serde_json::json!({"error": "invalid_grant"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = oauth(&server, false).get_credential().await.unwrap_err();
        match err {
            Error::AuthenticationFailed { provider, reason } => {
                assert_eq!(provider, "https://portal");
                assert!(reason.contains("invalid_grant"), "{reason}");
            }
            other => panic!("expected AuthenticationFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transient_token_endpoint_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token("ok", serde_json::json!(3600)))
            .mount(&server)
            .await;

        let credential = oauth(&server, false).get_credential().await.unwrap();
        assert!(matches!(credential, Credential::Bearer { ref token, .. } if token == "ok"));
    }

    #[tokio::test]
    async fn transient_failure_with_totp_sends_a_new_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(token("ok", serde_json::json!(3600)))
            .mount(&server)
            .await;

        let credential = oauth(&server, true).get_credential().await.unwrap();
        assert!(matches!(credential, Credential::Bearer { ref token, .. } if token == "ok"));

        let codes = sent_totp_codes(&server.received_requests().await.unwrap());
        assert_eq!(codes.len(), 2);
        assert_ne!(codes[0], codes[1]);
    }

    #[tokio::test]
    async fn missing_expires_in_defaults_to_one_hour() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"access_token": "x"})),
            )
            .mount(&server)
            .await;

        let credential = oauth(&server, false).get_credential().await.unwrap();
        let expires_at = credential.expires_at().unwrap();
        assert!(expires_at > Utc::now() + chrono::Duration::minutes(59));
        assert!(expires_at <= Utc::now() + chrono::Duration::minutes(61));
    }
}
