//! Authentication strategies
//!
//! Every provider that carries credentials gets one [`Authenticator`]:
//! - [`BasicAuth`] hands out a username/password pair; it never expires and cannot be
//!   refreshed
//! - [`OAuth2Auth`] exchanges username, password and client id (plus a fresh TOTP code
//!   when a secret is configured) for a bearer token with an expiry
//!
//! The [`AuthRegistry`] builds authenticators lazily and keeps one per provider, so a
//! token fetched for one dataset is reused by the next until it nears expiry.

mod oauth2;
mod totp;

pub use oauth2::OAuth2Auth;
pub use totp::TotpGenerator;

use crate::config::{AuthenticationConfig, ProviderConfig, RetryConfig, Secret, TokenPlacement};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ready-to-use authentication material for one request
///
/// Derived from a provider configuration when needed; never persisted.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Username/password pair (HTTP basic auth, FTP login)
    Basic {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// OAuth2 bearer token
    Bearer {
        /// Access token
        token: String,
        /// Where the token goes on the request
        placement: TokenPlacement,
        /// Expiry declared by the token endpoint
        expires_at: DateTime<Utc>,
    },
}

impl Credential {
    /// Declared expiry, if the credential has one
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Credential::Basic { .. } => None,
            Credential::Bearer { expires_at, .. } => Some(*expires_at),
        }
    }

    /// Whether the credential is past `expires_at - margin`
    pub fn expires_within(&self, margin: Duration) -> bool {
        match self.expires_at() {
            None => false,
            Some(expires_at) => {
                let margin = chrono::Duration::from_std(margin)
                    .unwrap_or_else(|_| chrono::Duration::days(365));
                Utc::now().checked_add_signed(margin).is_none_or(|t| t >= expires_at)
            }
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Credential::Bearer {
                placement,
                expires_at,
                ..
            } => f
                .debug_struct("Bearer")
                .field("token", &"***")
                .field("placement", placement)
                .field("expires_at", expires_at)
                .finish(),
        }
    }
}

/// Produces and refreshes credentials for one provider
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// URL prefix of the provider this authenticator serves
    fn provider(&self) -> &str;

    /// Get a credential that is not expired
    async fn get_credential(&self) -> Result<Credential>;

    /// Whether `credential` must not be used any more (expiry minus safety margin)
    fn is_expired(&self, credential: &Credential) -> bool;

    /// Replace a stale or rejected credential
    async fn refresh(&self, credential: &Credential) -> Result<Credential>;
}

/// Basic authentication: static username/password, no expiry, no refresh
pub struct BasicAuth {
    provider: String,
    username: String,
    password: Secret,
}

impl BasicAuth {
    /// Create a basic authenticator
    pub fn new(provider: impl Into<String>, username: impl Into<String>, password: Secret) -> Self {
        Self {
            provider: provider.into(),
            username: username.into(),
            password,
        }
    }
}

#[async_trait]
impl Authenticator for BasicAuth {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn get_credential(&self) -> Result<Credential> {
        let password = self
            .password
            .resolve()
            .ok_or_else(|| Error::AuthenticationFailed {
                provider: self.provider.clone(),
                reason: format!("password not available from {}", self.password.source()),
            })?;
        Ok(Credential::Basic {
            username: self.username.clone(),
            password,
        })
    }

    fn is_expired(&self, _credential: &Credential) -> bool {
        false
    }

    async fn refresh(&self, _credential: &Credential) -> Result<Credential> {
        Err(Error::AuthenticationFailed {
            provider: self.provider.clone(),
            reason: "credentials rejected and basic credentials cannot be refreshed".into(),
        })
    }
}

/// One authenticator per provider, created on first use
pub struct AuthRegistry {
    client: reqwest::Client,
    expiry_margin: Duration,
    token_retry: RetryConfig,
    authenticators: Mutex<HashMap<String, Arc<dyn Authenticator>>>,
}

impl AuthRegistry {
    /// Create a registry whose OAuth2 authenticators share `client`
    pub fn new(client: reqwest::Client, expiry_margin: Duration, token_retry: RetryConfig) -> Self {
        Self {
            client,
            expiry_margin,
            token_retry,
            authenticators: Mutex::new(HashMap::new()),
        }
    }

    /// Authenticator for a provider, or `None` if it needs no credentials
    pub fn for_provider(&self, provider: &ProviderConfig) -> Result<Option<Arc<dyn Authenticator>>> {
        if !provider.requires_authentication() {
            return Ok(None);
        }

        let mut authenticators = self
            .authenticators
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = authenticators.get(&provider.url_prefix) {
            return Ok(Some(existing.clone()));
        }

        let authenticator: Arc<dyn Authenticator> = match &provider.authentication {
            AuthenticationConfig::Anonymous => return Ok(None),
            AuthenticationConfig::Basic { username, password } => Arc::new(BasicAuth::new(
                &provider.url_prefix,
                username,
                password.clone(),
            )),
            AuthenticationConfig::OAuth2(config) => Arc::new(
                OAuth2Auth::new(&provider.url_prefix, config.clone(), self.client.clone())?
                    .with_expiry_margin(self.expiry_margin)
                    .with_retry(self.token_retry.clone()),
            ),
        };
        authenticators.insert(provider.url_prefix.clone(), authenticator.clone());
        Ok(Some(authenticator))
    }
}
