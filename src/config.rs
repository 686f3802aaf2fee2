//! Configuration types for dataset-fetch
//!
//! The provider settings document is a YAML mapping from URL prefix to a settings
//! object. It is validated once, at load time, into [`ProviderConfig`] values whose
//! authentication part is an explicit [`AuthenticationConfig`] variant.
//!
//! ```yaml
//! "https://scihub.copernicus.eu":
//!   username: alice
//!   password: !ENV SCIHUB_PASSWORD
//!   max_parallel_downloads: 2
//! "https://portal.example.org/data":
//!   authentication_type: oauth2
//!   username: alice
//!   password: !ENV PORTAL_PASSWORD
//!   client_id: portal-cli
//!   token_url: https://portal.example.org/auth/token
//!   totp_secret: !ENV PORTAL_TOTP
//!   token_placement: url
//!   token_parameter_name: token
//! ```

use crate::error::{Error, Result};
use serde::de::{self, Deserializer, EnumAccess, MapAccess, VariantAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable holding the shared store hostname
pub const REDIS_HOST_ENV: &str = "DATASET_FETCH_REDIS_HOST";
/// Environment variable holding the shared store port
pub const REDIS_PORT_ENV: &str = "DATASET_FETCH_REDIS_PORT";

/// A secret value, either literal or read from an environment variable
///
/// In YAML, `password: hunter2` is a literal and `password: !ENV MY_VAR` names an
/// environment variable. The variable is read when a credential is built, not when
/// the document is loaded.
#[derive(Clone, PartialEq, Eq)]
pub enum Secret {
    /// Value given directly in the settings document
    Literal(String),
    /// Name of the environment variable holding the value
    Env(String),
}

impl Secret {
    /// Resolve the secret value; `None` if the environment variable is unset or empty
    pub fn resolve(&self) -> Option<String> {
        match self {
            Secret::Literal(value) => Some(value.clone()),
            Secret::Env(name) => std::env::var(name).ok().filter(|v| !v.is_empty()),
        }
    }

    /// Describe where the secret comes from, without revealing it
    pub fn source(&self) -> String {
        match self {
            Secret::Literal(_) => "literal value".to_string(),
            Secret::Env(name) => format!("environment variable {name}"),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::Literal(_) => f.write_str("Secret::Literal(***)"),
            Secret::Env(name) => write!(f, "Secret::Env({name})"),
        }
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SecretVisitor;

        impl<'de> Visitor<'de> for SecretVisitor {
            type Value = Secret;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string, an `!ENV NAME` tagged string, or {env: NAME}")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Secret, E> {
                Ok(Secret::Literal(v.to_owned()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Secret, E> {
                Ok(Secret::Literal(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Secret, E> {
                Ok(Secret::Literal(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Secret, E> {
                Ok(Secret::Literal(v.to_string()))
            }

            // YAML tags arrive as enum variants: `!ENV NAME` -> variant "ENV", value "NAME"
            fn visit_enum<A>(self, data: A) -> std::result::Result<Secret, A::Error>
            where
                A: EnumAccess<'de>,
            {
                let (tag, variant): (String, _) = data.variant()?;
                match tag.trim_start_matches('!') {
                    "ENV" => variant.newtype_variant::<String>().map(Secret::Env),
                    other => Err(de::Error::unknown_variant(other, &["ENV"])),
                }
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Secret, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut env = None;
                while let Some(key) = map.next_key::<String>()? {
                    if key == "env" {
                        env = Some(map.next_value::<String>()?);
                    } else {
                        return Err(de::Error::unknown_field(&key, &["env"]));
                    }
                }
                env.map(Secret::Env)
                    .ok_or_else(|| de::Error::missing_field("env"))
            }
        }

        deserializer.deserialize_any(SecretVisitor)
    }
}

/// Where an OAuth2 bearer token is placed on requests
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenPlacement {
    /// `Authorization: Bearer <token>` header
    Header,
    /// Query parameter appended to the URL
    Url {
        /// Name of the query parameter (default: "access_token")
        parameter_name: String,
    },
}

/// One-time password settings for OAuth2 multi-factor exchanges
#[derive(Clone, Debug)]
pub struct TotpConfig {
    /// Base32 shared secret
    pub secret: Secret,
    /// Length of a code's validity window (default: 30 seconds)
    pub period: Duration,
}

/// OAuth2 resource-owner password exchange settings
#[derive(Clone, Debug)]
pub struct OAuth2Config {
    /// Resource owner username
    pub username: String,
    /// Resource owner password
    pub password: Secret,
    /// OAuth2 client identifier
    pub client_id: String,
    /// Token endpoint URL
    pub token_url: String,
    /// Optional TOTP second factor
    pub totp: Option<TotpConfig>,
    /// Where to put the token on download requests
    pub placement: TokenPlacement,
}

/// Validated authentication settings of a provider
#[derive(Clone, Debug)]
pub enum AuthenticationConfig {
    /// No credentials configured
    Anonymous,
    /// HTTP basic authentication (or FTP login)
    Basic {
        /// Username
        username: String,
        /// Password
        password: Secret,
    },
    /// OAuth2 bearer tokens
    OAuth2(OAuth2Config),
}

/// Settings of one provider, keyed by URL prefix
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// URL prefix identifying the provider (longest matching prefix wins)
    pub url_prefix: String,
    /// Authentication scheme
    pub authentication: AuthenticationConfig,
    /// Maximum simultaneous downloads across all workers (None = unlimited)
    pub max_parallel_downloads: Option<u32>,
    /// Extra query parameters added to every HTTP request
    pub request_parameters: BTreeMap<String, String>,
    /// HTTP statuses meaning the URL is obsolete, with a reason (404 always included)
    pub invalid_status_codes: BTreeMap<u16, String>,
    /// Allow URL-placed tokens over plain HTTP
    pub allow_insecure_transport: bool,
}

impl ProviderConfig {
    /// Create an anonymous, unlimited provider for a URL prefix
    pub fn new(url_prefix: impl Into<String>) -> Self {
        Self {
            url_prefix: url_prefix.into(),
            authentication: AuthenticationConfig::Anonymous,
            max_parallel_downloads: None,
            request_parameters: BTreeMap::new(),
            invalid_status_codes: default_invalid_status_codes(),
            allow_insecure_transport: false,
        }
    }

    /// Set the authentication scheme
    #[must_use]
    pub fn with_authentication(mut self, authentication: AuthenticationConfig) -> Self {
        self.authentication = authentication;
        self
    }

    /// Set the fleet-wide parallel download limit
    #[must_use]
    pub fn with_max_parallel_downloads(mut self, limit: u32) -> Self {
        self.max_parallel_downloads = Some(limit);
        self
    }

    /// Allow URL-placed tokens over plain HTTP
    #[must_use]
    pub fn with_insecure_transport(mut self) -> Self {
        self.allow_insecure_transport = true;
        self
    }

    /// Whether requests to this provider carry credentials
    pub fn requires_authentication(&self) -> bool {
        !matches!(self.authentication, AuthenticationConfig::Anonymous)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AuthenticationType {
    #[default]
    Basic,
    #[serde(alias = "oauth")]
    OAuth2,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PlacementKind {
    #[default]
    Header,
    #[serde(alias = "url-query", alias = "query")]
    Url,
}

/// A settings object as written in the document, before validation
#[derive(Debug, Default, Deserialize)]
struct RawProviderEntry {
    username: Option<String>,
    password: Option<Secret>,
    #[serde(default)]
    authentication_type: AuthenticationType,
    token_url: Option<String>,
    client_id: Option<String>,
    totp_secret: Option<Secret>,
    totp_period: Option<u64>,
    #[serde(default)]
    token_placement: PlacementKind,
    token_parameter_name: Option<String>,
    max_parallel_downloads: Option<u32>,
    #[serde(default)]
    request_parameters: BTreeMap<String, String>,
    #[serde(default)]
    invalid_status_codes: BTreeMap<u16, String>,
    #[serde(default)]
    allow_insecure_transport: bool,
}

impl RawProviderEntry {
    fn validate(self, url_prefix: &str) -> Result<ProviderConfig> {
        let invalid = |message: String, key: &str| Error::Config {
            message: format!("provider '{url_prefix}': {message}"),
            key: Some(key.to_string()),
        };

        if url_prefix.is_empty() {
            return Err(Error::config("empty URL prefix", "url_prefix"));
        }
        if self.max_parallel_downloads == Some(0) {
            return Err(invalid(
                "max_parallel_downloads must be a positive integer".into(),
                "max_parallel_downloads",
            ));
        }

        let authentication = match self.authentication_type {
            AuthenticationType::Basic => match (self.username, self.password) {
                (Some(username), Some(password)) => AuthenticationConfig::Basic { username, password },
                (None, None) => AuthenticationConfig::Anonymous,
                (Some(_), None) => {
                    return Err(invalid("username given without password".into(), "password"));
                }
                (None, Some(_)) => {
                    return Err(invalid("password given without username".into(), "username"));
                }
            },
            AuthenticationType::OAuth2 => {
                let mut missing = Vec::new();
                if self.username.is_none() {
                    missing.push("username");
                }
                if self.password.is_none() {
                    missing.push("password");
                }
                if self.token_url.is_none() {
                    missing.push("token_url");
                }
                if self.client_id.is_none() {
                    missing.push("client_id");
                }
                let (Some(username), Some(password), Some(token_url), Some(client_id)) =
                    (self.username, self.password, self.token_url, self.client_id)
                else {
                    return Err(invalid(
                        format!("missing keys for oauth2 authentication: {missing:?}"),
                        missing.first().copied().unwrap_or("authentication_type"),
                    ));
                };
                if self.totp_period == Some(0) {
                    return Err(invalid("totp_period must be positive".into(), "totp_period"));
                }
                let placement = match self.token_placement {
                    PlacementKind::Header => TokenPlacement::Header,
                    PlacementKind::Url => TokenPlacement::Url {
                        parameter_name: self
                            .token_parameter_name
                            .unwrap_or_else(default_token_parameter_name),
                    },
                };
                AuthenticationConfig::OAuth2(OAuth2Config {
                    username,
                    password,
                    client_id,
                    token_url,
                    totp: self.totp_secret.map(|secret| TotpConfig {
                        secret,
                        period: Duration::from_secs(self.totp_period.unwrap_or(30)),
                    }),
                    placement,
                })
            }
        };

        let mut invalid_status_codes = default_invalid_status_codes();
        invalid_status_codes.extend(self.invalid_status_codes);

        Ok(ProviderConfig {
            url_prefix: url_prefix.to_string(),
            authentication,
            max_parallel_downloads: self.max_parallel_downloads,
            request_parameters: self.request_parameters,
            invalid_status_codes,
            allow_insecure_transport: self.allow_insecure_transport,
        })
    }
}

/// The loaded provider settings document
///
/// Immutable once loaded. Shared behind `Arc` by everything that needs it; replace the
/// whole object (see `DownloadManager::with_provider_settings`) to change settings.
#[derive(Clone, Debug, Default)]
pub struct ProviderSettings {
    providers: Vec<Arc<ProviderConfig>>,
}

impl ProviderSettings {
    /// Settings with no providers (every URL is downloaded anonymously and unthrottled)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load and validate a YAML settings document from disk
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("cannot read provider settings {}: {e}", path.display()),
            key: None,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate a YAML settings document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::empty());
        }
        let raw: Option<BTreeMap<String, Option<RawProviderEntry>>> =
            serde_yml::from_str(content)?;
        let providers = raw
            .unwrap_or_default()
            .into_iter()
            .map(|(prefix, entry)| entry.unwrap_or_default().validate(&prefix))
            .collect::<Result<Vec<_>>>()?;
        Self::from_providers(providers)
    }

    /// Build settings from already-validated provider configurations
    pub fn from_providers(providers: impl IntoIterator<Item = ProviderConfig>) -> Result<Self> {
        let mut providers: Vec<Arc<ProviderConfig>> =
            providers.into_iter().map(Arc::new).collect();
        providers.sort_by(|a, b| a.url_prefix.cmp(&b.url_prefix));
        if let Some(pair) = providers
            .windows(2)
            .find(|pair| pair[0].url_prefix == pair[1].url_prefix)
        {
            return Err(Error::config(
                format!("duplicate provider prefix '{}'", pair[0].url_prefix),
                "url_prefix",
            ));
        }
        Ok(Self { providers })
    }

    /// Look up a provider by its exact prefix
    pub fn get(&self, url_prefix: &str) -> Option<&Arc<ProviderConfig>> {
        self.providers.iter().find(|p| p.url_prefix == url_prefix)
    }

    /// Iterate over all providers (sorted by prefix)
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProviderConfig>> {
        self.providers.iter()
    }

    /// Number of configured providers
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// True when no provider is configured
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Connection settings of the shared store used by the concurrency limiter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    /// Redis hostname
    pub host: String,
    /// Redis port
    pub port: u16,
    /// Namespace for every key written by this crate
    pub key_prefix: String,
}

impl StoreConfig {
    /// Create a store configuration with the default key prefix
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            key_prefix: default_key_prefix(),
        }
    }

    /// Read the store location from `DATASET_FETCH_REDIS_HOST` / `DATASET_FETCH_REDIS_PORT`
    ///
    /// Returns `None` (limiter disabled) if either variable is missing or the port is invalid.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var(REDIS_HOST_ENV).ok().filter(|h| !h.is_empty())?;
        let port = std::env::var(REDIS_PORT_ENV).ok()?;
        match port.parse::<u16>() {
            Ok(port) => Some(Self::new(host, port)),
            Err(e) => {
                tracing::warn!(port = %port, error = %e, "ignoring invalid {REDIS_PORT_ENV}");
                None
            }
        }
    }

    /// Redis connection URL
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Concurrency limiter timing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// How long `acquire` waits for a slot before failing (default: 300 seconds)
    #[serde(default = "default_acquire_timeout", with = "duration_serde")]
    pub acquire_timeout: Duration,

    /// Lease of a held slot; renewed every third of it while the download runs
    /// (default: 60 seconds)
    #[serde(default = "default_lease", with = "duration_serde")]
    pub lease: Duration,

    /// First wait between acquisition attempts (default: 100 ms)
    #[serde(default = "default_poll_interval", with = "millis_serde")]
    pub poll_interval: Duration,

    /// Cap for the doubling wait between acquisition attempts (default: 2 s)
    #[serde(default = "default_max_poll_interval", with = "millis_serde")]
    pub max_poll_interval: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: default_acquire_timeout(),
            lease: default_lease(),
            poll_interval: default_poll_interval(),
            max_poll_interval: default_max_poll_interval(),
        }
    }
}

/// Which of a dataset's candidate URIs are tried
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UriPolicy {
    /// Try every URI in catalog order until one succeeds (default)
    #[default]
    TryInOrder,
    /// Only try the first URI
    FirstOnly,
}

/// Construction-time settings of a `DownloadManager`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Datasets of one call downloaded at the same time in this process (default: 4)
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Candidate URI selection
    #[serde(default)]
    pub uri_policy: UriPolicy,

    /// Transfer retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Slot acquisition settings
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// A token is treated as expired this long before its declared expiry (default: 30 s)
    #[serde(default = "default_expiry_margin", with = "duration_serde")]
    pub expiry_margin: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            uri_policy: UriPolicy::default(),
            retry: RetryConfig::default(),
            limiter: LimiterConfig::default(),
            expiry_margin: default_expiry_margin(),
        }
    }
}

/// Per-call download options
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Destination directory; may contain strftime placeholders (`%Y/%m/%d`) expanded
    /// with each dataset's time coverage start
    pub download_directory: String,

    /// Safety limit on the number of datasets a selection may resolve to (default: 100)
    #[serde(default = "default_max_downloads")]
    pub max_downloads: usize,

    /// Record the downloaded file's path back into the catalog
    #[serde(default)]
    pub save_path: bool,
}

impl DownloadOptions {
    /// Options with the default safety limit
    pub fn new(download_directory: impl Into<String>) -> Self {
        Self {
            download_directory: download_directory.into(),
            max_downloads: default_max_downloads(),
            save_path: false,
        }
    }

    /// Set the safety limit
    #[must_use]
    pub fn with_max_downloads(mut self, max_downloads: usize) -> Self {
        self.max_downloads = max_downloads;
        self
    }

    /// Record downloaded paths in the catalog
    #[must_use]
    pub fn with_save_path(mut self, save_path: bool) -> Self {
        self.save_path = save_path;
        self
    }
}

fn default_invalid_status_codes() -> BTreeMap<u16, String> {
    BTreeMap::from([(404, "URL does not exist".to_string())])
}

fn default_token_parameter_name() -> String {
    "access_token".to_string()
}

fn default_key_prefix() -> String {
    "dataset-fetch".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_lease() -> Duration {
    Duration::from_secs(60)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_parallelism() -> usize {
    4
}

fn default_expiry_margin() -> Duration {
    Duration::from_secs(30)
}

fn default_max_downloads() -> usize {
    100
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
