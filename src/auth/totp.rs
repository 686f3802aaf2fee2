//! Time-based one-time passwords (RFC 6238, HMAC-SHA1)

use crate::config::Secret;
use crate::error::{Error, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::Duration;
use tokio::sync::Mutex;

type HmacSha1 = Hmac<Sha1>;

/// Generates TOTP codes from a base32 shared secret
///
/// A provider accepts each code at most once, so [`fresh_code`](Self::fresh_code)
/// never hands out two codes from the same time window: if the current window was
/// already used it waits for the next one.
pub struct TotpGenerator {
    key: Vec<u8>,
    period: Duration,
    digits: u32,
    last_step: Mutex<Option<u64>>,
}

impl TotpGenerator {
    /// Create a generator producing 6-digit codes
    pub fn new(secret: &Secret, period: Duration) -> Result<Self> {
        let encoded = secret
            .resolve()
            .ok_or_else(|| Error::Totp(format!("secret not available from {}", secret.source())))?;
        if period.as_secs() == 0 {
            return Err(Error::Totp("period must be at least one second".into()));
        }
        Ok(Self {
            key: decode_base32(&encoded)?,
            period,
            digits: 6,
            last_step: Mutex::new(None),
        })
    }

    /// Change the number of digits per code
    #[must_use]
    pub fn with_digits(mut self, digits: u32) -> Self {
        self.digits = digits.clamp(1, 9);
        self
    }

    /// Code valid at the given Unix time
    pub fn code_at(&self, unix_secs: u64) -> String {
        self.code_for_step(unix_secs / self.period.as_secs())
    }

    /// A code from a window that has not produced a code before
    pub async fn fresh_code(&self) -> String {
        let mut last_step = self.last_step.lock().await;
        let period_ms = self.period.as_millis() as u64;

        let mut now_ms = unix_millis();
        let mut step = now_ms / period_ms;
        if let Some(last) = *last_step
            && step <= last
        {
            let next_window_ms = (last + 1) * period_ms;
            let wait = Duration::from_millis(next_window_ms.saturating_sub(now_ms));
            tracing::debug!(wait_ms = wait.as_millis(), "waiting for the next TOTP window");
            tokio::time::sleep(wait).await;
            now_ms = unix_millis().max(next_window_ms);
            step = now_ms / period_ms;
        }

        *last_step = Some(step);
        self.code_for_step(step)
    }

    fn code_for_step(&self, step: u64) -> String {
        // HMAC accepts keys of any length
        let mut mac = match HmacSha1::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(&step.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);
        let code = binary % 10u32.pow(self.digits);
        format!("{code:0width$}", width = self.digits as usize)
    }
}

impl std::fmt::Debug for TotpGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TotpGenerator")
            .field("period", &self.period)
            .field("digits", &self.digits)
            .finish_non_exhaustive()
    }
}

fn decode_base32(encoded: &str) -> Result<Vec<u8>> {
    let normalized: String = encoded
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let key = data_encoding::BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|e| Error::Totp(format!("secret is not valid base32: {e}")))?;
    if key.is_empty() {
        return Err(Error::Totp("secret is empty".into()));
    }
    Ok(key)
}

fn unix_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
