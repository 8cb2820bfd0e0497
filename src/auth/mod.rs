//! Bearer credential lifecycle.
//!
//! - `claims`: pure JWT payload decoding into a [`SessionContext`]
//! - `authorize`: implicit-grant request construction and fragment parsing
//! - `broker`: the interactive/silent round-trip (loopback listener)
//! - `manager`: cache check, validation call, silent + interactive renewal

pub mod authorize;
pub mod broker;
pub mod claims;
pub mod manager;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use claims::SessionContext;
pub use manager::TokenManager;

/// Longest token lifetime we accept from the provider (24h).
pub const MAX_LIFETIME_SECS: i64 = 24 * 60 * 60;

/// Hex SHA-256 of the raw token.
pub fn fingerprint(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// A bearer token plus the metadata needed to decide whether to trust it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub issued_tenant: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub fingerprint: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("issued_tenant", &self.issued_tenant)
            .field("expires_at", &self.expires_at)
            .field("fingerprint", &&self.fingerprint[..self.fingerprint.len().min(12)])
            .finish()
    }
}

impl Credential {
    /// Build a credential from a provider response. `expires_at` is
    /// `issued_at + expires_in`, with `expires_in` clamped to
    /// `0..=MAX_LIFETIME_SECS`.
    pub fn issue(
        token: impl Into<String>,
        expires_in_secs: i64,
        issued_tenant: Option<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        let token = token.into();
        let fingerprint = fingerprint(&token);
        Self {
            token,
            issued_tenant,
            expires_at: issued_at + Duration::seconds(expires_in_secs.clamp(0, MAX_LIFETIME_SECS)),
            fingerprint,
        }
    }

    pub fn is_usable(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now < self.expires_at - buffer
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}
