pub mod file;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::auth::{fingerprint, Credential};
use crate::errors::ControllerError;

pub use file::FileStore;
pub use memory::MemoryStore;

pub const KEY_ACCESS_TOKEN: &str = "access_token";
pub const KEY_TOKEN_EXPIRY: &str = "token_expiry";
pub const KEY_FINGERPRINT: &str = "session_fingerprint";
pub const KEY_ISSUED_TENANT: &str = "issued_tenant";
pub const KEY_DEBUG_LOGGING: &str = "debug_logging";

/// Durable string key/value persistence.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Write several keys as one unit where the backend supports it.
    async fn set_many(&self, entries: &[(&str, &str)]) -> anyhow::Result<()> {
        for (k, v) in entries {
            self.set(k, v).await?;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// Typed view over a [`KeyValueStore`] holding the credential triple and
/// the debug-logging preference.
#[derive(Clone)]
pub struct CredentialStore {
    kv: Arc<dyn KeyValueStore>,
}

fn store_err(e: anyhow::Error) -> ControllerError {
    ControllerError::Store(e.to_string())
}

impl CredentialStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Load the persisted credential.
    ///
    /// `Ok(None)` when nothing is stored. A corrupt triple (unparsable expiry,
    /// or a token whose fingerprint does not match the stored one) is a
    /// `Validation` error; the caller is expected to [`clear`](Self::clear).
    pub async fn load(&self) -> Result<Option<Credential>, ControllerError> {
        let token = match self.kv.get(KEY_ACCESS_TOKEN).await.map_err(store_err)? {
            Some(t) if !t.is_empty() => t,
            _ => return Ok(None),
        };

        let expiry = self
            .kv
            .get(KEY_TOKEN_EXPIRY)
            .await
            .map_err(store_err)?
            .ok_or_else(|| ControllerError::Validation("token expiry missing".into()))?;
        let expires_at = DateTime::parse_from_rfc3339(&expiry)
            .map_err(|e| ControllerError::Validation(format!("token expiry unreadable: {}", e)))?
            .with_timezone(&Utc);

        let actual = fingerprint(&token);
        if let Some(stored) = self.kv.get(KEY_FINGERPRINT).await.map_err(store_err)? {
            if stored != actual {
                return Err(ControllerError::Validation(
                    "session fingerprint mismatch".into(),
                ));
            }
        }

        Ok(Some(Credential {
            token,
            issued_tenant: self.kv.get(KEY_ISSUED_TENANT).await.map_err(store_err)?,
            expires_at,
            fingerprint: actual,
        }))
    }

    pub async fn save(&self, credential: &Credential) -> Result<(), ControllerError> {
        let expiry = credential.expires_at.to_rfc3339();
        self.kv
            .set_many(&[
                (KEY_ACCESS_TOKEN, credential.token.as_str()),
                (KEY_TOKEN_EXPIRY, expiry.as_str()),
                (KEY_FINGERPRINT, credential.fingerprint.as_str()),
            ])
            .await
            .map_err(store_err)?;
        match &credential.issued_tenant {
            Some(t) => self.kv.set(KEY_ISSUED_TENANT, t).await.map_err(store_err),
            None => self.kv.remove(KEY_ISSUED_TENANT).await.map_err(store_err),
        }
    }

    pub async fn clear(&self) -> Result<(), ControllerError> {
        for key in [
            KEY_ACCESS_TOKEN,
            KEY_TOKEN_EXPIRY,
            KEY_FINGERPRINT,
            KEY_ISSUED_TENANT,
        ] {
            self.kv.remove(key).await.map_err(store_err)?;
        }
        Ok(())
    }

    pub async fn debug_enabled(&self) -> bool {
        matches!(
            self.kv.get(KEY_DEBUG_LOGGING).await,
            Ok(Some(v)) if v == "true"
        )
    }

    pub async fn set_debug(&self, on: bool) -> Result<(), ControllerError> {
        self.kv
            .set(KEY_DEBUG_LOGGING, if on { "true" } else { "false" })
            .await
            .map_err(store_err)
    }

    /// Raw access, mainly for tests that need to tamper with entries.
    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }
}
