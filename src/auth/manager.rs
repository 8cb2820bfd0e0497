//! Token lifecycle manager.
//!
//! Single owner of the cached credential. Everything else reads it through
//! [`TokenManager::get_valid_credential`].
//!
//! Acquisition order on a cache miss:
//! 1. silent with the canonical scopes (only if we held a credential before)
//! 2. silent with the management scope alone, when legacy fallback is on
//! 3. interactive with the canonical scopes
//!
//! Acquisitions are serialized by `acquire_lock` so concurrent callers never
//! open two sign-in windows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::authorize::{self, AuthorizeError, Prompt, TokenResponse};
use super::broker::{AuthorizationBroker, BrokerError};
use super::claims::{self, SessionContext};
use super::Credential;
use crate::activity::ActivityLog;
use crate::clock::Clock;
use crate::config::{Config, CANONICAL_SCOPES, MANAGEMENT_SCOPE};
use crate::errors::ControllerError;
use crate::store::CredentialStore;

pub struct TokenManager {
    config: Arc<Config>,
    store: CredentialStore,
    broker: Arc<dyn AuthorizationBroker>,
    clock: Arc<dyn Clock>,
    log: ActivityLog,
    http: reqwest::Client,
    current: RwLock<Option<Credential>>,
    session: RwLock<Option<SessionContext>>,
    /// Set once the current credential passed validation or came straight
    /// from the provider.
    validated: AtomicBool,
    acquire_lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(
        config: Arc<Config>,
        store: CredentialStore,
        broker: Arc<dyn AuthorizationBroker>,
        clock: Arc<dyn Clock>,
        log: ActivityLog,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            store,
            broker,
            clock,
            log,
            http,
            current: RwLock::new(None),
            session: RwLock::new(None),
            validated: AtomicBool::new(false),
            acquire_lock: Mutex::new(()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Current session labels, if signed in and the token decodes.
    pub async fn session_context(&self) -> Option<SessionContext> {
        self.session.read().await.clone()
    }

    /// The in-memory credential without any acquisition or validation.
    pub async fn peek(&self) -> Option<Credential> {
        self.current.read().await.clone()
    }

    fn usable(&self, cred: &Credential) -> bool {
        cred.is_usable(self.clock.now(), self.config.renewal_buffer())
    }

    /// Return a credential that is unexpired (outside the renewal buffer)
    /// and validated, acquiring a new one if needed.
    pub async fn get_valid_credential(&self) -> Result<Credential, ControllerError> {
        if self.validated.load(Ordering::Acquire) {
            if let Some(cred) = self.current.read().await.as_ref() {
                if self.usable(cred) {
                    return Ok(cred.clone());
                }
            }
        }

        let _guard = self.acquire_lock.lock().await;

        let had_credential = match self.cached_valid().await? {
            CacheOutcome::Hit(cred) => return Ok(cred),
            CacheOutcome::Stale => true,
            CacheOutcome::Empty => false,
        };

        if had_credential {
            if let Some(cred) = self.silent_inner().await {
                return Ok(cred);
            }
        }
        self.interactive_inner().await
    }

    /// Restore and validate a persisted session without prompting.
    /// Used at startup; returns `None` when the user has to sign in.
    pub async fn restore(&self) -> Result<Option<Credential>, ControllerError> {
        let _guard = self.acquire_lock.lock().await;
        match self.cached_valid().await? {
            CacheOutcome::Hit(cred) => Ok(Some(cred)),
            CacheOutcome::Stale | CacheOutcome::Empty => Ok(None),
        }
    }

    /// Look at memory, then the store. Runs the validation call on the
    /// first store hit of the session.
    async fn cached_valid(&self) -> Result<CacheOutcome, ControllerError> {
        let in_memory = self.current.read().await.clone();
        let candidate = match in_memory {
            Some(c) => Some(c),
            None => match self.store.load().await {
                Ok(c) => c,
                Err(ControllerError::Validation(reason)) => {
                    self.log
                        .debug(format!("Discarding cached credential: {}", reason));
                    self.discard().await?;
                    return Ok(CacheOutcome::Stale);
                }
                Err(e) => return Err(e),
            },
        };

        let Some(cred) = candidate else {
            return Ok(CacheOutcome::Empty);
        };

        if !self.usable(&cred) {
            self.log.debug(format!(
                "Cached token expires at {} (inside the renewal buffer); renewing",
                cred.expires_at.format("%H:%M:%S")
            ));
            return Ok(CacheOutcome::Stale);
        }

        if !self.validated.load(Ordering::Acquire) {
            if !self.still_accepted(&cred).await? {
                self.log.info("Cached session rejected by the control plane; signing in again");
                self.discard().await?;
                return Ok(CacheOutcome::Stale);
            }
            self.set_current(cred.clone()).await;
            self.validated.store(true, Ordering::Release);
            self.log.debug("Cached session validated");
        }

        Ok(CacheOutcome::Hit(cred))
    }

    /// Lightweight read-only call to confirm the token is still accepted.
    async fn still_accepted(&self, cred: &Credential) -> Result<bool, ControllerError> {
        let url = format!(
            "{}/subscriptions?api-version={}",
            self.config.arm_base_url, self.config.subscriptions_api_version
        );
        let resp = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, cred.bearer())
            .send()
            .await?;
        Ok(resp.status().is_success())
    }

    /// One silent attempt. Never fails: `None` means "ask the user".
    ///
    /// `rejected` is the fingerprint of the credential the caller just saw
    /// refused. If another caller already replaced it while this one waited
    /// for the lock, the replacement is returned without a new attempt.
    pub async fn renew_silently(&self, rejected: Option<&str>) -> Option<Credential> {
        let _guard = self.acquire_lock.lock().await;
        if let Some(cred) = self.replaced_since(rejected).await {
            return Some(cred);
        }
        self.silent_inner().await
    }

    /// Interactive sign-in. Errors are terminal for the calling operation.
    /// `rejected` works as in [`renew_silently`](Self::renew_silently).
    pub async fn acquire_interactive(
        &self,
        rejected: Option<&str>,
    ) -> Result<Credential, ControllerError> {
        let _guard = self.acquire_lock.lock().await;
        if let Some(cred) = self.replaced_since(rejected).await {
            return Ok(cred);
        }
        self.interactive_inner().await
    }

    /// The current credential, if it is usable and is not the rejected one.
    async fn replaced_since(&self, rejected: Option<&str>) -> Option<Credential> {
        let rejected = rejected?;
        let current = self.current.read().await.clone()?;
        (current.fingerprint != rejected && self.usable(&current)).then_some(current)
    }

    async fn silent_inner(&self) -> Option<Credential> {
        if let Some(cred) = self.silent_with(CANONICAL_SCOPES).await {
            return Some(cred);
        }
        if self.config.legacy_scope_fallback {
            self.log
                .debug("Silent renewal failed; retrying with the management scope only");
            return self.silent_with(MANAGEMENT_SCOPE).await;
        }
        None
    }

    async fn silent_with(&self, scopes: &str) -> Option<Credential> {
        let request = match authorize::build(&self.config, scopes, Prompt::None) {
            Ok(r) => r,
            Err(e) => {
                self.log.debug(format!("Silent renewal not attempted: {}", e));
                return None;
            }
        };

        let redirect = match self.broker.authorize(&request).await {
            Ok(r) => r,
            Err(BrokerError::SilentUnavailable) => {
                self.log.debug("Silent renewal unavailable");
                return None;
            }
            Err(e) => {
                self.log.debug(format!("Silent renewal failed: {}", e));
                return None;
            }
        };

        match request.complete(&redirect) {
            Ok(resp) => match self.install(resp).await {
                Ok(cred) => {
                    self.log.debug("Token renewed silently");
                    Some(cred)
                }
                Err(e) => {
                    self.log.debug(format!("Could not persist renewed token: {}", e));
                    None
                }
            },
            Err(AuthorizeError::InteractionRequired) => {
                self.log.debug("Silent renewal needs user interaction");
                None
            }
            Err(e) => {
                self.log.debug(format!("Silent renewal rejected: {}", e));
                None
            }
        }
    }

    async fn interactive_inner(&self) -> Result<Credential, ControllerError> {
        let request = authorize::build(&self.config, CANONICAL_SCOPES, Prompt::SelectAccount)
            .map_err(|e| ControllerError::Authentication(e.to_string()))?;

        self.log.info("Waiting for interactive sign-in");
        let redirect = self
            .broker
            .authorize(&request)
            .await
            .map_err(|e| ControllerError::Authentication(e.to_string()))?;

        let resp = request.complete(&redirect).map_err(|e| match e {
            AuthorizeError::Csrf => {
                ControllerError::Authentication("state mismatch (possible CSRF)".into())
            }
            other => ControllerError::Authentication(other.to_string()),
        })?;

        let cred = self.install(resp).await?;
        match self.session_context().await {
            Some(ctx) => self.log.success(format!(
                "Signed in as {}",
                ctx.principal_name
                    .or(ctx.display_name)
                    .unwrap_or_else(|| "unknown user".into())
            )),
            None => self.log.success("Signed in"),
        }
        Ok(cred)
    }

    /// Persist a provider response and make it current.
    async fn install(&self, resp: TokenResponse) -> Result<Credential, ControllerError> {
        let ctx = claims::session_context(&resp.access_token);
        let tenant = ctx.as_ref().and_then(|c| c.tenant_id.clone());
        let cred = Credential::issue(resp.access_token, resp.expires_in, tenant, self.clock.now());
        self.store.save(&cred).await?;
        self.set_current(cred.clone()).await;
        self.validated.store(true, Ordering::Release);
        Ok(cred)
    }

    async fn set_current(&self, cred: Credential) {
        let ctx = claims::session_context(&cred.token);
        *self.current.write().await = Some(cred);
        *self.session.write().await = ctx;
    }

    async fn discard(&self) -> Result<(), ControllerError> {
        self.validated.store(false, Ordering::Release);
        *self.current.write().await = None;
        *self.session.write().await = None;
        self.store.clear().await
    }

    /// Called by the renewal job. Renews silently when the remaining
    /// lifetime is below the threshold but not yet zero.
    /// Returns whether a renewal happened.
    pub async fn proactive_renew(&self) -> bool {
        let Some(cred) = self.peek().await else {
            return false;
        };
        let remaining = cred.remaining(self.clock.now());
        if remaining <= chrono::Duration::zero() || remaining >= self.config.renewal_threshold() {
            return false;
        }

        self.log.debug(format!(
            "Token expires in {} min; renewing in the background",
            remaining.num_minutes()
        ));
        match self.renew_silently(Some(&cred.fingerprint)).await {
            Some(_) => {
                self.log.debug("Background token renewal succeeded");
                true
            }
            None => {
                tracing::warn!("background token renewal failed; will retry next tick");
                false
            }
        }
    }

    /// Forget the credential locally. The provider session is left alone.
    pub async fn logout(&self) -> Result<(), ControllerError> {
        let _guard = self.acquire_lock.lock().await;
        self.discard().await?;
        self.log.info("Signed out");
        Ok(())
    }
}

enum CacheOutcome {
    Hit(Credential),
    /// Something was cached but is unusable; a provider session may exist.
    Stale,
    Empty,
}
