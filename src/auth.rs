//! Token lifecycle: caller-supplied token provider, cached current token,
//! proactive expiry checks and collapsed concurrent renewals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use secrecy::{ExposeSecret as _, SecretString};
use tracing::{debug, warn};

use crate::Result;

/// Tokens within this margin of expiry are renewed proactively rather than
/// presented to the server.
const EXPIRY_MARGIN_SECONDS: i64 = 30;

/// A credential issued by the auth service, scoped to a capability and
/// valid until `expires`.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Token {
    pub value: SecretString,
    pub capability: String,
    pub expires: DateTime<Utc>,
}

impl Token {
    #[must_use]
    pub fn new(
        value: impl Into<String>,
        capability: impl Into<String>,
        expires: DateTime<Utc>,
    ) -> Self {
        Self {
            value: SecretString::from(value.into()),
            capability: capability.into(),
            expires,
        }
    }

    /// Whether the token is expired or close enough to expiry that it
    /// should not be presented on a new connection.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.expires - now < ChronoDuration::seconds(EXPIRY_MARGIN_SECONDS)
    }
}

/// Issues tokens on demand. Implemented by the application, typically by
/// calling its own auth backend.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn request_token(&self, capability: &str) -> Result<Token>;
}

/// Cached token state shared between the connection task and callers.
///
/// Renewal is collapsed: when several callers race to renew, only one
/// provider request is made and the rest reuse its result.
pub struct Auth {
    provider: Arc<dyn TokenProvider>,
    capability: String,
    token: RwLock<Option<Token>>,
    renewal: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl Auth {
    pub fn new(provider: Arc<dyn TokenProvider>, capability: impl Into<String>) -> Self {
        Self {
            provider,
            capability: capability.into(),
            token: RwLock::new(None),
            renewal: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Snapshot of the current token, if one has been issued.
    pub fn current(&self) -> Option<Token> {
        self.token
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Return a fresh token value, renewing first if the cached one is
    /// missing or stale.
    pub async fn ensure_valid(&self) -> Result<String> {
        if let Some(token) = self.current()
            && !token.is_stale()
        {
            return Ok(token.value.expose_secret().to_owned());
        }
        self.renew().await
    }

    /// Request a new token from the provider and install it.
    ///
    /// Callers that observed the same stale token converge on a single
    /// provider request: the generation counter is read before taking the
    /// renewal lock and compared after, so late arrivals see the bump made
    /// by the winner and return the already-installed token.
    pub async fn renew(&self) -> Result<String> {
        let observed = self.generation.load(Ordering::Acquire);
        let _guard = self.renewal.lock().await;
        if self.generation.load(Ordering::Acquire) != observed
            && let Some(token) = self.current()
            && !token.is_stale()
        {
            return Ok(token.value.expose_secret().to_owned());
        }

        debug!(capability = %self.capability, "requesting token renewal");
        let token = self
            .provider
            .request_token(&self.capability)
            .await
            .inspect_err(|e| warn!(error = %e, "token renewal failed"))?;
        let value = token.value.expose_secret().to_owned();
        *self
            .token
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token);
        self.generation.fetch_add(1, Ordering::Release);
        Ok(value)
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("capability", &self.capability)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
