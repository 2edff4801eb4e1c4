//! Credential manager.
//!
//! Acquires an access token from a [`TokenSource`] at startup, derives the
//! worker-facing [`Identity`] from it and keeps it fresh with a background
//! refresh task. The current identity is published on a `tokio::sync::watch`
//! channel; the supervisor subscribes and relays every change to its workers.
//!
//! Without a configured source the manager hands out the fixed placeholder
//! identity and never refreshes.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use taskhost_types::config::CredentialSettings;
use taskhost_types::error::CredentialError;
use taskhost_types::identity::Identity;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;

/// Lifetime assumed for tokens issued without `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

/// Consecutive refresh failures logged at WARN before escalating to ERROR.
const REFRESH_WARN_LIMIT: u32 = 2;

// ---------------------------------------------------------------------------
// Token set
// ---------------------------------------------------------------------------

/// Tokens issued by the identity provider. Never handed to workers.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenSet {
    /// Build a token set from a token response received at `now`.
    pub fn from_response(
        access_token: String,
        refresh_token: Option<String>,
        expires_in: Option<u64>,
        now: DateTime<Utc>,
    ) -> Self {
        let expires_at = expires_in
            .and_then(|secs| chrono::Duration::try_seconds(secs.min(i64::MAX as u64) as i64))
            .and_then(|lifetime| now.checked_add_signed(lifetime));

        Self {
            access_token: SecretString::from(access_token),
            refresh_token: refresh_token.map(SecretString::from),
            expires_at,
        }
    }
}

/// Decode the access token's claims (without verifying the signature) and
/// build the worker identity from the `sub` claim.
pub fn derive_identity(tokens: &TokenSet) -> Result<Identity, CredentialError> {
    let token = tokens.access_token.expose_secret();

    let mut parts = token.split('.');
    let claims_segment = match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(claims), Some(_)) if !claims.is_empty() => claims,
        _ => {
            return Err(CredentialError::InvalidToken(
                "expected three dot-separated segments".to_string(),
            ));
        }
    };

    let raw = URL_SAFE_NO_PAD
        .decode(claims_segment.trim_end_matches('='))
        .map_err(|e| CredentialError::InvalidToken(format!("claims are not base64url: {e}")))?;

    let claims: serde_json::Value = serde_json::from_slice(&raw)
        .map_err(|e| CredentialError::InvalidToken(format!("claims are not JSON: {e}")))?;

    let subject = claims
        .get("sub")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CredentialError::InvalidToken("missing `sub` claim".to_string()))?;

    Ok(Identity::new(token, subject))
}

/// How long to wait before refreshing `tokens`: the remaining lifetime at
/// `now` scaled by `fraction`. Expired tokens refresh immediately.
pub fn refresh_delay(tokens: &TokenSet, now: DateTime<Utc>, fraction: f64) -> Duration {
    let remaining = match tokens.expires_at {
        Some(expires_at) => (expires_at - now).to_std().unwrap_or(Duration::ZERO),
        None => DEFAULT_TOKEN_LIFETIME,
    };

    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        1.0
    };
    remaining.mul_f64(fraction)
}

// ---------------------------------------------------------------------------
// Token source
// ---------------------------------------------------------------------------

/// Issues tokens via the client-credentials grant.
pub trait TokenSource: Send + Sync {
    fn fetch(&self) -> impl Future<Output = Result<TokenSet, CredentialError>> + Send;
}

type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<TokenSet, CredentialError>> + Send + 'a>>;

/// Object-safe version of [`TokenSource`] with boxed futures.
trait TokenSourceDyn: Send + Sync {
    fn fetch_boxed(&self) -> FetchFuture<'_>;
}

impl<T: TokenSource> TokenSourceDyn for T {
    fn fetch_boxed(&self) -> FetchFuture<'_> {
        Box::pin(self.fetch())
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct RefreshTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the current identity and the refresh cycle.
pub struct CredentialManager {
    source: Option<Arc<dyn TokenSourceDyn>>,
    settings: CredentialSettings,
    identity: Arc<watch::Sender<Identity>>,
    refresh: Mutex<Option<RefreshTask>>,
}

impl CredentialManager {
    /// Manager without an identity provider. Workers get the placeholder identity.
    pub fn without_provider(settings: CredentialSettings) -> Self {
        Self::build(None, settings)
    }

    /// Manager that fetches tokens from `source`.
    pub fn with_source<T: TokenSource + 'static>(source: T, settings: CredentialSettings) -> Self {
        Self::build(Some(Arc::new(source)), settings)
    }

    fn build(source: Option<Arc<dyn TokenSourceDyn>>, settings: CredentialSettings) -> Self {
        let (tx, _rx) = watch::channel(Identity::placeholder());
        Self {
            source,
            settings,
            identity: Arc::new(tx),
            refresh: Mutex::new(None),
        }
    }

    pub fn has_provider(&self) -> bool {
        self.source.is_some()
    }

    /// Acquire the first identity.
    ///
    /// Returns the placeholder when no provider is configured. Otherwise
    /// retries with exponential backoff and fails with
    /// [`CredentialError::Exhausted`] once the attempts are used up.
    pub async fn acquire_initial(&self) -> Result<(Identity, Option<TokenSet>), CredentialError> {
        let Some(source) = &self.source else {
            tracing::info!("no identity provider configured, using placeholder identity");
            return Ok((Identity::placeholder(), None));
        };

        let max_attempts = self.settings.initial_max_attempts.max(1);
        let backoff = BackoffPolicy::doubling(
            Duration::from_millis(self.settings.initial_base_delay_ms),
            Duration::from_millis(self.settings.initial_max_delay_ms),
        );

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            let result = source
                .fetch_boxed()
                .await
                .and_then(|tokens| derive_identity(&tokens).map(|identity| (identity, tokens)));

            match result {
                Ok((identity, tokens)) => {
                    tracing::info!(user_id = %identity.user_id, attempt, "acquired credentials");
                    return Ok((identity, Some(tokens)));
                }
                Err(e) => {
                    tracing::warn!(attempt, max_attempts, error = %e, "credential acquisition failed");
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        tokio::time::sleep(backoff.next(attempt - 1)).await;
                    }
                }
            }
        }

        Err(CredentialError::Exhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Acquire credentials, publish them and start the refresh cycle when a
    /// token set was issued.
    pub async fn bootstrap(&self) -> Result<Identity, CredentialError> {
        let (identity, tokens) = self.acquire_initial().await?;
        self.broadcast(identity.clone());
        if let Some(tokens) = tokens {
            self.start_refresh_cycle(tokens);
        }
        Ok(identity)
    }

    /// Start the background refresh task. No-op while one is already running
    /// or when no provider is configured.
    pub fn start_refresh_cycle(&self, tokens: TokenSet) {
        let Some(source) = self.source.clone() else {
            return;
        };

        let mut guard = match self.refresh.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            tracing::debug!("refresh cycle already active");
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_refresh_cycle(
            source,
            self.settings.clone(),
            Arc::clone(&self.identity),
            tokens,
            cancel.clone(),
        ));
        *guard = Some(RefreshTask { cancel, handle });
    }

    pub fn is_refresh_active(&self) -> bool {
        let guard = match self.refresh.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .as_ref()
            .is_some_and(|task| !task.cancel.is_cancelled() && !task.handle.is_finished())
    }

    pub fn current_identity(&self) -> Identity {
        self.identity.borrow().clone()
    }

    /// Receiver that observes every published identity.
    pub fn subscribe(&self) -> watch::Receiver<Identity> {
        self.identity.subscribe()
    }

    /// Publish a new identity to all subscribers.
    pub fn broadcast(&self, identity: Identity) {
        self.identity.send_replace(identity);
    }

    /// Cancel the refresh cycle.
    pub fn shutdown(&self) {
        let task = match self.refresh.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.cancel.cancel();
            tracing::debug!("refresh cycle cancelled");
        }
    }
}

impl Drop for CredentialManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_refresh_cycle(
    source: Arc<dyn TokenSourceDyn>,
    settings: CredentialSettings,
    identity: Arc<watch::Sender<Identity>>,
    tokens: TokenSet,
    cancel: CancellationToken,
) {
    let retry = BackoffPolicy::doubling(
        Duration::from_millis(settings.refresh_retry_base_ms),
        Duration::from_millis(settings.refresh_retry_max_ms),
    );
    let mut delay = refresh_delay(&tokens, Utc::now(), settings.refresh_fraction);
    let mut failures: u32 = 0;

    loop {
        tracing::debug!(delay_ms = delay.as_millis() as u64, "next credential refresh scheduled");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let result = source
            .fetch_boxed()
            .await
            .and_then(|tokens| derive_identity(&tokens).map(|identity| (identity, tokens)));

        match result {
            Ok((next, tokens)) => {
                if failures > 0 {
                    tracing::info!(failures, "credential refresh recovered");
                }
                failures = 0;
                tracing::info!(user_id = %next.user_id, "credentials refreshed");
                identity.send_replace(next);
                delay = refresh_delay(&tokens, Utc::now(), settings.refresh_fraction);
            }
            Err(e) => {
                failures += 1;
                delay = retry.next(failures - 1);
                if failures <= REFRESH_WARN_LIMIT {
                    tracing::warn!(attempt = failures, retry_in_ms = delay.as_millis() as u64, error = %e, "credential refresh failed");
                } else {
                    tracing::error!(attempt = failures, retry_in_ms = delay.as_millis() as u64, error = %e, "credential refresh keeps failing, workers use the last known identity");
                }
            }
        }
    }
}
