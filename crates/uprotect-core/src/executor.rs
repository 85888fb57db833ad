// ── Resilient request executor ──
//
// Every authenticated request goes through here. The executor injects the
// session's tokens, follows CSRF rotation, re-logs in once when the
// controller rejects the session (shared by all callers that saw the same
// rejection) and guards the controller with a consecutive-failure circuit
// breaker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uprotect_api::{ApiRequest, ApiResponse};

use crate::config::RetryPolicy;
use crate::error::CoreError;
use crate::session::Session;

// ── CircuitBreaker ───────────────────────────────────────────────────

/// Consecutive-failure breaker with a cooldown.
#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    policy: RetryPolicy,
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
            last_success: None,
            opened_at: None,
        }
    }

    /// Fail fast while the circuit is open; close it once the cooldown has
    /// elapsed.
    pub(crate) fn check(&mut self, now: Instant) -> Result<(), CoreError> {
        let Some(opened_at) = self.opened_at else {
            return Ok(());
        };

        let elapsed = now.saturating_duration_since(opened_at);
        if elapsed < self.policy.cooldown {
            let remaining = self.policy.cooldown.saturating_sub(elapsed);
            return Err(CoreError::CircuitOpen {
                failures: self.consecutive_failures,
                retry_in_secs: remaining.as_secs(),
            });
        }

        info!("circuit breaker cooldown elapsed, resuming requests");
        self.opened_at = None;
        self.consecutive_failures = 0;
        Ok(())
    }

    pub(crate) fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            info!(
                failures = self.consecutive_failures,
                "controller reachable again"
            );
        }
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.last_success = Some(Utc::now());
    }

    pub(crate) fn record_failure(&mut self, now: Instant, err: &CoreError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures == 1 {
            warn!(error = %err, "controller request failed");
        }

        if self.opened_at.is_none() && self.consecutive_failures >= self.policy.failure_threshold
        {
            error!(
                failures = self.consecutive_failures,
                cooldown_secs = self.policy.cooldown.as_secs(),
                "too many consecutive failures, opening circuit"
            );
            self.opened_at = Some(now);
        }
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub(crate) fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    pub(crate) fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }
}

// ── Executor ─────────────────────────────────────────────────────────

/// Runs requests against the session's controller.
pub struct Executor {
    session: Arc<Session>,
    breaker: Mutex<CircuitBreaker>,
    /// Last failed re-login and the epoch it tried to replace.
    relogin: tokio::sync::Mutex<Option<(u64, CoreError)>>,
    /// Completed re-login attempts.
    relogin_attempts: AtomicU64,
}

impl Executor {
    pub fn new(session: Arc<Session>, policy: RetryPolicy) -> Self {
        Self {
            session,
            breaker: Mutex::new(CircuitBreaker::new(policy)),
            relogin: tokio::sync::Mutex::new(None),
            relogin_attempts: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Consecutive failed requests since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.with_breaker(|b| b.consecutive_failures())
    }

    /// When the last request succeeded.
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.with_breaker(|b| b.last_success())
    }

    pub fn is_circuit_open(&self) -> bool {
        self.with_breaker(|b| b.is_open())
    }

    fn with_breaker<R>(&self, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut breaker = self.breaker.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut breaker)
    }

    /// Execute `request` with the current session tokens.
    ///
    /// Fails with [`CoreError::NotAuthenticated`] before any I/O when no
    /// login has succeeded, and with [`CoreError::CircuitOpen`] while the
    /// breaker is open.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, CoreError> {
        let state = self.session.load();
        let Some(tokens) = state.tokens() else {
            return Err(CoreError::NotAuthenticated);
        };

        self.with_breaker(|b| b.check(Instant::now()))?;

        let attempts = self.relogin_attempts.load(Ordering::Acquire);
        match state.client().send(request, Some(tokens)).await {
            Ok(response) => Ok(self.succeeded(state.auth_epoch(), response)),
            Err(e) if e.is_auth_rejected() => {
                debug!(url = %request.url, "session rejected, re-authenticating");
                self.relogin(state.auth_epoch(), attempts).await?;
                self.retry(request).await
            }
            Err(e) => Err(self.failed(e.into())),
        }
    }

    /// Second and final attempt after a re-login.
    async fn retry(&self, request: &ApiRequest) -> Result<ApiResponse, CoreError> {
        let state = self.session.load();
        let Some(tokens) = state.tokens() else {
            return Err(CoreError::NotAuthenticated);
        };

        match state.client().send(request, Some(tokens)).await {
            Ok(response) => Ok(self.succeeded(state.auth_epoch(), response)),
            Err(e) if e.is_auth_rejected() => {
                warn!(url = %request.url, "controller rejected fresh session");
                Err(CoreError::AuthenticationFailed {
                    message: "request rejected after re-authentication".into(),
                })
            }
            Err(e) => Err(self.failed(e.into())),
        }
    }

    /// Log in again with the stored credentials, unless a concurrent caller
    /// already replaced the tokens that were rejected at `rejected_epoch`.
    ///
    /// `attempts_before` is the attempt count read before the rejected
    /// request was sent. If an attempt for the same epoch finished since then
    /// and failed, its error is returned without logging in again.
    async fn relogin(&self, rejected_epoch: u64, attempts_before: u64) -> Result<(), CoreError> {
        let mut last_failure = self.relogin.lock().await;

        let state = self.session.load();
        if state.auth_epoch() != rejected_epoch {
            debug!("session already refreshed by another request");
            return Ok(());
        }
        let attempted = self.relogin_attempts.load(Ordering::Acquire) != attempts_before;
        if let Some((_, err)) = last_failure
            .as_ref()
            .filter(|(epoch, _)| attempted && *epoch == rejected_epoch)
        {
            debug!(error = %err, "sharing failed re-authentication");
            return Err(err.clone());
        }
        let Some(credentials) = state.credentials() else {
            return Err(CoreError::NotAuthenticated);
        };

        info!("session expired, logging in again");
        let outcome = match state
            .client()
            .login(&credentials.username, &credentials.password)
            .await
        {
            Ok(tokens) => {
                self.session.refresh_tokens(rejected_epoch, tokens);
                Ok(())
            }
            Err(e) if e.is_transient() => Err(self.failed(e.into())),
            Err(e) => {
                warn!(error = %e, "re-authentication failed");
                Err(e.into())
            }
        };

        *last_failure = outcome
            .as_ref()
            .err()
            .map(|err| (rejected_epoch, err.clone()));
        self.relogin_attempts.fetch_add(1, Ordering::Release);
        outcome
    }

    fn succeeded(&self, epoch: u64, response: ApiResponse) -> ApiResponse {
        self.with_breaker(CircuitBreaker::record_success);
        if let Some(csrf) = self
            .session
            .load()
            .client()
            .token_headers()
            .rotated_csrf(&response.headers)
        {
            self.session.rotate_csrf(epoch, &csrf);
        }
        response
    }

    fn failed(&self, err: CoreError) -> CoreError {
        if err.is_transport() {
            self.with_breaker(|b| b.record_failure(Instant::now(), &err));
        }
        err
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("session", &self.session)
            .field("consecutive_failures", &self.consecutive_failures())
            .finish_non_exhaustive()
    }
}
