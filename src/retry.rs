//! Retry with exponential backoff for remote calls.
//!
//! Every network-facing component funnels its calls through [`execute`] (or
//! [`execute_cancellable`]) with an explicit [`RetryPolicy`]. The executor only
//! ever re-invokes the whole operation; it never replays partial results.
//!
//! # Examples
//!
//! ```
//! use aura::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new()
//!     .with_max_attempts(3)
//!     .with_initial_delay(Duration::from_millis(100));
//! assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AuraError, Result};

/// Default total number of attempts (first call included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Default growth factor between consecutive delays.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
/// Default cap on a single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Status codes treated as transient when they appear in error text.
const TRANSIENT_STATUS_TOKENS: &[&str] = &["408", "429", "500", "502", "503", "504"];

/// Markers the remote service uses for quota exhaustion and unavailability.
const TRANSIENT_TEXT_MARKERS: &[&str] = &[
    "RESOURCE_EXHAUSTED",
    "UNAVAILABLE",
    "DEADLINE_EXCEEDED",
    "overloaded",
    "rate limit",
];

/// Predicate deciding whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&AuraError) -> bool + Send + Sync>;

/// Immutable retry configuration for one call site.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_multiplier: f64,
    max_delay: Duration,
    retriable: RetryPredicate,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
            retriable: Arc::new(is_transient_error),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default values and the transient-error predicate.
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Set the total number of attempts (clamped to at least one).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the delay before the first retry.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the cap applied to every computed delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Replace the retriable-error predicate.
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&AuraError) -> bool + Send + Sync + 'static,
    {
        self.retriable = Arc::new(predicate);
        self
    }

    /// Total number of attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether `error` should be retried under this policy.
    pub fn is_retriable(&self, error: &AuraError) -> bool {
        (self.retriable)(error)
    }

    /// Delay to wait after the failed attempt with zero-based index `attempt`.
    ///
    /// Formula: `min(initial_delay * multiplier^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let secs = self.initial_delay.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Default retriable-error predicate.
///
/// Matches [`AuraError::TransientRemote`] plus remote-sourced errors whose
/// text carries a rate-limit or availability signature. Empty payloads,
/// device failures, decode failures and closed sessions never match.
pub fn is_transient_error(error: &AuraError) -> bool {
    match error {
        AuraError::TransientRemote(_) => true,
        AuraError::PermanentRemote(text) | AuraError::Protocol(text) => {
            has_transient_signature(text)
        }
        _ => false,
    }
}

fn has_transient_signature(text: &str) -> bool {
    let status_match = text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| TRANSIENT_STATUS_TOKENS.contains(&token));
    if status_match {
        return true;
    }
    let lower = text.to_ascii_lowercase();
    TRANSIENT_TEXT_MARKERS
        .iter()
        .any(|marker| lower.contains(&marker.to_ascii_lowercase()))
}

/// Result of a remote call that distinguishes "succeeded with nothing" from
/// transport failure.
#[derive(Debug)]
pub enum RemoteOutcome<T> {
    /// The call returned usable data.
    Data(T),
    /// The call succeeded but the payload was empty or unusable.
    Empty,
    /// The call failed in transport or was rejected by the service.
    TransportError(AuraError),
}

impl<T> RemoteOutcome<T> {
    /// Convert into a `Result`, turning [`RemoteOutcome::Empty`] into an
    /// [`AuraError::EmptyPayload`] that names `what`.
    pub fn into_result(self, what: &str) -> Result<T> {
        match self {
            Self::Data(value) => Ok(value),
            Self::Empty => Err(AuraError::EmptyPayload(format!("{what} returned no data"))),
            Self::TransportError(e) => Err(e),
        }
    }
}

impl<T> From<Result<Option<T>>> for RemoteOutcome<T> {
    fn from(result: Result<Option<T>>) -> Self {
        match result {
            Ok(Some(value)) => Self::Data(value),
            Ok(None) => Self::Empty,
            Err(e) => Self::TransportError(e),
        }
    }
}

/// Run `operation` under `policy`.
///
/// # Errors
///
/// Non-retriable errors are returned unchanged as soon as they occur. When
/// every attempt fails with a retriable error, the last one is returned
/// wrapped in [`AuraError::RetriesExhausted`].
pub async fn execute<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    execute_cancellable(policy, &CancellationToken::new(), operation).await
}

/// Run `operation` under `policy`, aborting the backoff wait when `cancel`
/// fires.
///
/// # Errors
///
/// As [`execute`], plus [`AuraError::SessionClosed`] when cancelled before an
/// attempt or during a backoff delay. A cancelled wait never starts another
/// attempt.
pub async fn execute_cancellable<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(AuraError::SessionClosed(
                "operation cancelled before attempt".into(),
            ));
        }

        let error = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "remote call recovered after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let attempts_made = attempt + 1;
        if !policy.is_retriable(&error) {
            debug!(code = error.code(), error = %error, "non-retriable failure");
            return Err(error);
        }
        if attempts_made >= policy.max_attempts {
            warn!(attempts = attempts_made, error = %error, "retry budget exhausted");
            return Err(AuraError::RetriesExhausted {
                attempts: attempts_made,
                last: Box::new(error),
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            attempt = attempts_made,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retriable failure, backing off"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("retry backoff cancelled");
                return Err(AuraError::SessionClosed(
                    "operation cancelled during retry backoff".into(),
                ));
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}
