//! Wait - Poll a remote condition until it converges
//!
//! AWS applies many changes asynchronously: a certificate is requested and
//! issued later, a domain keeps "processing" for minutes after an update.
//! `ConvergencePoller` re-checks a caller-supplied condition at a fixed
//! interval until it holds, the policy's ceiling is reached, or the caller
//! cancels.
//!
//! The clock is injectable so that tests never depend on wall-clock time.

use std::future::Future;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::provider::BoxFuture;

/// How long to wait and how often to check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Ceiling on the total wait (seconds when serialized, fractions allowed)
    #[serde(with = "secs")]
    pub max_wait: Duration,
    /// Pause between two checks (seconds when serialized, fractions allowed)
    #[serde(with = "secs")]
    pub interval: Duration,
    /// Whether an interactive caller should offer to keep waiting on timeout.
    /// The poller itself never prompts.
    #[serde(default)]
    pub prompt_on_timeout: bool,
}

impl PollPolicy {
    pub fn new(max_wait: Duration, interval: Duration) -> Self {
        Self {
            max_wait,
            interval,
            prompt_on_timeout: false,
        }
    }

    pub fn with_prompt_on_timeout(mut self, prompt: bool) -> Self {
        self.prompt_on_timeout = prompt;
        self
    }

    /// Check that the policy can be polled without spinning
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.interval.is_zero() {
            return Err("interval must be greater than zero");
        }
        if self.interval > self.max_wait {
            return Err("interval must not exceed max_wait");
        }
        Ok(())
    }
}

mod secs {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    // Whole seconds stay integers; sub-second values become fractional seconds
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.subsec_nanos() == 0 {
            serializer.serialize_u64(value.as_secs())
        } else {
            serializer.serialize_f64(value.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| D::Error::custom(format!("invalid duration {}: {}", secs, e)))
    }
}

/// Source of time for the poller
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Suspend the caller without consuming CPU
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()>;
}

/// Clock backed by the tokio timer (honours paused time in tests)
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Sending half of a cancellation signal
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel every wait observing a token from this handle
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Never resolves if the handle is dropped
    /// without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Create a connected cancellation handle and token
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Error a condition can report
#[derive(Debug)]
pub enum ConditionError<E> {
    /// The remote resource is not visible yet; treated as "not converged"
    NotYetAvailable,
    /// Anything else; aborts the wait
    Failed(E),
}

impl<E> From<E> for ConditionError<E> {
    fn from(error: E) -> Self {
        ConditionError::Failed(error)
    }
}

/// The policy ceiling was reached before the condition held
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "condition not met within {:?} ({checks} checks, {elapsed:?} elapsed)",
    .policy.max_wait
)]
pub struct PollTimeoutError {
    pub elapsed: Duration,
    pub checks: u32,
    pub policy: PollPolicy,
}

/// Errors returned by `ConvergencePoller::wait_until`
#[derive(Debug, Error)]
pub enum PollError<E> {
    #[error(transparent)]
    TimedOut(#[from] PollTimeoutError),

    #[error("wait cancelled after {elapsed:?} ({checks} checks)")]
    Cancelled { elapsed: Duration, checks: u32 },

    #[error("invalid poll policy: {0}")]
    InvalidPolicy(&'static str),

    /// Error raised by the condition, unchanged
    #[error(transparent)]
    Failed(E),
}

impl<E> PollError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::TimedOut(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PollError::Cancelled { .. })
    }
}

/// Successful end of a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Converged {
    /// Number of times the condition was invoked
    pub checks: u32,
    pub elapsed: Duration,
}

/// Fixed-interval poller with timeout and cooperative cancellation
#[derive(Debug, Clone, Default)]
pub struct ConvergencePoller<C = TokioClock> {
    clock: C,
    cancel: Option<CancelToken>,
}

impl ConvergencePoller<TokioClock> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C: Clock> ConvergencePoller<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            cancel: None,
        }
    }

    /// Abort waits when `token` is cancelled
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Invoke `condition` until it returns `Ok(true)`
    ///
    /// The condition is checked immediately, then after every `interval`.
    /// The last pause is shortened so the final check lands on `max_wait`.
    pub async fn wait_until<F, Fut, E>(
        &self,
        policy: &PollPolicy,
        mut condition: F,
    ) -> Result<Converged, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, ConditionError<E>>>,
    {
        policy.validate().map_err(PollError::InvalidPolicy)?;

        let start = self.clock.now();
        let mut checks = 0u32;

        loop {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                return Err(self.cancelled(start, checks));
            }

            checks += 1;
            match condition().await {
                Ok(true) => {
                    let elapsed = self.elapsed_since(start);
                    info!("converged after {} checks ({:?})", checks, elapsed);
                    return Ok(Converged { checks, elapsed });
                }
                Ok(false) => debug!("check {}: not converged", checks),
                Err(ConditionError::NotYetAvailable) => {
                    debug!("check {}: resource not available yet", checks)
                }
                Err(ConditionError::Failed(e)) => return Err(PollError::Failed(e)),
            }

            let elapsed = self.elapsed_since(start);
            if elapsed >= policy.max_wait {
                warn!(
                    "gave up after {} checks ({:?}, limit {:?})",
                    checks, elapsed, policy.max_wait
                );
                return Err(PollTimeoutError {
                    elapsed,
                    checks,
                    policy: policy.clone(),
                }
                .into());
            }

            let pause = policy.interval.min(policy.max_wait - elapsed);
            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(self.cancelled(start, checks)),
                        _ = self.clock.sleep(pause) => {}
                    }
                }
                None => self.clock.sleep(pause).await,
            }
        }
    }

    fn elapsed_since(&self, start: Instant) -> Duration {
        self.clock.now().saturating_duration_since(start)
    }

    fn cancelled<E>(&self, start: Instant, checks: u32) -> PollError<E> {
        let elapsed = self.elapsed_since(start);
        warn!("wait cancelled after {} checks ({:?})", checks, elapsed);
        PollError::Cancelled { elapsed, checks }
    }
}
