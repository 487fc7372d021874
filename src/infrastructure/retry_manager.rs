//! 재시도 관리자
//!
//! Exponential backoff with jitter applied to every oracle call, page
//! navigation and state flush. Only errors that classify themselves as
//! transient are retried; everything else is returned on the first attempt.

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Classification hook for errors that pass through [`RetryExecutor`]
pub trait RetryableError: std::error::Error + Send + Sync + 'static {
    /// Whether another attempt may succeed
    fn is_transient(&self) -> bool;

    /// Error produced when an attempt exceeds the per-attempt timeout
    fn timed_out(operation: &str, after: Duration) -> Self
    where
        Self: Sized;
}

/// 재시도 정책 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 최대 시도 횟수 (first attempt included)
    pub max_attempts: u32,
    /// 기본 지연 시간 (밀리초)
    pub base_delay_ms: u64,
    /// 최대 지연 시간 (밀리초)
    pub max_delay_ms: u64,
    /// 백오프 승수 (예: 2.0 = 배수 증가)
    pub backoff_multiplier: f64,
    /// 지터 범위 (밀리초)
    pub jitter_range_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        use crate::infrastructure::config::defaults;
        Self {
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
            backoff_multiplier: defaults::RETRY_BACKOFF_MULTIPLIER,
            jitter_range_ms: defaults::RETRY_JITTER_RANGE_MS,
        }
    }
}

impl RetryPolicy {
    /// Policy without any waiting between attempts
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
            jitter_range_ms: 0,
        }
    }

    /// Backoff before the attempt following `attempt` (1-based):
    /// `min(base * mult^(attempt-1), max) + jitter`
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let exponential = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if exponential.is_finite() {
            (exponential as u64).min(self.max_delay_ms)
        } else {
            self.max_delay_ms
        };

        let jitter = if self.jitter_range_ms > 0 {
            fastrand::u64(0..=self.jitter_range_ms)
        } else {
            0
        };

        Duration::from_millis(capped.saturating_add(jitter))
    }
}

/// Terminal outcome of a retried operation
#[derive(Error, Debug)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        last: E,
    },

    #[error("{operation} failed: {source}")]
    Permanent {
        operation: String,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[must_use]
    pub const fn inner(&self) -> &E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Permanent { source, .. } => source,
        }
    }

    #[must_use]
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Permanent { source, .. } => source,
        }
    }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Runs operations under a [`RetryPolicy`] with a per-attempt timeout
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl RetryExecutor {
    #[must_use]
    pub const fn new(policy: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            policy,
            attempt_timeout,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[must_use]
    pub const fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Starts an attempt sequence for call sites that need `&mut` access
    /// between attempts (see [`RetryAttempts::next`]).
    #[must_use]
    pub fn attempts(&self, operation: impl Into<String>) -> RetryAttempts<'_> {
        RetryAttempts {
            executor: self,
            operation: operation.into(),
            attempt: 0,
        }
    }

    /// Retries `op` until it succeeds, fails permanently or runs out of attempts
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
    {
        let mut attempts = self.attempts(operation);
        loop {
            if let ControlFlow::Break(outcome) = attempts.next(op()).await {
                return outcome;
            }
        }
    }
}

/// Attempt counter driving one retried operation.
///
/// ```ignore
/// let mut attempts = retry.attempts("add_to_cart");
/// let verdict = loop {
///     if let ControlFlow::Break(outcome) = attempts.next(oracle.try_add_to_cart(&variant, 3)).await {
///         break outcome;
///     }
/// };
/// ```
#[derive(Debug)]
pub struct RetryAttempts<'a> {
    executor: &'a RetryExecutor,
    operation: String,
    attempt: u32,
}

impl RetryAttempts<'_> {
    /// Attempts made so far
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Awaits one attempt. `Continue` means a transient failure was seen and
    /// the backoff has already elapsed; the caller should issue the next call.
    pub async fn next<T, E, Fut>(&mut self, call: Fut) -> ControlFlow<Result<T, RetryError<E>>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
    {
        self.attempt += 1;
        let timeout = self.executor.attempt_timeout;

        let outcome = match tokio::time::timeout(timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(E::timed_out(&self.operation, timeout)),
        };

        match outcome {
            Ok(value) => {
                if self.attempt > 1 {
                    debug!(operation = %self.operation, attempt = self.attempt, "✅ Succeeded after retry");
                }
                ControlFlow::Break(Ok(value))
            }
            Err(error) if !error.is_transient() => ControlFlow::Break(Err(RetryError::Permanent {
                operation: self.operation.clone(),
                source: error,
            })),
            Err(error) if self.attempt >= self.executor.policy.max_attempts.max(1) => {
                warn!(
                    operation = %self.operation,
                    attempts = self.attempt,
                    error = %error,
                    "❌ Retry budget exhausted"
                );
                ControlFlow::Break(Err(RetryError::Exhausted {
                    operation: self.operation.clone(),
                    attempts: self.attempt,
                    last: error,
                }))
            }
            Err(error) => {
                let delay = self.executor.policy.delay_for_attempt(self.attempt);
                warn!(
                    operation = %self.operation,
                    attempt = self.attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "🔄 Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                ControlFlow::Continue(())
            }
        }
    }
}
