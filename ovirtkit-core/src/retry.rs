//! Composable retry policies and the engine that interprets them.
//!
//! Every network call in ovirtkit runs through [`retry`]. A call is described by
//! a list of [`RetryStrategy`] values; the engine evaluates all of them after
//! each failed attempt and stops on success, on a permanent error, or as soon
//! as any terminating strategy says so.

use crate::error::{ClientError, ErrorCode, Result};
use std::future::{Future, poll_fn};
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound for a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delay used between attempts when no delay strategy is given.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

/// Appended to strategy sets that could otherwise retry forever.
pub const FALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub enum RetryStrategy {
    /// Give up once this many attempts have failed.
    MaxAttempts(u32),
    /// Wait `base * 2^(attempt - 1)` between attempts, capped at [`MAX_BACKOFF`].
    ExponentialBackoff(Duration),
    /// Wait a constant interval between attempts.
    FixedDelay(Duration),
    /// Give up once this much time has passed since the first attempt.
    WallClockTimeout(Duration),
    /// Give up as soon as the token is cancelled.
    Cancellation(CancellationToken),
    /// Fail a single attempt with [`ErrorCode::Timeout`] if it runs longer than this.
    AttemptTimeout(Duration),
}

/// Strategies used when a caller passes an empty set.
pub fn default_strategies() -> Vec<RetryStrategy> {
    vec![
        RetryStrategy::ExponentialBackoff(Duration::from_secs(1)),
        RetryStrategy::MaxAttempts(3),
        RetryStrategy::WallClockTimeout(Duration::from_secs(60)),
    ]
}

#[derive(Debug)]
enum StopReason {
    Attempts(u32),
    Deadline(Duration),
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Attempts(n) => write!(f, "maximum of {n} attempts reached"),
            StopReason::Deadline(d) => write!(f, "timeout of {d:?} exceeded"),
            StopReason::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

/// The strategy list folded into the limits that apply to one call.
///
/// When a variant appears more than once the tightest limit wins, and the
/// longest delay wins.
struct Plan {
    max_attempts: Option<u32>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    backoff: Option<Duration>,
    fixed: Option<Duration>,
    attempt_timeout: Option<Duration>,
    tokens: Vec<CancellationToken>,
}

impl Plan {
    fn new(strategies: &[RetryStrategy], started: Instant) -> Self {
        let defaults;
        let strategies = if strategies.is_empty() {
            defaults = default_strategies();
            defaults.as_slice()
        } else {
            strategies
        };

        let mut plan = Plan {
            max_attempts: None,
            timeout: None,
            deadline: None,
            backoff: None,
            fixed: None,
            attempt_timeout: None,
            tokens: Vec::new(),
        };

        for strategy in strategies {
            match strategy {
                RetryStrategy::MaxAttempts(n) => {
                    let n = (*n).max(1);
                    plan.max_attempts = Some(plan.max_attempts.map_or(n, |m| m.min(n)));
                }
                RetryStrategy::ExponentialBackoff(base) => {
                    plan.backoff = Some(plan.backoff.map_or(*base, |b| b.max(*base)));
                }
                RetryStrategy::FixedDelay(delay) => {
                    plan.fixed = Some(plan.fixed.map_or(*delay, |d| d.max(*delay)));
                }
                RetryStrategy::WallClockTimeout(limit) => {
                    plan.timeout = Some(plan.timeout.map_or(*limit, |t| t.min(*limit)));
                }
                RetryStrategy::Cancellation(token) => plan.tokens.push(token.clone()),
                RetryStrategy::AttemptTimeout(limit) => {
                    plan.attempt_timeout =
                        Some(plan.attempt_timeout.map_or(*limit, |t| t.min(*limit)));
                }
            }
        }

        if plan.max_attempts.is_none() && plan.timeout.is_none() {
            plan.timeout = Some(FALLBACK_TIMEOUT);
        }
        plan.deadline = plan.timeout.map(|t| started + t);
        plan
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.backoff.map(|base| {
            let factor = 1u32 << attempt.saturating_sub(1).min(20);
            base.saturating_mul(factor).min(MAX_BACKOFF)
        });
        match (exponential, self.fixed) {
            (Some(e), Some(f)) => e.max(f),
            (Some(e), None) => e,
            (None, Some(f)) => f,
            (None, None) => DEFAULT_DELAY,
        }
    }

    fn stop_reason(&self, attempts: u32) -> Option<StopReason> {
        if self.tokens.iter().any(CancellationToken::is_cancelled) {
            return Some(StopReason::Cancelled);
        }
        if let Some(max) = self.max_attempts {
            if attempts >= max {
                return Some(StopReason::Attempts(max));
            }
        }
        if let (Some(deadline), Some(timeout)) = (self.deadline, self.timeout) {
            if Instant::now() >= deadline {
                return Some(StopReason::Deadline(timeout));
            }
        }
        None
    }

    /// Sleeps for `delay`, waking early on the deadline or a cancellation.
    async fn wait(&self, delay: Duration) {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = deadline => {}
            _ = any_cancelled(&self.tokens) => {}
        }
    }
}

async fn any_cancelled(tokens: &[CancellationToken]) {
    if tokens.is_empty() {
        return std::future::pending().await;
    }
    let mut waits: Vec<Pin<Box<_>>> = tokens.iter().map(|t| Box::pin(t.cancelled())).collect();
    poll_fn(|cx| {
        for wait in waits.iter_mut() {
            if wait.as_mut().poll(cx).is_ready() {
                return Poll::Ready(());
            }
        }
        Poll::Pending
    })
    .await
}

/// Runs `action` until it succeeds, fails permanently, or the strategies are exhausted.
///
/// The action runs at least once. Exhaustion is reported as an
/// [`ErrorCode::Timeout`] error wrapping the last failure.
pub async fn retry<T, F, Fut>(
    description: &str,
    strategies: &[RetryStrategy],
    mut action: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let plan = Plan::new(strategies, Instant::now());
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let outcome = match plan.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, action()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ClientError::new(
                    ErrorCode::Timeout,
                    format!("attempt {attempt} did not finish within {limit:?}"),
                )),
            },
            None => action().await,
        };

        let err = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "{description}: succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) => err.classified(),
        };

        if err.is_permanent() {
            let code = err.code();
            debug!(attempt, code = %code, "{description}: permanent failure, not retrying");
            return Err(ClientError::wrap(err, code, format!("failed to {description}")));
        }

        if let Some(reason) = plan.stop_reason(attempt) {
            return Err(give_up(description, attempt, reason, err));
        }

        let delay = plan.delay(attempt);
        debug!(
            attempt,
            code = %err.code(),
            delay_ms = delay.as_millis() as u64,
            error = %err.full_message(),
            "{description}: attempt failed, retrying"
        );
        plan.wait(delay).await;

        if let Some(reason) = plan.stop_reason(attempt) {
            return Err(give_up(description, attempt, reason, err));
        }
    }
}

fn give_up(description: &str, attempts: u32, reason: StopReason, last: ClientError) -> ClientError {
    warn!(
        attempts,
        code = %last.code(),
        error = %last.full_message(),
        "{description}: giving up ({reason})"
    );
    ClientError::wrap(
        last,
        ErrorCode::Timeout,
        format!("failed to {description} after {attempts} attempt(s): {reason}"),
    )
}
