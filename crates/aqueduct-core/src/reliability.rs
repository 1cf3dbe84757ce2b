//! Retry policy engine
//!
//! Backoff computation and the retry wrappers applied around connection
//! opens, CBS authorizations, management requests and streaming receives.
//! The policy is a closed set of variants selected once from
//! [`AmqpRetryOptions`]; the budget is counted in attempts, never in wall
//! clock time.

use crate::{AmqpError, ErrorCondition, Result};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Extra wait applied on top of the computed delay when the peer reports
/// `com.microsoft:server-busy`.
pub const SERVER_BUSY_WAIT: Duration = Duration::from_secs(4);

/// Backoff mode for retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Same delay before every retry
    Fixed,
    /// Delay doubles on every retry, capped at the maximum delay
    Exponential,
}

/// Retry configuration supplied with the connection options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmqpRetryOptions {
    /// Backoff mode
    pub mode: RetryMode,
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Base delay before a retry
    pub delay: Duration,
    /// Upper bound on any single delay (exponential mode)
    pub max_delay: Duration,
    /// Deadline for a single attempt
    pub try_timeout: Duration,
    /// Half-width of the multiplicative jitter band applied to exponential delays
    pub jitter: f64,
}

impl Default for AmqpRetryOptions {
    fn default() -> Self {
        Self {
            mode: RetryMode::Exponential,
            max_retries: 3,
            delay: Duration::from_millis(800),
            max_delay: Duration::from_secs(60),
            try_timeout: Duration::from_secs(60),
            jitter: 0.08,
        }
    }
}

impl AmqpRetryOptions {
    /// Fixed-delay options
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            mode: RetryMode::Fixed,
            max_retries,
            delay,
            max_delay: delay,
            ..Self::default()
        }
    }

    /// Exponential options
    pub fn exponential(delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            mode: RetryMode::Exponential,
            max_retries,
            delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Set the per-attempt deadline
    pub fn with_try_timeout(mut self, try_timeout: Duration) -> Self {
        self.try_timeout = try_timeout;
        self
    }

    /// Set the jitter band
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check the invariants of the options.
    pub fn validate(&self) -> Result<()> {
        if self.delay.is_zero() {
            return Err(AmqpError::configuration("retry delay must be greater than zero"));
        }
        if self.try_timeout.is_zero() {
            return Err(AmqpError::configuration(
                "retry try_timeout must be greater than zero",
            ));
        }
        if self.mode == RetryMode::Exponential && self.max_delay < self.delay {
            return Err(AmqpError::configuration(format!(
                "retry max_delay {:?} is shorter than delay {:?}",
                self.max_delay, self.delay
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(AmqpError::configuration(format!(
                "retry jitter must be in [0, 1), got {}",
                self.jitter
            )));
        }
        Ok(())
    }
}

/// Fixed backoff
#[derive(Debug, Clone)]
pub struct FixedRetryPolicy {
    options: AmqpRetryOptions,
}

impl FixedRetryPolicy {
    fn delay(&self, _attempt: u32) -> Duration {
        self.options.delay
    }
}

/// Exponential backoff with symmetric jitter
#[derive(Debug, Clone)]
pub struct ExponentialRetryPolicy {
    options: AmqpRetryOptions,
}

impl ExponentialRetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let max_delay = self.options.max_delay;
        let base = self
            .options
            .delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(max_delay);

        let jitter = self.options.jitter;
        if jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor).min(max_delay)
    }
}

/// Retry policy resolved from [`AmqpRetryOptions`]
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// Fixed delay between attempts
    Fixed(FixedRetryPolicy),
    /// Exponentially growing delay between attempts
    Exponential(ExponentialRetryPolicy),
}

impl RetryPolicy {
    /// Resolve the policy variant matching `options.mode`.
    pub fn from_options(options: AmqpRetryOptions) -> Result<Self> {
        options.validate()?;
        Ok(match options.mode {
            RetryMode::Fixed => Self::Fixed(FixedRetryPolicy { options }),
            RetryMode::Exponential => Self::Exponential(ExponentialRetryPolicy { options }),
        })
    }

    /// Options this policy was built from
    pub fn options(&self) -> &AmqpRetryOptions {
        match self {
            Self::Fixed(policy) => &policy.options,
            Self::Exponential(policy) => &policy.options,
        }
    }

    /// Maximum number of retries
    pub fn max_retries(&self) -> u32 {
        self.options().max_retries
    }

    /// Per-attempt deadline
    pub fn try_timeout(&self) -> Duration {
        self.options().try_timeout
    }

    /// Delay before retry number `attempt` (zero-based), or `None` once the
    /// budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries() {
            return None;
        }
        Some(match self {
            Self::Fixed(policy) => policy.delay(attempt),
            Self::Exponential(policy) => policy.delay(attempt),
        })
    }

    /// Like [`next_delay`](Self::next_delay), adding [`SERVER_BUSY_WAIT`]
    /// when the failure is a server-busy condition.
    pub fn delay_for(&self, error: &AmqpError, attempt: u32) -> Option<Duration> {
        let delay = self.next_delay(attempt)?;
        match error.root_cause() {
            AmqpError::Link {
                condition: ErrorCondition::ServerBusy,
                ..
            } => Some(delay + SERVER_BUSY_WAIT),
            _ => Some(delay),
        }
    }

    /// Whether `error` may be recovered by another attempt.
    pub fn is_retriable(&self, error: &AmqpError) -> bool {
        error.is_transient()
    }
}

/// Run `operation` under the policy.
///
/// Each attempt is bounded by the policy's try timeout. Timeouts and
/// retriable failures wait for the next delay and try again; any other
/// failure is returned immediately. After `max_retries + 1` failed attempts
/// the last failure is returned wrapped in [`AmqpError::RetryExhausted`].
/// Dropping the returned future stops any scheduled retry.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let try_timeout = policy.try_timeout();
    let mut attempt = 0u32;

    loop {
        let failure = match tokio::time::timeout(try_timeout, operation()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) if !policy.is_retriable(&err) => {
                debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    error = %err,
                    "Operation failed with non-retriable error"
                );
                return Err(err);
            }
            Ok(Err(err)) => err,
            Err(_) => AmqpError::request_timeout(operation_name, try_timeout),
        };

        match policy.delay_for(&failure, attempt) {
            Some(delay) => {
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => {
                warn!(
                    operation = operation_name,
                    attempts = attempt + 1,
                    error = %failure,
                    "Retry budget exhausted"
                );
                return Err(AmqpError::retry_exhausted(attempt + 1, failure));
            }
        }
    }
}

struct RetryStreamState<F, T> {
    policy: RetryPolicy,
    operation: String,
    factory: F,
    current: Option<BoxStream<'static, Result<T>>>,
    attempts: u32,
    retries: u32,
    finished: bool,
}

/// Streaming counterpart of [`with_retry`].
///
/// `factory` creates a fresh subscription for every attempt. The wait for
/// each item is bounded by the try timeout; a retriable failure resubscribes
/// after the next delay. Once the budget is spent the stream yields a final
/// [`AmqpError::RetryExhausted`] and ends.
pub fn with_retry_stream<T, F, S>(
    policy: RetryPolicy,
    operation_name: impl Into<String>,
    factory: F,
) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    F: FnMut() -> S + Send + 'static,
    S: Stream<Item = Result<T>> + Send + 'static,
{
    let state = RetryStreamState {
        policy,
        operation: operation_name.into(),
        factory,
        current: None,
        attempts: 0,
        retries: 0,
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }

            let try_timeout = st.policy.try_timeout();
            let subscription = match st.current.as_mut() {
                Some(subscription) => subscription,
                None => {
                    st.attempts += 1;
                    debug!(operation = %st.operation, attempt = st.attempts, "Subscribing");
                    st.current.insert((st.factory)().boxed())
                }
            };

            let next = tokio::time::timeout(try_timeout, subscription.next()).await;
            let failure = match next {
                Ok(Some(Ok(item))) => return Some((Ok(item), st)),
                Ok(None) => return None,
                Ok(Some(Err(err))) => err,
                Err(_) => AmqpError::request_timeout(st.operation.clone(), try_timeout),
            };
            st.current = None;

            if !st.policy.is_retriable(&failure) {
                st.finished = true;
                return Some((Err(failure), st));
            }

            match st.policy.delay_for(&failure, st.retries) {
                Some(delay) => {
                    warn!(
                        operation = %st.operation,
                        attempt = st.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Subscription failed, resubscribing"
                    );
                    tokio::time::sleep(delay).await;
                    st.retries += 1;
                }
                None => {
                    st.finished = true;
                    let exhausted = AmqpError::retry_exhausted(st.attempts, failure);
                    return Some((Err(exhausted), st));
                }
            }
        }
    })
    .boxed()
}
