//! Retry policy engine behaviour under virtual time

#![allow(clippy::unwrap_used, clippy::expect_used)]

use aqueduct_core::{
    with_retry, with_retry_stream, AmqpError, AmqpRetryOptions, RetryMode, RetryPolicy,
};
use assert_matches::assert_matches;
use futures::stream::{self, StreamExt};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn fixed(delay_ms: u64, max_retries: u32, try_timeout_ms: u64) -> RetryPolicy {
    RetryPolicy::from_options(
        AmqpRetryOptions::fixed(Duration::from_millis(delay_ms), max_retries)
            .with_try_timeout(Duration::from_millis(try_timeout_ms)),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn stalled_operation_exhausts_after_backoff_and_timeouts() {
    let policy = fixed(1_000, 2, 500);
    let subscriptions = Arc::new(AtomicU32::new(0));
    let started = Instant::now();

    let counter = subscriptions.clone();
    let result: Result<(), AmqpError> = with_retry(&policy, "stalled", || {
        counter.fetch_add(1, Ordering::SeqCst);
        futures::future::pending()
    })
    .await;

    let elapsed = started.elapsed();
    assert_eq!(subscriptions.load(Ordering::SeqCst), 3);
    assert!(elapsed >= Duration::from_millis(3_500), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3_600), "elapsed {elapsed:?}");

    let err = result.unwrap_err();
    assert_matches!(err, AmqpError::RetryExhausted { attempts: 3, .. });
    assert_matches!(err.root_cause(), AmqpError::RequestTimeout { .. });
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_makes_max_retries_plus_one_attempts() {
    for mode in [RetryMode::Fixed, RetryMode::Exponential] {
        for max_retries in [0u32, 1, 4] {
            let options = AmqpRetryOptions {
                mode,
                max_retries,
                delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(2),
                ..AmqpRetryOptions::default()
            };
            let policy = RetryPolicy::from_options(options).unwrap();
            let attempts = Arc::new(AtomicU32::new(0));

            let counter = attempts.clone();
            let result: Result<(), AmqpError> = with_retry(&policy, "always-fails", || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(AmqpError::transport("connection reset")) }
            })
            .await;

            assert_eq!(attempts.load(Ordering::SeqCst), max_retries + 1, "{mode:?}");
            assert_matches!(result, Err(AmqpError::RetryExhausted { .. }));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn non_retriable_error_propagates_immediately() {
    let policy = fixed(100, 5, 1_000);
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = attempts.clone();
    let result: Result<(), AmqpError> = with_retry(&policy, "bad-config", || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(AmqpError::configuration("missing scope")) }
    })
    .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_matches!(result, Err(AmqpError::Configuration { .. }));
}

#[tokio::test(start_paused = true)]
async fn recovers_when_a_later_attempt_succeeds() {
    let policy = fixed(100, 3, 1_000);
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = attempts.clone();
    let value = with_retry(&policy, "flaky", || {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt < 2 {
                Err(AmqpError::transport("flap"))
            } else {
                Ok(attempt)
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(value, 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_scheduled_retries() {
    let policy = fixed(1_000, 10, 100);
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = attempts.clone();
    let task = tokio::spawn(async move {
        let _: Result<(), AmqpError> = with_retry(&policy, "cancelled", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(AmqpError::transport("down")) }
        })
        .await;
    });

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    task.abort();
    let seen = attempts.load(Ordering::SeqCst);
    assert_eq!(seen, 2);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), seen);
}

#[tokio::test(start_paused = true)]
async fn stalled_stream_resubscribes_until_exhausted() {
    let policy = fixed(1_000, 2, 500);
    let subscriptions = Arc::new(AtomicU32::new(0));

    let counter = subscriptions.clone();
    let items: Vec<Result<u32, AmqpError>> = with_retry_stream(policy, "stalled-stream", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        stream::pending()
    })
    .collect()
    .await;

    assert_eq!(subscriptions.load(Ordering::SeqCst), 3);
    assert_eq!(items.len(), 1);
    assert_matches!(items[0], Err(AmqpError::RetryExhausted { attempts: 3, .. }));
}

#[tokio::test(start_paused = true)]
async fn stream_resumes_after_transient_failure() {
    let policy = fixed(100, 2, 1_000);
    let subscriptions = Arc::new(AtomicU32::new(0));

    let counter = subscriptions.clone();
    let items: Vec<u32> = with_retry_stream(policy, "receive", move || {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        if attempt == 0 {
            stream::iter(vec![Ok(1), Ok(2), Err(AmqpError::transport("detached"))]).boxed()
        } else {
            stream::iter(vec![Ok(3)]).boxed()
        }
    })
    .map(|item| item.unwrap())
    .collect()
    .await;

    assert_eq!(items, vec![1, 2, 3]);
    assert_eq!(subscriptions.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn empty_stream_completes_without_retry() {
    let policy = fixed(100, 2, 1_000);
    let items: Vec<Result<u32, AmqpError>> =
        with_retry_stream(policy, "empty", stream::empty).collect().await;
    assert!(items.is_empty());
}

proptest! {
    #[test]
    fn exponential_delay_stays_within_bounds(
        base_ms in 1u64..5_000,
        extra_ms in 0u64..120_000,
        attempt in 0u32..40,
        jitter in 0.0f64..0.5,
    ) {
        let delay = Duration::from_millis(base_ms);
        let max_delay = Duration::from_millis(base_ms + extra_ms);
        let options = AmqpRetryOptions::exponential(delay, max_delay, 64).with_jitter(jitter);
        let policy = RetryPolicy::from_options(options).unwrap();

        let computed = policy.next_delay(attempt).unwrap();
        let nominal = delay.saturating_mul(2u32.saturating_pow(attempt)).min(max_delay);

        prop_assert!(computed <= max_delay);
        prop_assert!(computed >= nominal.mul_f64(1.0 - jitter) - Duration::from_micros(1));
    }
}
