// Property-based tests for retry backoff and API quota tracking

use chrono::Utc;
use common::rate_limit::RateLimiter;
use common::retry::{ExponentialBackoff, FixedDelay, RetryStrategy, DEFAULT_MAX_RETRIES};
use proptest::prelude::*;
use std::time::Duration;

// Property: backoff delays stay within [base * 2^n, cap * (1 + jitter)]
#[test]
fn property_backoff_delay_bounds() {
    proptest!(|(
        base in 1u64..2_000,
        cap_factor in 1u64..64,
        jitter in 0.0f64..1.0,
        attempt in 0u32..12
    )| {
        let cap = base * cap_factor;
        let strategy = ExponentialBackoff::with_config(base, cap, jitter, 12);
        let delay = strategy.next_delay(attempt).unwrap().as_millis() as u64;

        let expected_base = base.saturating_mul(2u64.pow(attempt)).min(cap);
        prop_assert!(delay >= expected_base);
        prop_assert!(delay <= expected_base + (expected_base as f64 * jitter) as u64);
    });
}

// Property: without jitter the sequence never decreases
#[test]
fn property_backoff_is_monotonic_without_jitter() {
    proptest!(|(base in 1u64..1_000, cap in 1_000u64..60_000)| {
        let strategy = ExponentialBackoff::with_config(base, cap, 0.0, 10);
        let delays: Vec<Duration> = (0..10).filter_map(|a| strategy.next_delay(a)).collect();
        prop_assert_eq!(delays.len(), 10);
        for pair in delays.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
    });
}

// Property: the retry budget is exactly max_retries for every strategy
#[test]
fn property_retry_budget_is_exact() {
    proptest!(|(max_retries in 0u32..10, delay_ms in 0u64..100)| {
        let strategies: Vec<Box<dyn RetryStrategy>> = vec![
            Box::new(ExponentialBackoff::with_config(10, 1_000, 0.5, max_retries)),
            Box::new(FixedDelay::new(Duration::from_millis(delay_ms), max_retries)),
        ];
        for strategy in strategies {
            for attempt in 0..max_retries {
                prop_assert!(strategy.next_delay(attempt).is_some());
                prop_assert!(strategy.should_retry(attempt));
            }
            prop_assert!(strategy.next_delay(max_retries).is_none());
            prop_assert!(!strategy.should_retry(max_retries));
        }
    });
}

#[test]
fn default_backoff_uses_default_budget() {
    let strategy = ExponentialBackoff::new();
    assert_eq!(strategy.max_retries(), DEFAULT_MAX_RETRIES);
}

// Property: with quota above the margin, each reservation takes exactly one unit
#[test]
fn property_reservations_consume_one_unit_each() {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    proptest!(|(
        margin in 0u32..50,
        headroom in 1u32..200,
        reservations in 0u32..40
    )| {
        let remaining = margin + headroom + reservations;
        let limiter = RateLimiter::new(margin);
        limiter.update(remaining, remaining + 1_000, Some(Utc::now() + chrono::Duration::hours(1)));

        runtime.block_on(async {
            for _ in 0..reservations {
                limiter.reserve().await;
            }
        });

        prop_assert_eq!(limiter.snapshot().remaining, remaining - reservations);
        prop_assert_eq!(limiter.safety_margin(), margin);
    });
}

// Property: an update always replaces the tracked state wholesale
#[test]
fn property_update_is_authoritative() {
    proptest!(|(
        first in (0u32..5_000, 1u32..5_000),
        second in (0u32..5_000, 1u32..5_000)
    )| {
        let limiter = RateLimiter::new(10);
        limiter.update(first.0, first.1, None);
        let reset = Utc::now() + chrono::Duration::minutes(30);
        limiter.update(second.0, second.1, Some(reset));

        let snapshot = limiter.snapshot();
        prop_assert_eq!(snapshot.remaining, second.0);
        prop_assert_eq!(snapshot.ceiling, second.1);
        prop_assert_eq!(snapshot.reset_at, Some(reset));
    });
}

#[tokio::test]
async fn exhausted_quota_with_elapsed_reset_resumes_at_ceiling() {
    let limiter = RateLimiter::new(5);
    limiter.update(0, 100, Some(Utc::now() - chrono::Duration::seconds(5)));

    limiter.reserve().await;

    assert_eq!(limiter.snapshot().remaining, 99);
}
