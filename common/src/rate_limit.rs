// Outbound API quota tracking for the repository host

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::models::RateLimitState;
use crate::telemetry;

/// Upper bound on one sleep slice, so a far-away reset still re-checks state
const MAX_WAIT_SLICE: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct QuotaState {
    /// False until the host has reported a quota
    known: bool,
    remaining: u32,
    ceiling: u32,
    reset_at: Option<DateTime<Utc>>,
}

/// RateLimiter keeps the process-wide view of the remaining API quota.
///
/// Callers `reserve()` before each request and `update()` with the
/// host's authoritative headers afterwards. The lock is only held for the
/// bookkeeping, never across a sleep.
#[derive(Debug)]
pub struct RateLimiter {
    safety_margin: u32,
    state: Mutex<QuotaState>,
}

impl RateLimiter {
    pub fn new(safety_margin: u32) -> Self {
        Self {
            safety_margin,
            state: Mutex::new(QuotaState::default()),
        }
    }

    /// Wait until quota above the safety margin is available, then take one unit
    pub async fn reserve(&self) {
        loop {
            let wait = self.try_reserve(Utc::now());
            match wait {
                None => return,
                Some(wait) => {
                    debug!(
                        wait_ms = wait.as_millis() as u64,
                        safety_margin = self.safety_margin,
                        "API quota below safety margin, waiting for reset"
                    );
                    tokio::time::sleep(wait.min(MAX_WAIT_SLICE)).await;
                }
            }
        }
    }

    /// Take one unit if possible, otherwise report how long to wait
    fn try_reserve(&self, now: DateTime<Utc>) -> Option<Duration> {
        let mut state = self.lock();

        if !state.known {
            return None;
        }

        if state.remaining <= self.safety_margin {
            match state.reset_at {
                Some(reset_at) if reset_at > now => {
                    let wait = (reset_at - now).to_std().unwrap_or_default();
                    // Round up so the next check lands after the reset instant
                    return Some(wait + Duration::from_millis(1));
                }
                Some(_) => {
                    info!(ceiling = state.ceiling, "API quota window reset");
                    state.remaining = state.ceiling;
                    state.reset_at = None;
                }
                // Nothing to wait for
                None => return None,
            }
        }

        state.remaining = state.remaining.saturating_sub(1);
        None
    }

    /// Resynchronize from the host's authoritative values
    pub fn update(&self, remaining: u32, ceiling: u32, reset_at: Option<DateTime<Utc>>) {
        {
            let mut state = self.lock();
            state.known = true;
            state.remaining = remaining;
            state.ceiling = ceiling;
            state.reset_at = reset_at;
        }
        telemetry::update_rate_limit_remaining(remaining);
    }

    /// Current view of the quota; all zeros before the first update
    pub fn snapshot(&self) -> RateLimitState {
        let state = self.lock();
        RateLimitState {
            remaining: state.remaining,
            ceiling: state.ceiling,
            reset_at: state.reset_at,
        }
    }

    pub fn safety_margin(&self) -> u32 {
        self.safety_margin
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QuotaState> {
        // A panic while holding the guard cannot leave the counters torn
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
