//! Time methods, clock cache and delay helpers

use chrono::Utc;
use rand::{self, Rng};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use std::{cmp, thread, time};

lazy_static! {
    static ref NOW: Arc<AtomicUsize> =
        Arc::new(AtomicUsize::new(Utc::now().timestamp() as usize));
    static ref START: Instant = Instant::now();
}

/// Number of nanoseconds elapsed since `i`.
pub fn elapsed_ns(i: Instant) -> u64 {
    let elapsed = i.elapsed();
    (elapsed.as_secs().saturating_mul(1_000_000_000))
        .saturating_add(u64::from(elapsed.subsec_nanos()))
}

/// Current wall-clock time, in seconds since the epoch.
///
/// The value is cached and refreshed by `update_time`. Samples are stamped
/// often enough that asking the OS for the time on every stamp is wasted
/// motion at second granularity.
pub fn now() -> i64 {
    NOW.load(Ordering::Relaxed) as i64
}

/// Nanoseconds of monotonic clock since process start.
pub fn uptime_ns() -> u64 {
    elapsed_ns(*START)
}

/// Refresh the cached wall-clock, twice a second, forever.
pub fn update_time() {
    let dur = time::Duration::from_millis(500);
    loop {
        thread::sleep(dur);
        let now = Utc::now().timestamp() as usize;
        NOW.store(now, Ordering::Relaxed);
    }
}

/// Sleep for a duration scaled by `attempts`, capped at 500ms.
///
/// Used to pace restart and idle loops that have no configured backoff
/// bounds of their own.
pub fn delay(attempts: u32) {
    if attempts > 0 && attempts < 9 {
        let delay = cmp::min(500, 2u64.pow(attempts));
        let sleep_time = time::Duration::from_millis(delay);
        thread::sleep(sleep_time);
    } else if attempts >= 9 {
        let sleep_time = time::Duration::from_millis(500);
        thread::sleep(sleep_time);
    }
}

/// Delay before retry `attempt`, doubling from `base` up to `max`.
///
/// `attempt` counts failed transmissions, starting at 1. The returned
/// duration is deterministic and non-decreasing in `attempt`; callers that
/// sleep on it should add `jitter` first.
pub fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = (base.as_secs() * 1_000).saturating_add(u64::from(base.subsec_millis()));
    let max_ms = (max.as_secs() * 1_000).saturating_add(u64::from(max.subsec_millis()));
    // 2^20 * base already dwarfs any sane ceiling. Clamping the exponent
    // keeps the shift from wrapping on pathological attempt counts.
    let exp = cmp::min(attempt.saturating_sub(1), 20);
    let ms = cmp::min(max_ms, base_ms.saturating_mul(1u64 << exp));
    Duration::from_millis(ms)
}

/// Add up to 25% of random slop to `d`.
///
/// Keeps a fleet of agents that lost their collector at the same instant
/// from retrying in lockstep.
pub fn jitter(d: Duration) -> Duration {
    let ms = (d.as_secs() * 1_000).saturating_add(u64::from(d.subsec_millis()));
    let span = ms / 4;
    if span == 0 {
        return d;
    }
    let slop = rand::thread_rng().gen_range(0, span + 1);
    Duration::from_millis(ms.saturating_add(slop))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(30_000);
        assert_eq!(backoff(1, base, max), Duration::from_millis(100));
        assert_eq!(backoff(2, base, max), Duration::from_millis(200));
        assert_eq!(backoff(3, base, max), Duration::from_millis(400));
        assert_eq!(backoff(4, base, max), Duration::from_millis(800));
    }

    #[test]
    fn backoff_respects_ceiling() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1_000);
        assert_eq!(backoff(5, base, max), Duration::from_millis(1_000));
        assert_eq!(backoff(64, base, max), Duration::from_millis(1_000));
    }

    #[test]
    fn backoff_is_non_decreasing() {
        let base = Duration::from_millis(50);
        let max = Duration::from_millis(5_000);
        let mut prev = Duration::from_millis(0);
        for attempt in 1..32 {
            let cur = backoff(attempt, base, max);
            assert!(cur >= prev);
            prev = cur;
        }
    }

    #[test]
    fn jitter_is_bounded() {
        let d = Duration::from_millis(400);
        for _ in 0..100 {
            let j = jitter(d);
            assert!(j >= d);
            assert!(j <= d + Duration::from_millis(100));
        }
    }

    #[test]
    fn jitter_of_zero_is_zero() {
        assert_eq!(jitter(Duration::from_millis(0)), Duration::from_millis(0));
    }
}
