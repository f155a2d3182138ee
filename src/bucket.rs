use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Outcome of a single `try_take` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Take {
    pub consumed: bool,
    /// Tokens left after this call.
    pub remaining: u64,
    /// Time until enough tokens come back. Zero when consumed, `Duration::MAX`
    /// when the request can never be satisfied.
    pub wait: Duration,
    /// Time until the next interval refill, regardless of outcome.
    pub until_reset: Duration,
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: u64,
}

/// Token bucket with interval refill: all `capacity` tokens come back once per
/// `window`, and partial windows add nothing.
#[derive(Debug)]
pub struct Bucket {
    capacity: u64,
    window_nanos: u64,
    state: Mutex<BucketState>,
}

impl Bucket {
    /// Create a full bucket whose first window starts at `now` (clock nanos).
    pub fn new(capacity: u64, window: Duration, now: u64) -> Self {
        let window_nanos = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX).max(1);
        Self {
            capacity,
            window_nanos,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        Duration::from_nanos(self.window_nanos)
    }

    /// Take `n` tokens if available. The whole read-modify-write happens under
    /// the bucket's lock, so calls on one bucket are linearizable.
    pub fn try_take(&self, n: u64, now: u64) -> Take {
        // The critical section cannot panic mid-update, so a poisoned state is still whole.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state, now);

        let until_reset = self.until_reset(&state, now);

        if n > self.capacity {
            return Take {
                consumed: false,
                remaining: state.tokens,
                wait: Duration::MAX,
                until_reset,
            };
        }

        if state.tokens >= n {
            state.tokens -= n;
            Take {
                consumed: true,
                remaining: state.tokens,
                wait: Duration::ZERO,
                until_reset,
            }
        } else {
            Take {
                consumed: false,
                remaining: state.tokens,
                wait: until_reset,
                until_reset,
            }
        }
    }

    /// Tokens available at `now` without consuming any.
    pub fn available_tokens(&self, now: u64) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state, now);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState, now: u64) {
        // A reading earlier than the last refill credits nothing.
        let elapsed = now.saturating_sub(state.last_refill);
        let periods = elapsed / self.window_nanos;
        if periods == 0 {
            return;
        }

        state.tokens = state
            .tokens
            .saturating_add(self.capacity.saturating_mul(periods))
            .min(self.capacity);
        state.last_refill += periods * self.window_nanos;
    }

    fn until_reset(&self, state: &BucketState, now: u64) -> Duration {
        let boundary = state.last_refill.saturating_add(self.window_nanos);
        Duration::from_nanos(boundary.saturating_sub(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const MINUTE: u64 = 60_000_000_000;

    #[test]
    fn test_bucket_creation() {
        let bucket = Bucket::new(10, Duration::from_secs(60), 0);
        assert_eq!(bucket.capacity(), 10);
        assert_eq!(bucket.window(), Duration::from_secs(60));
        assert_eq!(bucket.available_tokens(0), 10);
    }

    #[test]
    fn test_token_consumption() {
        let bucket = Bucket::new(3, Duration::from_secs(60), 0);
        assert_eq!(bucket.try_take(1, 0).remaining, 2);
        assert_eq!(bucket.try_take(1, 0).remaining, 1);
        assert_eq!(bucket.try_take(1, 0).remaining, 0);

        let denied = bucket.try_take(1, 0);
        assert!(!denied.consumed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.wait, Duration::from_secs(60));
    }

    #[test]
    fn test_wait_shrinks_with_elapsed_time() {
        let bucket = Bucket::new(1, Duration::from_secs(60), 0);
        assert!(bucket.try_take(1, 0).consumed);

        let denied = bucket.try_take(1, 45_000_000_000);
        assert!(!denied.consumed);
        assert_eq!(denied.wait, Duration::from_secs(15));
    }

    #[test]
    fn test_partial_window_adds_nothing() {
        let bucket = Bucket::new(5, Duration::from_secs(60), 0);
        for _ in 0..5 {
            assert!(bucket.try_take(1, 0).consumed);
        }
        assert_eq!(bucket.available_tokens(MINUTE - 1), 0);
        assert_eq!(bucket.available_tokens(MINUTE), 5);
    }

    #[test]
    fn test_refill_never_exceeds_capacity() {
        let bucket = Bucket::new(5, Duration::from_secs(60), 0);
        bucket.try_take(2, 0);
        assert_eq!(bucket.available_tokens(10 * MINUTE), 5);
    }

    #[test]
    fn test_refill_keeps_window_phase() {
        let bucket = Bucket::new(2, Duration::from_secs(60), 0);
        bucket.try_take(2, 0);

        // 90s in: one refill happened at 60s, the next boundary is at 120s.
        let take = bucket.try_take(1, MINUTE + MINUTE / 2);
        assert!(take.consumed);
        assert_eq!(take.until_reset, Duration::from_secs(30));
    }

    #[test]
    fn test_request_larger_than_capacity() {
        let bucket = Bucket::new(5, Duration::from_secs(60), 0);
        let take = bucket.try_take(6, 0);
        assert!(!take.consumed);
        assert_eq!(take.remaining, 5);
        assert_eq!(take.wait, Duration::MAX);
    }

    #[test]
    fn test_clock_going_backwards_credits_nothing() {
        let bucket = Bucket::new(2, Duration::from_secs(60), MINUTE);
        bucket.try_take(2, MINUTE);
        let take = bucket.try_take(1, 0);
        assert!(!take.consumed);
        assert_eq!(take.remaining, 0);
    }

    #[test]
    fn test_concurrent_takes_are_exact() {
        let capacity = 50;
        let callers = 80;
        let bucket = Bucket::new(capacity, Duration::from_secs(60), 0);

        let takes: Vec<Take> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..callers)
                .map(|_| s.spawn(|| bucket.try_take(1, 0)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let successes: Vec<u64> = takes
            .iter()
            .filter(|p| p.consumed)
            .map(|p| p.remaining)
            .collect();
        assert_eq!(successes.len() as u64, capacity.min(callers));

        // Every success saw a distinct count, covering capacity-1 down to 0.
        let distinct: HashSet<u64> = successes.iter().copied().collect();
        assert_eq!(distinct.len(), successes.len());
        assert_eq!(distinct, (0..capacity).collect::<HashSet<_>>());
    }

    #[test]
    fn test_successes_bounded_over_many_windows() {
        let capacity = 4;
        let bucket = Bucket::new(capacity, Duration::from_secs(60), 0);
        let k = 3;
        let mut successes = 0;

        // One attempt every second across k windows.
        for second in 0..(k * 60) {
            for _ in 0..2 {
                if bucket.try_take(1, second * 1_000_000_000).consumed {
                    successes += 1;
                }
            }
        }
        assert!(successes <= (k + 1) * capacity);
        assert_eq!(successes, k * capacity);
    }
}
