//! Window Tracker
//!
//! Fixed-window counter per (client key, rule) with lazy rollover: an expired
//! window is reset by the next request that observes it, no timer involved.
//!
//! Adjacent windows can admit up to `2 * max_requests` around a boundary.
//! That burst is accepted; a token bucket could sit behind the same
//! `check_and_increment` signature if stricter smoothing is ever needed.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use super::clock::Clock;
use super::config::RateLimitRule;
use super::rules::RegisteredRule;
use super::store::{
    update_counter, ClientKey, CounterEntry, CounterKey, CounterStore, StoreError, WindowState,
};
use crate::error::AdmissionError;

/// Result of an endpoint rule check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOutcome {
    /// Request counted; `remaining` slots left in this window
    Allowed { remaining: u32 },

    /// Window full
    Rejected {
        /// Seconds until the window rolls over, in `1..=window_seconds`
        retry_after_secs: u64,
        /// Rejections from this key since its last accepted request, as seen
        /// by this process
        consecutive_rejections: u32,
    },
}

/// One request applied to a window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowStep {
    /// Slot taken; `next` must be stored for the request to count
    Counted { next: WindowState, remaining: u32 },

    /// Window full; nothing changes
    Full { retry_after_secs: u64 },
}

impl WindowState {
    fn fresh(now: Duration) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    /// Apply one request at monotonic time `now`
    pub fn advance(&self, now: Duration, rule: &RateLimitRule) -> WindowStep {
        let window = rule.window();
        let elapsed = now.saturating_sub(self.window_start);

        // A request exactly on the boundary starts a new window
        let (window_start, count) = if elapsed >= window {
            (now, 0)
        } else {
            (self.window_start, self.count)
        };

        if count < rule.max_requests {
            let next = WindowState {
                window_start,
                count: count + 1,
            };
            let remaining = rule.max_requests - next.count;
            return WindowStep::Counted { next, remaining };
        }

        let left = window.saturating_sub(now.saturating_sub(window_start));
        WindowStep::Full {
            retry_after_secs: ceil_secs(left).clamp(1, rule.window_seconds.max(1)),
        }
    }

    /// Count that applies at `now`, treating an expired window as empty
    pub fn live_count(&self, now: Duration, rule: &RateLimitRule) -> u32 {
        if now.saturating_sub(self.window_start) >= rule.window() {
            0
        } else {
            self.count
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Endpoint rule counter over a pluggable store
#[derive(Debug, Clone)]
pub struct WindowTracker {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    max_cas_attempts: u32,

    /// Rejection streaks per key: (count, last rejection). Kept out of the
    /// stored record so a full window costs a read and no write.
    streaks: Arc<DashMap<CounterKey, (u32, Duration)>>,
}

impl WindowTracker {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, max_cas_attempts: u32) -> Self {
        Self {
            store,
            clock,
            max_cas_attempts,
            streaks: Arc::new(DashMap::new()),
        }
    }

    /// Count one request against `rule` for `client`
    ///
    /// The increment is committed as part of the check. Concurrent calls for
    /// the same key are serialized by the store's compare-and-swap; a full
    /// window is decided from the read alone.
    pub async fn check_and_increment(
        &self,
        client: &ClientKey,
        rule: &RegisteredRule,
    ) -> Result<WindowOutcome, AdmissionError> {
        let key = CounterKey::window(client.clone(), rule.id.clone());
        let clock = &self.clock;

        let step = update_counter(self.store.as_ref(), &key, self.max_cas_attempts, |current| {
            let now = clock.monotonic();
            let state = match current {
                Some(entry) => entry
                    .as_window()
                    .cloned()
                    .ok_or_else(|| StoreError::Corrupt(key.to_string()))?,
                None => WindowState::fresh(now),
            };
            let step = state.advance(now, &rule.rule);
            let entry = match &step {
                WindowStep::Counted { next, .. } => Some(CounterEntry::window(next.clone(), now)),
                WindowStep::Full { .. } => None,
            };
            Ok((entry, step))
        })
        .await?;

        Ok(match step {
            WindowStep::Counted { remaining, .. } => {
                self.streaks.remove(&key);
                WindowOutcome::Allowed { remaining }
            }
            WindowStep::Full { retry_after_secs } => {
                let now = self.clock.monotonic();
                let mut streak = self.streaks.entry(key).or_insert((0, now));
                streak.0 = streak.0.saturating_add(1);
                streak.1 = now;
                WindowOutcome::Rejected {
                    retry_after_secs,
                    consecutive_rejections: streak.0,
                }
            }
        })
    }

    /// Current state for a key without counting a request
    pub async fn peek(
        &self,
        client: &ClientKey,
        rule: &RegisteredRule,
    ) -> Result<Option<WindowState>, AdmissionError> {
        let key = CounterKey::window(client.clone(), rule.id.clone());
        let entry = self.store.get(&key).await?;
        Ok(entry.and_then(|e| e.as_window().cloned()))
    }

    /// Forget rejection streaks with no rejection for longer than `max_idle`
    pub fn evict_idle_streaks(&self, now: Duration, max_idle: Duration) -> usize {
        let before = self.streaks.len();
        self.streaks
            .retain(|_, (_, last)| now.saturating_sub(*last) <= max_idle);
        before.saturating_sub(self.streaks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::clock::ManualClock;
    use crate::rate_limit::config::RuleScope;
    use crate::rate_limit::rules::RuleRegistry;
    use crate::rate_limit::store::MemoryStore;
    use std::net::{IpAddr, Ipv4Addr};

    fn auth_rule() -> RegisteredRule {
        RuleRegistry::new(vec![RateLimitRule::new("/auth/*", 5, 60, RuleScope::PerIp)])
            .iter()
            .next()
            .cloned()
            .unwrap()
    }

    fn tracker() -> (WindowTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_hour_boundary());
        let tracker = WindowTracker::new(Arc::new(MemoryStore::new()), clock.clone(), 16);
        (tracker, clock)
    }

    fn ip() -> ClientKey {
        ClientKey::Ip(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)))
    }

    #[tokio::test]
    async fn test_allows_up_to_max_then_rejects() {
        let (tracker, clock) = tracker();
        let rule = auth_rule();

        for expected_remaining in (0..5).rev() {
            let outcome = tracker.check_and_increment(&ip(), &rule).await.unwrap();
            assert_eq!(outcome, WindowOutcome::Allowed { remaining: expected_remaining });
            clock.advance(Duration::from_secs(1));
        }

        let outcome = tracker.check_and_increment(&ip(), &rule).await.unwrap();
        match outcome {
            WindowOutcome::Rejected { retry_after_secs, .. } => {
                assert!(retry_after_secs > 0 && retry_after_secs <= 60);
                assert_eq!(retry_after_secs, 55);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_window_resets_at_boundary() {
        let (tracker, clock) = tracker();
        let rule = auth_rule();

        for _ in 0..5 {
            tracker.check_and_increment(&ip(), &rule).await.unwrap();
        }
        assert!(matches!(
            tracker.check_and_increment(&ip(), &rule).await.unwrap(),
            WindowOutcome::Rejected { .. }
        ));

        // Exactly window_seconds later counts as a new window
        clock.advance(Duration::from_secs(60));
        let outcome = tracker.check_and_increment(&ip(), &rule).await.unwrap();
        assert_eq!(outcome, WindowOutcome::Allowed { remaining: 4 });

        let state = tracker.peek(&ip(), &rule).await.unwrap().unwrap();
        assert_eq!(state.count, 1);
        assert_eq!(state.window_start, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (tracker, _clock) = tracker();
        let rule = auth_rule();
        let other = ClientKey::Identity("alice".to_string());

        for _ in 0..5 {
            tracker.check_and_increment(&ip(), &rule).await.unwrap();
        }
        let outcome = tracker.check_and_increment(&other, &rule).await.unwrap();
        assert_eq!(outcome, WindowOutcome::Allowed { remaining: 4 });
    }

    #[tokio::test]
    async fn test_consecutive_rejections_tracked() {
        let (tracker, _clock) = tracker();
        let rule = auth_rule();

        for _ in 0..5 {
            tracker.check_and_increment(&ip(), &rule).await.unwrap();
        }
        for expected in 1..=3 {
            match tracker.check_and_increment(&ip(), &rule).await.unwrap() {
                WindowOutcome::Rejected { consecutive_rejections, .. } => {
                    assert_eq!(consecutive_rejections, expected)
                }
                other => panic!("expected rejection, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_rejection_leaves_stored_window_untouched() {
        let (tracker, clock) = tracker();
        let rule = auth_rule();

        for _ in 0..5 {
            tracker.check_and_increment(&ip(), &rule).await.unwrap();
        }
        let full = tracker.peek(&ip(), &rule).await.unwrap();

        clock.advance(Duration::from_secs(10));
        for _ in 0..3 {
            tracker.check_and_increment(&ip(), &rule).await.unwrap();
        }
        assert_eq!(tracker.peek(&ip(), &rule).await.unwrap(), full);
    }

    #[tokio::test]
    async fn test_idle_streaks_are_evicted() {
        let (tracker, clock) = tracker();
        let rule = auth_rule();
        for _ in 0..6 {
            tracker.check_and_increment(&ip(), &rule).await.unwrap();
        }

        clock.advance(Duration::from_secs(30));
        assert_eq!(tracker.evict_idle_streaks(clock.monotonic(), Duration::from_secs(60)), 0);
        clock.advance(Duration::from_secs(31));
        assert_eq!(tracker.evict_idle_streaks(clock.monotonic(), Duration::from_secs(60)), 1);
    }

    #[test]
    fn test_retry_after_rounds_up_sub_second_remainder() {
        let rule = RateLimitRule::new("/x", 1, 10, RuleScope::PerIp);
        let WindowStep::Counted { next, .. } = WindowState::fresh(Duration::ZERO).advance(Duration::ZERO, &rule) else {
            panic!("first request must be counted");
        };
        assert_eq!(
            next.advance(Duration::from_millis(9_500), &rule),
            WindowStep::Full { retry_after_secs: 1 }
        );
    }

    #[test]
    fn test_live_count_treats_expired_window_as_empty() {
        let rule = RateLimitRule::new("/x", 3, 10, RuleScope::PerIp);
        let WindowStep::Counted { next, .. } = WindowState::fresh(Duration::ZERO).advance(Duration::ZERO, &rule) else {
            panic!("first request must be counted");
        };
        assert_eq!(next.live_count(Duration::from_secs(9), &rule), 1);
        assert_eq!(next.live_count(Duration::from_secs(10), &rule), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_requests_never_exceed_limit() {
        use crate::rate_limit::config::DEFAULT_MAX_CAS_ATTEMPTS;
        use crate::rate_limit::store::testing::LatentStore;

        for _ in 0..5 {
            let clock = Arc::new(ManualClock::at_hour_boundary());
            let tracker = WindowTracker::new(
                Arc::new(LatentStore::new()),
                clock,
                DEFAULT_MAX_CAS_ATTEMPTS,
            );
            let rule = Arc::new(auth_rule());
            let barrier = Arc::new(tokio::sync::Barrier::new(200));

            let handles: Vec<_> = (0..200)
                .map(|_| {
                    let tracker = tracker.clone();
                    let rule = rule.clone();
                    let barrier = barrier.clone();
                    tokio::spawn(async move {
                        barrier.wait().await;
                        tracker.check_and_increment(&ip(), &rule).await
                    })
                })
                .collect();

            let mut allowed = 0;
            let mut rejected = 0;
            for handle in handles {
                match handle.await.unwrap().unwrap() {
                    WindowOutcome::Allowed { .. } => allowed += 1,
                    WindowOutcome::Rejected { .. } => rejected += 1,
                }
            }
            assert_eq!(allowed, 5);
            assert_eq!(rejected, 195);
        }
    }
}
