//! Property-Based Tests for Admission Control
//!
//! - **Window cap**: accepted requests per fixed window never exceed the rule
//! - **Retry-After bounds**: always in `1..=window_seconds` or `1..=3600`
//! - **Registry determinism**: rebuilding from the same rules yields the same
//!   ids and the same matches
//! - **Quota cap**: accepted requests per hour never exceed the role limit
//!
//! ```bash
//! cargo test --lib rate_limit::proptests
//! ```

use chrono::{DateTime, TimeDelta};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::rate_limit::clock::{seconds_until_next_hour, Clock, ManualClock};
use crate::rate_limit::config::{RateLimitRule, RoleLimits, RuleScope, CATCH_ALL_PATTERN};
use crate::rate_limit::quota::{QuotaLedger, QuotaOutcome};
use crate::rate_limit::rules::RuleRegistry;
use crate::rate_limit::store::{MemoryStore, WindowState};
use crate::rate_limit::window::WindowStep;

fn arb_rule() -> impl Strategy<Value = RateLimitRule> {
    ("/[a-z]{1,6}(/[a-z*]{1,4}){0,2}", 1u32..50, 1u64..600, any::<bool>()).prop_map(
        |(pattern, max, window, per_ip)| {
            let scope = if per_ip { RuleScope::PerIp } else { RuleScope::PerIdentity };
            RateLimitRule::new(&pattern, max, window, scope)
        },
    )
}

fn arb_rule_set() -> impl Strategy<Value = Vec<RateLimitRule>> {
    prop::collection::vec(arb_rule(), 0..6).prop_map(|mut rules| {
        rules.push(RateLimitRule::new(CATCH_ALL_PATTERN, 100, 60, RuleScope::PerIp));
        rules
    })
}

// ============================================================================
// Endpoint windows
// ============================================================================

proptest! {
    #[test]
    fn prop_window_never_exceeds_max(
        max in 1u32..20,
        window_secs in 1u64..120,
        gaps_ms in prop::collection::vec(0u64..5_000, 1..300)
    ) {
        let rule = RateLimitRule::new("/x", max, window_secs, RuleScope::PerIp);
        let mut now = Duration::ZERO;
        let mut state = WindowState { window_start: now, count: 0 };
        let mut accepted: HashMap<Duration, u32> = HashMap::new();

        for gap in gaps_ms {
            now += Duration::from_millis(gap);
            if let WindowStep::Counted { next, .. } = state.advance(now, &rule) {
                *accepted.entry(next.window_start).or_default() += 1;
                state = next;
            }
        }

        for count in accepted.values() {
            prop_assert!(*count <= max);
        }
    }

    #[test]
    fn prop_window_retry_after_in_bounds(
        max in 1u32..5,
        window_secs in 1u64..3600,
        gaps_ms in prop::collection::vec(0u64..2_000, 1..100)
    ) {
        let rule = RateLimitRule::new("/x", max, window_secs, RuleScope::PerIp);
        let mut now = Duration::ZERO;
        let mut state = WindowState { window_start: now, count: 0 };

        for gap in gaps_ms {
            now += Duration::from_millis(gap);
            match state.advance(now, &rule) {
                WindowStep::Counted { next, .. } => state = next,
                WindowStep::Full { retry_after_secs } => {
                    prop_assert!(retry_after_secs >= 1);
                    prop_assert!(retry_after_secs <= window_secs);
                }
            }
        }
    }

    #[test]
    fn prop_quota_retry_after_in_bounds(secs in 0i64..10_000_000_000, millis in 0u32..1000) {
        let t = DateTime::from_timestamp(secs, millis * 1_000_000).unwrap();
        let retry = seconds_until_next_hour(t);
        prop_assert!((1..=3600).contains(&retry));

        // Waiting that long always lands in the next period
        let after = t + TimeDelta::seconds(retry as i64);
        prop_assert!(after.timestamp() / 3600 > t.timestamp() / 3600);
    }
}

// ============================================================================
// Rule registry
// ============================================================================

proptest! {
    #[test]
    fn prop_registry_rebuild_is_deterministic(
        rules in arb_rule_set(),
        path in "/[a-z]{1,6}(/[a-z0-9]{1,4}){0,3}",
        method in prop_oneof![Just("GET"), Just("POST"), Just("DELETE")]
    ) {
        let first = RuleRegistry::new(rules.clone());
        let second = RuleRegistry::new(rules);

        let ids_a: Vec<_> = first.iter().map(|r| r.id.clone()).collect();
        let ids_b: Vec<_> = second.iter().map(|r| r.id.clone()).collect();
        prop_assert_eq!(ids_a, ids_b);

        let hit_a = first.match_rule(&path, method).map(|r| r.id.clone());
        let hit_b = second.match_rule(&path, method).map(|r| r.id.clone());
        prop_assert!(hit_a.is_some());
        prop_assert_eq!(hit_a, hit_b);
    }
}

// ============================================================================
// Hourly quota
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_quota_never_exceeds_limit(
        limit in 1u32..30,
        expensive_limit in 0u32..10,
        requests in prop::collection::vec((0u64..400, any::<bool>()), 1..120)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let clock = Arc::new(ManualClock::at_hour_boundary());
        let ledger = QuotaLedger::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            HashMap::from([("free".to_string(), RoleLimits::new(limit, expensive_limit))]),
            8,
        );

        let mut per_hour: HashMap<i64, (u32, u32)> = HashMap::new();
        for (gap_secs, expensive) in requests {
            clock.advance(Duration::from_secs(gap_secs));
            let hour = clock.wall().timestamp() / 3600;
            let outcome = runtime
                .block_on(ledger.check_and_increment("alice", "free", expensive))
                .unwrap();
            if let QuotaOutcome::Allowed { .. } = outcome {
                let counts = per_hour.entry(hour).or_default();
                counts.0 += 1;
                if expensive {
                    counts.1 += 1;
                }
            }
        }

        for (general, expensive) in per_hour.values() {
            prop_assert!(*general <= limit);
            prop_assert!(*expensive <= expensive_limit);
        }
    }
}
