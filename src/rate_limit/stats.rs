//! Stats Reporter
//!
//! Read-only views over admission state: the public rule list, a caller's own
//! quota usage, and an aggregate across all tracked keys for operators.
//!
//! The aggregate is built from a store snapshot and cached for a short TTL,
//! so dashboards polling it never hold up the admission path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::clock::hour_floor;
use super::config::{RateLimitRule, RoleLimits, RuleScope};
use super::manager::{AdmissionManager, Caller};
use super::quota::QuotaUsage;
use super::store::{CounterKey, CounterRecord};
use crate::error::AdmissionError;

/// One rule as published to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicRule {
    pub pattern: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    pub max_requests: u32,
    pub window_seconds: u64,
    pub scope: RuleScope,
}

impl From<&RateLimitRule> for PublicRule {
    fn from(rule: &RateLimitRule) -> Self {
        Self {
            pattern: rule.pattern.clone(),
            methods: rule.methods.clone(),
            max_requests: rule.max_requests,
            window_seconds: rule.window_seconds,
            scope: rule.scope,
        }
    }
}

/// Public view: configured limits, no caller data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicLimits {
    pub rules: Vec<PublicRule>,
    pub roles: BTreeMap<String, RoleLimits>,
}

/// Live usage of one endpoint rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleAggregate {
    pub rule_id: String,
    pub pattern: String,
    pub max_requests: u32,
    /// Keys with requests in their current window
    pub active_keys: usize,
    /// Requests counted across those windows
    pub requests_in_window: u64,
    /// Keys whose window is full
    pub saturated_keys: usize,
}

/// Current-period usage of one role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAggregate {
    pub role: String,
    pub identities: usize,
    pub requests: u64,
    pub expensive_calls: u64,
    /// Identities with their general budget used up
    pub exhausted_identities: usize,
}

/// Privileged view across all tracked keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateView {
    pub generated_at: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub tracked_keys: usize,
    pub rules: Vec<RuleAggregate>,
    pub roles: Vec<RoleAggregate>,
}

#[derive(Debug)]
struct CachedView {
    built_at: Duration,
    view: Arc<AggregateView>,
}

/// Read-only admission statistics
#[derive(Debug, Clone)]
pub struct StatsReporter {
    manager: AdmissionManager,
    ttl: Duration,
    cache: Arc<RwLock<Option<CachedView>>>,
}

impl StatsReporter {
    pub fn new(manager: AdmissionManager, ttl: Duration) -> Self {
        Self {
            manager,
            ttl,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn public_limits(&self) -> PublicLimits {
        let registry = self.manager.registry().await;
        PublicLimits {
            rules: registry.iter().map(|r| PublicRule::from(&r.rule)).collect(),
            roles: self
                .manager
                .ledger()
                .roles()
                .iter()
                .map(|(name, limits)| (name.clone(), *limits))
                .collect(),
        }
    }

    /// Usage for the calling identity only
    pub async fn self_service(&self, caller: &Caller) -> Result<QuotaUsage, AdmissionError> {
        self.manager
            .ledger()
            .usage(&caller.identity, &caller.role)
            .await
    }

    /// Aggregate view, served from cache while younger than the TTL
    pub async fn aggregate(&self) -> Result<Arc<AggregateView>, AdmissionError> {
        let now = self.manager.clock().monotonic();

        if let Some(cached) = self.cache.read().await.as_ref() {
            if now.saturating_sub(cached.built_at) < self.ttl {
                return Ok(cached.view.clone());
            }
        }

        let view = Arc::new(self.build_aggregate().await?);
        *self.cache.write().await = Some(CachedView {
            built_at: now,
            view: view.clone(),
        });
        Ok(view)
    }

    async fn build_aggregate(&self) -> Result<AggregateView, AdmissionError> {
        let snapshot = self.manager.store().snapshot().await?;
        let registry = self.manager.registry().await;
        let clock = self.manager.clock();
        let now = clock.monotonic();
        let wall = clock.wall();
        let period = hour_floor(wall);
        let role_limits = self.manager.ledger().roles();

        let mut rules: BTreeMap<String, RuleAggregate> = registry
            .iter()
            .map(|r| {
                let agg = RuleAggregate {
                    rule_id: r.id.to_string(),
                    pattern: r.rule.pattern.clone(),
                    max_requests: r.rule.max_requests,
                    ..Default::default()
                };
                (r.id.to_string(), agg)
            })
            .collect();
        let mut roles: BTreeMap<String, RoleAggregate> = BTreeMap::new();

        for (key, entry) in &snapshot {
            match (key, &entry.record) {
                (CounterKey::Window { rule, .. }, CounterRecord::Window(state)) => {
                    // Counters of a rule that has since been reloaded away
                    let Some(registered) = registry.get(rule) else {
                        continue;
                    };
                    let live = state.live_count(now, &registered.rule);
                    if live == 0 {
                        continue;
                    }
                    if let Some(agg) = rules.get_mut(rule.as_str()) {
                        agg.active_keys += 1;
                        agg.requests_in_window += u64::from(live);
                        if live >= registered.rule.max_requests {
                            agg.saturated_keys += 1;
                        }
                    }
                }
                (CounterKey::Quota { .. }, CounterRecord::Quota(state)) => {
                    if state.period_start != period {
                        continue;
                    }
                    let agg = roles.entry(state.role.clone()).or_insert_with(|| RoleAggregate {
                        role: state.role.clone(),
                        ..Default::default()
                    });
                    agg.identities += 1;
                    agg.requests += u64::from(state.request_count);
                    agg.expensive_calls += u64::from(state.expensive_call_count);
                    let exhausted = role_limits
                        .get(&state.role)
                        .is_some_and(|l| state.request_count >= l.request_limit);
                    if exhausted {
                        agg.exhausted_identities += 1;
                    }
                }
                _ => {}
            }
        }

        // Keep registry order for rules
        let ordered_rules = registry
            .iter()
            .filter_map(|r| rules.remove(r.id.as_str()))
            .collect();

        debug!(tracked_keys = snapshot.len(), "Built aggregate admission view");

        Ok(AggregateView {
            generated_at: wall,
            period_start: period,
            tracked_keys: snapshot.len(),
            rules: ordered_rules,
            roles: roles.into_values().collect(),
        })
    }
}
