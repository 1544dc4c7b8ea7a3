//! Quota Ledger
//!
//! Hourly budgets per identity. Periods are fixed and aligned to wall-clock
//! hour boundaries, so every caller's counters reset at the same predictable
//! instant. Each period tracks general requests and, separately, expensive
//! calls; an expensive call counts against both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::clock::{hour_floor, seconds_until_next_hour, Clock};
use super::config::RoleLimits;
use super::store::{update_counter, CounterEntry, CounterKey, CounterStore, QuotaState, StoreError};
use crate::error::AdmissionError;

/// Which budget a quota rejection hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuotaKind {
    General,
    Expensive,
}

impl QuotaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaKind::General => "GENERAL",
            QuotaKind::Expensive => "EXPENSIVE",
        }
    }
}

/// Result of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaOutcome {
    Allowed {
        remaining_requests: u32,
        remaining_expensive: u32,
    },
    Rejected {
        /// Seconds until the next hour boundary, in `1..=3600`
        retry_after_secs: u64,
        kind: QuotaKind,
    },
}

/// Current-period usage for one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub identity: String,
    pub role: String,
    pub request_count: u32,
    pub request_limit: u32,
    pub expensive_call_count: u32,
    pub expensive_call_limit: u32,
    pub period_start: DateTime<Utc>,
    pub resets_in_secs: u64,
}

impl QuotaState {
    fn fresh(role: &str, period_start: DateTime<Utc>) -> Self {
        Self {
            role: role.to_string(),
            period_start,
            request_count: 0,
            expensive_call_count: 0,
        }
    }

    /// The state that applies in `period`: carried over if it is the same
    /// period, otherwise a fresh one for `role`
    fn for_period(current: Option<&QuotaState>, role: &str, period: DateTime<Utc>) -> Self {
        match current {
            Some(state) if state.period_start == period => state.clone(),
            _ => Self::fresh(role, period),
        }
    }
}

/// Per-identity hourly quota tracker
#[derive(Debug, Clone)]
pub struct QuotaLedger {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    roles: Arc<HashMap<String, RoleLimits>>,
    max_cas_attempts: u32,
}

impl QuotaLedger {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        roles: HashMap<String, RoleLimits>,
        max_cas_attempts: u32,
    ) -> Self {
        Self {
            store,
            clock,
            roles: Arc::new(roles),
            max_cas_attempts,
        }
    }

    pub fn roles(&self) -> &HashMap<String, RoleLimits> {
        &self.roles
    }

    fn limits_for(&self, role: &str) -> Result<RoleLimits, AdmissionError> {
        self.roles
            .get(role)
            .copied()
            .ok_or_else(|| AdmissionError::UnknownRole(role.to_string()))
    }

    /// Count one request for `identity`
    ///
    /// The general budget is checked first; an expensive request must then
    /// also fit the expensive budget. A rejected request consumes nothing and
    /// writes nothing.
    /// `role` only matters when a new period starts: the role in effect at
    /// period start governs the whole period.
    pub async fn check_and_increment(
        &self,
        identity: &str,
        role: &str,
        is_expensive: bool,
    ) -> Result<QuotaOutcome, AdmissionError> {
        let key = CounterKey::quota(identity);

        update_counter(self.store.as_ref(), &key, self.max_cas_attempts, |current| {
            let now = self.clock.monotonic();
            let wall = self.clock.wall();
            let current = current
                .map(|entry| {
                    entry
                        .as_quota()
                        .ok_or_else(|| StoreError::Corrupt(key.to_string()))
                })
                .transpose()?;
            let mut state = QuotaState::for_period(current, role, hour_floor(wall));
            let limits = self.limits_for(&state.role)?;

            let rejected = if state.request_count >= limits.request_limit {
                Some(QuotaKind::General)
            } else if is_expensive && state.expensive_call_count >= limits.expensive_call_limit {
                Some(QuotaKind::Expensive)
            } else {
                None
            };

            if let Some(kind) = rejected {
                let outcome = QuotaOutcome::Rejected {
                    retry_after_secs: seconds_until_next_hour(wall),
                    kind,
                };
                return Ok((None, outcome));
            }

            state.request_count += 1;
            if is_expensive {
                state.expensive_call_count += 1;
            }
            let outcome = QuotaOutcome::Allowed {
                remaining_requests: limits.request_limit - state.request_count,
                remaining_expensive: limits
                    .expensive_call_limit
                    .saturating_sub(state.expensive_call_count),
            };
            Ok((Some(CounterEntry::quota(state, now)), outcome))
        })
        .await
    }

    /// Charge an expensive call discovered after dispatch
    ///
    /// The request already counted as general traffic at admission, so only
    /// the expensive counter moves. Never rejects; the counter saturates at
    /// the limit so later expensive requests in this period are refused.
    pub async fn charge_expensive(&self, identity: &str, role: &str) -> Result<QuotaUsage, AdmissionError> {
        let key = CounterKey::quota(identity);

        let state = update_counter(self.store.as_ref(), &key, self.max_cas_attempts, |current| {
            let now = self.clock.monotonic();
            let current = current
                .map(|entry| {
                    entry
                        .as_quota()
                        .ok_or_else(|| StoreError::Corrupt(key.to_string()))
                })
                .transpose()?;
            let mut state = QuotaState::for_period(current, role, hour_floor(self.clock.wall()));
            let limits = self.limits_for(&state.role)?;
            state.expensive_call_count = state
                .expensive_call_count
                .saturating_add(1)
                .min(limits.expensive_call_limit);
            Ok((Some(CounterEntry::quota(state.clone(), now)), state))
        })
        .await?;

        self.usage_from_state(identity, &state)
    }

    /// Current-period usage without counting anything
    pub async fn usage(&self, identity: &str, role: &str) -> Result<QuotaUsage, AdmissionError> {
        let entry = self.store.get(&CounterKey::quota(identity)).await?;
        let period = hour_floor(self.clock.wall());
        let state = QuotaState::for_period(entry.as_ref().and_then(|e| e.as_quota()), role, period);
        self.usage_from_state(identity, &state)
    }

    fn usage_from_state(&self, identity: &str, state: &QuotaState) -> Result<QuotaUsage, AdmissionError> {
        let limits = self.limits_for(&state.role)?;
        Ok(QuotaUsage {
            identity: identity.to_string(),
            role: state.role.clone(),
            request_count: state.request_count,
            request_limit: limits.request_limit,
            expensive_call_count: state.expensive_call_count,
            expensive_call_limit: limits.expensive_call_limit,
            period_start: state.period_start,
            resets_in_secs: seconds_until_next_hour(self.clock.wall()),
        })
    }
}
