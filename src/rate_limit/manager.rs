//! Admission Manager
//!
//! Transport-independent orchestration of one admission check: endpoint rule
//! first (cheap, keyed by IP or identity), then the caller's hourly quota when
//! an identity is known. Produces a decision value; the HTTP binding lives in
//! [`super::middleware`].

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::clock::{Clock, SystemClock};
use super::config::{EndpointPattern, FailurePolicy, RateLimitConfig, RateLimitRule, RuleScope};
use super::quota::{QuotaKind, QuotaLedger, QuotaOutcome};
use super::rules::{endpoint_matches, RuleRegistry};
use super::store::{ClientKey, CounterStore, MemoryStore};
use super::window::{WindowOutcome, WindowTracker};
use crate::error::AdmissionError;
use crate::metrics;

/// Retry-After for a request turned away because its counter was too hot to update
pub const CONTENTION_RETRY_AFTER_SECS: u64 = 1;

/// Authenticated caller, as supplied by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    pub identity: String,
    pub role: String,
}

impl Caller {
    pub fn new(identity: &str, role: &str) -> Self {
        Self {
            identity: identity.to_string(),
            role: role.to_string(),
        }
    }
}

/// What the manager needs to know about a request
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    pub path: &'a str,
    pub method: &'a str,
    pub client_ip: IpAddr,
    pub caller: Option<&'a Caller>,
}

/// Why a request was turned away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Endpoint rule window full
    RateLimited {
        retry_after_secs: u64,
        pattern: String,
        max_requests: u32,
        window_seconds: u64,
    },
    /// Hourly budget exhausted
    QuotaExceeded {
        retry_after_secs: u64,
        kind: QuotaKind,
    },
}

impl Rejection {
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            Rejection::RateLimited { retry_after_secs, .. }
            | Rejection::QuotaExceeded { retry_after_secs, .. } => *retry_after_secs,
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Forward to the handler; `expensive` is the admission-time classification
    Admitted { expensive: bool },
    /// Answer 429
    Rejected(Rejection),
    /// Counter store failed under a fail-closed policy
    Unavailable,
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted { .. })
    }
}

#[derive(Debug, Clone)]
struct Settings {
    enabled: bool,
    failure_policy: FailurePolicy,
    anomaly_threshold: u32,
    max_idle: Duration,
    expensive_endpoints: Arc<Vec<EndpointPattern>>,
}

/// Admission manager
#[derive(Debug, Clone)]
pub struct AdmissionManager {
    settings: Settings,

    /// Swapped wholesale on reload; readers clone the `Arc` and release
    registry: Arc<RwLock<Arc<RuleRegistry>>>,

    window: WindowTracker,

    ledger: QuotaLedger,

    store: Arc<dyn CounterStore>,

    clock: Arc<dyn Clock>,
}

impl AdmissionManager {
    /// In-memory store and the system clock
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_backend(config, Arc::new(MemoryStore::new()), Arc::new(SystemClock::new()))
    }

    /// Explicit store and clock (shared backends, deterministic tests)
    pub fn with_backend(
        config: RateLimitConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let settings = Settings {
            enabled: config.enabled,
            failure_policy: config.failure_policy,
            anomaly_threshold: config.anomaly_threshold,
            max_idle: config.max_idle(),
            expensive_endpoints: Arc::new(config.expensive_endpoints),
        };
        let window = WindowTracker::new(store.clone(), clock.clone(), config.max_cas_attempts);
        let ledger = QuotaLedger::new(
            store.clone(),
            clock.clone(),
            config.roles,
            config.max_cas_attempts,
        );

        Self {
            settings,
            registry: Arc::new(RwLock::new(Arc::new(RuleRegistry::new(config.rules)))),
            window,
            ledger,
            store,
            clock,
        }
    }

    /// Admit everything (for tests)
    pub fn disabled() -> Self {
        Self::new(RateLimitConfig::disabled())
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Evaluate one request; counters are committed as part of the check
    pub async fn admit(&self, request: &AdmissionRequest<'_>) -> AdmissionDecision {
        let expensive = endpoint_matches(
            &self.settings.expensive_endpoints,
            request.path,
            request.method,
        );
        if !self.settings.enabled {
            return AdmissionDecision::Admitted { expensive };
        }

        let registry = self.registry().await;
        let Some(rule) = registry.match_rule(request.path, request.method) else {
            let err = AdmissionError::NoMatchingRule {
                path: request.path.to_string(),
                method: request.method.to_string(),
            };
            return self
                .on_failure(&err)
                .unwrap_or(AdmissionDecision::Admitted { expensive });
        };

        let client = client_key(rule.rule.scope, request);
        match self.window.check_and_increment(&client, rule).await {
            Ok(WindowOutcome::Allowed { .. }) => {}
            Ok(WindowOutcome::Rejected {
                retry_after_secs,
                consecutive_rejections,
            }) => {
                debug!(
                    client = %client,
                    rule = %rule.id,
                    retry_after_secs,
                    "Endpoint rate limit exceeded"
                );
                self.flag_anomaly(&client, &rule.rule, consecutive_rejections);
                metrics::record_decision("rejected", "rate_limit_exceeded");
                return AdmissionDecision::Rejected(Rejection::RateLimited {
                    retry_after_secs,
                    pattern: rule.rule.pattern.clone(),
                    max_requests: rule.rule.max_requests,
                    window_seconds: rule.rule.window_seconds,
                });
            }
            Err(err @ AdmissionError::Contention { .. }) => {
                self.on_contention(&err);
                return AdmissionDecision::Rejected(Rejection::RateLimited {
                    retry_after_secs: CONTENTION_RETRY_AFTER_SECS,
                    pattern: rule.rule.pattern.clone(),
                    max_requests: rule.rule.max_requests,
                    window_seconds: rule.rule.window_seconds,
                });
            }
            Err(err) => {
                if let Some(decision) = self.on_failure(&err) {
                    return decision;
                }
            }
        }

        // Unauthenticated traffic is governed by endpoint rules alone
        let Some(caller) = request.caller else {
            metrics::record_decision("admitted", "anonymous");
            return AdmissionDecision::Admitted { expensive };
        };

        match self
            .ledger
            .check_and_increment(&caller.identity, &caller.role, expensive)
            .await
        {
            Ok(QuotaOutcome::Allowed { .. }) => {}
            Ok(QuotaOutcome::Rejected {
                retry_after_secs,
                kind,
            }) => {
                info!(
                    identity = %caller.identity,
                    role = %caller.role,
                    quota_kind = kind.as_str(),
                    retry_after_secs,
                    "Quota exceeded"
                );
                metrics::record_decision("rejected", "quota_exceeded");
                return AdmissionDecision::Rejected(Rejection::QuotaExceeded {
                    retry_after_secs,
                    kind,
                });
            }
            Err(err @ AdmissionError::Contention { .. }) => {
                self.on_contention(&err);
                let kind = if expensive {
                    QuotaKind::Expensive
                } else {
                    QuotaKind::General
                };
                return AdmissionDecision::Rejected(Rejection::QuotaExceeded {
                    retry_after_secs: CONTENTION_RETRY_AFTER_SECS,
                    kind,
                });
            }
            Err(err) => {
                if let Some(decision) = self.on_failure(&err) {
                    return decision;
                }
            }
        }

        metrics::record_decision("admitted", "identified");
        AdmissionDecision::Admitted { expensive }
    }

    /// Retroactively charge an expensive call to the caller's sub-quota
    pub async fn report_expensive(&self, caller: &Caller) {
        if !self.settings.enabled {
            return;
        }
        match self
            .ledger
            .charge_expensive(&caller.identity, &caller.role)
            .await
        {
            Ok(usage) => debug!(
                identity = %caller.identity,
                expensive_call_count = usage.expensive_call_count,
                "Charged expensive call after dispatch"
            ),
            Err(err) => error!(
                identity = %caller.identity,
                error = %err,
                "Failed to charge expensive call"
            ),
        }
    }

    /// Replace the rule list; live counters are kept
    pub async fn reload_rules(&self, rules: Vec<RateLimitRule>) {
        let registry = Arc::new(RuleRegistry::new(rules));
        info!(rules = registry.len(), "Reloaded admission rules");
        *self.registry.write().await = registry;
    }

    pub async fn registry(&self) -> Arc<RuleRegistry> {
        self.registry.read().await.clone()
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn window(&self) -> &WindowTracker {
        &self.window
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Idle time after which the sweeper may drop a key
    pub fn max_idle(&self) -> Duration {
        self.settings.max_idle
    }

    /// Apply the failure policy to a store or configuration failure; `None`
    /// means continue (fail open)
    fn on_failure(&self, err: &AdmissionError) -> Option<AdmissionDecision> {
        let fail_closed =
            !err.is_configuration() && self.settings.failure_policy == FailurePolicy::FailClosed;
        let policy = if fail_closed { "fail_closed" } else { "fail_open" };

        error!(error = %err, kind = err.kind(), policy, "Admission check could not be completed");
        metrics::record_failure(err.kind(), policy);

        fail_closed.then_some(AdmissionDecision::Unavailable)
    }

    /// A counter that cannot be updated is never a reason to admit
    fn on_contention(&self, err: &AdmissionError) {
        warn!(error = %err, "Rejecting request on a contended admission counter");
        metrics::record_failure(err.kind(), "reject");
        metrics::record_decision("rejected", "contention");
    }

    fn flag_anomaly(&self, client: &ClientKey, rule: &RateLimitRule, consecutive: u32) {
        let threshold = self.settings.anomaly_threshold;
        if threshold > 0 && consecutive > 0 && consecutive % threshold == 0 {
            warn!(
                client = %client,
                pattern = %rule.pattern,
                consecutive_rejections = consecutive,
                "Client keeps hitting a full rate limit window"
            );
        }
    }
}

/// Key an endpoint rule counts against for this request
pub fn client_key(scope: RuleScope, request: &AdmissionRequest<'_>) -> ClientKey {
    match (scope, request.caller) {
        (RuleScope::PerIdentity, Some(caller)) => ClientKey::Identity(caller.identity.clone()),
        _ => ClientKey::Ip(request.client_ip),
    }
}
