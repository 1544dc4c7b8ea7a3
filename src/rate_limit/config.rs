//! Rate Limit Configuration
//!
//! Static rule list and role limits. Loaded once at startup; the rule list can
//! be swapped at runtime through [`AdmissionManager::reload_rules`].
//!
//! [`AdmissionManager::reload_rules`]: super::manager::AdmissionManager::reload_rules

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AdmissionError;

/// Pattern that matches every path
pub const CATCH_ALL_PATTERN: &str = "/*";

/// Length of a quota period (fixed, aligned to wall-clock hours)
pub const QUOTA_PERIOD_SECS: u64 = 3600;

pub const DEFAULT_MAX_CAS_ATTEMPTS: u32 = 64;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_STATS_SNAPSHOT_TTL_SECS: u64 = 5;
pub const DEFAULT_ANOMALY_THRESHOLD: u32 = 100;
pub const DEFAULT_ROLE: &str = "free";

/// Which key an endpoint rule counts against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleScope {
    /// Always the source IP, even for authenticated callers
    PerIp,
    /// The caller identity when known, the source IP otherwise
    PerIdentity,
}

fn default_scope() -> RuleScope {
    RuleScope::PerIp
}

/// Endpoint traffic-shaping rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Path prefix or glob (`/auth/*`, `/repos/*/files`, `/*`)
    pub pattern: String,

    /// Methods this rule applies to; `None` means all methods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,

    /// Requests accepted per window
    pub max_requests: u32,

    /// Window length in seconds
    pub window_seconds: u64,

    /// Counting scope
    #[serde(default = "default_scope")]
    pub scope: RuleScope,
}

impl RateLimitRule {
    pub fn new(pattern: &str, max_requests: u32, window_seconds: u64, scope: RuleScope) -> Self {
        Self {
            pattern: pattern.to_string(),
            methods: None,
            max_requests,
            window_seconds,
            scope,
        }
    }

    /// Restrict the rule to the given methods
    pub fn with_methods(mut self, methods: &[&str]) -> Self {
        self.methods = Some(methods.iter().map(|m| m.to_ascii_uppercase()).collect());
        self
    }

    pub fn is_catch_all(&self) -> bool {
        self.pattern == CATCH_ALL_PATTERN && self.methods.is_none()
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Path/method pair used to classify expensive endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPattern {
    pub pattern: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
}

impl EndpointPattern {
    pub fn new(pattern: &str, methods: &[&str]) -> Self {
        Self {
            pattern: pattern.to_string(),
            methods: if methods.is_empty() {
                None
            } else {
                Some(methods.iter().map(|m| m.to_ascii_uppercase()).collect())
            },
        }
    }
}

/// Hourly budget for one role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleLimits {
    /// General requests per hour
    pub request_limit: u32,

    /// Expensive-operation calls per hour (also counted as general requests)
    pub expensive_call_limit: u32,
}

impl RoleLimits {
    pub fn new(request_limit: u32, expensive_call_limit: u32) -> Self {
        Self {
            request_limit,
            expensive_call_limit,
        }
    }
}

/// What to do when the counter store cannot answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request and log the failure
    #[default]
    FailOpen,
    /// Answer 503 until the store recovers
    FailClosed,
}

impl FromStr for FailurePolicy {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_open" | "open" => Ok(FailurePolicy::FailOpen),
            "fail_closed" | "closed" => Ok(FailurePolicy::FailClosed),
            other => Err(AdmissionError::Configuration(format!(
                "unknown failure policy '{}'",
                other
            ))),
        }
    }
}

/// Admission control configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable admission control
    pub enabled: bool,

    /// Behaviour on counter store failure
    pub failure_policy: FailurePolicy,

    /// Compare-and-swap retries before giving up on a contended key
    pub max_cas_attempts: u32,

    /// Idle-key sweep interval in seconds
    pub sweep_interval_secs: u64,

    /// How long the privileged aggregate view may be served from cache
    pub stats_snapshot_ttl_secs: u64,

    /// Consecutive endpoint rejections from one key before a warning is logged
    pub anomaly_threshold: u32,

    /// Endpoint rules, first match wins
    pub rules: Vec<RateLimitRule>,

    /// Role name to hourly limits
    pub roles: HashMap<String, RoleLimits>,

    /// Endpoints whose calls count against the expensive sub-quota
    pub expensive_endpoints: Vec<EndpointPattern>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_policy: FailurePolicy::FailOpen,
            max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            stats_snapshot_ttl_secs: DEFAULT_STATS_SNAPSHOT_TTL_SECS,
            anomaly_threshold: DEFAULT_ANOMALY_THRESHOLD,
            rules: default_rules(),
            roles: default_roles(),
            expensive_endpoints: vec![
                EndpointPattern::new("/chat/*", &["POST"]),
                EndpointPattern::new("/analysis/*", &["POST"]),
            ],
        }
    }
}

fn default_rules() -> Vec<RateLimitRule> {
    vec![
        RateLimitRule::new("/auth/*", 5, 60, RuleScope::PerIp),
        RateLimitRule::new("/chat/*", 30, 60, RuleScope::PerIdentity),
        RateLimitRule::new("/upload/*", 10, 60, RuleScope::PerIdentity),
        RateLimitRule::new(CATCH_ALL_PATTERN, 100, 60, RuleScope::PerIp),
    ]
}

fn default_roles() -> HashMap<String, RoleLimits> {
    HashMap::from([
        (DEFAULT_ROLE.to_string(), RoleLimits::new(100, 10)),
        ("premium".to_string(), RoleLimits::new(5000, 500)),
        ("admin".to_string(), RoleLimits::new(100_000, 10_000)),
    ])
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit everything (for tests and local development)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Apply `ADMISSION_*` environment overrides; unparseable values are ignored
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("ADMISSION_ENABLED") {
            self.enabled = val.parse().unwrap_or(self.enabled);
        }

        if let Ok(val) = std::env::var("ADMISSION_FAILURE_POLICY") {
            if let Ok(policy) = val.parse() {
                self.failure_policy = policy;
            }
        }

        if let Ok(val) = std::env::var("ADMISSION_SWEEP_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                if secs > 0 {
                    self.sweep_interval_secs = secs;
                }
            }
        }

        self
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn stats_snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.stats_snapshot_ttl_secs)
    }

    /// Idle time after which a counter can be evicted
    ///
    /// Covers both the longest endpoint window and the quota period.
    pub fn max_idle(&self) -> Duration {
        let largest_window = self
            .rules
            .iter()
            .map(|r| r.window_seconds)
            .max()
            .unwrap_or(0);
        Duration::from_secs(largest_window.max(QUOTA_PERIOD_SECS))
    }

    /// Check rule and role invariants
    pub fn validate(&self) -> Result<(), AdmissionError> {
        validate_rules(&self.rules)?;

        if self.roles.is_empty() {
            return Err(AdmissionError::Configuration(
                "at least one role must be configured".to_string(),
            ));
        }
        for (role, limits) in &self.roles {
            if limits.request_limit == 0 {
                return Err(AdmissionError::Configuration(format!(
                    "role '{}' has a zero request limit",
                    role
                )));
            }
            if limits.expensive_call_limit > limits.request_limit {
                return Err(AdmissionError::Configuration(format!(
                    "role '{}' allows more expensive calls ({}) than requests ({})",
                    role, limits.expensive_call_limit, limits.request_limit
                )));
            }
        }

        for endpoint in &self.expensive_endpoints {
            if !endpoint.pattern.starts_with('/') {
                return Err(AdmissionError::Configuration(format!(
                    "expensive endpoint pattern '{}' must start with '/'",
                    endpoint.pattern
                )));
            }
        }

        if self.max_cas_attempts == 0 {
            return Err(AdmissionError::Configuration(
                "max_cas_attempts must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Check that every rule is well formed and the catch-all closes the list
pub fn validate_rules(rules: &[RateLimitRule]) -> Result<(), AdmissionError> {
    for rule in rules {
        if !rule.pattern.starts_with('/') {
            return Err(AdmissionError::Configuration(format!(
                "rule pattern '{}' must start with '/'",
                rule.pattern
            )));
        }
        if rule.max_requests == 0 {
            return Err(AdmissionError::Configuration(format!(
                "rule '{}' must allow at least one request",
                rule.pattern
            )));
        }
        if rule.window_seconds == 0 {
            return Err(AdmissionError::Configuration(format!(
                "rule '{}' must have a window of at least one second",
                rule.pattern
            )));
        }
        if matches!(&rule.methods, Some(methods) if methods.is_empty()) {
            return Err(AdmissionError::Configuration(format!(
                "rule '{}' has an empty method list",
                rule.pattern
            )));
        }
    }

    let catch_alls = rules.iter().filter(|r| r.is_catch_all()).count();
    if catch_alls != 1 {
        return Err(AdmissionError::Configuration(format!(
            "expected exactly one catch-all rule '{}', found {}",
            CATCH_ALL_PATTERN, catch_alls
        )));
    }
    if !rules.last().is_some_and(RateLimitRule::is_catch_all) {
        return Err(AdmissionError::Configuration(
            "the catch-all rule must be the last entry".to_string(),
        ));
    }

    Ok(())
}
