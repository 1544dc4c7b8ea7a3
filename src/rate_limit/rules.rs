//! Rule Registry
//!
//! Ordered endpoint rules evaluated first-match-wins. Patterns are segment
//! prefixes: `/auth/*` and `/auth` both cover `/auth`, `/auth/login` and
//! anything deeper. A `*` inside a segment matches any run of characters
//! within that one segment, so `/repos/*/files` covers `/repos/42/files/a.rs`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::config::{validate_rules, EndpointPattern, RateLimitRule};
use crate::error::AdmissionError;

/// Stable identifier of a rule within a registry
///
/// Derived from position and definition, so reloading an identical rule set
/// yields identical ids and live counters carry over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(String);

impl RuleId {
    fn for_rule(index: usize, rule: &RateLimitRule) -> Self {
        let methods = rule
            .methods
            .as_ref()
            .map(|m| m.join(","))
            .unwrap_or_else(|| "*".to_string());
        Self(format!("{}:{}:{}", index, methods, rule.pattern))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A rule together with its registry id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredRule {
    pub id: RuleId,
    pub rule: RateLimitRule,
}

/// Ordered, immutable rule list
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<RegisteredRule>,
}

impl RuleRegistry {
    /// Build a registry from an already-validated rule list
    pub fn new(rules: Vec<RateLimitRule>) -> Self {
        let rules = rules
            .into_iter()
            .enumerate()
            .map(|(index, rule)| RegisteredRule {
                id: RuleId::for_rule(index, &rule),
                rule,
            })
            .collect();
        Self { rules }
    }

    /// Build a registry, checking the catch-all invariant first
    pub fn validated(rules: Vec<RateLimitRule>) -> Result<Self, AdmissionError> {
        validate_rules(&rules)?;
        Ok(Self::new(rules))
    }

    /// First rule whose pattern and method filter both match
    ///
    /// Returns `None` only when the catch-all is missing.
    pub fn match_rule(&self, path: &str, method: &str) -> Option<&RegisteredRule> {
        self.rules.iter().find(|r| {
            method_matches(r.rule.methods.as_deref(), method) && pattern_matches(&r.rule.pattern, path)
        })
    }

    pub fn get(&self, id: &RuleId) -> Option<&RegisteredRule> {
        self.rules.iter().find(|r| &r.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredRule> {
        self.rules.iter()
    }

    pub fn rules(&self) -> Vec<RateLimitRule> {
        self.rules.iter().map(|r| r.rule.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn largest_window(&self) -> Duration {
        self.rules
            .iter()
            .map(|r| r.rule.window())
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Whether a request hits one of the given endpoint patterns
pub fn endpoint_matches(endpoints: &[EndpointPattern], path: &str, method: &str) -> bool {
    endpoints
        .iter()
        .any(|e| method_matches(e.methods.as_deref(), method) && pattern_matches(&e.pattern, path))
}

fn method_matches(filter: Option<&[String]>, method: &str) -> bool {
    match filter {
        None => true,
        Some(methods) => methods.iter().any(|m| m.eq_ignore_ascii_case(method)),
    }
}

/// Segment-prefix match with in-segment `*` wildcards
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pattern = pattern.strip_suffix("/*").unwrap_or(pattern);
    let mut path_segments = path.split('/').filter(|s| !s.is_empty());

    for pattern_segment in pattern.split('/').filter(|s| !s.is_empty()) {
        match path_segments.next() {
            Some(segment) if segment_matches(pattern_segment, segment) => {}
            _ => return false,
        }
    }
    true
}

fn segment_matches(pattern: &str, segment: &str) -> bool {
    let p = pattern.as_bytes();
    let s = segment.as_bytes();
    let (mut pi, mut si) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while si < s.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            pi += 1;
            mark = si;
        } else if pi < p.len() && p[pi] == s[si] {
            pi += 1;
            si += 1;
        } else if let Some(star_at) = star {
            pi = star_at + 1;
            mark += 1;
            si = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}
