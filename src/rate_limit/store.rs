//! Counter Store
//!
//! Backend abstraction for window and quota counters. Every mutation goes
//! through `compare_and_swap`, so the same retry loop gives per-key atomicity
//! over a local sharded map or a shared external store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::rules::RuleId;
use crate::error::AdmissionError;

/// Failures reported by a counter store backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Backend cannot be reached
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// Entry exists but holds the wrong record type for its key
    #[error("corrupt counter entry for {0}")]
    Corrupt(String),
}

/// Key an endpoint rule counts against
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ClientKey {
    Ip(IpAddr),
    Identity(String),
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKey::Ip(ip) => write!(f, "ip:{}", ip),
            ClientKey::Identity(id) => write!(f, "id:{}", id),
        }
    }
}

/// Storage key for one counter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CounterKey {
    /// Endpoint window for (client key, rule)
    Window { client: ClientKey, rule: RuleId },
    /// Hourly quota for an identity
    Quota { identity: String },
}

impl CounterKey {
    pub fn window(client: ClientKey, rule: RuleId) -> Self {
        CounterKey::Window { client, rule }
    }

    pub fn quota(identity: &str) -> Self {
        CounterKey::Quota {
            identity: identity.to_string(),
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterKey::Window { client, rule } => write!(f, "window/{}/{}", client, rule),
            CounterKey::Quota { identity } => write!(f, "quota/{}", identity),
        }
    }
}

/// Fixed-window state for one (client key, rule)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowState {
    /// Monotonic time the current window began
    pub window_start: Duration,

    /// Requests accepted in the current window
    pub count: u32,
}

/// Hourly quota state for one identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaState {
    /// Role captured at period start
    pub role: String,

    /// Hour boundary the period started on
    pub period_start: DateTime<Utc>,

    pub request_count: u32,

    pub expensive_call_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterRecord {
    Window(WindowState),
    Quota(QuotaState),
}

/// Stored value: a record plus its last-touched time for idle eviction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterEntry {
    pub record: CounterRecord,

    /// Monotonic time of the last update
    pub touched_at: Duration,
}

impl CounterEntry {
    pub fn window(state: WindowState, touched_at: Duration) -> Self {
        Self {
            record: CounterRecord::Window(state),
            touched_at,
        }
    }

    pub fn quota(state: QuotaState, touched_at: Duration) -> Self {
        Self {
            record: CounterRecord::Quota(state),
            touched_at,
        }
    }

    pub fn as_window(&self) -> Option<&WindowState> {
        match &self.record {
            CounterRecord::Window(state) => Some(state),
            CounterRecord::Quota(_) => None,
        }
    }

    pub fn as_quota(&self) -> Option<&QuotaState> {
        match &self.record {
            CounterRecord::Quota(state) => Some(state),
            CounterRecord::Window(_) => None,
        }
    }
}

/// Counter storage backend
///
/// Implementations must make `compare_and_swap` atomic per key. Nothing else
/// is required for the admission guarantees to hold.
#[async_trait]
pub trait CounterStore: Send + Sync + fmt::Debug {
    /// Current entry for `key`
    async fn get(&self, key: &CounterKey) -> Result<Option<CounterEntry>, StoreError>;

    /// Store `new` only if the current value equals `expected` (`None` = absent)
    ///
    /// Returns `Ok(false)` when another writer changed the key first.
    async fn compare_and_swap(
        &self,
        key: &CounterKey,
        expected: Option<CounterEntry>,
        new: CounterEntry,
    ) -> Result<bool, StoreError>;

    /// Point-in-time copy of all entries; may be eventually consistent
    async fn snapshot(&self) -> Result<Vec<(CounterKey, CounterEntry)>, StoreError>;

    /// Drop entries untouched for longer than `max_idle`; returns how many
    async fn evict_idle(&self, now: Duration, max_idle: Duration) -> Result<usize, StoreError>;

    /// Number of tracked keys
    async fn len(&self) -> Result<usize, StoreError>;
}

/// In-process store backed by a sharded concurrent map
///
/// Each shard has its own lock, so updates to unrelated keys never contend
/// on a global lock.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    counters: Arc<DashMap<CounterKey, CounterEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &CounterKey) -> Result<Option<CounterEntry>, StoreError> {
        Ok(self.counters.get(key).map(|entry| entry.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &CounterKey,
        expected: Option<CounterEntry>,
        new: CounterEntry,
    ) -> Result<bool, StoreError> {
        match self.counters.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if expected.as_ref() == Some(occupied.get()) {
                    occupied.insert(new);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(new);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn snapshot(&self) -> Result<Vec<(CounterKey, CounterEntry)>, StoreError> {
        Ok(self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    async fn evict_idle(&self, now: Duration, max_idle: Duration) -> Result<usize, StoreError> {
        let mut evicted = 0;
        self.counters.retain(|_, entry| {
            let keep = now.saturating_sub(entry.touched_at) <= max_idle;
            if !keep {
                evicted += 1;
            }
            keep
        });
        Ok(evicted)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.counters.len())
    }
}

/// Read-modify-write `key` with optimistic retries
///
/// `step` sees the current entry and returns the replacement plus a value to
/// hand back once the swap lands. A `None` replacement means the decision
/// needs no write; the value is returned straight from the read. `step` may
/// run several times under contention.
pub async fn update_counter<T, F>(
    store: &dyn CounterStore,
    key: &CounterKey,
    max_attempts: u32,
    mut step: F,
) -> Result<T, AdmissionError>
where
    F: FnMut(Option<&CounterEntry>) -> Result<(Option<CounterEntry>, T), AdmissionError> + Send,
    T: Send,
{
    for attempt in 0..max_attempts {
        let current = store.get(key).await?;
        let (next, output) = step(current.as_ref())?;
        let Some(next) = next else {
            return Ok(output);
        };
        if store.compare_and_swap(key, current, next).await? {
            return Ok(output);
        }
        if attempt > 0 {
            // Let the winning writer finish before re-reading
            tokio::task::yield_now().await;
        }
    }

    Err(AdmissionError::Contention {
        key: key.to_string(),
        attempts: max_attempts,
    })
}
