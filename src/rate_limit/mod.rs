//! Admission Control Module
//!
//! Two independent checks in front of protected handlers:
//!
//! - **Endpoint rules**: fixed-window request caps per path pattern, keyed by
//!   source IP or caller identity. Cheap, and applied to every request.
//! - **Hourly quotas**: per-identity budgets by role, aligned to wall-clock
//!   hours, with a separate sub-budget for expensive operations. Applied only
//!   when the caller is authenticated.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Admission Middleware (axum)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     Admission Manager                        │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐       │
//! │  │ Rule         │  │ Window       │  │ Quota        │       │
//! │  │ Registry     │  │ Tracker      │  │ Ledger       │       │
//! │  └──────────────┘  └──────────────┘  └──────────────┘       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │        Counter Store (per-key compare-and-swap)      │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//!          ▲                                   ▲
//!    Stats Reporter (snapshots)         Sweeper (idle keys)
//! ```

pub mod clock;
pub mod config;
pub mod manager;
pub mod middleware;
pub mod quota;
pub mod rules;
pub mod stats;
pub mod store;
pub mod sweeper;
pub mod window;

#[cfg(test)]
mod proptests;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EndpointPattern, FailurePolicy, RateLimitConfig, RateLimitRule, RoleLimits, RuleScope};
pub use manager::{AdmissionDecision, AdmissionManager, AdmissionRequest, Caller, Rejection};
pub use middleware::{
    admission_middleware, AdmissionState, CallerResolver, ExpensiveCall, ExtensionResolver,
    HeaderResolver, RejectionBody,
};
pub use quota::{QuotaKind, QuotaLedger, QuotaOutcome, QuotaUsage};
pub use rules::{RuleId, RuleRegistry};
pub use stats::{AggregateView, PublicLimits, StatsReporter};
pub use store::{ClientKey, CounterStore, MemoryStore, StoreError};
pub use sweeper::spawn_sweeper;
pub use window::{WindowOutcome, WindowStep, WindowTracker};
