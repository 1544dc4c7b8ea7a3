//! Admission Control Library
//!
//! Endpoint rate limiting and per-identity hourly quotas for HTTP APIs,
//! with an axum middleware, read-only statistics views and Prometheus
//! metrics.

pub mod config;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod server;

pub use error::AdmissionError;
