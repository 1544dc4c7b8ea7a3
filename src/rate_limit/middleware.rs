//! Admission Middleware
//!
//! axum binding of [`AdmissionManager`]: resolves the caller and client IP,
//! runs the admission check and either forwards to the wrapped router or
//! answers 429 / 503 directly.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use super::config::DEFAULT_ROLE;
use super::manager::{AdmissionDecision, AdmissionManager, AdmissionRequest, Caller, Rejection};
use super::quota::QuotaKind;

/// Header carrying the authenticated identity (trusted proxy deployments)
pub const IDENTITY_HEADER: &str = "x-caller-identity";

/// Header carrying the authenticated role
pub const ROLE_HEADER: &str = "x-caller-role";

/// Response extension set by a handler that performed an expensive call the
/// route classification did not predict
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpensiveCall;

/// Source of the authenticated caller for a request
pub trait CallerResolver: Send + Sync + fmt::Debug {
    fn resolve(&self, request: &Request) -> Option<Caller>;
}

/// Reads a [`Caller`] extension inserted by an upstream authentication layer
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionResolver;

impl CallerResolver for ExtensionResolver {
    fn resolve(&self, request: &Request) -> Option<Caller> {
        request.extensions().get::<Caller>().cloned()
    }
}

/// Reads identity and role from headers set by an authenticating proxy
#[derive(Debug, Clone)]
pub struct HeaderResolver {
    pub default_role: String,
}

impl Default for HeaderResolver {
    fn default() -> Self {
        Self {
            default_role: DEFAULT_ROLE.to_string(),
        }
    }
}

impl CallerResolver for HeaderResolver {
    fn resolve(&self, request: &Request) -> Option<Caller> {
        let headers = request.headers();
        let identity = header_str(headers, IDENTITY_HEADER)?;
        let role = header_str(headers, ROLE_HEADER).unwrap_or(self.default_role.as_str());
        Some(Caller::new(identity, role))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Shared state for [`admission_middleware`]
#[derive(Debug, Clone)]
pub struct AdmissionState {
    pub manager: AdmissionManager,
    pub resolver: Arc<dyn CallerResolver>,
    pub trust_forwarded_for: bool,
}

impl AdmissionState {
    pub fn new(manager: AdmissionManager) -> Self {
        Self {
            manager,
            resolver: Arc::new(ExtensionResolver),
            trust_forwarded_for: false,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn CallerResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    /// Put every route of `router` behind the admission check
    pub fn wrap(self, router: Router) -> Router {
        router.layer(middleware::from_fn_with_state(self, admission_middleware))
    }
}

/// 429 / 503 response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub detail: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub retry_after: u64,
    pub quota_kind: Option<QuotaKind>,
}

impl RejectionBody {
    fn from_rejection(rejection: &Rejection) -> Self {
        match rejection {
            Rejection::RateLimited {
                retry_after_secs,
                max_requests,
                window_seconds,
                ..
            } => Self {
                detail: format!(
                    "Rate limit of {} requests per {}s exceeded, retry in {}s",
                    max_requests, window_seconds, retry_after_secs
                ),
                kind: "rate_limit_exceeded".to_string(),
                retry_after: *retry_after_secs,
                quota_kind: None,
            },
            Rejection::QuotaExceeded {
                retry_after_secs,
                kind,
            } => Self {
                detail: format!(
                    "Hourly {} quota exhausted, resets in {}s",
                    kind.as_str().to_lowercase(),
                    retry_after_secs
                ),
                kind: "quota_exceeded".to_string(),
                retry_after: *retry_after_secs,
                quota_kind: Some(*kind),
            },
        }
    }
}

fn rejection_response(rejection: &Rejection) -> Response {
    let body = RejectionBody::from_rejection(rejection);
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, HeaderValue::from(body.retry_after))],
        Json(body),
    )
        .into_response()
}

fn unavailable_response() -> Response {
    let body = RejectionBody {
        detail: "Admission control is temporarily unavailable".to_string(),
        kind: "admission_unavailable".to_string(),
        retry_after: 1,
        quota_kind: None,
    };
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, HeaderValue::from(body.retry_after))],
        Json(body),
    )
        .into_response()
}

/// Source IP of a request
///
/// Uses the first `X-Forwarded-For` entry only when `trust_forwarded_for` is
/// set, then the socket peer, then the unspecified address.
pub fn client_ip(request: &Request, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Admission check in front of the wrapped handlers
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    mut request: Request,
    next: Next,
) -> Response {
    let caller = state.resolver.resolve(&request);
    let ip = client_ip(&request, state.trust_forwarded_for);
    let path = request.uri().path().to_string();
    let method = request.method().as_str().to_string();

    let decision = state
        .manager
        .admit(&AdmissionRequest {
            path: &path,
            method: &method,
            client_ip: ip,
            caller: caller.as_ref(),
        })
        .await;

    let expensive = match decision {
        AdmissionDecision::Admitted { expensive } => expensive,
        AdmissionDecision::Rejected(rejection) => return rejection_response(&rejection),
        AdmissionDecision::Unavailable => return unavailable_response(),
    };

    if let Some(caller) = &caller {
        request.extensions_mut().insert(caller.clone());
    }

    let response = next.run(request).await;

    if !expensive && response.extensions().get::<ExpensiveCall>().is_some() {
        if let Some(caller) = &caller {
            state.manager.report_expensive(caller).await;
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri("/chat/x");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_header_resolver() {
        let resolver = HeaderResolver::default();

        let request = request_with(&[(IDENTITY_HEADER, "alice"), (ROLE_HEADER, "premium")]);
        assert_eq!(resolver.resolve(&request), Some(Caller::new("alice", "premium")));

        let request = request_with(&[(IDENTITY_HEADER, "bob")]);
        assert_eq!(resolver.resolve(&request), Some(Caller::new("bob", "free")));

        let request = request_with(&[(ROLE_HEADER, "admin")]);
        assert_eq!(resolver.resolve(&request), None);
    }

    #[test]
    fn test_extension_resolver() {
        let mut request = request_with(&[]);
        assert_eq!(ExtensionResolver.resolve(&request), None);

        request.extensions_mut().insert(Caller::new("alice", "free"));
        assert_eq!(ExtensionResolver.resolve(&request), Some(Caller::new("alice", "free")));
    }

    #[test]
    fn test_client_ip_sources() {
        let mut request = request_with(&[("x-forwarded-for", "198.51.100.4, 10.0.0.1")]);
        assert_eq!(client_ip(&request, false), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(client_ip(&request, true), "198.51.100.4".parse::<IpAddr>().unwrap());

        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4000))));
        assert_eq!(client_ip(&request, false), "192.0.2.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_quota_rejection_body() {
        let body = RejectionBody::from_rejection(&Rejection::QuotaExceeded {
            retry_after_secs: 120,
            kind: QuotaKind::Expensive,
        });
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "quota_exceeded");
        assert_eq!(json["retry_after"], 120);
        assert_eq!(json["quota_kind"], "EXPENSIVE");
    }

    #[test]
    fn test_rate_limit_body_has_null_quota_kind() {
        let body = RejectionBody::from_rejection(&Rejection::RateLimited {
            retry_after_secs: 30,
            pattern: "/auth/*".to_string(),
            max_requests: 5,
            window_seconds: 60,
        });
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "rate_limit_exceeded");
        assert!(json.get("quota_kind").unwrap().is_null());
    }
}
