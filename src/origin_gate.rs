//! Origin Gate
//!
//! Request-time cross-origin policy. Every decision re-reads the origin
//! registry, so allow-list changes apply to the very next request.
//!
//! # Policy
//!
//! 1. No `Origin` header: accepted (same-origin and non-browser callers)
//! 2. Development with the open-gate override: accepted
//! 3. Unparseable origin: rejected as invalid
//! 4. Explicit port equal to the trusted frontend port: accepted, any host
//! 5. Exact string match in the registry: accepted
//! 6. Anything else: rejected and audited
//!
//! Rule 4 trusts any host that declares the frontend port. It assumes that
//! port is not reachable from untrusted networks.

use crate::errors::ApiError;
use crate::origins::OriginStore;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Why a request was accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptReason {
    NoOrigin,
    OpenGate,
    TrustedPort,
    Registered,
}

/// Why a request was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRejection {
    InvalidOrigin,
    OriginNotAllowed,
}

/// Terminal state of a gate evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Accepted(AcceptReason),
    Rejected(GateRejection),
}

impl GateDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GateDecision::Accepted(_))
    }
}

/// Cross-origin admission policy
pub struct OriginGate {
    trusted_port: u16,
    open: bool,
    registry: Arc<dyn OriginStore>,
    rejections: AtomicU64,
}

impl OriginGate {
    pub fn new(trusted_port: u16, registry: Arc<dyn OriginStore>) -> Self {
        Self {
            trusted_port,
            open: false,
            registry,
            rejections: AtomicU64::new(0),
        }
    }

    /// Accept every origin. Only wired up in development configurations.
    pub fn open(mut self, open: bool) -> Self {
        self.open = open;
        self
    }

    pub fn trusted_port(&self) -> u16 {
        self.trusted_port
    }

    /// Number of rejected requests since startup
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Decide whether a request declaring `origin` may proceed
    pub async fn evaluate(&self, origin: Option<&str>) -> GateDecision {
        let Some(origin) = origin else {
            return GateDecision::Accepted(AcceptReason::NoOrigin);
        };

        if self.open {
            debug!(origin, "Origin gate open, accepting");
            return GateDecision::Accepted(AcceptReason::OpenGate);
        }

        let parsed = match Url::parse(origin) {
            Ok(url) if url.has_host() => url,
            _ => return self.reject(origin, GateRejection::InvalidOrigin),
        };

        if parsed.port() == Some(self.trusted_port) {
            return GateDecision::Accepted(AcceptReason::TrustedPort);
        }

        let registered = match self.registry.list_origin_strings().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Failed to read origin registry");
                Vec::new()
            }
        };

        if registered.iter().any(|o| o == origin) {
            return GateDecision::Accepted(AcceptReason::Registered);
        }

        self.reject(origin, GateRejection::OriginNotAllowed)
    }

    fn reject(&self, origin: &str, reason: GateRejection) -> GateDecision {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        warn!(target: "audit", origin, reason = ?reason, "Cross-origin request rejected");
        GateDecision::Rejected(reason)
    }
}

/// Reject requests whose `Origin` the gate does not accept
pub async fn origin_gate_middleware(
    State(gate): State<Arc<OriginGate>>,
    req: Request,
    next: Next,
) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .map(|v| v.to_str().map(str::to_string));

    let decision = match &origin {
        None => gate.evaluate(None).await,
        Some(Ok(origin)) => gate.evaluate(Some(origin)).await,
        // Non-visible ASCII cannot be a valid origin
        Some(Err(_)) => gate.reject("<non-ascii>", GateRejection::InvalidOrigin),
    };

    let origin = origin.and_then(Result::ok).unwrap_or_default();
    match decision {
        GateDecision::Accepted(_) => next.run(req).await,
        GateDecision::Rejected(GateRejection::InvalidOrigin) => {
            ApiError::InvalidOrigin(origin).into_response()
        }
        GateDecision::Rejected(GateRejection::OriginNotAllowed) => {
            ApiError::OriginNotAllowed(origin).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origins::MemoryOriginStore;

    fn gate_with(origins: &[&str]) -> OriginGate {
        OriginGate::new(2727, Arc::new(MemoryOriginStore::with_origins(origins.iter())))
    }

    #[tokio::test]
    async fn test_trusted_port_any_host() {
        let gate = gate_with(&[]);
        assert_eq!(
            gate.evaluate(Some("http://192.168.1.50:2727")).await,
            GateDecision::Accepted(AcceptReason::TrustedPort)
        );
        assert_eq!(
            gate.evaluate(Some("https://anything.example.org:2727")).await,
            GateDecision::Accepted(AcceptReason::TrustedPort)
        );
    }

    #[tokio::test]
    async fn test_unregistered_origin_rejected() {
        let gate = gate_with(&[]);
        assert_eq!(
            gate.evaluate(Some("https://evil.example.com")).await,
            GateDecision::Rejected(GateRejection::OriginNotAllowed)
        );
        assert_eq!(gate.rejections(), 1);
    }

    #[tokio::test]
    async fn test_malformed_origin_rejected() {
        let gate = gate_with(&[]);
        for bad in ["not-a-url", "", "null", "http://"] {
            assert_eq!(
                gate.evaluate(Some(bad)).await,
                GateDecision::Rejected(GateRejection::InvalidOrigin),
                "{:?} should be invalid",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_missing_origin_accepted() {
        let gate = gate_with(&[]);
        assert_eq!(
            gate.evaluate(None).await,
            GateDecision::Accepted(AcceptReason::NoOrigin)
        );
    }

    #[tokio::test]
    async fn test_registered_origin_exact_match_only() {
        let gate = gate_with(&["https://partner.example.com"]);

        assert!(gate.evaluate(Some("https://partner.example.com")).await.is_accepted());
        assert!(!gate.evaluate(Some("https://partner.example.com/")).await.is_accepted());
        assert!(!gate.evaluate(Some("https://PARTNER.example.com")).await.is_accepted());
        assert!(!gate.evaluate(Some("http://partner.example.com")).await.is_accepted());
    }

    #[tokio::test]
    async fn test_default_port_is_not_trusted_port() {
        let gate = OriginGate::new(443, Arc::new(MemoryOriginStore::new()));
        // Implicit default ports are not "declared"
        assert!(!gate.evaluate(Some("https://host.example.com")).await.is_accepted());
        assert!(gate.evaluate(Some("https://host.example.com:8443")).await == GateDecision::Rejected(GateRejection::OriginNotAllowed));
    }

    #[tokio::test]
    async fn test_registry_changes_apply_immediately() {
        let registry = Arc::new(MemoryOriginStore::new());
        let gate = OriginGate::new(2727, registry.clone());

        assert!(!gate.evaluate(Some("https://late.example.com")).await.is_accepted());
        let record = registry.add("https://late.example.com", None).await.unwrap();
        assert!(gate.evaluate(Some("https://late.example.com")).await.is_accepted());
        registry.remove(&record.id).await.unwrap();
        assert!(!gate.evaluate(Some("https://late.example.com")).await.is_accepted());
    }

    #[tokio::test]
    async fn test_open_gate_accepts_anything() {
        let gate = gate_with(&[]).open(true);
        assert_eq!(
            gate.evaluate(Some("not-a-url")).await,
            GateDecision::Accepted(AcceptReason::OpenGate)
        );
        assert_eq!(gate.rejections(), 0);
    }
}
