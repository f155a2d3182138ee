use axum::http::Method;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cache::CacheManager;
use crate::clock::{Clock, MonotonicClock};
use crate::config::AdmissionConfig;
use crate::error::Result;
use crate::identity::{Authentication, Identity, IdentityResolver};
use crate::metrics::AdmissionMetrics;
use crate::registry::BucketRegistry;
use crate::tier::{Tier, TierTable};

/// Exempt paths match by prefix, except these which must match exactly.
const EXACT_EXEMPT_PATHS: [&str; 1] = ["/health"];

/// What the gate needs to know about a request.
#[derive(Debug, Clone, Copy)]
pub struct RequestFacts<'a> {
    pub path: &'a str,
    pub method: &'a Method,
    pub forwarded_for: Option<&'a str>,
    pub peer: Option<IpAddr>,
    pub auth: Option<&'a Authentication>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowance {
    pub identity: Identity,
    pub tier: Tier,
    pub remaining: u64,
    pub limit: u64,
    /// Whole seconds until the bucket refills.
    pub reset_after: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub identity: Identity,
    pub tier: Tier,
    pub retry_after: u64,
}

/// Outcome of one admission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Path is exempt; no bucket was touched.
    Exempt,
    Allowed(Allowance),
    Denied(Denial),
    /// The layer could not decide and let the request through.
    FailOpen,
}

/// Whole seconds, rounded up, so a client never retries before the refill.
pub fn ceil_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs();
    if wait.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

/// Admission decisions for every request: exemption, identity, tier, bucket.
pub struct Gate {
    tiers: TierTable,
    exempt_paths: Vec<String>,
    resolver: IdentityResolver,
    cache: CacheManager,
    registry: Arc<BucketRegistry>,
    metrics: AdmissionMetrics,
    emit_limit_headers: bool,
}

impl Gate {
    pub fn new(config: AdmissionConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    /// Build with an explicit time source. Refuses invalid limits.
    pub fn with_clock(config: AdmissionConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let config = config.validated()?;
        let cache = CacheManager::new(&config.registry);
        let registry = Arc::new(cache.bucket_registry(clock));

        Ok(Self {
            tiers: config.tier,
            exempt_paths: config.exempt_paths,
            resolver: IdentityResolver::new(&config.client_ip),
            cache,
            registry,
            metrics: AdmissionMetrics::new(),
            emit_limit_headers: config.emit_limit_headers,
        })
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    pub fn registry(&self) -> &Arc<BucketRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn metrics(&self) -> &AdmissionMetrics {
        &self.metrics
    }

    pub fn emit_limit_headers(&self) -> bool {
        self.emit_limit_headers
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|exempt| {
            if EXACT_EXEMPT_PATHS.contains(&exempt.as_str()) {
                path == exempt
            } else {
                path.starts_with(exempt.as_str())
            }
        })
    }

    /// Decide one request. Takes at most one token and never fails: internal
    /// problems are logged and the request is let through.
    pub fn admit(&self, request: &RequestFacts<'_>) -> Admission {
        if self.is_exempt(request.path) {
            self.metrics.record_exempt();
            return Admission::Exempt;
        }

        let identity = match self
            .resolver
            .resolve(request.auth, request.forwarded_for, request.peer)
        {
            Ok(identity) => identity,
            Err(e) => {
                warn!(
                    target: "postnow_admission::gate",
                    path = %request.path,
                    error = %e,
                    "Falling back to unknown identity"
                );
                Identity::unknown()
            }
        };

        let is_authenticated = request.auth.is_some_and(Authentication::is_authenticated);
        let tier = Tier::classify(request.path, request.method, is_authenticated);
        let limit = self.tiers.limit(tier);

        let bucket = match self.registry.get_or_create(identity.as_str(), tier, limit) {
            Ok(bucket) => bucket,
            Err(e) => {
                warn!(
                    target: "postnow_admission::gate",
                    identity = %identity,
                    path = %request.path,
                    tier = %tier,
                    error = %e,
                    "Admission failed open"
                );
                self.metrics.record_fail_open();
                return Admission::FailOpen;
            }
        };

        let take = bucket.try_take(1, self.registry.clock().now_nanos());
        self.metrics.record_decision(tier, take.consumed);

        if take.consumed {
            Admission::Allowed(Allowance {
                identity,
                tier,
                remaining: take.remaining,
                limit: bucket.capacity(),
                reset_after: ceil_secs(take.until_reset),
            })
        } else {
            let retry_after = ceil_secs(take.wait);
            warn!(
                target: "postnow_admission::gate",
                identity = %identity,
                path = %request.path,
                tier = %tier,
                retry_after,
                "Rate limit exceeded"
            );
            Admission::Denied(Denial {
                identity,
                tier,
                retry_after,
            })
        }
    }
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("tiers", &self.tiers)
            .field("exempt_paths", &self.exempt_paths)
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::AdmissionError;

    fn gate() -> (Gate, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let gate = Gate::with_clock(AdmissionConfig::default(), clock.clone()).unwrap();
        (gate, clock)
    }

    fn facts<'a>(path: &'a str, method: &'a Method, auth: Option<&'a Authentication>) -> RequestFacts<'a> {
        RequestFacts {
            path,
            method,
            forwarded_for: None,
            peer: Some("203.0.113.7".parse().unwrap()),
            auth,
        }
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::ZERO), 0);
        assert_eq!(ceil_secs(Duration::from_secs(60)), 60);
        assert_eq!(ceil_secs(Duration::from_millis(59_001)), 60);
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_exempt_paths() {
        let (gate, _) = gate();
        assert!(gate.is_exempt("/h2-console/login.do"));
        assert!(gate.is_exempt("/actuator"));
        assert!(gate.is_exempt("/actuator/health"));
        assert!(gate.is_exempt("/health"));
        assert!(gate.is_exempt("/swagger-ui/index.html"));
        assert!(gate.is_exempt("/v3/api-docs/swagger-config"));

        assert!(!gate.is_exempt("/healthz"));
        assert!(!gate.is_exempt("/health/db"));
        assert!(!gate.is_exempt("/api/posts"));
    }

    #[test]
    fn test_exempt_request_touches_nothing() {
        let (gate, _) = gate();
        let method = Method::GET;
        for _ in 0..100 {
            assert_eq!(gate.admit(&facts("/actuator/health", &method, None)), Admission::Exempt);
        }
        assert!(gate.registry().is_empty());
        assert_eq!(gate.metrics().snapshot().exempt_requests, 100);
    }

    #[test]
    fn test_allowance_counts_down() {
        let (gate, _) = gate();
        let method = Method::GET;

        match gate.admit(&facts("/api/posts", &method, None)) {
            Admission::Allowed(allowance) => {
                assert_eq!(allowance.identity.as_str(), "ip:203.0.113.7");
                assert_eq!(allowance.tier, Tier::Lenient);
                assert_eq!(allowance.remaining, 59);
                assert_eq!(allowance.limit, 60);
                assert_eq!(allowance.reset_after, 60);
            }
            other => panic!("expected allowance, got {:?}", other),
        }
    }

    #[test]
    fn test_denial_after_capacity() {
        let (gate, clock) = gate();
        let method = Method::POST;

        for _ in 0..10 {
            assert!(matches!(gate.admit(&facts("/api/auth/login", &method, None)), Admission::Allowed(_)));
        }

        clock.advance(Duration::from_secs(15));
        match gate.admit(&facts("/api/auth/login", &method, None)) {
            Admission::Denied(denial) => {
                assert_eq!(denial.tier, Tier::Strict);
                assert_eq!(denial.retry_after, 45);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[test]
    fn test_authenticated_caller_gets_own_bucket() {
        let (gate, _) = gate();
        let method = Method::GET;
        let alice = Authentication::user("alice");

        match gate.admit(&facts("/api/posts", &method, Some(&alice))) {
            Admission::Allowed(allowance) => {
                assert_eq!(allowance.identity.as_str(), "user:alice");
                assert_eq!(allowance.tier, Tier::Authenticated);
                assert_eq!(allowance.remaining, 99);
            }
            other => panic!("expected allowance, got {:?}", other),
        }
    }

    #[test]
    fn test_unresolvable_identity_shares_unknown_bucket() {
        let (gate, _) = gate();
        let method = Method::GET;
        let request = RequestFacts {
            path: "/api/posts",
            method: &method,
            forwarded_for: None,
            peer: None,
            auth: None,
        };

        assert!(matches!(gate.admit(&request), Admission::Allowed(_)));
        assert!(gate.registry().peek("ip:unknown", Tier::Lenient).is_some());
    }

    #[test]
    fn test_full_registry_fails_open() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let mut gate = Gate::with_clock(AdmissionConfig::default(), clock.clone()).unwrap();
        gate.registry = Arc::new(BucketRegistry::new(0, Duration::from_secs(3600), clock));

        let method = Method::GET;
        assert_eq!(gate.admit(&facts("/api/posts", &method, None)), Admission::FailOpen);
        assert_eq!(gate.metrics().snapshot().fail_open_requests, 1);
        assert!(gate.registry().is_empty());
    }

    #[test]
    fn test_invalid_config_refuses_to_build() {
        let mut config = AdmissionConfig::default();
        config.tier.strict.capacity = 0;
        let err = Gate::new(config).unwrap_err();
        assert!(matches!(err, AdmissionError::ConfigInvalid(_)));
    }
}
