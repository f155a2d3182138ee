use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::gate::{Admission, Gate, RequestFacts};
use crate::identity::Authentication;
use crate::response::{RateLimitExceeded, RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING, RATE_LIMIT_RESET};

/// Marks a request the admission middleware has already seen.
#[derive(Debug, Clone, Copy)]
struct AdmissionApplied;

/// Runs every request through the gate before dispatch.
///
/// Allowed requests get `X-Rate-Limit-Remaining` on the way out; denied ones
/// get a 429 and never reach the handler. A request re-entering the stack is
/// passed through untouched, so a request spends at most one token.
pub async fn admission_middleware(
    State(gate): State<Arc<Gate>>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.extensions().get::<AdmissionApplied>().is_some() {
        return next.run(request).await;
    }
    request.extensions_mut().insert(AdmissionApplied);

    let admission = {
        let forwarded_for = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok());
        let facts = RequestFacts {
            path: request.uri().path(),
            method: request.method(),
            forwarded_for,
            peer: peer_ip(&request),
            auth: request.extensions().get::<Authentication>(),
        };
        gate.admit(&facts)
    };

    match admission {
        Admission::Exempt | Admission::FailOpen => next.run(request).await,
        Admission::Allowed(allowance) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(allowance.remaining));
            if gate.emit_limit_headers() {
                headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(allowance.limit));
                headers.insert(RATE_LIMIT_RESET, HeaderValue::from(allowance.reset_after));
            }
            response
        }
        Admission::Denied(denial) => RateLimitExceeded::new(denial.retry_after).into_response(),
    }
}

/// Transport peer, from `ConnectInfo` or a bare `SocketAddr` extension.
fn peer_ip(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .or_else(|| request.extensions().get::<SocketAddr>().map(SocketAddr::ip))
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let peer = peer_ip(&request).map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
    let started = Instant::now();

    info!(
        target: "postnow_admission::middleware",
        method = %method,
        uri = %uri,
        peer = %peer,
        "Incoming request"
    );

    let response = next.run(request).await;

    info!(
        target: "postnow_admission::middleware",
        method = %method,
        uri = %uri,
        status = %response.status(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );

    response
}
