//! # Admission Middleware
//!
//! HTTP entry point of the controller. Each flavor is a catch-all
//! [`Router`]: any method on any path goes through the same gate.
//!
//! ## Request flow
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ 1. Read the configured identity header                         │
//! │      absent or empty ──► 400 "Missing <name> header"           │
//! │ 2. limiter.allow(identity, 1, capacity, refill_rate)           │
//! │      false ──► 429 "Too many requests"                         │
//! │ 3. Admitted                                                    │
//! │      proxy flavor     ──► forward to the upstream target       │
//! │      non-proxy flavor ──► 200 OK, empty body                   │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Construction validates everything a request would need: the proxy flavor
//! requires a parsable target URL, both flavors require a usable identity
//! header name, and a distributed engine must have answered its readiness
//! probe. A controller that cannot gate traffic refuses to install rather
//! than silently admitting it.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{info, warn};

use crate::config::{DistributedConfig, LocalConfig};
use crate::error::GatekeeperError;
use crate::limiter::Limiter;
use crate::proxy::Forwarder;

/// The slice of engine configuration the middleware needs.
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    pub identity_header: String,
    pub capacity: u64,
    pub refill_rate: u64,
    pub target_url: String,
}

impl From<&LocalConfig> for MiddlewareConfig {
    fn from(config: &LocalConfig) -> Self {
        Self {
            identity_header: config.identity_header.clone(),
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            target_url: config.target_url.clone(),
        }
    }
}

impl From<&DistributedConfig> for MiddlewareConfig {
    fn from(config: &DistributedConfig) -> Self {
        Self {
            identity_header: config.identity_header.clone(),
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            target_url: config.target_url.clone(),
        }
    }
}

#[derive(Clone)]
struct GateState {
    limiter: Arc<Limiter>,
    identity_header: String,
    capacity: u64,
    refill_rate: u64,
}

#[derive(Clone)]
struct ProxyState {
    gate: GateState,
    forwarder: Arc<Forwarder>,
}

/// Builds the forwarding flavor: admitted requests are proxied to the
/// configured upstream target.
pub async fn proxy_middleware(
    limiter: Arc<Limiter>,
    config: &MiddlewareConfig,
) -> Result<Router, GatekeeperError> {
    let forwarder = Forwarder::new(&config.target_url).map_err(|e| {
        warn!("proxy middleware not installed: {}", e);
        e
    })?;
    let gate = gate_state(limiter, config).await?;

    let state = ProxyState {
        gate,
        forwarder: Arc::new(forwarder),
    };
    Ok(Router::new().fallback(proxy_handler).with_state(state))
}

/// Builds the non-forwarding flavor: admitted requests get an empty 200,
/// for use as an external gate in front of some other hop.
pub async fn admission_middleware(
    limiter: Arc<Limiter>,
    config: &MiddlewareConfig,
) -> Result<Router, GatekeeperError> {
    let gate = gate_state(limiter, config).await?;
    Ok(Router::new().fallback(admit_handler).with_state(gate))
}

async fn gate_state(
    limiter: Arc<Limiter>,
    config: &MiddlewareConfig,
) -> Result<GateState, GatekeeperError> {
    if config.identity_header.is_empty()
        || HeaderName::from_bytes(config.identity_header.as_bytes()).is_err()
    {
        warn!("admission middleware not installed: identity header name is not set");
        return Err(GatekeeperError::MissingHeaderName);
    }

    // A distributed engine whose store never answered must not install; an
    // unreachable store would turn every request into a 429.
    limiter.check_ready().await.map_err(|e| {
        warn!("admission middleware not installed: {}", e);
        e
    })?;

    Ok(GateState {
        limiter,
        identity_header: config.identity_header.clone(),
        capacity: config.capacity,
        refill_rate: config.refill_rate,
    })
}

async fn admit_handler(State(state): State<GateState>, request: Request) -> Response {
    match admit(&state, request.headers()).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(rejection) => rejection,
    }
}

async fn proxy_handler(State(state): State<ProxyState>, request: Request) -> Response {
    match admit(&state.gate, request.headers()).await {
        Ok(()) => state.forwarder.forward(request).await,
        Err(rejection) => rejection,
    }
}

/// Runs the admission decision for one request. `Err` carries the finished
/// rejection response.
async fn admit(state: &GateState, headers: &HeaderMap) -> Result<(), Response> {
    let identity = headers
        .get(state.identity_header.as_str())
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if identity.is_empty() {
        warn!(header = %state.identity_header, "request rejected: missing identity header");
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Missing {} header", state.identity_header),
        )
            .into_response());
    }

    let allowed = state
        .limiter
        .allow(identity, 1, state.capacity, state.refill_rate)
        .await;
    if !allowed {
        warn!(identity = %identity, "request blocked");
        return Err((StatusCode::TOO_MANY_REQUESTS, "Too many requests").into_response());
    }

    info!(identity = %identity, "request allowed");
    Ok(())
}
