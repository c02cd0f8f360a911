use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::Request,
    response::Response,
    routing::{any, get},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{error::StoreError, gate::Gate, ratelimit::Store};

/// Handlers that sit behind the gate.
pub fn service_routes() -> Router {
    Router::new().route("/", get(root))
}

/// Everything unmatched goes through the gate; diagnostics, when mounted, do not.
pub fn app(gate: Arc<Gate>, diagnostics: Option<Arc<dyn Store>>) -> Router {
    let mut router = Router::new().fallback(any(gated)).with_state(gate);
    if let Some(store) = diagnostics {
        router = router.merge(diagnostics_routes(store));
    }
    router
}

fn diagnostics_routes(store: Arc<dyn Store>) -> Router {
    Router::new()
        .route("/diagnostics/{key}", get(inspect))
        .with_state(store)
}

async fn root() -> &'static str {
    "Rate limiter OK!"
}

async fn gated(State(gate): State<Arc<Gate>>, request: Request<Body>) -> Response {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    gate.handle_http(request, client_ip).await
}

#[derive(Debug, Serialize)]
struct KeyDiagnostics {
    key: String,
    request_count: u64,
    blocked: bool,
    block_ttl_ms: u64,
    blocked_until: Option<DateTime<Utc>>,
    checked_at: DateTime<Utc>,
}

async fn inspect(
    State(store): State<Arc<dyn Store>>,
    Path(key): Path<String>,
) -> Result<Json<KeyDiagnostics>, StoreError> {
    let request_count = store.get_request_count(&key).await?;
    let status = store.is_blocked(&key).await?;
    let checked_at = Utc::now();

    // A TTL past chrono's range reports no end time rather than a bogus one.
    let blocked_until = status
        .blocked
        .then(|| chrono::Duration::from_std(status.ttl).ok())
        .flatten()
        .and_then(|ttl| checked_at.checked_add_signed(ttl));

    Ok(Json(KeyDiagnostics {
        key,
        request_count,
        blocked: status.blocked,
        block_ttl_ms: u64::try_from(status.ttl.as_millis()).unwrap_or(u64::MAX),
        blocked_until,
        checked_at,
    }))
}
