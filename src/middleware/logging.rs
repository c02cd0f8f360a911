use async_trait::async_trait;
use axum::{body::Body, http::StatusCode, response::Response};

use crate::{
    context::RequestContext,
    middleware::{GateMiddleware, Verdict},
};

/// Logs each gated request on arrival and on completion. Completion lines carry
/// the key the request was counted against and which policy applied.
pub struct RequestLoggingMiddleware;

#[async_trait]
impl GateMiddleware for RequestLoggingMiddleware {
    fn name(&self) -> &'static str {
        "request-logging"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Verdict {
        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            client_ip = ?ctx.client_ip,
            "incoming request"
        );
        Verdict::Pass
    }

    async fn on_response(&self, ctx: &RequestContext, response: &mut Response<Body>) {
        let identity = ctx.identity.as_ref();
        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            status = %response.status(),
            identity = identity.map(|i| i.key.as_str()),
            credentialed = identity.map(|i| i.credentialed),
            policy = identity.map(|i| i.policy_class()),
            limited = response.status() == StatusCode::TOO_MANY_REQUESTS,
            latency_ms = ctx.started_at.elapsed().as_millis() as u64,
            "request completed"
        );
    }
}
