use std::{net::IpAddr, sync::Arc};

use axum::{
    Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    response::Response,
};
use tower::ServiceExt;
use uuid::Uuid;

use crate::{
    context::RequestContext,
    middleware::{
        GateMiddleware, Verdict, logging::RequestLoggingMiddleware,
        rate_limit::RateLimitMiddleware,
    },
    ratelimit::RateLimiter,
};

const REQUEST_ID: &str = "x-request-id";

/// Runs the middleware chain in front of `downstream`. A rejection ends the
/// request there; otherwise the untouched request is handed to `downstream`.
pub struct Gate {
    middlewares: Vec<Arc<dyn GateMiddleware>>,
    downstream: Router,
}

impl Gate {
    pub fn new(limiter: RateLimiter, token_header: &str, downstream: Router) -> Self {
        let middlewares: Vec<Arc<dyn GateMiddleware>> = vec![
            Arc::new(RequestLoggingMiddleware),
            Arc::new(RateLimitMiddleware::new(limiter, token_header)),
        ];

        Self {
            middlewares,
            downstream,
        }
    }

    pub async fn handle_http(
        &self,
        request: Request<Body>,
        client_ip: Option<IpAddr>,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();

        let request_id = parts
            .headers
            .get(REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut ctx = RequestContext::new(
            request_id,
            parts.method.clone(),
            parts.uri.clone(),
            parts.headers.clone(),
            client_ip,
        );

        let mut executed = Vec::new();

        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(&mut ctx).await {
                Verdict::Pass => executed.push(idx),
                Verdict::Reject(mut response) => {
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        middleware = middleware.name(),
                        status = %response.status(),
                        "request rejected by gate"
                    );
                    self.apply_response_middlewares(&executed, &ctx, &mut response)
                        .await;
                    attach_request_id(&ctx.request_id, &mut response);
                    return response;
                }
            }
        }

        let downstream = self.downstream.clone();
        let mut response = match downstream.oneshot(Request::from_parts(parts, body)).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        self.apply_response_middlewares(&executed, &ctx, &mut response)
            .await;
        attach_request_id(&ctx.request_id, &mut response);
        response
    }

    async fn apply_response_middlewares(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) {
        for idx in executed.iter().rev() {
            self.middlewares[*idx].on_response(ctx, response).await;
        }
    }
}

fn attach_request_id(request_id: &str, response: &mut Response<Body>) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID), value);
    }
}
