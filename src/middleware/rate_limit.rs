use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, header},
    response::{IntoResponse, Response},
};

use crate::{
    context::RequestContext,
    identity::Identity,
    middleware::{GateMiddleware, Verdict},
    ratelimit::{Decision, RateLimiter},
};

pub struct RateLimitMiddleware {
    limiter: RateLimiter,
    token_header: HeaderName,
}

impl RateLimitMiddleware {
    pub fn new(limiter: RateLimiter, token_header: &str) -> Self {
        let token_header = HeaderName::from_bytes(token_header.as_bytes())
            .unwrap_or_else(|_| HeaderName::from_static("api_key"));

        Self {
            limiter,
            token_header,
        }
    }

    /// The decision's status and message, verbatim, as a plain-text response.
    fn denied_response(decision: &Decision) -> Response<Body> {
        let mut response = (decision.status(), decision.message()).into_response();

        if let Decision::Limited { retry_after_secs } = decision
            && let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }

        response
    }
}

#[async_trait]
impl GateMiddleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Verdict {
        let identity = Identity::classify(&ctx.headers, &self.token_header, ctx.client_ip);
        let decision = self.limiter.allow(&identity.key, identity.credentialed).await;
        ctx.identity = Some(identity);

        match decision {
            Decision::Allowed => Verdict::Pass,
            Decision::Limited { retry_after_secs } => {
                tracing::debug!(
                    request_id = %ctx.request_id,
                    policy = ctx.identity.as_ref().map(|i| i.policy_class()),
                    retry_after_secs,
                    "request rate limited"
                );
                Verdict::Reject(Self::denied_response(&decision))
            }
            Decision::Unavailable => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    "rate limiter backend unavailable; rejecting request"
                );
                Verdict::Reject(Self::denied_response(&decision))
            }
        }
    }
}
