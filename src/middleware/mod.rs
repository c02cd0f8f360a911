pub mod logging;
pub mod rate_limit;

use async_trait::async_trait;
use axum::{body::Body, response::Response};

use crate::context::RequestContext;

/// Outcome of a request hook: hand the request on, or answer it right away.
pub enum Verdict {
    Pass,
    Reject(Response<Body>),
}

/// A stage of the gate.
///
/// `on_request` hooks run in chain order and the first `Reject` answers the
/// request. `on_response` runs, in reverse order, only for stages whose
/// `on_request` passed, so a stage never sees a response to a request it has not
/// looked at.
#[async_trait]
pub trait GateMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, ctx: &mut RequestContext) -> Verdict;

    async fn on_response(&self, _ctx: &RequestContext, _response: &mut Response<Body>) {}
}
