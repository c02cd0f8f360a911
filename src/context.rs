use http::{HeaderMap, Method, Uri};
use std::{net::IpAddr, time::Instant};

use crate::identity::Identity;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub client_ip: Option<IpAddr>,
    pub started_at: Instant,
    /// Set once the rate-limit middleware has classified the request.
    pub identity: Option<Identity>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        client_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            request_id,
            method,
            uri,
            headers,
            client_ip,
            started_at: Instant::now(),
            identity: None,
        }
    }
}
