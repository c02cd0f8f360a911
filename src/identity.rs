use std::net::IpAddr;

use http::{HeaderMap, HeaderName};

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Who a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub key: String,
    pub credentialed: bool,
}

impl Identity {
    /// A non-empty credential header wins. Otherwise the first `X-Forwarded-For`
    /// hop is used, then the peer address.
    pub fn classify(headers: &HeaderMap, token_header: &HeaderName, peer: Option<IpAddr>) -> Self {
        if let Some(token) = header_str(headers, token_header) {
            return Self {
                key: format!("token:{token}"),
                credentialed: true,
            };
        }

        let address = headers
            .get(FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
            .or_else(|| peer.map(|ip| ip.to_string()))
            .unwrap_or_else(|| "anonymous".to_string());

        Self {
            key: format!("ip:{address}"),
            credentialed: false,
        }
    }

    /// Name of the policy this identity is counted under.
    pub fn policy_class(&self) -> &'static str {
        if self.credentialed { "token" } else { "ip" }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}
