//! Client identity extraction.
//!
//! The identity that keys and IP bans are scoped to is the caller's IP as a
//! string: the first `X-Forwarded-For` element when a proxy sets one,
//! otherwise the socket peer. IPv4-mapped IPv6 addresses are reduced to their
//! IPv4 form so `::ffff:1.2.3.4` and `1.2.3.4` are the same client.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::{HeaderMap, request::Parts};

const MAPPED_V4_PREFIX: &str = "::ffff:";

/// Identity used when neither a forwarded header nor a peer address exists.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Strip the IPv4-mapped IPv6 prefix.
#[must_use]
pub fn normalize(ip: &str) -> String {
    let ip = ip.trim();
    ip.strip_prefix(MAPPED_V4_PREFIX).unwrap_or(ip).to_string()
}

/// Resolve the caller's identity from headers and the socket peer.
#[must_use]
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    match (forwarded, peer) {
        (Some(ip), _) => normalize(ip),
        (None, Some(addr)) => normalize(&addr.ip().to_string()),
        (None, None) => UNKNOWN_IDENTITY.to_string(),
    }
}

/// Extractor yielding the caller's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self(client_identity(&parts.headers, peer)))
    }
}
