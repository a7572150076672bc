//! Fixed-window rate limiting
//!
//! Counters live in the store (`ratelimit:{action}:{client}`, 60 s
//! window) so limits hold across API replicas. Store failures allow the
//! request: a store blip must not blackhole the whole API behind 429s.

use std::net::SocketAddr;

use axum::http::HeaderMap;

use crate::errors::{AppError, AppResult};
use crate::store::Store;

/// Per-action request budgets, checked per client per minute
#[derive(Clone)]
pub struct RateLimiter {
    store: Store,
    create_per_min: u64,
    fetch_per_min: u64,
}

/// Rate-limited action classes
#[derive(Debug, Clone, Copy)]
pub enum Action {
    /// Address allocation (random or custom)
    Create,
    /// Inbox listing and message fetch
    Fetch,
}

impl Action {
    fn key_segment(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Fetch => "fetch",
        }
    }
}

impl RateLimiter {
    pub fn new(store: Store, create_per_min: u64, fetch_per_min: u64) -> Self {
        Self {
            store,
            create_per_min,
            fetch_per_min,
        }
    }

    /// Enforce the budget for one request
    ///
    /// Increments the window counter and rejects with `RateLimited` when
    /// the post-increment count exceeds the action's budget. A store
    /// error logs a warning and allows the request (fail-open).
    pub async fn check(
        &self,
        action: Action,
        headers: &HeaderMap,
        peer: SocketAddr,
    ) -> AppResult<()> {
        let client = client_id(headers, peer);
        let limit = match action {
            Action::Create => self.create_per_min,
            Action::Fetch => self.fetch_per_min,
        };

        match self.store.rate_incr(action.key_segment(), &client).await {
            Ok(count) if count <= limit => Ok(()),
            Ok(_) => Err(AppError::RateLimited(format!(
                "too many {} requests, retry in a minute",
                action.key_segment()
            ))),
            Err(e) => {
                tracing::warn!(error = %e, client = %client, "rate-limit store failure, allowing request");
                Ok(())
            }
        }
    }
}

/// Derive the client identifier for rate limiting
///
/// Precedence: `X-Real-IP`, else the first element of `X-Forwarded-For`,
/// else the peer address. Ports are stripped so a client is one bucket
/// regardless of source port.
pub fn client_id(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        return strip_port(real_ip.trim()).to_owned();
    }
    if let Some(forwarded) = header_str(headers, "x-forwarded-for")
        && let Some(first) = forwarded.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return strip_port(first).to_owned();
        }
    }
    peer.ip().to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Strip a trailing `:port` from an address string
///
/// Handles bracketed IPv6 (`[::1]:80` → `::1`); a bare IPv6 address is
/// returned untouched even though it contains colons.
fn strip_port(address: &str) -> &str {
    if let Some(rest) = address.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match address.rsplit_once(':') {
        // More than one colon without brackets means bare IPv6.
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => address,
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::http::HeaderMap;

    use super::{client_id, strip_port};

    fn peer() -> SocketAddr {
        "198.51.100.9:41000".parse().expect("valid socket addr")
    }

    #[test]
    fn prefers_x_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "203.0.113.7".parse().unwrap());
        headers.insert("x-forwarded-for", "192.0.2.1, 10.0.0.1".parse().unwrap());
        assert_eq!(client_id(&headers, peer()), "203.0.113.7");
    }

    #[test]
    fn falls_back_to_first_forwarded_for_element() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", " 192.0.2.1 , 10.0.0.1".parse().unwrap());
        assert_eq!(client_id(&headers, peer()), "192.0.2.1");
    }

    #[test]
    fn falls_back_to_peer_address_without_port() {
        assert_eq!(client_id(&HeaderMap::new(), peer()), "198.51.100.9");
    }

    #[test]
    fn strips_ports_from_header_values() {
        assert_eq!(strip_port("203.0.113.7:4711"), "203.0.113.7");
        assert_eq!(strip_port("203.0.113.7"), "203.0.113.7");
        assert_eq!(strip_port("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
    }
}
