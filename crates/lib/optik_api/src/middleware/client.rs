//! Caller identification for rate limiting and the session audit trail.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::header::USER_AGENT;
use axum::http::request::Parts;
use axum::http::{Extensions, HeaderMap};
use optik_core::models::auth::DeviceInfo;

use crate::AppState;

/// Source address of the caller.
///
/// The socket peer, unless the peer is a trusted proxy: then the right-most
/// `x-forwarded-for` hop that is not itself a trusted proxy, or `x-real-ip`.
/// `"unknown"` when there is no peer at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddr(pub String);

impl ClientAddr {
    pub fn resolve(headers: &HeaderMap, extensions: &Extensions, trusted: &[IpAddr]) -> Self {
        let peer = extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let Some(peer) = peer else {
            return Self("unknown".to_string());
        };
        if !trusted.contains(&peer) {
            return Self(peer.to_string());
        }

        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let forwarded = header("x-forwarded-for").and_then(|value| {
            let hops: Vec<IpAddr> = value
                .split(',')
                .filter_map(|hop| hop.trim().parse().ok())
                .collect();
            hops.iter()
                .rev()
                .find(|hop| !trusted.contains(hop))
                .or_else(|| hops.first())
                .copied()
        });
        let addr = forwarded
            .or_else(|| header("x-real-ip").and_then(|v| v.trim().parse().ok()))
            .unwrap_or(peer);
        Self(addr.to_string())
    }
}

impl FromRequestParts<AppState> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self::resolve(
            &parts.headers,
            &parts.extensions,
            &state.config.trusted_proxies,
        ))
    }
}

/// Device details of the caller.
#[derive(Debug, Clone)]
pub struct ClientDevice(pub DeviceInfo);

impl FromRequestParts<AppState> for ClientDevice {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let ClientAddr(addr) = ClientAddr::resolve(
            &parts.headers,
            &parts.extensions,
            &state.config.trusted_proxies,
        );
        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(Self(DeviceInfo::new(addr, user_agent)))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn from_peer(ip: [u8; 4]) -> Extensions {
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from((ip, 55000))));
        extensions
    }

    fn forwarded(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(value));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        headers
    }

    #[test]
    fn untrusted_peers_cannot_choose_their_address() {
        let headers = forwarded("203.0.113.9");
        assert_eq!(
            ClientAddr::resolve(&headers, &from_peer([192, 168, 4, 20]), &[]).0,
            "192.168.4.20"
        );
    }

    #[test]
    fn trusted_proxies_yield_the_rightmost_untrusted_hop() {
        let proxies: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        let headers = forwarded("1.2.3.4, 203.0.113.9, 10.0.0.2");
        assert_eq!(
            ClientAddr::resolve(&headers, &from_peer([10, 0, 0, 1]), &proxies).0,
            "203.0.113.9"
        );

        let mut real_ip_only = HeaderMap::new();
        real_ip_only.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(
            ClientAddr::resolve(&real_ip_only, &from_peer([10, 0, 0, 1]), &proxies).0,
            "198.51.100.2"
        );
    }

    #[test]
    fn without_a_peer_the_caller_is_unknown() {
        let headers = forwarded("203.0.113.9");
        assert_eq!(
            ClientAddr::resolve(&headers, &Extensions::new(), &[]).0,
            "unknown"
        );
    }
}
