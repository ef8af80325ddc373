//! Client IP extraction for connection admission and logging.
//!
//! `x-forwarded-for` is only honored when the TCP peer is a configured
//! trusted proxy, and the header is parsed right-to-left so an attacker
//! prepending fake hops behind a proxy chain cannot spoof the source.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

use crate::config::WS_TRUSTED_PROXY_IPS;

/// Resolve the effective client IP for an upgrade request.
pub fn extract_client_ip(
    headers: &HeaderMap,
    addr: SocketAddr,
    trusted_proxy_ips: &HashSet<IpAddr>,
) -> IpAddr {
    let peer_ip = addr.ip();
    if !trusted_proxy_ips.contains(&peer_ip) {
        return peer_ip;
    }

    let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    else {
        return peer_ip;
    };

    // Right-to-left: skip trusted proxy hops, take the first untrusted IP.
    for candidate in forwarded.rsplit(',') {
        if let Ok(ip) = candidate.trim().parse::<IpAddr>() {
            if !trusted_proxy_ips.contains(&ip) {
                return ip;
            }
        }
    }
    peer_ip
}

/// Parse the trusted proxy set from the environment, skipping junk entries.
pub fn trusted_proxies_from_env() -> HashSet<IpAddr> {
    match std::env::var(WS_TRUSTED_PROXY_IPS) {
        Ok(raw) => parse_trusted_proxies(&raw),
        Err(_) => HashSet::new(),
    }
}

fn parse_trusted_proxies(raw: &str) -> HashSet<IpAddr> {
    let mut ips = HashSet::new();
    for part in raw.split(',') {
        let candidate = part.trim();
        if candidate.is_empty() {
            continue;
        }
        match candidate.parse::<IpAddr>() {
            Ok(ip) => {
                ips.insert(ip);
            }
            Err(e) => {
                tracing::warn!(value = candidate, error = %e, "ignoring invalid trusted proxy ip");
            }
        }
    }
    ips
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn addr(ip: &str) -> SocketAddr {
        format!("{ip}:4242").parse().unwrap()
    }

    #[test]
    fn forwarded_ignored_without_trusted_proxy() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        let ip = extract_client_ip(&headers, addr("10.0.0.1"), &HashSet::new());
        assert_eq!(ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn rightmost_untrusted_ip_wins_behind_trusted_proxy() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 5.6.7.8"),
        );
        let mut trusted = HashSet::new();
        trusted.insert("10.0.0.1".parse().unwrap());

        let ip = extract_client_ip(&headers, addr("10.0.0.1"), &trusted);
        assert_eq!(ip, "5.6.7.8".parse::<IpAddr>().unwrap());

        // When the rightmost hop is itself a trusted proxy, keep walking.
        trusted.insert("5.6.7.8".parse().unwrap());
        let ip = extract_client_ip(&headers, addr("10.0.0.1"), &trusted);
        assert_eq!(ip, "1.2.3.4".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn invalid_forwarded_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        let mut trusted = HashSet::new();
        trusted.insert("10.0.0.1".parse().unwrap());

        let ip = extract_client_ip(&headers, addr("10.0.0.1"), &trusted);
        assert_eq!(ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn proxy_list_parsing_skips_invalid_entries() {
        assert!(parse_trusted_proxies("").is_empty());
        assert!(parse_trusted_proxies(" , ,").is_empty());
        let ips = parse_trusted_proxies("127.0.0.1, ::1, nope, 10.0.0.1");
        assert_eq!(ips.len(), 3);
        assert!(ips.contains(&"::1".parse::<IpAddr>().unwrap()));
    }
}
