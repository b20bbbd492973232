use std::net::IpAddr;

use routed_core::http::HeaderMap;
use routed_core::ClientIpResolver;

use crate::cidr::{any_contains, Cidr};

/// Default forwarded-address headers, walked in order; first match wins.
pub const DEFAULT_FORWARDED_HEADERS: &[&str] = &["x-forwarded-for", "x-real-ip", "forwarded"];

/// Derives the real client address from trusted-proxy configuration and
/// forwarded headers.
///
/// Headers are only honored when the transport peer itself sits inside a
/// trusted network; otherwise the transport address wins, which keeps a
/// spoofed `X-Forwarded-For` from an untrusted peer inert. Within a header
/// the left-most address that is not itself a trusted proxy is the client.
#[derive(Debug, Clone)]
pub struct ProxyResolver {
    enabled: bool,
    forward_client_ip: bool,
    proxies: Vec<Cidr>,
    headers: Vec<String>,
}

impl ProxyResolver {
    pub fn new(proxies: Vec<Cidr>) -> Self {
        Self {
            enabled: true,
            forward_client_ip: true,
            proxies,
            headers: DEFAULT_FORWARDED_HEADERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            forward_client_ip: false,
            proxies: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_forward_client_ip(mut self, forward: bool) -> Self {
        self.forward_client_ip = forward;
        self
    }

    /// Replace the header walk order.
    pub fn with_headers(mut self, headers: impl IntoIterator<Item = String>) -> Self {
        self.headers = headers
            .into_iter()
            .map(|h| h.to_ascii_lowercase())
            .collect();
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_trusted(&self, ip: IpAddr) -> bool {
        any_contains(&self.proxies, ip)
    }

    fn client_from_header(&self, name: &str, headers: &HeaderMap) -> Option<IpAddr> {
        for value in headers.get_all(name) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for part in value.split(',') {
                // unparseable tokens are skipped, not fatal; the walk keeps
                // going until an untrusted address turns up
                if let Some(candidate) = extract_ip(part.trim(), name) {
                    if !self.is_trusted(candidate) {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }
}

impl ClientIpResolver for ProxyResolver {
    fn resolve(&self, remote: IpAddr, headers: &HeaderMap) -> IpAddr {
        if !self.enabled || !self.forward_client_ip {
            return remote;
        }
        if !self.is_trusted(remote) {
            return remote;
        }
        for name in &self.headers {
            if let Some(client) = self.client_from_header(name, headers) {
                tracing::trace!(header = %name, client = %client, "client address from forwarded header");
                return client;
            }
        }
        remote
    }
}

/// Pull an address out of one comma-separated element.
///
/// Handles `Forwarded` pairs (`for=1.2.3.4;proto=http`), quoted values,
/// bracketed IPv6, and trailing ports.
fn extract_ip(part: &str, header_name: &str) -> Option<IpAddr> {
    let mut token = part;

    if header_name.eq_ignore_ascii_case("forwarded") {
        token = part
            .split(';')
            .map(str::trim)
            .find_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                key.eq_ignore_ascii_case("for").then_some(value)
            })?;
    }

    let token = token.trim().trim_matches('"');

    if let Some(rest) = token.strip_prefix('[') {
        // bracketed IPv6, optionally with a port after the bracket
        let inner = rest.split(']').next()?;
        return inner.parse().ok();
    }

    if let Ok(ip) = token.parse::<IpAddr>() {
        return Some(ip);
    }

    // v4 with port
    if let Some((host, _port)) = token.rsplit_once(':') {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use routed_core::http::HeaderValue;

    fn resolver(proxies: &[&str]) -> ProxyResolver {
        ProxyResolver::new(crate::cidr::parse_list(proxies).unwrap())
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<routed_core::http::HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn trusted_peer_yields_forwarded_client() {
        let r = resolver(&["127.0.0.1/32"]);
        let h = headers(&[("x-forwarded-for", "203.0.113.5, 10.0.0.1")]);
        assert_eq!(r.resolve(ip("127.0.0.1"), &h), ip("203.0.113.5"));
    }

    #[test]
    fn untrusted_peer_keeps_transport_address() {
        let r = resolver(&["127.0.0.1/32"]);
        let h = headers(&[("x-forwarded-for", "203.0.113.5, 10.0.0.1")]);
        assert_eq!(r.resolve(ip("8.8.8.8"), &h), ip("8.8.8.8"));
    }

    #[test]
    fn skips_leading_trusted_hops() {
        let r = resolver(&["127.0.0.0/8", "10.0.0.0/8"]);
        let h = headers(&[("x-forwarded-for", "10.0.0.9, 203.0.113.5")]);
        assert_eq!(r.resolve(ip("127.0.0.1"), &h), ip("203.0.113.5"));
    }

    #[test]
    fn walks_headers_in_order() {
        let r = resolver(&["127.0.0.1/32"]);
        let h = headers(&[
            ("x-real-ip", "198.51.100.7"),
            ("x-forwarded-for", "203.0.113.5"),
        ]);
        // x-forwarded-for is configured first, so it wins
        assert_eq!(r.resolve(ip("127.0.0.1"), &h), ip("203.0.113.5"));
    }

    #[test]
    fn forwarded_header_pairs() {
        let r = resolver(&["127.0.0.1/32"]);
        let h = headers(&[("forwarded", "for=192.0.2.60;proto=http, for=10.0.0.1")]);
        assert_eq!(r.resolve(ip("127.0.0.1"), &h), ip("192.0.2.60"));
    }

    #[test]
    fn garbage_headers_fall_back_to_transport() {
        let r = resolver(&["127.0.0.1/32"]);
        let h = headers(&[("x-forwarded-for", "not-an-address")]);
        assert_eq!(r.resolve(ip("127.0.0.1"), &h), ip("127.0.0.1"));
    }

    #[test]
    fn garbage_tokens_are_skipped_not_fatal() {
        let r = resolver(&["127.0.0.1/32"]);
        let h = headers(&[("x-forwarded-for", "garbage, 203.0.113.7")]);
        assert_eq!(r.resolve(ip("127.0.0.1"), &h), ip("203.0.113.7"));
    }

    #[test]
    fn garbage_tokens_between_trusted_hops_are_skipped() {
        let r = resolver(&["127.0.0.0/8", "10.0.0.0/8"]);
        let h = headers(&[("x-forwarded-for", "10.0.0.9, unknown, 203.0.113.7")]);
        assert_eq!(r.resolve(ip("127.0.0.1"), &h), ip("203.0.113.7"));
    }

    #[test]
    fn disabled_resolver_is_passthrough() {
        let r = resolver(&["127.0.0.1/32"]).with_enabled(false);
        let h = headers(&[("x-forwarded-for", "203.0.113.5")]);
        assert_eq!(r.resolve(ip("127.0.0.1"), &h), ip("127.0.0.1"));
    }

    #[test]
    fn header_honoring_can_be_toggled_off() {
        let r = resolver(&["127.0.0.1/32"]).with_forward_client_ip(false);
        let h = headers(&[("x-forwarded-for", "203.0.113.5")]);
        assert_eq!(r.resolve(ip("127.0.0.1"), &h), ip("127.0.0.1"));
    }

    #[test]
    fn extract_ip_variants() {
        assert_eq!(extract_ip("203.0.113.5", "x-forwarded-for"), Some(ip("203.0.113.5")));
        assert_eq!(extract_ip("203.0.113.5:8080", "x-forwarded-for"), Some(ip("203.0.113.5")));
        assert_eq!(extract_ip("\"[2001:db8::1]:443\"", "x-forwarded-for"), Some(ip("2001:db8::1")));
        assert_eq!(extract_ip("for=203.0.113.5", "forwarded"), Some(ip("203.0.113.5")));
        assert_eq!(extract_ip("proto=http", "forwarded"), None);
    }
}
