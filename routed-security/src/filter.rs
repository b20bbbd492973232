use std::net::IpAddr;

use routed_core::middleware::BoxFuture;
use routed_core::{EngineError, GateDecision, GateRequest, PolicyGate};

use crate::cidr::{any_contains, Cidr};

/// What happens to an address that matches neither list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Allow,
    Deny,
}

/// CIDR allow/deny gate over the resolved client address.
///
/// Deny takes precedence over allow for the same address; anything else
/// falls through to the default action.
#[derive(Debug, Clone)]
pub struct IpFilter {
    enabled: bool,
    default_action: FilterAction,
    allow: Vec<Cidr>,
    deny: Vec<Cidr>,
    respect_trusted_proxies: bool,
}

impl IpFilter {
    pub fn new(default_action: FilterAction) -> Self {
        Self {
            enabled: true,
            default_action,
            allow: Vec::new(),
            deny: Vec::new(),
            respect_trusted_proxies: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            default_action: FilterAction::Allow,
            allow: Vec::new(),
            deny: Vec::new(),
            respect_trusted_proxies: true,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_allow(mut self, allow: Vec<Cidr>) -> Self {
        self.allow = allow;
        self
    }

    pub fn with_deny(mut self, deny: Vec<Cidr>) -> Self {
        self.deny = deny;
        self
    }

    /// Evaluate against the transport address instead of the proxy-resolved
    /// client address.
    pub fn with_respect_trusted_proxies(mut self, respect: bool) -> Self {
        self.respect_trusted_proxies = respect;
        self
    }

    /// The decision for one address.
    pub fn evaluate(&self, addr: IpAddr) -> FilterAction {
        if !self.enabled {
            return FilterAction::Allow;
        }
        if any_contains(&self.deny, addr) {
            return FilterAction::Deny;
        }
        if any_contains(&self.allow, addr) {
            return FilterAction::Allow;
        }
        self.default_action
    }
}

impl PolicyGate for IpFilter {
    fn check<'a>(&'a self, req: &'a GateRequest<'a>) -> BoxFuture<'a, GateDecision> {
        Box::pin(async move {
            let addr = if self.respect_trusted_proxies {
                req.client_ip
            } else {
                req.remote_addr
            };
            match self.evaluate(addr) {
                FilterAction::Allow => GateDecision::Allow,
                FilterAction::Deny => {
                    tracing::warn!(addr = %addr, "address rejected by IP filter");
                    GateDecision::Deny(
                        EngineError::forbidden("address not allowed").with_code("ip_filtered"),
                    )
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cidr::parse_list;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn deny_default_admits_only_allowed() {
        let filter = IpFilter::new(FilterAction::Deny)
            .with_allow(parse_list(&["203.0.113.5"]).unwrap());
        assert_eq!(filter.evaluate(ip("203.0.113.5")), FilterAction::Allow);
        assert_eq!(filter.evaluate(ip("198.51.100.1")), FilterAction::Deny);
    }

    #[test]
    fn deny_beats_allow() {
        let filter = IpFilter::new(FilterAction::Allow)
            .with_allow(parse_list(&["0.0.0.0/0"]).unwrap())
            .with_deny(parse_list(&["198.51.100.0/24"]).unwrap());
        assert_eq!(filter.evaluate(ip("198.51.100.25")), FilterAction::Deny);
        assert_eq!(filter.evaluate(ip("203.0.113.200")), FilterAction::Allow);
    }

    #[test]
    fn disabled_admits_everything() {
        let filter = IpFilter::disabled();
        assert_eq!(filter.evaluate(ip("198.51.100.1")), FilterAction::Allow);
    }

    #[tokio::test]
    async fn gate_uses_resolved_or_transport_address() {
        use routed_core::http::{HeaderMap, Method};

        let filter = IpFilter::new(FilterAction::Deny)
            .with_allow(parse_list(&["203.0.113.5"]).unwrap());
        let headers = HeaderMap::new();
        let req = GateRequest {
            method: &Method::GET,
            path: "/",
            headers: &headers,
            remote_addr: ip("127.0.0.1"),
            client_ip: ip("203.0.113.5"),
        };

        // resolved client address admits
        assert!(matches!(filter.check(&req).await, GateDecision::Allow));

        // transport address denies once resolution is ignored
        let filter = filter.with_respect_trusted_proxies(false);
        assert!(matches!(filter.check(&req).await, GateDecision::Deny(_)));
    }
}
