use routed_core::config::{ConfigError, RoutedConfig};

use crate::cidr::{parse_list, Cidr};
use crate::filter::{FilterAction, IpFilter};
use crate::proxy::{ProxyResolver, DEFAULT_FORWARDED_HEADERS};

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.into(),
    }
}

fn cidrs(config: &RoutedConfig, key: &str) -> Result<Vec<Cidr>, ConfigError> {
    let raw: Vec<String> = config.get_or(key, Vec::new())?;
    parse_list(&raw).map_err(|e| invalid(key, e.to_string()))
}

/// The `security.trusted_proxies.*` section.
#[derive(Debug, Clone)]
pub struct TrustedProxiesConfig {
    pub enabled: bool,
    pub forward_client_ip: bool,
    pub proxies: Vec<Cidr>,
    pub headers: Vec<String>,
}

impl TrustedProxiesConfig {
    pub fn from_config(config: &RoutedConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            enabled: config.get_or("security.trusted_proxies.enabled", false)?,
            forward_client_ip: config
                .get_or("security.trusted_proxies.forward_client_ip", true)?,
            proxies: cidrs(config, "security.trusted_proxies.proxies")?,
            headers: config.get_or(
                "security.trusted_proxies.headers",
                DEFAULT_FORWARDED_HEADERS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            )?,
        })
    }

    pub fn build(self) -> ProxyResolver {
        ProxyResolver::new(self.proxies)
            .with_enabled(self.enabled)
            .with_forward_client_ip(self.forward_client_ip)
            .with_headers(self.headers)
    }
}

/// The `security.ip_filter.*` section.
#[derive(Debug, Clone)]
pub struct IpFilterConfig {
    pub enabled: bool,
    pub default_action: FilterAction,
    pub allow: Vec<Cidr>,
    pub deny: Vec<Cidr>,
    pub respect_trusted_proxies: bool,
}

impl IpFilterConfig {
    pub fn from_config(config: &RoutedConfig) -> Result<Self, ConfigError> {
        let action_key = "security.ip_filter.default_action";
        let default_action = match config.get_or(action_key, "allow".to_string())?.as_str() {
            "allow" => FilterAction::Allow,
            "deny" => FilterAction::Deny,
            other => return Err(invalid(action_key, format!("unknown action '{other}'"))),
        };
        Ok(Self {
            enabled: config.get_or("security.ip_filter.enabled", false)?,
            default_action,
            allow: cidrs(config, "security.ip_filter.allow")?,
            deny: cidrs(config, "security.ip_filter.deny")?,
            respect_trusted_proxies: config
                .get_or("security.ip_filter.respect_trusted_proxies", true)?,
        })
    }

    pub fn build(self) -> IpFilter {
        IpFilter::new(self.default_action)
            .with_enabled(self.enabled)
            .with_allow(self.allow)
            .with_deny(self.deny)
            .with_respect_trusted_proxies(self.respect_trusted_proxies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
security:
  trusted_proxies:
    enabled: true
    forward_client_ip: true
    proxies:
      - 127.0.0.1/32
      - 10.0.0.0/8
    headers:
      - x-real-ip
  ip_filter:
    enabled: true
    default_action: deny
    allow:
      - 203.0.113.5
    deny:
      - 198.51.100.0/24
    respect_trusted_proxies: false
"#;

    #[test]
    fn trusted_proxies_section_parses() {
        let cfg = RoutedConfig::from_yaml_str(YAML, "test").unwrap();
        let section = TrustedProxiesConfig::from_config(&cfg).unwrap();
        assert!(section.enabled);
        assert_eq!(section.proxies.len(), 2);
        assert_eq!(section.headers, vec!["x-real-ip"]);
    }

    #[test]
    fn ip_filter_section_parses() {
        let cfg = RoutedConfig::from_yaml_str(YAML, "test").unwrap();
        let section = IpFilterConfig::from_config(&cfg).unwrap();
        assert!(section.enabled);
        assert_eq!(section.default_action, FilterAction::Deny);
        assert_eq!(section.allow.len(), 1);
        assert_eq!(section.deny.len(), 1);
        assert!(!section.respect_trusted_proxies);
    }

    #[test]
    fn absent_sections_use_defaults() {
        let cfg = RoutedConfig::empty();
        let proxies = TrustedProxiesConfig::from_config(&cfg).unwrap();
        assert!(!proxies.enabled);
        assert_eq!(proxies.headers.len(), 3);
        let filter = IpFilterConfig::from_config(&cfg).unwrap();
        assert!(!filter.enabled);
        assert_eq!(filter.default_action, FilterAction::Allow);
    }

    #[test]
    fn bad_cidr_is_an_error() {
        let cfg = RoutedConfig::from_yaml_str(
            "security:\n  ip_filter:\n    allow:\n      - not-a-network\n",
            "test",
        )
        .unwrap();
        assert!(IpFilterConfig::from_config(&cfg).is_err());
    }

    #[test]
    fn bad_action_is_an_error() {
        let cfg = RoutedConfig::from_yaml_str(
            "security:\n  ip_filter:\n    default_action: maybe\n",
            "test",
        )
        .unwrap();
        assert!(IpFilterConfig::from_config(&cfg).is_err());
    }
}
