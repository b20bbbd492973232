//! Policy construction from the `rate_limit.policies` configuration
//! section (one indexed entry per policy).

use std::sync::Arc;
use std::time::Duration;

use routed_core::config::RoutedConfig;

use crate::algorithm::Algorithm;
use crate::backend::RateLimitBackend;
use crate::matcher::RouteMatcher;
use crate::{FailoverMode, KeyResolver, Policy, PolicyError};

fn get<T: routed_core::config::FromConfigValue>(
    config: &RoutedConfig,
    key: &str,
) -> Result<T, PolicyError> {
    config.get(key).map_err(|e| PolicyError::Config(e.to_string()))
}

fn get_or<T: routed_core::config::FromConfigValue>(
    config: &RoutedConfig,
    key: &str,
    default: T,
) -> Result<T, PolicyError> {
    config
        .get_or(key, default)
        .map_err(|e| PolicyError::Config(e.to_string()))
}

fn algorithm(config: &RoutedConfig, prefix: &str) -> Result<Algorithm, PolicyError> {
    let kind: String = get(config, &format!("{prefix}.algorithm"))?;
    let algo = match kind.as_str() {
        "token_bucket" => {
            let capacity: u64 = get(config, &format!("{prefix}.capacity"))?;
            Algorithm::TokenBucket {
                capacity,
                refill_tokens: get_or(config, &format!("{prefix}.refill_tokens"), capacity)?,
                refill_interval: Duration::from_millis(get_or(
                    config,
                    &format!("{prefix}.refill_interval_ms"),
                    1_000,
                )?),
                max_tokens: get_or(config, &format!("{prefix}.max_tokens"), capacity)?,
            }
        }
        "sliding_window" => Algorithm::SlidingWindow {
            limit: get(config, &format!("{prefix}.limit"))?,
            window: Duration::from_millis(get(config, &format!("{prefix}.window_ms"))?),
        },
        "quota" => Algorithm::Quota {
            limit: get(config, &format!("{prefix}.limit"))?,
            period: Duration::from_millis(get(config, &format!("{prefix}.period_ms"))?),
        },
        other => {
            return Err(PolicyError::Config(format!(
                "unknown algorithm '{other}' at {prefix}.algorithm"
            )))
        }
    };
    algo.validate()?;
    Ok(algo)
}

fn key_resolver(spec: &str) -> Result<KeyResolver, PolicyError> {
    if spec == "ip" {
        return Ok(KeyResolver::ClientIp);
    }
    if let Some(header) = spec.strip_prefix("header:") {
        if header.is_empty() {
            return Err(PolicyError::Config("empty header key spec".into()));
        }
        return Ok(KeyResolver::Header(header.to_string()));
    }
    Err(PolicyError::Config(format!(
        "unknown key spec '{spec}' (expected 'ip' or 'header:<name>')"
    )))
}

fn failover(spec: &str) -> Result<FailoverMode, PolicyError> {
    match spec {
        "allow" => Ok(FailoverMode::Allow),
        "block" => Ok(FailoverMode::Block),
        "local" => Ok(FailoverMode::Local),
        other => Err(PolicyError::Config(format!(
            "unknown failover mode '{other}'"
        ))),
    }
}

/// Build all policies declared under `rate_limit.policies`, attaching the
/// given backend to each.
pub fn policies_from_config(
    config: &RoutedConfig,
    backend: Arc<dyn RateLimitBackend>,
) -> Result<Vec<Policy>, PolicyError> {
    let mut policies = Vec::new();
    let mut index = 0usize;
    loop {
        let prefix = format!("rate_limit.policies.{index}");
        if !config.contains(&format!("{prefix}.name")) {
            break;
        }

        let name: String = get(config, &format!("{prefix}.name"))?;
        let method: String = get_or(config, &format!("{prefix}.method"), "*".to_string())?;
        let path: String = get_or(config, &format!("{prefix}.path"), "/**".to_string())?;
        let matcher = RouteMatcher::new(&method, &path)?;
        let key = key_resolver(&get_or(config, &format!("{prefix}.key"), "ip".to_string())?)?;
        let algorithm = algorithm(config, &prefix)?;
        let failover = failover(&get_or(
            config,
            &format!("{prefix}.failover"),
            "allow".to_string(),
        )?)?;
        let lock_timeout =
            Duration::from_millis(get_or(config, &format!("{prefix}.lock_timeout_ms"), 1_000)?);

        policies.push(
            Policy::new(name, matcher, key, algorithm, backend.clone())?
                .with_failover(failover)
                .with_lock_timeout(lock_timeout),
        );
        index += 1;
    }
    Ok(policies)
}
