//! Backend Configuration
//!
//! Parses the flat string-to-string option map handed down by the server's
//! configuration layer into a validated, immutable `ConsulConfig`.
//! Construction is all-or-nothing: any malformed option fails the whole
//! backend instead of silently falling back to a default.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::time::Duration;

/// Default agent address when none is configured.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8500";
/// Default KV path prefix and service-discovery name.
pub const DEFAULT_PATH: &str = "vault/";
pub const DEFAULT_SERVICE_NAME: &str = "vault";
/// Default TTL for the registered health check.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// Health checks shorter than this cannot be refreshed reliably.
pub const MIN_CHECK_TIMEOUT: Duration = Duration::from_secs(1);
/// Default cap on in-flight calls to the agent.
pub const DEFAULT_MAX_PARALLEL: i64 = 4;

/// Validated backend configuration. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    /// Agent network address (`host:port`).
    pub address: String,
    /// `http` or `https`.
    pub scheme: String,
    /// ACL token sent with every request; empty means anonymous.
    pub token: String,
    /// KV path prefix, normalized to `segment/` form.
    pub path: String,
    /// Name this node registers under in service discovery.
    pub service_name: String,
    /// Extra tags attached to the registration, order preserved.
    pub service_tags: Vec<String>,
    /// TTL of the registered health check.
    pub check_timeout: Duration,
    /// Maximum concurrent calls to the agent; <= 0 means unlimited.
    pub max_parallel: i64,
    /// When set, the service-discovery synchronizer is never started.
    pub disable_registration: bool,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            scheme: "http".to_string(),
            token: String::new(),
            path: DEFAULT_PATH.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_tags: Vec::new(),
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            max_parallel: DEFAULT_MAX_PARALLEL,
            disable_registration: false,
        }
    }
}

impl ConsulConfig {
    /// Parse and validate the raw option map.
    ///
    /// Unknown keys are ignored; other layers of the server share the same
    /// map (e.g. `redirect_addr`).
    pub fn from_map(conf: &HashMap<String, String>) -> Result<Self> {
        let mut config = ConsulConfig::default();

        if let Some(address) = conf.get("address") {
            config.address = address.clone();
        }

        if let Some(scheme) = conf.get("scheme") {
            match scheme.as_str() {
                "http" | "https" => config.scheme = scheme.clone(),
                other => {
                    return Err(Error::Config(format!(
                        "scheme must be http or https, got {:?}",
                        other
                    )))
                }
            }
        }

        if let Some(token) = conf.get("token") {
            config.token = token.clone();
        }

        if let Some(path) = conf.get("path") {
            config.path = normalize_path(path)?;
        }

        if let Some(service) = conf.get("service") {
            config.service_name = service.clone();
        }

        if let Some(tags) = conf.get("service_tags") {
            config.service_tags = parse_tags(tags);
        }

        if let Some(timeout) = conf.get("check_timeout") {
            let d = parse_duration(timeout)?;
            if d < MIN_CHECK_TIMEOUT {
                return Err(Error::Config(format!(
                    "check_timeout must be at least {:?}, got {:?}",
                    MIN_CHECK_TIMEOUT, d
                )));
            }
            config.check_timeout = d;
        }

        if let Some(max_parallel) = conf.get("max_parallel") {
            config.max_parallel = max_parallel.parse().map_err(|_| {
                Error::Config(format!("invalid max_parallel: {:?}", max_parallel))
            })?;
        }

        if let Some(disable) = conf.get("disable_registration") {
            config.disable_registration = parse_bool(disable)?;
        }

        Ok(config)
    }
}

/// Normalize a KV path prefix: no leading slash, exactly one trailing slash.
fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(Error::Config("path must not be empty".to_string()));
    }
    if trimmed.ends_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{}/", trimmed))
    }
}

/// Split a comma-separated tag list, trimming whitespace and dropping
/// empty entries.
fn parse_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(Error::Config(format!("invalid boolean: {:?}", s))),
    }
}

/// Parse a duration string (e.g. "99ms", "6s", "5m", "1h").
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Config("empty duration".to_string()));
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        return Err(Error::Config(format!("duration missing unit: {:?}", s)));
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration: {:?}", s)))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        _ => unreachable!(),
    };

    Ok(duration)
}
