//! Redirect Address Resolution
//!
//! Parses the node's externally reachable "redirect" address into a
//! structured host/port form used to derive the service-discovery identity.
//! The resolver never guesses: a missing scheme or a TCP address without an
//! explicit port is a hard error.

use crate::error::{Error, Result};
use url::Url;

/// Sentinel port for non-TCP (unix socket) redirect addresses.
pub const NO_PORT: i32 = -1;

/// Resolved redirect address.
///
/// `host` is never empty after successful resolution; `port` is either a
/// valid TCP port or exactly [`NO_PORT`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectAddress {
    pub host: String,
    pub port: i32,
}

impl RedirectAddress {
    /// Resolve a raw redirect address.
    ///
    /// Accepted forms: `http://host:port`, `https://host:port` (trailing
    /// path is discarded) and `unix:///path/to.sock` (the whole path becomes
    /// the host, port is [`NO_PORT`]).
    pub fn resolve(raw: &str) -> Result<RedirectAddress> {
        let url = Url::parse(raw).map_err(|e| {
            Error::AddressResolution(format!("failed to parse {:?}: {}", raw, e))
        })?;

        match url.scheme() {
            "http" | "https" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| {
                        Error::AddressResolution(format!("no host in {:?}", raw))
                    })?
                    .to_string();
                // Url::port() is None for a scheme-default port even when
                // the input spells it out, so fall back to the default only
                // when the authority carries an explicit one.
                let port = url
                    .port()
                    .or_else(|| {
                        if has_explicit_port(raw) {
                            url.port_or_known_default()
                        } else {
                            None
                        }
                    })
                    .ok_or_else(|| {
                        Error::AddressResolution(format!("no port in {:?}", raw))
                    })?;
                if port == 0 {
                    return Err(Error::AddressResolution(format!(
                        "port 0 is not routable in {:?}",
                        raw
                    )));
                }
                Ok(RedirectAddress {
                    host,
                    port: i32::from(port),
                })
            }
            "unix" => {
                let path = url.path();
                if path.is_empty() {
                    return Err(Error::AddressResolution(format!(
                        "no socket path in {:?}",
                        raw
                    )));
                }
                Ok(RedirectAddress {
                    host: path.to_string(),
                    port: NO_PORT,
                })
            }
            other => Err(Error::AddressResolution(format!(
                "unsupported scheme {:?} in {:?}",
                other, raw
            ))),
        }
    }

    /// Whether this address has a numeric TCP port.
    pub fn has_port(&self) -> bool {
        self.port != NO_PORT
    }
}

/// Whether the raw address spells out a port in its authority
/// (`host:80`, `[::1]:443`), as opposed to leaving it implicit.
fn has_explicit_port(raw: &str) -> bool {
    let rest = match raw.split_once("://") {
        Some((_, rest)) => rest,
        None => return false,
    };
    let authority = rest
        .split(|c| matches!(c, '/' | '?' | '#'))
        .next()
        .unwrap_or(rest);
    let host_port = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);
    match host_port.rsplit_once(':') {
        Some((host, port)) => {
            // An IPv6 host without a port also contains colons; a real
            // port suffix leaves the brackets balanced on the left.
            !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && !(host.starts_with('[') && !host.ends_with(']'))
        }
        None => false,
    }
}
