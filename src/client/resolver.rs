//! Recursive resolver discovery
//!
//! The client sends its queries to an explicitly configured recursive
//! resolver when one is given. Otherwise it borrows the host's resolver
//! configuration: the first `nameserver` line of `/etc/resolv.conf`, with
//! `:53` assumed when the entry has no port, falling back to `8.8.8.8:53`
//! when the file is unreadable or lists no servers.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{TunnelError, TunnelResult};

/// Public resolver used when nothing else is available.
pub const FALLBACK_RESOLVER: &str = "8.8.8.8:53";

/// Path of the host resolver configuration.
const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Resolve the recursive DNS server the tunnel should use.
///
/// # Errors
///
/// Returns [`TunnelError::Config`] if `configured` is non-empty but does
/// not parse as a socket address.
pub fn effective_resolver(configured: &str) -> TunnelResult<SocketAddr> {
    if !configured.is_empty() {
        return configured.parse().map_err(|_| {
            TunnelError::config_field(
                format!("invalid DNS server address {configured:?}"),
                "dns_server",
            )
        });
    }

    if let Some(addr) = from_resolv_conf(RESOLV_CONF) {
        debug!(resolver = %addr, "using system resolver");
        return Ok(addr);
    }

    warn!(fallback = FALLBACK_RESOLVER, "no usable system resolver, using fallback");
    Ok(FALLBACK_RESOLVER.parse().expect("fallback resolver parses"))
}

/// Read the first usable `nameserver` entry from a resolv.conf file.
pub(crate) fn from_resolv_conf(path: impl AsRef<Path>) -> Option<SocketAddr> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| line.strip_prefix("nameserver"))
        .map(str::trim)
        .find_map(parse_nameserver)
}

/// Parse a nameserver entry, assuming port 53 for bare addresses.
fn parse_nameserver(entry: &str) -> Option<SocketAddr> {
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, 53));
    }
    entry.parse().ok()
}
