//! Core types for `WireGuard` configuration.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WireGuardError};

/// A `WireGuard` peer endpoint.
///
/// Unlike a socket address the host may be a DNS name, which is common in
/// configs handed out by commercial VPN providers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Creates an endpoint from a host and port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host part without IPv6 brackets.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the UDP port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the host as an IP address when it is a literal.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl FromStr for Endpoint {
    type Err = WireGuardError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| WireGuardError::InvalidEndpoint(s.to_string()))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(WireGuardError::InvalidEndpoint(s.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| WireGuardError::InvalidEndpoint(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses an address in CIDR notation, treating a bare address as a host
/// route (`/32` or `/128`), as `wg-quick` does.
pub(crate) fn parse_cidr(s: &str) -> Option<IpNet> {
    let s = s.trim();
    if let Ok(net) = s.parse::<IpNet>() {
        return Some(net);
    }
    s.parse::<IpAddr>().ok().map(IpNet::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("198.51.100.7:51820", "198.51.100.7", 51820 ; "ipv4")]
    #[test_case("vpn.example.com:1194", "vpn.example.com", 1194 ; "hostname")]
    #[test_case("[2001:db8::1]:51820", "2001:db8::1", 51820 ; "bracketed ipv6")]
    fn endpoint_parses(input: &str, host: &str, port: u16) {
        let endpoint: Endpoint = input.parse().expect("valid endpoint");
        assert_eq!(endpoint.host(), host);
        assert_eq!(endpoint.port(), port);
        assert_eq!(endpoint.to_string(), input);
    }

    #[test_case("no-port" ; "missing port")]
    #[test_case(":51820" ; "missing host")]
    #[test_case("host:99999" ; "port out of range")]
    fn endpoint_rejects(input: &str) {
        assert!(input.parse::<Endpoint>().is_err());
    }

    #[test]
    fn bare_address_becomes_host_route() {
        assert_eq!(parse_cidr("10.0.0.2").map(|n| n.prefix_len()), Some(32));
        assert_eq!(parse_cidr("10.0.0.0/24").map(|n| n.prefix_len()), Some(24));
        assert!(parse_cidr("10.0.0.0/33").is_none());
    }
}
