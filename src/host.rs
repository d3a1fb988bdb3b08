//! Target host model.
//!
//! Only what account selection and job naming need: a name, an address, a protocol and an
//! optional port. Connecting is left to the job callable.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol assumed when none is given.
pub const DEFAULT_PROTOCOL: &str = "telnet";

/// A device jobs run against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    name: String,
    address: String,
    protocol: String,
    port: Option<u16>,
}

impl Host {
    /// A host reachable at `name` over the default protocol.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            address: name.clone(),
            name,
            protocol: DEFAULT_PROTOCOL.to_string(),
            port: None,
        }
    }

    /// Parse `protocol://address[:port]`. A bare string is treated as an address.
    ///
    /// ```
    /// use hostqueue::host::Host;
    ///
    /// let host = Host::from_uri("ssh://router1:2222");
    /// assert_eq!(host.protocol(), "ssh");
    /// assert_eq!(host.address(), "router1");
    /// assert_eq!(host.port(), Some(2222));
    /// ```
    pub fn from_uri(uri: &str) -> Self {
        let (protocol, rest) = uri
            .split_once("://")
            .map_or((DEFAULT_PROTOCOL, uri), |(p, r)| (p, r));
        let rest = rest.trim_end_matches('/');
        let (address, port) = match rest.rsplit_once(':') {
            Some((addr, port)) if !addr.contains(':') => match port.parse::<u16>() {
                Ok(port) => (addr, Some(port)),
                Err(_) => (rest, None),
            },
            _ => (rest, None),
        };
        Self {
            name: address.to_string(),
            address: address.to_string(),
            protocol: protocol.to_string(),
            port,
        }
    }

    /// Set the address, keeping the name.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the protocol.
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Set the port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Display name, also used as the job name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Network address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Protocol name, e.g. `ssh` or `telnet`.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Explicit port, if any.
    pub const fn port(&self) -> Option<u16> {
        self.port
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for Host {
    fn from(uri: &str) -> Self {
        Self::from_uri(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name_uses_default_protocol() {
        let host = Host::from_uri("switch7");
        assert_eq!(host.name(), "switch7");
        assert_eq!(host.protocol(), "telnet");
        assert_eq!(host.port(), None);
    }

    #[test]
    fn test_ipv6_address_is_not_split() {
        let host = Host::from_uri("ssh://fe80::1");
        assert_eq!(host.address(), "fe80::1");
        assert_eq!(host.port(), None);
    }

    #[test]
    fn test_invalid_port_kept_in_address() {
        let host = Host::from_uri("telnet://box:http");
        assert_eq!(host.address(), "box:http");
    }
}
