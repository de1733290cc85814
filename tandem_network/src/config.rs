//! Network endpoint configuration shared by the CLI layer and the
//! transports.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Address and port options for one node's transport, as collected from the
/// command line or a config record.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Name of the broker to connect to.
    pub broker_name: String,
    /// Broker host, possibly carrying a `host:port` suffix.
    pub broker_address: String,
    /// Explicit broker port; overrides a port embedded in the address.
    pub broker_port: Option<u16>,
    /// Local interface to bind.
    pub local_interface: String,
    /// Local port to bind; 0 or absent picks an ephemeral port.
    pub local_port: Option<u16>,
}

impl NetworkConfig {
    /// Split a `host:port` string into its parts. A missing or unparsable
    /// port yields `None`.
    pub fn split_address(address: &str) -> (&str, Option<u16>) {
        match address.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host, Some(port)),
                Err(_) => (address, None),
            },
            None => (address, None),
        }
    }

    /// The broker socket address, combining the address field with any
    /// explicit port override.
    pub fn broker_socket_addr(&self) -> Option<SocketAddr> {
        let (host, embedded) = Self::split_address(&self.broker_address);
        let port = self.broker_port.or(embedded)?;
        format!("{host}:{port}").parse().ok()
    }

    /// The local socket address to bind, defaulting to all interfaces on an
    /// ephemeral port.
    pub fn local_socket_addr(&self) -> SocketAddr {
        let host = if self.local_interface.is_empty() {
            "0.0.0.0"
        } else {
            &self.local_interface
        };
        let port = self.local_port.unwrap_or(0);
        format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_splitting() {
        assert_eq!(
            NetworkConfig::split_address("127.0.0.1:4242"),
            ("127.0.0.1", Some(4242))
        );
        assert_eq!(NetworkConfig::split_address("localhost"), ("localhost", None));
        assert_eq!(
            NetworkConfig::split_address("broker.example.org:notaport"),
            ("broker.example.org:notaport", None)
        );
    }

    #[test]
    fn broker_addr_combines_overrides() {
        let config = NetworkConfig {
            broker_address: "127.0.0.1:4242".to_owned(),
            broker_port: Some(5000),
            ..Default::default()
        };
        assert_eq!(
            config.broker_socket_addr().unwrap(),
            "127.0.0.1:5000".parse().unwrap()
        );

        let config = NetworkConfig {
            broker_address: "127.0.0.1:4242".to_owned(),
            ..Default::default()
        };
        assert_eq!(
            config.broker_socket_addr().unwrap(),
            "127.0.0.1:4242".parse().unwrap()
        );

        let config = NetworkConfig::default();
        assert!(config.broker_socket_addr().is_none());
    }
}
