//! Messenger and reactor configuration.
//!
//! Loaded from TOML or built programmatically with the chainable setters.

use serde::Deserialize;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// Wire protocol spoken by new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Yb,
    Redis,
    Cql,
}

/// Configuration for a messenger and the reactors it owns.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessengerBuilder {
    /// Base name; reactor threads are named "{name}_R{index:03}".
    #[serde(default = "default_name")]
    pub name: String,

    /// Protocol for new connection contexts.
    #[serde(default)]
    pub connection_type: ConnectionType,

    /// Idle timeout for inbound connections, in milliseconds.
    #[serde(default = "default_keepalive_ms")]
    pub connection_keepalive_ms: u64,

    /// Period of the reactor maintenance tick, in milliseconds.
    #[serde(default = "default_granularity_ms")]
    pub coarse_timer_granularity_ms: u64,

    /// Per-direction handshake deadline, in milliseconds. Runtime-tunable on
    /// the messenger after construction.
    #[serde(default = "default_negotiation_timeout_ms")]
    pub rpc_negotiation_timeout_ms: u64,

    /// Parallel client connections per (remote, credentials).
    #[serde(default = "default_num_connections_to_server")]
    pub num_connections_to_server: u8,

    /// When non-empty, outbound sockets are not auto-bound to the configured
    /// outbound addresses.
    #[serde(default)]
    pub local_ip_for_outbound_sockets: String,

    /// Local address to bind v4 outbound sockets to.
    #[serde(default)]
    pub outbound_address_v4: Option<Ipv4Addr>,

    /// Local address to bind v6 outbound sockets to.
    #[serde(default)]
    pub outbound_address_v6: Option<Ipv6Addr>,

    /// Threads in the blocking negotiation pool.
    #[serde(default = "default_negotiation_threads")]
    pub negotiation_threads: usize,
}

fn default_name() -> String {
    "messenger".to_string()
}

fn default_keepalive_ms() -> u64 {
    65_000
}

fn default_granularity_ms() -> u64 {
    100
}

fn default_negotiation_timeout_ms() -> u64 {
    3_000
}

fn default_num_connections_to_server() -> u8 {
    8
}

fn default_negotiation_threads() -> usize {
    4
}

impl Default for MessengerBuilder {
    fn default() -> Self {
        MessengerBuilder {
            name: default_name(),
            connection_type: ConnectionType::default(),
            connection_keepalive_ms: default_keepalive_ms(),
            coarse_timer_granularity_ms: default_granularity_ms(),
            rpc_negotiation_timeout_ms: default_negotiation_timeout_ms(),
            num_connections_to_server: default_num_connections_to_server(),
            local_ip_for_outbound_sockets: String::new(),
            outbound_address_v4: None,
            outbound_address_v6: None,
            negotiation_threads: default_negotiation_threads(),
        }
    }
}

impl MessengerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        MessengerBuilder {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }

    pub fn connection_keepalive_ms(mut self, ms: u64) -> Self {
        self.connection_keepalive_ms = ms;
        self
    }

    pub fn coarse_timer_granularity_ms(mut self, ms: u64) -> Self {
        self.coarse_timer_granularity_ms = ms;
        self
    }

    pub fn rpc_negotiation_timeout_ms(mut self, ms: u64) -> Self {
        self.rpc_negotiation_timeout_ms = ms;
        self
    }

    pub fn num_connections_to_server(mut self, n: u8) -> Self {
        self.num_connections_to_server = n;
        self
    }

    pub fn negotiation_threads(mut self, n: usize) -> Self {
        self.negotiation_threads = n;
        self
    }

    pub fn connection_keepalive_time(&self) -> Duration {
        Duration::from_millis(self.connection_keepalive_ms)
    }

    pub fn coarse_timer_granularity(&self) -> Duration {
        Duration::from_millis(self.coarse_timer_granularity_ms)
    }

    pub fn rpc_negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_negotiation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let builder = MessengerBuilder::default();
        assert_eq!(builder.name, "messenger");
        assert_eq!(builder.connection_type, ConnectionType::Yb);
        assert_eq!(builder.connection_keepalive_time(), Duration::from_secs(65));
        assert_eq!(
            builder.coarse_timer_granularity(),
            Duration::from_millis(100)
        );
        assert_eq!(builder.rpc_negotiation_timeout(), Duration::from_secs(3));
        assert_eq!(builder.num_connections_to_server, 8);
        assert!(builder.local_ip_for_outbound_sockets.is_empty());
    }

    #[test]
    fn test_setters_chain() {
        let builder = MessengerBuilder::new("test")
            .connection_type(ConnectionType::Cql)
            .connection_keepalive_ms(100)
            .coarse_timer_granularity_ms(20)
            .negotiation_threads(1);
        assert_eq!(builder.name, "test");
        assert_eq!(builder.connection_type, ConnectionType::Cql);
        assert_eq!(
            builder.connection_keepalive_time(),
            Duration::from_millis(100)
        );
        assert_eq!(builder.negotiation_threads, 1);
    }

    #[test]
    fn test_toml_parse() {
        let builder: MessengerBuilder = toml::from_str(
            r#"
            name = "tserver"
            connection_type = "redis"
            connection_keepalive_ms = 30000
            outbound_address_v4 = "10.0.0.1"
            "#,
        )
        .unwrap();
        assert_eq!(builder.name, "tserver");
        assert_eq!(builder.connection_type, ConnectionType::Redis);
        assert_eq!(builder.connection_keepalive_time(), Duration::from_secs(30));
        assert_eq!(builder.outbound_address_v4, Some("10.0.0.1".parse().unwrap()));
        // unset fields keep their defaults
        assert_eq!(builder.rpc_negotiation_timeout_ms, 3_000);
    }

    #[test]
    fn test_toml_rejects_unknown_fields() {
        let result: std::result::Result<MessengerBuilder, _> =
            toml::from_str("unknown_knob = 1\n");
        assert!(result.is_err());
    }
}
