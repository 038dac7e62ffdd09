//! Network configuration shared by channels, registry and acceptor.

use bitcoin::p2p::Magic;
use std::net::SocketAddr;
use std::time::Duration;

/// Default timeout for establishing an outbound TCP connection.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Highest protocol version spoken when nothing narrower has been negotiated.
///
/// 70016 covers every message this library routes. See
/// [BIP-155](https://en.bitcoin.it/wiki/BIP_0155) for the version history.
pub const DEFAULT_PROTOCOL_MAXIMUM: u32 = 70016;

/// Default bitcoin mainnet p2p port.
pub const DEFAULT_LISTEN_PORT: u16 = 8333;

/// Settings captured at construction by every component of the core.
///
/// No CLI, environment or persisted state feeds these; callers assemble the
/// struct directly.
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    /// Network magic compared against every incoming heading and stamped
    /// on every outgoing frame.
    pub network_magic: Magic,
    /// Upper bound of the negotiated protocol version; also sizes each
    /// channel's payload buffer.
    pub protocol_maximum: u32,
    /// Inbound connection target, a registry capacity hint.
    pub inbound_connections: usize,
    /// Outbound connection target, a registry capacity hint.
    pub outbound_connections: usize,
    /// Seed peers; the list length feeds the registry capacity.
    pub peers: Vec<SocketAddr>,
    /// TCP port the acceptor listens on.
    pub listen_port: u16,
    /// Timeout applied to outbound connection attempts.
    pub connection_timeout: Duration,
    /// Bind the listener on the IPv6 wildcard instead of IPv4 only.
    pub enable_ipv6: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            network_magic: Magic::BITCOIN,
            protocol_maximum: DEFAULT_PROTOCOL_MAXIMUM,
            inbound_connections: 8,
            outbound_connections: 8,
            peers: Vec::new(),
            listen_port: DEFAULT_LISTEN_PORT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            enable_ipv6: false,
        }
    }
}
