//! # Peer-to-peer connections
//!
//! Two clients registered with the same broker ask it for a connection; the
//! broker allocates an id and exchanges their candidate addresses. The
//! connection is then established one of two ways:
//!
//! ```text
//!   Direct (p2p)                         Relay
//!
//!   A ──punch!──► B                      A ──► relay ◄── B
//!   A ══QUIC════► B (peer server)              │ splice │
//!   A ──p2p-client-init──► B                   ▼        ▼
//!                                         stream A ⇄ stream B
//! ```
//!
//! - [`manager::P2pManager`]: client side, owns connections and dispatches
//!   incoming streams.
//! - [`broker::BrokerManager`]: broker side, matches requests and advertises
//!   relays.
//! - [`conn::Connection`]: one established (or establishing) connection.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;

pub mod broker;
pub mod conn;
mod direct;
pub mod manager;
pub mod message_stream;
pub mod peer;
mod relay;

pub use broker::{BrokerManager, ConnectionIdGenerator};
pub use conn::Connection;
pub use manager::{ConnectionHandler, MessageStreamHandler, P2pConfig, P2pManager};
pub use message_stream::{MessageStream, StreamMessageHandler};
pub use peer::Peer;

// ============================================================================
// Timing and retry policy
// ============================================================================

/// Liveness probe interval for broker-side connections.
pub const TICKER_DURATION: Duration = Duration::from_secs(15);

/// Timeout for short p2p control requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a connection request forwarded through the broker.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

pub const P2P_CONNECT_TRIES: u32 = 3;
pub const P2P_RECONNECT_TRIES: u32 = 3;
pub const RELAY_CONNECT_TRIES: u32 = 3;
pub const RELAY_RECONNECT_TRIES: u32 = 4;

/// How long a relay client waits for its counterpart to arrive.
pub const RELAY_PEER_AWAIT_TIMEOUT: Duration = Duration::from_secs(20);

/// How long an acceptor waits for the initiator's inbound session.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between hole-punch bursts.
pub const PUNCH_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Tags and metadata keys
// ============================================================================

/// Registry tag carried by relay servers.
pub const TAG_RELAY: &str = "relay";

pub const KEY_CONNECTION_ID: &str = "__CONNECTION_ID";
pub const KEY_PORT: &str = "__PORT";
pub const KEY_TAGS: &str = "__TAGS";
pub const KEY_CLIENT_ID: &str = "__CLIENT_ID";
/// Marks a relay stream opened on behalf of a local `open_stream`.
pub const KEY_STREAM_IGNORE: &str = "__STREAM_IGNORE";
/// Marks a stream carrying framed messages.
pub const KEY_STREAM_MESSAGE: &str = "__STREAM_MESSAGE";

// ============================================================================
// Modes and states
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionMode {
    P2p,
    Relay,
}

impl ConnectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMode::P2p => "p2p",
            ConnectionMode::Relay => "relay",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p2p" => Ok(ConnectionMode::P2p),
            "relay" => Ok(ConnectionMode::Relay),
            other => bail!("unknown connection mode ({})", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_wire_names() {
        assert_eq!("p2p".parse::<ConnectionMode>().unwrap(), ConnectionMode::P2p);
        assert_eq!("relay".parse::<ConnectionMode>().unwrap(), ConnectionMode::Relay);
        assert!("tcp".parse::<ConnectionMode>().is_err());
        assert_eq!(ConnectionMode::Relay.to_string(), "relay");
    }
}
