//! # xnet - Peer-to-Peer Networking over QUIC
//!
//! xnet connects clients that sit behind NATs. A broker keeps a registry of
//! clients and matches connection requests; peers then talk either directly
//! through a hole-punched QUIC session or through a relay that splices their
//! streams.
//!
//! - **Channel**: length-prefixed frames with request/reply correlation
//! - **Registry**: token-validated client sessions with search and streams
//! - **Direct path**: UDP hole punching raced across every candidate address
//! - **Relay path**: rendezvous on a relay server and byte-level splicing
//!
//! ## Architecture
//!
//! Every long-lived object is shared through `Arc` and owns an exit signal.
//! Background loops run supervised; a loop that dies closes its owner, and
//! closing an owner cascades to everything it holds.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `channel` | Framed message channel over a byte stream |
//! | `message` | Message envelope, frame codec, timeouts |
//! | `model` | Message types, wire records, body decoders |
//! | `server` | Registry server and its per-client sessions |
//! | `client` | Registry client with reconnection and ping loop |
//! | `stream` | Auxiliary streams on a registry session |
//! | `transport` | QUIC endpoint sharing one UDP socket with hole punching |
//! | `crypto` | Self-signed TLS configuration for QUIC |
//! | `ping` | Latency probing for relay selection |
//! | `p2p` | Connections, client-side and broker-side managers |
//! | `relay` | Relay server |
//! | `broker` | Broker server and client façades |

pub mod broker;
pub mod channel;
pub mod client;
pub mod crypto;
pub mod error;
pub mod message;
pub mod model;
pub mod p2p;
pub mod ping;
pub mod relay;
pub mod server;
pub mod stream;
pub mod transport;
pub mod util;

pub use broker::{BrokerClient, BrokerClientConfig, BrokerServer, BrokerServerConfig, IdentityTokenValidator};
pub use channel::Channel;
pub use client::{RegistryClient, RegistryClientConfig};
pub use error::ChannelError;
pub use message::Message;
pub use p2p::{Connection, ConnectionMode, MessageStream, P2pConfig, P2pManager};
pub use relay::{RelayServer, RelayServerConfig};
pub use server::{ClientValidator, RegistryServer, RegistryServerConfig, ServerClient};
pub use stream::Stream;
