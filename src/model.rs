//! # Wire Model
//!
//! Message bodies exchanged over channels, their content-type tags, and the
//! decoder chain that maps a tag back to a typed [`Body`].
//!
//! All built-in bodies are serialized with bincode using big-endian fixed-width
//! integers and a size limit. Application-defined content types travel as
//! [`Body::Raw`] and are recognized by a [`RawUnmarshaler`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::ChannelError;

// ============================================================================
// Content Types
// ============================================================================

pub const CLIENT_PING: &str = "network-client-ping";
pub const CLIENT_VALIDATE: &str = "network-client-validate";
pub const CLIENT_DATA: &str = "network-client-data";
pub const CLIENT_SEARCH: &str = "network-client-search";
pub const CLIENTS: &str = "network-clients";

pub const STREAM_CONNECTION_DATA: &str = "network-stream-conn-data";
pub const STREAM_CONNECTION_STATUS: &str = "network-stream-conn-status";

pub const P2P_CLIENT_INIT: &str = "p2p-client-init";
pub const P2P_CONNECTION_REQUEST: &str = "p2p-conn-request";
pub const P2P_CONNECTION_STATUS: &str = "p2p-conn-status";
pub const P2P_CONNECTION_DATA: &str = "p2p-conn-data";
pub const P2P_DATA: &str = "p2p-data";

pub const P2P_RELAY_SERVERS: &str = "p2p-relay-servers";
pub const P2P_RELAY_VALIDATE: &str = "p2p-relay-validate";
pub const P2P_RELAY_AWAIT: &str = "p2p-relay-await";
pub const P2P_RELAY_CONNECTION_DATA: &str = "p2p-relay-conn-data";
pub const P2P_RELAY_OPEN_STREAM: &str = "p2p-relay-open-stream";
pub const P2P_RELAY_STREAM_INFO: &str = "p2p-relay-stream-info";

/// Upper bound for a single encoded body (1 MiB plus room for framing fields).
pub const MAX_BODY_SIZE: usize = 1024 * 1024 + 4 * 1024;

/// Upper bound for an encoded frame header.
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

// ============================================================================
// Codec
// ============================================================================

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_BODY_SIZE as u64)
        .with_big_endian()
        .with_fixint_encoding()
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    wire_options().serialize(value)
}

/// Deserialize with the wire size limit enforced.
pub(crate) fn decode_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    wire_options().deserialize(bytes)
}

// ============================================================================
// Bodies
// ============================================================================

pub type Metadata = HashMap<String, String>;

/// Builds metadata from literal pairs.
pub fn metadata<const N: usize>(pairs: [(&str, &str); N]) -> Metadata {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoData;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientValidateData {
    pub token: String,
    pub data: Metadata,
}

/// Role-specific context attached to a registered client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientContext {
    #[default]
    None,
    Broker,
    P2p {
        conn_id: String,
        peer_id: String,
        active: bool,
    },
    Relay {
        connection_id: String,
        source_peer_id: String,
        target_peer_id: String,
    },
}

/// Registration record produced by a validator and echoed back to the client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientData {
    pub status: bool,
    pub message: String,
    pub id: String,
    pub address: String,
    pub tag: String,
    pub tags: Metadata,
    pub data: Metadata,
    pub ctx: ClientContext,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPing {
    pub time: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSearch {
    pub id: String,
    pub tag: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clients {
    pub status: bool,
    pub message: String,
    pub clients: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConnectionData {
    pub id: String,
    pub data: Metadata,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConnectionStatus {
    pub id: String,
    pub status: bool,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pPeerData {
    pub id: String,
    pub address: String,
    pub addresses: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pConnectionRequest {
    pub id: String,
    pub mode: String,
    pub relay_address: String,
    pub peer: P2pPeerData,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pConnectionStatus {
    pub id: String,
    pub status: bool,
    pub message: String,
}

impl P2pConnectionStatus {
    /// Status reply for `id` describing the outcome of a handler.
    pub fn from_result(id: impl Into<String>, result: &anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => Self { id: id.into(), status: true, message: "Ok".into() },
            Err(e) => Self { id: id.into(), status: false, message: e.to_string() },
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pConnectionData {
    pub status: bool,
    pub message: String,
    pub id: String,
    pub mode: String,
    pub relay_address: String,
    pub peer: P2pPeerData,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pData {
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pRelayServers {
    pub servers: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pRelayConnectionData {
    pub status: bool,
    pub message: String,
    pub id: String,
    pub mode: String,
    pub peer: P2pPeerData,
    pub source_peer: P2pPeerData,
    pub target_peer: P2pPeerData,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pRelayOpenStream {
    pub metadata: Metadata,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2pRelayStreamInfo {
    pub status: bool,
    pub message: String,
    pub id: String,
}

/// Typed accessor implemented by every model struct carried in a [`Body`].
pub trait ModelBody: Sized {
    const NAME: &'static str;
    fn from_body(body: &Body) -> Option<&Self>;
}

macro_rules! bodies {
    ($($variant:ident),* $(,)?) => {
        /// Decoded message payload.
        #[derive(Clone, Debug, PartialEq)]
        pub enum Body {
            $($variant($variant),)*
            /// Application-defined payload, passed through undecoded.
            Raw(Vec<u8>),
        }

        impl Body {
            pub fn name(&self) -> &'static str {
                match self {
                    $(Body::$variant(_) => stringify!($variant),)*
                    Body::Raw(_) => "Raw",
                }
            }

            pub(crate) fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
                match self {
                    $(Body::$variant(v) => encode(v),)*
                    Body::Raw(bytes) => Ok(bytes.clone()),
                }
            }
        }

        $(
            impl From<$variant> for Body {
                fn from(value: $variant) -> Self {
                    Body::$variant(value)
                }
            }

            impl ModelBody for $variant {
                const NAME: &'static str = stringify!($variant);

                fn from_body(body: &Body) -> Option<&Self> {
                    match body {
                        Body::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )*
    };
}

bodies!(
    NoData,
    ClientValidateData,
    ClientData,
    ClientPing,
    ClientSearch,
    Clients,
    StreamConnectionData,
    StreamConnectionStatus,
    P2pConnectionRequest,
    P2pConnectionStatus,
    P2pConnectionData,
    P2pData,
    P2pRelayServers,
    P2pRelayConnectionData,
    P2pRelayOpenStream,
    P2pRelayStreamInfo,
);

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Raw(bytes)
    }
}

// ============================================================================
// Decoders
// ============================================================================

/// Maps a content-type tag to a decoded body.
///
/// Returns `None` when the tag is not handled by this decoder, letting the
/// next decoder in the chain try.
pub trait Unmarshal: Send + Sync {
    fn unmarshal(&self, content_type: &str, bytes: &[u8]) -> Option<Result<Body, ChannelError>>;
}

fn decode_as<T>(bytes: &[u8]) -> Result<Body, ChannelError>
where
    T: DeserializeOwned + Into<Body>,
{
    Ok(decode_bounded::<T>(bytes)?.into())
}

/// Decoder for every built-in content type.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModelUnmarshaler;

impl Unmarshal for ModelUnmarshaler {
    fn unmarshal(&self, content_type: &str, bytes: &[u8]) -> Option<Result<Body, ChannelError>> {
        let body = match content_type {
            CLIENT_VALIDATE | P2P_RELAY_VALIDATE => decode_as::<ClientValidateData>(bytes),
            CLIENT_DATA => decode_as::<ClientData>(bytes),
            CLIENT_PING => decode_as::<ClientPing>(bytes),
            CLIENT_SEARCH => decode_as::<ClientSearch>(bytes),
            CLIENTS => decode_as::<Clients>(bytes),

            STREAM_CONNECTION_DATA => decode_as::<StreamConnectionData>(bytes),
            STREAM_CONNECTION_STATUS => decode_as::<StreamConnectionStatus>(bytes),

            P2P_CLIENT_INIT | P2P_RELAY_AWAIT => decode_as::<NoData>(bytes),
            P2P_CONNECTION_REQUEST => decode_as::<P2pConnectionRequest>(bytes),
            P2P_CONNECTION_STATUS => decode_as::<P2pConnectionStatus>(bytes),
            P2P_CONNECTION_DATA => decode_as::<P2pConnectionData>(bytes),
            P2P_DATA => decode_as::<P2pData>(bytes),

            P2P_RELAY_SERVERS => decode_as::<P2pRelayServers>(bytes),
            P2P_RELAY_CONNECTION_DATA => decode_as::<P2pRelayConnectionData>(bytes),
            P2P_RELAY_OPEN_STREAM => decode_as::<P2pRelayOpenStream>(bytes),
            P2P_RELAY_STREAM_INFO => decode_as::<P2pRelayStreamInfo>(bytes),

            _ => return None,
        };
        Some(body)
    }
}

/// Passes the listed application content types through as [`Body::Raw`].
#[derive(Debug, Default, Clone)]
pub struct RawUnmarshaler {
    content_types: HashSet<String>,
}

impl RawUnmarshaler {
    pub fn new<I, S>(content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { content_types: content_types.into_iter().map(Into::into).collect() }
    }
}

impl Unmarshal for RawUnmarshaler {
    fn unmarshal(&self, content_type: &str, bytes: &[u8]) -> Option<Result<Body, ChannelError>> {
        self.content_types
            .contains(content_type)
            .then(|| Ok(Body::Raw(bytes.to_vec())))
    }
}

/// Ordered decoder list. The first decoder recognizing a tag wins.
#[derive(Clone)]
pub struct UnmarshalChain {
    decoders: Arc<[Arc<dyn Unmarshal>]>,
}

impl UnmarshalChain {
    /// Built-in model decoder, followed by an optional application decoder.
    pub fn new(extra: Option<Arc<dyn Unmarshal>>) -> Self {
        let mut decoders: Vec<Arc<dyn Unmarshal>> = vec![Arc::new(ModelUnmarshaler)];
        decoders.extend(extra);
        Self { decoders: decoders.into() }
    }

    pub fn decode(&self, content_type: &str, bytes: &[u8]) -> Result<Body, ChannelError> {
        self.decoders
            .iter()
            .find_map(|d| d.unmarshal(content_type, bytes))
            .unwrap_or_else(|| Err(ChannelError::UnknownContentType(content_type.to_string())))
    }
}

impl Default for UnmarshalChain {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for UnmarshalChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnmarshalChain").field("decoders", &self.decoders.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_decodes_builtin_type() {
        let request = P2pConnectionRequest {
            id: "c1".into(),
            mode: "p2p".into(),
            relay_address: String::new(),
            peer: P2pPeerData {
                id: "peer-a".into(),
                address: "10.0.0.1:4000".into(),
                addresses: vec!["192.168.1.2:4000".into()],
            },
        };
        let bytes = encode(&request).unwrap();

        let chain = UnmarshalChain::default();
        let body = chain.decode(P2P_CONNECTION_REQUEST, &bytes).unwrap();
        assert_eq!(P2pConnectionRequest::from_body(&body), Some(&request));
    }

    #[test]
    fn unknown_tag_is_typed_error() {
        let chain = UnmarshalChain::default();
        let err = chain.decode("made-up-type", &[]).unwrap_err();
        assert_eq!(err, ChannelError::UnknownContentType("made-up-type".into()));
    }

    #[test]
    fn raw_decoder_runs_after_models() {
        let chain = UnmarshalChain::new(Some(Arc::new(RawUnmarshaler::new(["app-blob"]))));
        let body = chain.decode("app-blob", b"opaque").unwrap();
        assert_eq!(body, Body::Raw(b"opaque".to_vec()));

        // Built-in tags are still claimed by the model decoder.
        let bytes = encode(&ClientPing { time: "now".into() }).unwrap();
        let body = chain.decode(CLIENT_PING, &bytes).unwrap();
        assert_eq!(body.name(), "ClientPing");
    }

    #[test]
    fn truncated_body_fails_to_decode() {
        let bytes = encode(&ClientSearch { id: "abc".into(), tag: String::new() }).unwrap();
        let err = UnmarshalChain::default()
            .decode(CLIENT_SEARCH, &bytes[..bytes.len() - 1])
            .unwrap_err();
        assert!(matches!(err, ChannelError::Decode(_)));
    }

    #[test]
    fn integers_are_big_endian() {
        let bytes = encode(&P2pData { data: vec![7] }).unwrap();
        // u64 length prefix, big-endian, then the byte itself.
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0, 1, 7]);
    }

    #[test]
    fn status_from_result() {
        let ok = P2pConnectionStatus::from_result("c", &Ok(()));
        assert!(ok.status);
        let err = P2pConnectionStatus::from_result("c", &Err(anyhow::anyhow!("connection pending")));
        assert!(!err.status);
        assert_eq!(err.message, "connection pending");
    }
}
