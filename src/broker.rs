//! # Broker façades
//!
//! Ready-made assemblies of the registry and p2p layers:
//!
//! - [`BrokerServer`]: a [`RegistryServer`] with a [`BrokerManager`] attached.
//! - [`BrokerClient`]: a [`RegistryClient`] whose endpoint also serves
//!   inbound peer sessions, with a [`P2pManager`] attached.
//! - [`IdentityTokenValidator`]: a permissive broker validator that takes
//!   the client id from its data or token.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::client::{RegistryClient, RegistryClientConfig};
use crate::model::{ClientContext, ClientData, ClientValidateData, Metadata, Unmarshal};
use crate::p2p::manager::PeerStreamHandler;
use crate::p2p::{
    BrokerManager, Connection, ConnectionHandler, ConnectionMode, MessageStreamHandler, P2pConfig, P2pManager,
    KEY_CLIENT_ID, KEY_TAGS, TICKER_DURATION,
};
use crate::server::{ClientValidator, RegistryServer, RegistryServerConfig};
use crate::transport::QuicEndpoint;
use crate::util::ExitSignal;

// ============================================================================
// Validation
// ============================================================================

/// Accepts any non-empty token, optionally restricted to a fixed set.
///
/// The registered id is the `__CLIENT_ID` data entry when present, otherwise
/// the token itself. `__TAGS` is read as a comma-separated list.
#[derive(Debug, Clone, Default)]
pub struct IdentityTokenValidator {
    allowed: Option<HashSet<String>>,
}

impl IdentityTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allowed<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { allowed: Some(tokens.into_iter().map(Into::into).collect()) }
    }
}

#[async_trait]
impl ClientValidator for IdentityTokenValidator {
    async fn validate(&self, addr: SocketAddr, request: &ClientValidateData) -> Result<ClientData> {
        if request.token.is_empty() {
            bail!("empty token");
        }
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(&request.token) {
                bail!("token not allowed");
            }
        }

        let id = request
            .data
            .get(KEY_CLIENT_ID)
            .filter(|id| !id.is_empty())
            .cloned()
            .unwrap_or_else(|| request.token.clone());
        let tags = parse_tags(request.data.get(KEY_TAGS).map(String::as_str).unwrap_or_default());
        debug!(id = %id, addr = %addr, tags = tags.len(), "validated broker client");

        Ok(ClientData {
            id,
            address: addr.to_string(),
            tags,
            data: request.data.clone(),
            ctx: ClientContext::Broker,
            ..ClientData::default()
        })
    }
}

/// `"a, b,,c"` becomes `{a, b, c}`; tags are stored as keys.
fn parse_tags(raw: &str) -> Metadata {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| (t.to_string(), String::new()))
        .collect()
}

// ============================================================================
// Server
// ============================================================================

#[derive(Clone)]
pub struct BrokerServerConfig {
    pub addr: SocketAddr,
    pub unmarshaler: Option<Arc<dyn Unmarshal>>,
    /// Interval between liveness probes of each brokered connection.
    pub check_interval: Duration,
}

impl Default for BrokerServerConfig {
    fn default() -> Self {
        Self { addr: SocketAddr::from(([0, 0, 0, 0], 10000)), unmarshaler: None, check_interval: TICKER_DURATION }
    }
}

impl std::fmt::Debug for BrokerServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerServerConfig")
            .field("addr", &self.addr)
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

pub struct BrokerServer {
    server: Arc<RegistryServer>,
    manager: Arc<BrokerManager>,
}

impl BrokerServer {
    pub async fn new(config: BrokerServerConfig, validator: Arc<dyn ClientValidator>) -> Result<Self> {
        let server = RegistryServer::new(
            RegistryServerConfig { tag: "broker".to_string(), addr: config.addr, unmarshaler: config.unmarshaler },
            validator,
        )
        .await?;
        let manager = BrokerManager::new(Arc::clone(&server)).await?;
        manager.set_check_interval(config.check_interval);
        Ok(Self { server, manager })
    }

    pub fn listen(&self) -> Result<()> {
        self.server.listen()?;
        info!(addr = %self.server.local_addr(), "broker listening");
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn server(&self) -> &Arc<RegistryServer> {
        &self.server
    }

    pub fn manager(&self) -> &Arc<BrokerManager> {
        &self.manager
    }

    pub fn exited(&self) -> ExitSignal {
        self.server.exited()
    }

    /// Closes every broker connection, then the registry server.
    pub async fn close(&self, reason: &str) {
        self.manager.close_all();
        self.server.close(0, reason).await;
    }
}

// ============================================================================
// Client
// ============================================================================

#[derive(Debug, Clone)]
pub struct BrokerClientConfig {
    pub server_addr: SocketAddr,
    pub token: String,
    /// Registered id; the broker falls back to the token when unset.
    pub id: Option<String>,
    pub tags: Vec<String>,
    pub data: Metadata,
    pub connect_tries: u32,
    pub reconnect_tries: u32,
    pub p2p: P2pConfig,
}

impl Default for BrokerClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 10000)),
            token: String::new(),
            id: None,
            tags: Vec::new(),
            data: Metadata::new(),
            connect_tries: 0,
            reconnect_tries: 0,
            p2p: P2pConfig::default(),
        }
    }
}

impl BrokerClientConfig {
    fn registry_config(&self) -> RegistryClientConfig {
        let mut data = self.data.clone();
        if let Some(id) = &self.id {
            data.insert(KEY_CLIENT_ID.to_string(), id.clone());
        }
        if !self.tags.is_empty() {
            data.insert(KEY_TAGS.to_string(), self.tags.join(","));
        }
        RegistryClientConfig {
            tag: "broker".to_string(),
            server_addr: self.server_addr,
            connect_tries: self.connect_tries,
            reconnect_tries: self.reconnect_tries,
            token: self.token.clone(),
            data,
            unmarshaler: None,
        }
    }
}

pub struct BrokerClient {
    client: Arc<RegistryClient>,
    manager: Arc<P2pManager>,
}

impl BrokerClient {
    /// Binds a listening endpoint for the broker's address family and
    /// attaches the p2p manager. Call [`connect`](Self::connect) next.
    pub async fn new(config: BrokerClientConfig) -> Result<Self> {
        let endpoint = QuicEndpoint::bind_for(&config.server_addr, true).await?;
        let client = RegistryClient::with_endpoint(config.registry_config(), endpoint)?;
        let manager = P2pManager::new(config.p2p, Arc::clone(&client)).await?;
        Ok(Self { client, manager })
    }

    pub async fn connect(&self) -> Result<()> {
        self.client.connect().await?;
        info!(id = %self.client.id(), broker = %self.client.server_addr(), "connected to broker");
        Ok(())
    }

    pub fn id(&self) -> String {
        self.client.id()
    }

    pub fn client(&self) -> &Arc<RegistryClient> {
        &self.client
    }

    pub fn manager(&self) -> &Arc<P2pManager> {
        &self.manager
    }

    pub fn exited(&self) -> ExitSignal {
        self.client.exited()
    }

    pub async fn connect_peer_by_id(&self, peer_id: &str, mode: ConnectionMode) -> Result<Arc<Connection>> {
        self.manager.connect_by_id(peer_id, mode).await
    }

    pub async fn connect_peer_by_tag(&self, tag: &str, mode: ConnectionMode) -> Result<Arc<Connection>> {
        self.manager.connect_by_tag(tag, mode).await
    }

    pub async fn set_connection_handler(&self, handler: ConnectionHandler) {
        self.manager.set_connection_handler(handler).await;
    }

    pub async fn set_stream_handler(&self, handler: PeerStreamHandler) {
        self.manager.set_stream_handler(handler).await;
    }

    pub async fn set_message_stream_handler(&self, handler: MessageStreamHandler) {
        self.manager.set_message_stream_handler(handler).await;
    }

    /// Closes every connection and the broker session.
    pub async fn close(&self, reason: &str) {
        self.manager.close().await;
        self.client.close(0, reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::metadata;

    fn request(token: &str, data: Metadata) -> ClientValidateData {
        ClientValidateData { token: token.to_string(), data }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn identity_validator_prefers_client_id() {
        let validator = IdentityTokenValidator::new();
        let data = validator
            .validate(addr(), &request("secret", metadata([(KEY_CLIENT_ID, "alice"), (KEY_TAGS, "a, b,,c")])))
            .await
            .expect("validation failed");
        assert_eq!(data.id, "alice");
        assert_eq!(data.ctx, ClientContext::Broker);
        assert_eq!(data.tags.len(), 3);
        assert!(data.tags.contains_key("b"));

        let data = validator.validate(addr(), &request("bob", Metadata::new())).await.expect("validation failed");
        assert_eq!(data.id, "bob");
        assert!(data.tags.is_empty());
    }

    #[tokio::test]
    async fn identity_validator_rejects_empty_and_unlisted_tokens() {
        let validator = IdentityTokenValidator::new();
        assert!(validator.validate(addr(), &request("", Metadata::new())).await.is_err());

        let validator = IdentityTokenValidator::with_allowed(["one"]);
        assert!(validator.validate(addr(), &request("two", Metadata::new())).await.is_err());
        assert!(validator.validate(addr(), &request("one", Metadata::new())).await.is_ok());
    }

    #[test]
    fn registry_config_carries_id_and_tags() {
        let config = BrokerClientConfig {
            token: "t".into(),
            id: Some("alice".into()),
            tags: vec!["a".into(), "b".into()],
            ..BrokerClientConfig::default()
        };
        let registry = config.registry_config();
        assert_eq!(registry.data.get(KEY_CLIENT_ID).map(String::as_str), Some("alice"));
        assert_eq!(registry.data.get(KEY_TAGS).map(String::as_str), Some("a,b"));
    }
}
