//! Relay path: both peers register with the same relay under the connection
//! id, wait for each other, and ask the relay for spliced streams.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use super::conn::{PathContext, PathOps};
use super::{KEY_CONNECTION_ID, RELAY_CONNECT_TRIES, RELAY_PEER_AWAIT_TIMEOUT, RELAY_RECONNECT_TRIES};
use crate::client::{RegistryClient, RegistryClientConfig};
use crate::message::{Message, CONNECTION_TIMEOUT};
use crate::model::{Metadata, NoData, P2pRelayOpenStream, P2pRelayStreamInfo, P2P_RELAY_AWAIT, P2P_RELAY_OPEN_STREAM};
use crate::stream::Stream;
use crate::util::ExitSignal;

pub(crate) struct RelayPath {
    me: Weak<RelayPath>,
    ctx: PathContext,
    relay_addr: SocketAddr,
    client: RwLock<Option<Arc<RegistryClient>>>,
    connected: AtomicBool,
    closed: AtomicBool,
    exit: ExitSignal,
}

impl RelayPath {
    pub(crate) fn new(ctx: PathContext, relay_addr: SocketAddr) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            ctx,
            relay_addr,
            client: RwLock::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            exit: ExitSignal::new(),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn client(&self) -> Result<Arc<RegistryClient>> {
        self.client.read().await.clone().ok_or_else(|| anyhow!("not connected to relay"))
    }

    async fn await_peer(&self, client: &RegistryClient) -> Result<()> {
        let reply = client
            .send(Message::with_ack(P2P_RELAY_AWAIT, NoData, RELAY_PEER_AWAIT_TIMEOUT))
            .await?
            .ok_or_else(|| anyhow!("relay await got no reply"))?;
        let info = reply.body::<P2pRelayStreamInfo>()?;
        if !info.status {
            bail!("{}", info.message);
        }
        Ok(())
    }
}

#[async_trait]
impl PathOps for RelayPath {
    async fn connect(&self) -> Result<()> {
        let mut data = self.ctx.broker_data.clone();
        data.insert(KEY_CONNECTION_ID.to_string(), self.ctx.conn_id.clone());
        let config = RegistryClientConfig {
            tag: format!("relay-{}", self.ctx.conn_id),
            server_addr: self.relay_addr,
            connect_tries: RELAY_CONNECT_TRIES,
            reconnect_tries: RELAY_RECONNECT_TRIES,
            token: self.ctx.broker_token.clone(),
            data,
            unmarshaler: self.ctx.unmarshaler.clone(),
        };
        let client = RegistryClient::new(config).await?;
        client.set_stream_handler(self.ctx.stream_handler.clone()).await;
        *self.client.write().await = Some(Arc::clone(&client));
        if self.is_closed() {
            client.close(0, "Connection closed").await;
            bail!("connection closed");
        }

        client.connect().await?;
        let me = self.me.clone();
        let exited = client.exited();
        tokio::spawn(async move {
            exited.wait().await;
            if let Some(path) = me.upgrade() {
                path.close().await;
            }
        });

        info!(conn = %self.ctx.conn_id, relay = %self.relay_addr, "awaiting peer on relay");
        self.await_peer(&client).await?;
        self.connected.store(true, Ordering::Release);
        info!(conn = %self.ctx.conn_id, relay = %self.relay_addr, peer = %self.ctx.peer.id, "relay session established");
        Ok(())
    }

    async fn open_stream(&self, data: Metadata) -> Result<Arc<Stream>> {
        let client = self.client().await?;
        let reply = client
            .send(Message::with_ack(P2P_RELAY_OPEN_STREAM, P2pRelayOpenStream { metadata: data }, CONNECTION_TIMEOUT))
            .await?
            .ok_or_else(|| anyhow!("relay open stream got no reply"))?;
        let info = reply.body::<P2pRelayStreamInfo>()?;
        if !info.status {
            bail!("relay could not open stream: {}", info.message);
        }
        client.await_stream(&info.id, CONNECTION_TIMEOUT).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.is_closed()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        if let Some(client) = self.client.write().await.take() {
            client.close(0, "Connection closed").await;
        }
        self.exit.fire();
    }

    fn exited(&self) -> ExitSignal {
        self.exit.clone()
    }
}
