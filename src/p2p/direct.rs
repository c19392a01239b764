//! Direct path: hole punching plus a race of outbound sessions.
//!
//! ```text
//! initiator                                   acceptor
//!   punch loop ──punch!──►   ◄──punch!── punch loop
//!   dial every candidate ───────────────► peer server validates token
//!   first session to pass ──p2p-client-init──► checkin_remote
//!   init wins, others closed                 handoff to waiting path
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::conn::{PathContext, PathOps};
use super::{ACCEPT_TIMEOUT, P2P_CONNECT_TRIES, P2P_RECONNECT_TRIES, PUNCH_INTERVAL, REQUEST_TIMEOUT};
use crate::client::{RegistryClient, RegistryClientConfig};
use crate::message::{Message, CONNECTION_TIMEOUT as DIAL_TIMEOUT};
use crate::model::{Metadata, NoData, P2pConnectionStatus, P2P_CLIENT_INIT};
use crate::server::ServerClient;
use crate::stream::{ClientHandle, Stream};
use crate::util::{spawn_supervised, ExitSignal};

const CLOSE_SUPERSEDED: &str = "Already connected using a different client";

pub(crate) struct DirectPath {
    me: Weak<DirectPath>,
    ctx: PathContext,
    session: RwLock<Option<Arc<dyn ClientHandle>>>,
    handoff_tx: std::sync::Mutex<Option<oneshot::Sender<Arc<ServerClient>>>>,
    handoff_rx: Mutex<Option<oneshot::Receiver<Arc<ServerClient>>>>,
    connected: AtomicBool,
    closed: AtomicBool,
    exit: ExitSignal,
}

impl DirectPath {
    pub(crate) fn new(ctx: PathContext) -> Arc<Self> {
        let (tx, rx) = oneshot::channel();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            ctx,
            session: RwLock::new(None),
            handoff_tx: std::sync::Mutex::new(Some(tx)),
            handoff_rx: Mutex::new(Some(rx)),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            exit: ExitSignal::new(),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Single-slot rendezvous for the acceptor. The first session wins.
    pub(crate) fn checkin_remote(&self, client: Arc<ServerClient>) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            bail!("connection already open");
        }
        let tx = self
            .handoff_tx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| anyhow!("another client is already connected"))?;
        tx.send(client).map_err(|_| anyhow!("connection is no longer waiting for a peer"))?;
        Ok(())
    }

    /// True once a remote session has checked in or the slot was withdrawn.
    pub(crate) fn is_claimed(&self) -> bool {
        self.handoff_tx.lock().map(|slot| slot.is_none()).unwrap_or(true)
    }

    fn start_punching(&self) {
        let me = self.me.clone();
        let targets = self.ctx.peer.addrs.clone();
        let conn_id = self.ctx.conn_id.clone();
        let task = async move {
            loop {
                let Some(path) = me.upgrade() else { return };
                if path.is_closed() || path.connected.load(Ordering::Acquire) {
                    debug!(conn = %conn_id, "punching stopped");
                    return;
                }
                path.ctx.endpoint.punch(&targets).await;
                drop(path);
                tokio::time::sleep(PUNCH_INTERVAL).await;
            }
        };
        spawn_supervised("p2p-punch", task, self.close_on_fault());
    }

    fn close_on_fault(&self) -> impl FnOnce() + Send + 'static {
        let me = self.me.clone();
        move || {
            if let Some(path) = me.upgrade() {
                tokio::spawn(async move { path.close().await });
            }
        }
    }

    async fn accept(&self) -> Result<Arc<dyn ClientHandle>> {
        let rx = self
            .handoff_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("connection already accepting"))?;
        let exit = self.exit.subscribe();
        let client = tokio::select! {
            _ = exit => bail!("connection closed"),
            handed = tokio::time::timeout(ACCEPT_TIMEOUT, rx) => match handed {
                Ok(Ok(client)) => client,
                Ok(Err(_)) => bail!("connection closed"),
                Err(_) => bail!("timed out waiting for peer {} to connect", self.ctx.peer.id),
            },
        };
        // Late check-ins are rejected from here on.
        if let Ok(mut slot) = self.handoff_tx.lock() {
            slot.take();
        }
        Ok(client as Arc<dyn ClientHandle>)
    }

    async fn initiate(&self) -> Result<Arc<dyn ClientHandle>> {
        let candidates = self.ctx.peer.addrs.clone();
        if candidates.is_empty() {
            bail!("peer {} has no candidate addresses", self.ctx.peer.id);
        }

        let race = Arc::new(Race::default());
        let (tx, mut rx) = mpsc::channel(candidates.len());
        for addr in candidates {
            tokio::spawn(attempt(self.ctx.clone(), addr, Arc::clone(&race), tx.clone()));
        }
        drop(tx);

        let deadline = tokio::time::sleep(DIAL_TIMEOUT * P2P_CONNECT_TRIES);
        tokio::pin!(deadline);
        let exit = self.exit.subscribe();
        tokio::pin!(exit);

        let mut last_err = anyhow!("no session could be established");
        let winner = loop {
            let offered = tokio::select! {
                _ = &mut deadline => break None,
                _ = &mut exit => break None,
                offered = rx.recv() => offered,
            };
            let Some(client) = offered else { break None };

            let mut won = race.won.lock().await;
            let inited = tokio::select! {
                _ = &mut deadline => None,
                inited = init_client(&client) => Some(inited),
            };
            let Some(inited) = inited else {
                client.close(0, "Init timed out").await;
                last_err = anyhow!("timed out initializing session with {}", client.server_addr());
                break None;
            };
            match inited {
                Ok(()) => {
                    *won = true;
                    race.done.store(true, Ordering::Release);
                    break Some(client);
                }
                Err(e) => {
                    warn!(conn = %self.ctx.conn_id, server = %client.server_addr(), error = %e, "client init failed");
                    client.close(0, &format!("Init failed: {}", e)).await;
                    last_err = e;
                }
            }
        };

        race.done.store(true, Ordering::Release);
        rx.close();
        while let Ok(extra) = rx.try_recv() {
            extra.close(0, CLOSE_SUPERSEDED).await;
        }

        match winner {
            Some(client) => Ok(client as Arc<dyn ClientHandle>),
            None if self.is_closed() => bail!("connection closed"),
            None => Err(last_err.context(format!("could not reach peer {}", self.ctx.peer.id))),
        }
    }

    /// Watches the winning session and closes the path when it exits.
    fn watch_session(&self, session: &Arc<dyn ClientHandle>) {
        let me = self.me.clone();
        let exited = session.exited();
        let watch = async move {
            exited.wait().await;
            if let Some(path) = me.upgrade() {
                path.close().await;
            }
        };
        spawn_supervised("p2p-session-watch", watch, self.close_on_fault());
    }
}

#[async_trait]
impl PathOps for DirectPath {
    async fn connect(&self) -> Result<()> {
        self.start_punching();

        let session = if self.ctx.initiator { self.initiate().await? } else { self.accept().await? };
        *self.session.write().await = Some(Arc::clone(&session));
        if self.is_closed() {
            session.close(0, "Connection closed").await;
            bail!("connection closed");
        }
        self.connected.store(true, Ordering::Release);
        self.watch_session(&session);
        info!(conn = %self.ctx.conn_id, peer = %self.ctx.peer.id, "direct session established");
        Ok(())
    }

    async fn open_stream(&self, data: Metadata) -> Result<Arc<Stream>> {
        let session = self.session.read().await.clone().ok_or_else(|| anyhow!("not connected"))?;
        session.open_stream(data).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.is_closed()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        if let Ok(mut slot) = self.handoff_tx.lock() {
            slot.take();
        }
        if let Some(session) = self.session.write().await.take() {
            session.close(0, "Connection closed").await;
        }
        self.exit.fire();
    }

    fn exited(&self) -> ExitSignal {
        self.exit.clone()
    }
}

// ============================================================================
// Initiator race
// ============================================================================

/// Completion flag for the race. `won` is held while a candidate runs its
/// init exchange, so attempts that finish meanwhile wait and then back off.
#[derive(Default)]
struct Race {
    won: Mutex<bool>,
    done: AtomicBool,
}

async fn attempt(ctx: PathContext, addr: SocketAddr, race: Arc<Race>, offers: mpsc::Sender<Arc<RegistryClient>>) {
    let config = RegistryClientConfig {
        tag: ctx.conn_id.clone(),
        server_addr: addr,
        connect_tries: P2P_CONNECT_TRIES,
        reconnect_tries: P2P_RECONNECT_TRIES,
        token: ctx.conn_id.clone(),
        data: Metadata::new(),
        unmarshaler: ctx.unmarshaler.clone(),
    };
    let client = match RegistryClient::with_endpoint(config, ctx.endpoint.clone()) {
        Ok(client) => client,
        Err(e) => {
            warn!(conn = %ctx.conn_id, addr = %addr, error = %e, "could not create client");
            return;
        }
    };
    let gate = Arc::clone(&race);
    client.set_can_connect(Arc::new(move |tries| !gate.done.load(Ordering::Acquire) && tries < P2P_CONNECT_TRIES));
    client.set_stream_handler(ctx.stream_handler.clone()).await;

    if let Err(e) = client.connect().await {
        debug!(conn = %ctx.conn_id, addr = %addr, error = %e, "candidate unreachable");
        client.close(0, "Connect failed").await;
        return;
    }

    let won = race.won.lock().await;
    if *won || offers.try_send(Arc::clone(&client)).is_err() {
        drop(won);
        client.close(0, CLOSE_SUPERSEDED).await;
        return;
    }
    debug!(conn = %ctx.conn_id, addr = %addr, "candidate connected");
}

async fn init_client(client: &RegistryClient) -> Result<()> {
    let reply = client
        .send(Message::with_ack(P2P_CLIENT_INIT, NoData, REQUEST_TIMEOUT))
        .await?
        .ok_or_else(|| anyhow!("client init got no reply"))?;
    let status = reply.body::<P2pConnectionStatus>()?;
    if !status.status {
        bail!("{}", status.message);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::model::{ClientData, ClientValidateData, P2P_CONNECTION_STATUS};
    use crate::p2p::Peer;
    use crate::server::{message_handler, ClientValidator, RegistryServer, RegistryServerConfig};
    use crate::stream::stream_handler;
    use crate::transport::QuicEndpoint;

    const CONN_ID: &str = "conn-1";

    /// Admits sessions that present the connection id as their token.
    struct ConnIdValidator;

    #[async_trait]
    impl ClientValidator for ConnIdValidator {
        async fn validate(&self, addr: SocketAddr, request: &ClientValidateData) -> Result<ClientData> {
            if request.token != CONN_ID {
                bail!("unknown connection");
            }
            Ok(ClientData { id: format!("{}:{}", CONN_ID, addr), address: addr.to_string(), ..ClientData::default() })
        }
    }

    /// A peer server that answers every check-in and counts them.
    async fn candidate(inits: Arc<AtomicUsize>) -> Arc<RegistryServer> {
        let config = RegistryServerConfig {
            tag: "candidate".to_string(),
            addr: "127.0.0.1:0".parse().unwrap(),
            unmarshaler: None,
        };
        let server = RegistryServer::new(config, Arc::new(ConnIdValidator)).await.unwrap();
        server
            .register_handler(
                P2P_CLIENT_INIT,
                message_handler(move |client, msg| {
                    let inits = Arc::clone(&inits);
                    async move {
                        inits.fetch_add(1, Ordering::SeqCst);
                        let reply = msg.reply(P2P_CONNECTION_STATUS, P2pConnectionStatus::from_result(CONN_ID, &Ok(())));
                        client.send(reply.unwrap()).await.unwrap();
                    }
                }),
            )
            .unwrap();
        server.listen().unwrap();
        server
    }

    fn initiator_context(endpoint: QuicEndpoint, addrs: Vec<SocketAddr>) -> PathContext {
        PathContext {
            conn_id: CONN_ID.to_string(),
            peer: Peer { id: "bob".into(), addr: addrs[0], addrs },
            initiator: true,
            endpoint,
            broker_token: "alice".into(),
            broker_data: Metadata::new(),
            unmarshaler: None,
            stream_handler: stream_handler(|_, stream| async move { stream.close().await }),
        }
    }

    fn registered(servers: &[Arc<RegistryServer>]) -> usize {
        servers.iter().map(|s| s.client_count()).sum()
    }

    #[tokio::test]
    async fn one_candidate_wins_and_the_rest_are_superseded() {
        let inits = Arc::new(AtomicUsize::new(0));
        let mut servers = Vec::new();
        for _ in 0..3 {
            servers.push(candidate(Arc::clone(&inits)).await);
        }
        let addrs = servers.iter().map(|s| s.local_addr()).collect();
        let endpoint = QuicEndpoint::bind("127.0.0.1:0".parse().unwrap(), false).await.unwrap();
        let path = DirectPath::new(initiator_context(endpoint, addrs));

        tokio::time::timeout(Duration::from_secs(30), path.connect()).await.unwrap().unwrap();
        assert!(path.is_connected());
        assert!(path.session.read().await.is_some());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while registered(&servers) != 1 {
            assert!(tokio::time::Instant::now() < deadline, "{} sessions still registered", registered(&servers));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(registered(&servers), 1, "only the winning session survives");
        assert_eq!(inits.load(Ordering::SeqCst), 1, "only the winner checks in");

        path.close().await;
        assert!(!path.is_connected());
        for server in servers {
            server.close(0, "done").await;
        }
    }

    #[tokio::test]
    async fn unreachable_candidates_fail_the_path() {
        // Bound but never listening, so every dial goes unanswered.
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let endpoint = QuicEndpoint::bind("127.0.0.1:0".parse().unwrap(), false).await.unwrap();
        let path = DirectPath::new(initiator_context(endpoint, vec![silent.local_addr().unwrap()]));

        let result = tokio::time::timeout(Duration::from_secs(60), path.connect()).await.unwrap();
        assert!(result.is_err());
        assert!(!path.is_connected());
        path.close().await;
    }

    #[tokio::test]
    async fn panicking_path_task_closes_the_path() {
        let endpoint = QuicEndpoint::bind("127.0.0.1:0".parse().unwrap(), false).await.unwrap();
        let path = DirectPath::new(initiator_context(endpoint, vec!["127.0.0.1:9".parse().unwrap()]));

        spawn_supervised("boom", async { panic!("punch loop bug") }, path.close_on_fault());

        tokio::time::timeout(Duration::from_secs(5), path.exited().wait()).await.unwrap();
        assert!(path.is_closed());
    }

    #[tokio::test]
    async fn acceptor_rejects_check_in_after_close() {
        let endpoint = QuicEndpoint::bind("127.0.0.1:0".parse().unwrap(), false).await.unwrap();
        let mut ctx = initiator_context(endpoint, vec!["127.0.0.1:9".parse().unwrap()]);
        ctx.initiator = false;
        let path = DirectPath::new(ctx);
        assert!(!path.is_claimed());

        path.close().await;
        assert!(path.is_claimed());
        let accepted = path.accept().await;
        assert!(accepted.is_err());
    }
}
