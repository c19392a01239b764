//! Integration tests for brokered peer connections on loopback.
//!
//! Every test runs a broker on an ephemeral port; relay tests add a relay
//! that registers with it.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test p2p -- --nocapture

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;

use xnet::client::RegistryClientConfig;
use xnet::message::Message;
use xnet::model::{metadata, P2pData, P2P_DATA};
use xnet::p2p::manager::{connection_handler, message_stream_handler, peer_stream_handler};
use xnet::p2p::message_stream::stream_message_handler;
use xnet::p2p::{ConnectionState, KEY_CONNECTION_ID};
use xnet::{
    BrokerClient, BrokerClientConfig, BrokerServer, BrokerServerConfig, Connection, ConnectionMode,
    IdentityTokenValidator, P2pConfig, RegistryClient, RelayServer, RelayServerConfig,
};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("debug")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Progress marker that prints elapsed time
fn progress(start: Instant, msg: &str) {
    eprintln!("[{:>6.2}s] {}", start.elapsed().as_secs_f64(), msg);
}

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A dropped direct session is only given up after the reconnect attempts
/// run out, and the relay gives up on its broker the same way.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Liveness probe interval for tests that exercise the periodic checks.
const CHECK_INTERVAL: Duration = Duration::from_secs(1);

async fn start_broker() -> BrokerServer {
    start_broker_checking(BrokerServerConfig::default().check_interval).await
}

async fn start_broker_checking(check_interval: Duration) -> BrokerServer {
    let config = BrokerServerConfig {
        addr: "127.0.0.1:0".parse().unwrap(),
        check_interval,
        ..BrokerServerConfig::default()
    };
    let broker = BrokerServer::new(config, Arc::new(IdentityTokenValidator::new())).await.expect("bind failed");
    broker.listen().expect("listen failed");
    broker
}

async fn start_relay(broker: &BrokerServer) -> Arc<RelayServer> {
    start_relay_checking(broker, RelayServerConfig::default().check_interval).await
}

async fn start_relay_checking(broker: &BrokerServer, check_interval: Duration) -> Arc<RelayServer> {
    let config = RelayServerConfig {
        addr: "127.0.0.1:0".parse().unwrap(),
        broker_addr: broker.local_addr(),
        broker_token: "relay-1".to_string(),
        check_interval,
    };
    let relay = RelayServer::new(config).await.expect("relay bind failed");
    timeout(TEST_TIMEOUT, relay.listen()).await.expect("relay listen timed out").expect("relay listen failed");
    relay
}

fn client_config(broker: &BrokerServer, name: &str) -> BrokerClientConfig {
    BrokerClientConfig {
        server_addr: broker.local_addr(),
        token: name.to_string(),
        tags: vec!["peers".to_string()],
        connect_tries: 3,
        reconnect_tries: 1,
        p2p: P2pConfig { relay_addr: None, local_ips: vec!["127.0.0.1".parse().unwrap()] },
        ..BrokerClientConfig::default()
    }
}

async fn start_client(config: BrokerClientConfig) -> BrokerClient {
    let client = BrokerClient::new(config).await.expect("client bind failed");
    timeout(TEST_TIMEOUT, client.connect()).await.expect("connect timed out").expect("connect failed");
    client
}

/// Installs handlers on `client` that report accepted connections and echo
/// raw streams reversed, and message streams with reversed payloads.
async fn echo_peer(client: &BrokerClient) -> mpsc::UnboundedReceiver<Arc<Connection>> {
    let (tx, rx) = mpsc::unbounded_channel();
    client
        .set_connection_handler(connection_handler(move |conn| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(conn);
            }
        }))
        .await;
    client
        .set_stream_handler(peer_stream_handler(|_, stream| async move {
            let mut bytes = stream.read_to_end().await.unwrap_or_default();
            bytes.reverse();
            let _ = stream.write_all(&bytes).await;
            let _ = stream.finish().await;
        }))
        .await;
    client
        .set_message_stream_handler(message_stream_handler(|stream| async move {
            let _ = stream.listen(stream_message_handler(|stream, msg| async move {
                let mut data = msg.body::<P2pData>().map(|d| d.data.clone()).unwrap_or_default();
                data.reverse();
                if let Ok(reply) = msg.reply(P2P_DATA, P2pData { data }) {
                    let _ = stream.send(reply).await;
                }
            }));
        }))
        .await;
    rx
}

async fn roundtrip_stream(conn: &Connection, payload: &[u8]) -> Vec<u8> {
    let stream = conn.open_stream(metadata([("kind", "echo")])).await.expect("open stream failed");
    assert_eq!(stream.get(KEY_CONNECTION_ID), Some(conn.id()));
    stream.write_all(payload).await.expect("write failed");
    stream.finish().await.expect("finish failed");
    let echoed = timeout(TEST_TIMEOUT, stream.read_to_end()).await.expect("read timed out").expect("read failed");
    stream.close().await;
    echoed
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ============================================================================
// Direct connections
// ============================================================================

#[tokio::test]
async fn direct_connection_carries_streams_and_messages() {
    init_tracing();
    let start = Instant::now();
    let broker = start_broker().await;
    let alice = start_client(client_config(&broker, "alice")).await;
    let bob = start_client(client_config(&broker, "bob")).await;
    let mut accepted = echo_peer(&bob).await;
    progress(start, "clients registered");

    let conn = timeout(TEST_TIMEOUT, alice.connect_peer_by_id("bob", ConnectionMode::P2p))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    assert!(conn.is_connected());
    assert!(conn.is_initiator());
    assert_eq!(conn.mode(), ConnectionMode::P2p);
    assert_eq!(conn.peer().id, "bob");
    assert_eq!(conn.state(), ConnectionState::Connected);

    let remote = timeout(TEST_TIMEOUT, accepted.recv()).await.expect("accept timed out").expect("handler dropped");
    assert_eq!(remote.id(), conn.id());
    assert!(remote.is_connected());
    assert!(!remote.is_initiator());
    assert_eq!(remote.peer().id, "alice");
    assert_eq!(broker.manager().connection_count(), 1);
    progress(start, "direct connection established");

    let echoed = roundtrip_stream(&conn, b"hello direct").await;
    assert_eq!(echoed, b"tcerid olleh".to_vec());

    let messages = conn.open_message_stream(metadata([])).await.expect("open message stream failed");
    let reply = timeout(
        TEST_TIMEOUT,
        messages.send_and_read(Message::with_ack(P2P_DATA, P2pData { data: b"abc".to_vec() }, TEST_TIMEOUT)),
    )
    .await
    .expect("message timed out")
    .expect("message failed")
    .expect("reply expected");
    assert_eq!(reply.body::<P2pData>().expect("wrong body").data, b"cba".to_vec());
    messages.close().await;
    progress(start, "streams verified");

    alice.close("done").await;
    bob.close("done").await;
    broker.close("done").await;
}

#[tokio::test]
async fn connect_by_tag_excludes_self() {
    init_tracing();
    let broker = start_broker().await;
    let alice = start_client(client_config(&broker, "alice")).await;
    let bob = start_client(client_config(&broker, "bob")).await;
    let _accepted = echo_peer(&bob).await;

    let conn = timeout(TEST_TIMEOUT, alice.connect_peer_by_tag("peers", ConnectionMode::P2p))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    assert_eq!(conn.peer().id, "bob");

    let missing = alice.connect_peer_by_tag("nobody-has-this", ConnectionMode::P2p).await;
    assert!(missing.is_err());

    alice.close("done").await;
    bob.close("done").await;
    broker.close("done").await;
}

#[tokio::test]
async fn invalid_targets_are_rejected() {
    init_tracing();
    let broker = start_broker().await;
    let alice = start_client(client_config(&broker, "alice")).await;

    assert!(alice.connect_peer_by_id("alice", ConnectionMode::P2p).await.is_err(), "self connection");
    assert!(alice.connect_peer_by_id("ghost", ConnectionMode::P2p).await.is_err(), "unknown peer");
    assert_eq!(broker.manager().connection_count(), 0);
    assert!(alice.manager().connections().is_empty());

    alice.close("done").await;
    broker.close("done").await;
}

#[tokio::test]
async fn peer_disconnect_closes_connection() {
    init_tracing();
    let broker = start_broker().await;
    let alice = start_client(client_config(&broker, "alice")).await;
    let bob = start_client(client_config(&broker, "bob")).await;
    let mut accepted = echo_peer(&bob).await;

    let conn = timeout(TEST_TIMEOUT, alice.connect_peer_by_id("bob", ConnectionMode::P2p))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let _remote = timeout(TEST_TIMEOUT, accepted.recv()).await.expect("accept timed out").expect("handler dropped");

    bob.close("leaving").await;

    timeout(DISCONNECT_TIMEOUT, conn.exited().wait()).await.expect("connection did not close");
    assert!(conn.is_closed());
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(conn.open_stream(metadata([])).await.is_err());

    let id = conn.id().to_string();
    eventually("client connection removal", || alice.manager().get_connection(&id).is_none()).await;
    eventually("broker connection removal", || broker.manager().connection_count() == 0).await;

    alice.close("done").await;
    broker.close("done").await;
}

#[tokio::test]
async fn broker_drops_connection_a_peer_no_longer_knows() {
    init_tracing();
    let broker = start_broker_checking(CHECK_INTERVAL).await;
    let alice = start_client(client_config(&broker, "alice")).await;
    let bob = start_client(client_config(&broker, "bob")).await;
    let mut accepted = echo_peer(&bob).await;

    let conn = timeout(TEST_TIMEOUT, alice.connect_peer_by_id("bob", ConnectionMode::P2p))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let _remote = timeout(TEST_TIMEOUT, accepted.recv()).await.expect("accept timed out").expect("handler dropped");
    assert!(broker.manager().get_connection(conn.id()).is_some());

    // Only the peers learn of this close; the broker notices on its next liveness check.
    conn.close("done").await;
    eventually("broker connection removal", || broker.manager().connection_count() == 0).await;
    assert!(alice.client().is_connected());
    assert!(bob.client().is_connected());

    alice.close("done").await;
    bob.close("done").await;
    broker.close("done").await;
}

// ============================================================================
// Relayed connections
// ============================================================================

#[tokio::test]
async fn relay_connection_splices_bytes_both_ways() {
    init_tracing();
    let start = Instant::now();
    let broker = start_broker().await;
    let relay = start_relay(&broker).await;
    assert_eq!(broker.manager().relay_servers(), vec![relay.local_addr().to_string()]);
    progress(start, "relay registered");

    // Alice asks the broker for relays; bob learns the relay from the request.
    let alice = start_client(client_config(&broker, "alice")).await;
    let bob = start_client(client_config(&broker, "bob")).await;
    let mut accepted = echo_peer(&bob).await;

    let conn = timeout(TEST_TIMEOUT, alice.connect_peer_by_id("bob", ConnectionMode::Relay))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    assert_eq!(conn.mode(), ConnectionMode::Relay);
    assert_eq!(conn.relay_addr(), Some(relay.local_addr()));
    let remote = timeout(TEST_TIMEOUT, accepted.recv()).await.expect("accept timed out").expect("handler dropped");
    assert_eq!(remote.mode(), ConnectionMode::Relay);
    assert_eq!(relay.connection_count(), 1);
    progress(start, "relay connection established");

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let echoed = roundtrip_stream(&conn, &payload).await;
    let mut expected = payload.clone();
    expected.reverse();
    assert_eq!(echoed, expected, "bytes must cross the relay unmodified");
    progress(start, "relay splice verified");

    alice.close("done").await;
    bob.close("done").await;
    relay.close("done").await;
    broker.close("done").await;
}

#[tokio::test]
async fn relay_rejects_unknown_connection() {
    init_tracing();
    let broker = start_broker().await;
    let relay = start_relay(&broker).await;

    let config = RegistryClientConfig {
        tag: "intruder".to_string(),
        server_addr: relay.local_addr(),
        connect_tries: 1,
        reconnect_tries: 1,
        token: "mallory".to_string(),
        data: metadata([(KEY_CONNECTION_ID, "no-such-connection")]),
        unmarshaler: None,
    };
    let intruder = RegistryClient::new(config).await.expect("client bind failed");
    let result = timeout(TEST_TIMEOUT, intruder.connect()).await.expect("connect timed out");
    assert!(result.is_err(), "relay must not admit a peer without a broker connection");
    assert_eq!(relay.connection_count(), 0);

    relay.close("done").await;
    broker.close("done").await;
}

#[tokio::test]
async fn relay_closes_when_broker_goes_away() {
    init_tracing();
    let broker = start_broker().await;
    let relay = start_relay(&broker).await;

    broker.close("shutdown").await;
    timeout(DISCONNECT_TIMEOUT, relay.exited().wait()).await.expect("relay did not close");
    assert!(relay.is_closed());
}

#[tokio::test]
async fn relay_drops_connection_the_broker_forgot() {
    init_tracing();
    let broker = start_broker().await;
    let relay = start_relay_checking(&broker, CHECK_INTERVAL).await;
    let alice = start_client(client_config(&broker, "alice")).await;
    let bob = start_client(client_config(&broker, "bob")).await;
    let mut accepted = echo_peer(&bob).await;

    let conn = timeout(TEST_TIMEOUT, alice.connect_peer_by_id("bob", ConnectionMode::Relay))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let remote = timeout(TEST_TIMEOUT, accepted.recv()).await.expect("accept timed out").expect("handler dropped");
    assert_eq!(relay.connection_count(), 1);

    broker.manager().close_connection(conn.id(), "forgotten");

    eventually("relay connection removal", || relay.connection_count() == 0).await;
    timeout(DISCONNECT_TIMEOUT, conn.exited().wait()).await.expect("initiator connection did not close");
    timeout(DISCONNECT_TIMEOUT, remote.exited().wait()).await.expect("acceptor connection did not close");

    alice.close("done").await;
    bob.close("done").await;
    relay.close("done").await;
    broker.close("done").await;
}
