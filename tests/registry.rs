//! Integration tests for the registry server and client.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test registry -- --nocapture

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use xnet::client::client_message_handler;
use xnet::message::Message;
use xnet::model::{metadata, ClientData, ClientSearch, ClientValidateData, P2pData, P2P_DATA};
use xnet::server::{client_hook, message_handler};
use xnet::stream::stream_handler;
use xnet::{ClientValidator, RegistryClient, RegistryClientConfig, RegistryServer, RegistryServerConfig};

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

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Token `name:tag` registers as `name` tagged `tag`; `deny` is refused.
struct NameTagValidator;

#[async_trait]
impl ClientValidator for NameTagValidator {
    async fn validate(&self, addr: SocketAddr, request: &ClientValidateData) -> Result<ClientData> {
        if request.token == "deny" {
            bail!("denied");
        }
        let (id, tag) = request.token.split_once(':').unwrap_or((request.token.as_str(), ""));
        Ok(ClientData {
            id: id.to_string(),
            address: addr.to_string(),
            tags: metadata([(tag, "")]),
            ..ClientData::default()
        })
    }
}

async fn start_server() -> Arc<RegistryServer> {
    let config = RegistryServerConfig {
        tag: "test".to_string(),
        addr: "127.0.0.1:0".parse().unwrap(),
        unmarshaler: None,
    };
    let server = RegistryServer::new(config, Arc::new(NameTagValidator)).await.expect("bind failed");
    server.listen().expect("listen failed");
    server
}

async fn client_for(server: &RegistryServer, token: &str) -> Arc<RegistryClient> {
    let config = RegistryClientConfig {
        server_addr: server.local_addr(),
        connect_tries: 1,
        reconnect_tries: 1,
        token: token.to_string(),
        ..RegistryClientConfig::default()
    };
    RegistryClient::new(config).await.expect("client bind failed")
}

#[tokio::test]
async fn client_registers_and_is_searchable() {
    init_tracing();
    let server = start_server().await;

    let alice = client_for(&server, "alice:red").await;
    timeout(TEST_TIMEOUT, alice.connect()).await.expect("connect timed out").expect("connect failed");
    let bob = client_for(&server, "bob:red").await;
    timeout(TEST_TIMEOUT, bob.connect()).await.expect("connect timed out").expect("connect failed");

    assert_eq!(alice.id(), "alice");
    assert_eq!(server.client_count(), 2);
    assert!(server.get_client("bob").is_ok());

    let by_id = alice
        .search_clients(ClientSearch { id: "bob".into(), tag: String::new() })
        .await
        .expect("search failed");
    assert_eq!(by_id, vec!["bob".to_string()]);

    let mut by_tag = alice
        .search_clients(ClientSearch { id: String::new(), tag: "red".into() })
        .await
        .expect("search failed");
    by_tag.sort();
    assert_eq!(by_tag, vec!["alice".to_string(), "bob".to_string()]);

    assert!(alice.search_clients(ClientSearch { id: String::new(), tag: "blue".into() }).await.is_err());
    assert!(alice.search_clients(ClientSearch { id: "carol".into(), tag: String::new() }).await.is_err());

    alice.close(0, "done").await;
    bob.close(0, "done").await;
    server.close(0, "done").await;
}

#[tokio::test]
async fn rejected_token_fails_connect() {
    init_tracing();
    let server = start_server().await;

    let client = client_for(&server, "deny").await;
    let result = timeout(TEST_TIMEOUT, client.connect()).await.expect("connect timed out");
    assert!(result.is_err(), "denied token must not register");
    assert!(client.is_closed());
    assert_eq!(server.client_count(), 0);

    server.close(0, "done").await;
}

#[tokio::test]
async fn empty_token_is_refused_up_front() {
    let config = RegistryClientConfig { token: String::new(), ..RegistryClientConfig::default() };
    assert!(RegistryClient::new(config).await.is_err());
}

#[tokio::test]
async fn messages_flow_both_ways_with_replies() {
    init_tracing();
    let server = start_server().await;
    server
        .register_handler(
            P2P_DATA,
            message_handler(|client, msg| async move {
                let mut echoed = msg.body::<P2pData>().map(|d| d.data.clone()).unwrap_or_default();
                echoed.reverse();
                if let Ok(reply) = msg.reply(P2P_DATA, P2pData { data: echoed }) {
                    let _ = client.send(reply).await;
                }
            }),
        )
        .expect("register failed");

    let client = client_for(&server, "alice:red").await;
    let (tx, mut rx) = mpsc::channel(1);
    client
        .register_handler(
            P2P_DATA,
            client_message_handler(move |_, msg| {
                let tx = tx.clone();
                async move {
                    let data = msg.body::<P2pData>().map(|d| d.data.clone()).unwrap_or_default();
                    let _ = tx.send(data).await;
                }
            }),
        )
        .expect("register failed");
    timeout(TEST_TIMEOUT, client.connect()).await.expect("connect timed out").expect("connect failed");

    let reply = client
        .send(Message::with_ack(P2P_DATA, P2pData { data: b"abc".to_vec() }, TEST_TIMEOUT))
        .await
        .expect("send failed")
        .expect("reply expected");
    assert_eq!(reply.body::<P2pData>().expect("wrong body").data, b"cba".to_vec());

    let session = server.get_client("alice").expect("client registered");
    session.send(Message::new(P2P_DATA, P2pData { data: b"push".to_vec() })).await.expect("push failed");
    let pushed = timeout(TEST_TIMEOUT, rx.recv()).await.expect("push timed out").expect("handler dropped");
    assert_eq!(pushed, b"push".to_vec());

    client.close(0, "done").await;
    server.close(0, "done").await;
}

#[tokio::test]
async fn server_opened_stream_reaches_client() {
    init_tracing();
    let server = start_server().await;
    let client = client_for(&server, "alice:red").await;
    let (tx, mut rx) = mpsc::channel(1);
    client
        .set_stream_handler(stream_handler(move |_, stream| {
            let tx = tx.clone();
            async move {
                let bytes = stream.read_to_end().await.unwrap_or_default();
                let _ = tx.send((stream.get("kind").map(str::to_string), bytes)).await;
            }
        }))
        .await;
    timeout(TEST_TIMEOUT, client.connect()).await.expect("connect timed out").expect("connect failed");

    let session = server.get_client("alice").expect("client registered");
    let stream = session.open_stream(metadata([("kind", "blob")])).await.expect("open failed");
    stream.write_all(b"payload").await.expect("write failed");
    stream.finish().await.expect("finish failed");

    let (kind, bytes) = timeout(TEST_TIMEOUT, rx.recv()).await.expect("stream timed out").expect("handler dropped");
    assert_eq!(kind.as_deref(), Some("blob"));
    assert_eq!(bytes, b"payload".to_vec());

    client.close(0, "done").await;
    server.close(0, "done").await;
}

#[tokio::test]
async fn hooks_fire_and_duplicate_id_replaces_session() {
    init_tracing();
    let server = start_server().await;
    let (conn_tx, mut connected) = mpsc::unbounded_channel();
    let (disc_tx, mut disconnected) = mpsc::unbounded_channel();
    server
        .set_connected_hook(client_hook(move |client| {
            let tx = conn_tx.clone();
            async move {
                let _ = tx.send(client.session_id().to_string());
            }
        }))
        .await;
    server
        .set_disconnected_hook(client_hook(move |client| {
            let tx = disc_tx.clone();
            async move {
                let _ = tx.send(client.session_id().to_string());
            }
        }))
        .await;

    let first = client_for(&server, "alice:red").await;
    timeout(TEST_TIMEOUT, first.connect()).await.expect("connect timed out").expect("connect failed");
    let first_session = timeout(TEST_TIMEOUT, connected.recv()).await.expect("hook timed out").expect("hook dropped");

    let second = client_for(&server, "alice:red").await;
    timeout(TEST_TIMEOUT, second.connect()).await.expect("connect timed out").expect("connect failed");
    let second_session = timeout(TEST_TIMEOUT, connected.recv()).await.expect("hook timed out").expect("hook dropped");
    assert_ne!(first_session, second_session);

    let gone = timeout(TEST_TIMEOUT, disconnected.recv()).await.expect("hook timed out").expect("hook dropped");
    assert_eq!(gone, first_session, "the replaced session is the one closed");
    assert_eq!(server.client_count(), 1);

    first.close(0, "done").await;
    second.close(0, "done").await;
    server.close(0, "done").await;
}
