use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use xnet::message::Message;
use xnet::model::{metadata, P2pData, P2P_DATA};
use xnet::p2p::manager::{connection_handler, message_stream_handler, peer_stream_handler};
use xnet::p2p::message_stream::stream_message_handler;
use xnet::transport::resolve;
use xnet::{
    BrokerClient, BrokerClientConfig, BrokerServer, BrokerServerConfig, Connection, ConnectionMode,
    IdentityTokenValidator, P2pConfig, RelayServer, RelayServerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "xnet")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a broker that registers clients and matches connection requests.
    Broker {
        #[arg(short, long, default_value = "0.0.0.0:10000")]
        bind: SocketAddr,

        /// Accept only these tokens. Any non-empty token when omitted.
        #[arg(short, long = "allow", value_name = "TOKEN")]
        allow: Vec<String>,
    },
    /// Run a relay that registers with a broker and splices peer streams.
    Relay {
        #[arg(short, long, default_value = "0.0.0.0:10001")]
        bind: SocketAddr,

        #[arg(short = 'B', long, default_value = "127.0.0.1:10000")]
        broker: String,

        #[arg(short, long)]
        token: String,
    },
    /// Register with a broker and optionally connect to a peer.
    Client {
        #[arg(short = 'B', long, default_value = "127.0.0.1:10000")]
        broker: String,

        #[arg(short, long)]
        token: String,

        #[arg(long)]
        id: Option<String>,

        #[arg(long = "tags", value_delimiter = ',')]
        tags: Vec<String>,

        /// Peer id to connect to.
        #[arg(short, long, conflicts_with = "tag")]
        connect: Option<String>,

        /// Connect to a random peer carrying this tag.
        #[arg(long)]
        tag: Option<String>,

        #[arg(short, long, default_value = "p2p")]
        mode: ConnectionMode,

        /// Fixed relay `host:port` instead of asking the broker.
        #[arg(long)]
        relay: Option<String>,

        /// Advertised local IPs for direct connections.
        #[arg(long = "local-ip", value_name = "IP")]
        local_ips: Vec<IpAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Broker { bind, allow } => run_broker(bind, allow).await,
        Command::Relay { bind, broker, token } => run_relay(bind, &broker, token).await,
        Command::Client { broker, token, id, tags, connect, tag, mode, relay, local_ips } => {
            let config = BrokerClientConfig {
                server_addr: resolve(&broker).await.context("invalid broker address")?,
                token,
                id,
                tags,
                p2p: P2pConfig { relay_addr: relay, local_ips },
                ..BrokerClientConfig::default()
            };
            run_client(config, connect, tag, mode).await
        }
    }
}

async fn run_broker(bind: SocketAddr, allow: Vec<String>) -> Result<()> {
    let validator = if allow.is_empty() {
        IdentityTokenValidator::new()
    } else {
        IdentityTokenValidator::with_allowed(allow)
    };
    let broker = BrokerServer::new(BrokerServerConfig { addr: bind, ..BrokerServerConfig::default() }, Arc::new(validator))
        .await?;
    broker.listen()?;

    let exited = broker.exited();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal, exiting gracefully"),
        _ = exited.wait() => warn!("broker exited"),
    }
    broker.close("Shutdown").await;
    Ok(())
}

async fn run_relay(bind: SocketAddr, broker: &str, token: String) -> Result<()> {
    let config = RelayServerConfig {
        addr: bind,
        broker_addr: resolve(broker).await.context("invalid broker address")?,
        broker_token: token,
        ..RelayServerConfig::default()
    };
    let relay = RelayServer::new(config).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, exiting gracefully");
            relay.close("Shutdown").await;
            return Ok(());
        }
        listened = relay.listen() => listened?,
    }

    let exited = relay.exited();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal, exiting gracefully"),
        _ = exited.wait() => warn!("relay exited"),
    }
    relay.close("Shutdown").await;
    Ok(())
}

async fn run_client(
    config: BrokerClientConfig,
    connect: Option<String>,
    tag: Option<String>,
    mode: ConnectionMode,
) -> Result<()> {
    let client = BrokerClient::new(config).await?;

    client
        .set_connection_handler(connection_handler(|conn| async move {
            info!(conn = %conn.id(), peer = %conn.peer().id, mode = %conn.mode(), "accepted connection");
        }))
        .await;
    client
        .set_stream_handler(peer_stream_handler(|conn, stream| async move {
            match stream.read_to_end().await {
                Ok(bytes) => info!(conn = %conn.id(), bytes = bytes.len(), "received stream"),
                Err(e) => warn!(conn = %conn.id(), error = %e, "stream read failed"),
            }
            stream.close().await;
        }))
        .await;
    client
        .set_message_stream_handler(message_stream_handler(|stream| async move {
            let listened = stream.listen(stream_message_handler(|stream, msg| async move {
                if let Ok(data) = msg.body::<P2pData>() {
                    info!(
                        conn = %stream.connection().id(),
                        text = %String::from_utf8_lossy(&data.data),
                        "received message"
                    );
                }
            }));
            if let Err(e) = listened {
                warn!(error = %e, "message stream listen failed");
            }
        }))
        .await;

    client.connect().await?;

    let target = match (connect, tag) {
        (Some(id), _) => Some(client.connect_peer_by_id(&id, mode).await),
        (None, Some(tag)) => Some(client.connect_peer_by_tag(&tag, mode).await),
        (None, None) => None,
    };
    if let Some(result) = target {
        match result {
            Ok(conn) => greet(&client, &conn).await,
            Err(e) => warn!(error = %e, "connection failed"),
        }
    }

    let exited = client.exited();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal, exiting gracefully"),
        _ = exited.wait() => warn!("broker session exited"),
    }
    client.close("Shutdown").await;
    Ok(())
}

async fn greet(client: &BrokerClient, conn: &Arc<Connection>) {
    info!(conn = %conn.id(), peer = %conn.peer().id, mode = %conn.mode(), "connected");
    let text = format!("hello from {}", client.id());
    let sent = async {
        let stream = conn.open_message_stream(metadata([("purpose", "greeting")])).await?;
        stream.send(Message::new(P2P_DATA, P2pData { data: text.into_bytes() })).await?;
        anyhow::Ok(())
    };
    if let Err(e) = sent.await {
        warn!(conn = %conn.id(), error = %e, "greeting failed");
    }
}
