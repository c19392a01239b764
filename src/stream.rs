//! # Streams
//!
//! A [`Stream`] is an extra bidirectional QUIC stream on an established
//! registry session. The opener announces it with a
//! `network-stream-conn-data` request carrying a fresh id and metadata; the
//! acceptor registers it under that id before confirming with
//! `network-stream-conn-status`. After the handshake the stream carries either
//! raw bytes or framed messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::channel::Channel;
use crate::message::{new_message_id, Message, CONNECTION_TIMEOUT};
use crate::model::{
    Metadata, StreamConnectionData, StreamConnectionStatus, UnmarshalChain, STREAM_CONNECTION_DATA,
    STREAM_CONNECTION_STATUS,
};
use crate::util::{BoxFuture, ExitSignal};

pub struct Stream {
    id: String,
    data: Metadata,
    channel: Arc<Channel>,
    closed: AtomicBool,
    exit: ExitSignal,
}

impl Stream {
    /// Opens a stream on `connection` and waits for the remote side to
    /// register it.
    pub async fn open(connection: &quinn::Connection, data: Metadata, decoders: UnmarshalChain) -> Result<Arc<Self>> {
        let (send, recv) = tokio::time::timeout(CONNECTION_TIMEOUT, connection.open_bi())
            .await
            .map_err(|_| anyhow!("timed out opening stream"))?
            .context("failed to open stream")?;
        let channel = Channel::from_quic(send, recv, decoders);

        let id = new_message_id();
        let request = Message::with_ack(
            STREAM_CONNECTION_DATA,
            StreamConnectionData { id: id.clone(), data: data.clone() },
            CONNECTION_TIMEOUT,
        );
        let result = async {
            let reply = channel
                .send_and_read(request)
                .await?
                .ok_or_else(|| anyhow!("stream handshake got no reply"))?;
            let status = reply.body::<StreamConnectionStatus>()?;
            if !status.status {
                bail!("stream rejected: {}", status.message);
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Err(e) = result {
            channel.close().await;
            return Err(e);
        }
        debug!(stream = %id, "stream opened");
        Ok(Arc::new(Self::new(id, data, channel)))
    }

    /// Accepts the handshake on an inbound stream. `register` runs before the
    /// opener is told the stream exists.
    pub async fn accept<F>(
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        decoders: UnmarshalChain,
        register: F,
    ) -> Result<Arc<Self>>
    where
        F: FnOnce(Arc<Stream>),
    {
        let channel = Channel::from_quic(send, recv, decoders);
        let first = match tokio::time::timeout(CONNECTION_TIMEOUT, channel.read(false)).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                channel.close().await;
                return Err(anyhow!(e).context("failed to read stream handshake"));
            }
            Err(_) => {
                channel.close().await;
                bail!("timed out waiting for stream handshake");
            }
        };

        let request = match first.body::<StreamConnectionData>() {
            Ok(request) if first.msg_type() == STREAM_CONNECTION_DATA => request.clone(),
            _ => {
                channel.close().await;
                bail!("unexpected stream handshake message ({})", first.msg_type());
            }
        };

        let stream = Arc::new(Self::new(request.id.clone(), request.data, Arc::clone(&channel)));
        register(Arc::clone(&stream));

        let reply = first.reply(
            STREAM_CONNECTION_STATUS,
            StreamConnectionStatus { id: request.id, status: true, message: "Ok".into() },
        )?;
        if let Err(e) = channel.send(reply).await {
            stream.close().await;
            return Err(anyhow!(e).context("failed to confirm stream"));
        }
        debug!(stream = %stream.id, "stream accepted");
        Ok(stream)
    }

    fn new(id: String, data: Metadata, channel: Arc<Channel>) -> Self {
        Self { id, data, channel, closed: AtomicBool::new(false), exit: ExitSignal::new() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &Metadata {
        &self.data
    }

    /// Metadata value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn exited(&self) -> ExitSignal {
        self.exit.clone()
    }

    /// Reads raw bytes. Returns 0 at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.channel.read_raw(buf).await?)
    }

    /// Reads raw bytes until end of stream.
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    pub async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        Ok(self.channel.write_raw(bytes).await?)
    }

    /// Signals end of stream to the remote reader.
    pub async fn finish(&self) -> Result<()> {
        Ok(self.channel.finish().await?)
    }

    /// Copies this stream's inbound bytes into `dst` until end of stream.
    pub async fn pipe_to(&self, dst: &Stream) -> Result<u64> {
        Ok(self.channel.pipe_to(&dst.channel).await?)
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channel.close().await;
        self.exit.fire();
        debug!(stream = %self.id, "stream closed");
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).field("data", &self.data).finish()
    }
}

// ============================================================================
// Session handles
// ============================================================================

/// Either end of a registry session: the server-side view of a client, or
/// the client's own connection to a server.
#[async_trait]
pub trait ClientHandle: Send + Sync {
    /// Registered id of the remote (server side) or local (client side) peer.
    fn id(&self) -> String;

    async fn send(&self, msg: Message) -> Result<Option<Message>>;

    async fn request(&self, msg: Message) -> Result<Message> {
        self.send(msg).await?.ok_or_else(|| anyhow!("request got no reply"))
    }

    async fn open_stream(&self, data: Metadata) -> Result<Arc<Stream>>;

    async fn close_stream(&self, id: &str);

    async fn close(&self, code: u32, reason: &str);

    fn exited(&self) -> ExitSignal;
}

/// Callback for a stream accepted on a session.
pub type StreamHandler = Arc<dyn Fn(Arc<dyn ClientHandle>, Arc<Stream>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a [`StreamHandler`].
pub fn stream_handler<F, Fut>(f: F) -> StreamHandler
where
    F: Fn(Arc<dyn ClientHandle>, Arc<Stream>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |from, stream| Box::pin(f(from, stream)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::QuicEndpoint;

    async fn session_pair() -> (quinn::Connection, quinn::Connection) {
        let server = QuicEndpoint::bind("127.0.0.1:0".parse().unwrap(), true).await.expect("bind failed");
        let client = QuicEndpoint::bind("127.0.0.1:0".parse().unwrap(), false).await.expect("bind failed");
        let addr = server.local_addr();
        let accept = tokio::spawn(async move { server.accept().await.unwrap().await.unwrap() });
        let dialed = client.dial(addr).await.expect("dial failed");
        (dialed, accept.await.unwrap())
    }

    #[tokio::test]
    async fn opened_stream_is_registered_before_reply() {
        let (dialed, accepted) = session_pair().await;

        let registry = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let seen = registry.clone();
        let acceptor = tokio::spawn(async move {
            let (send, recv) = accepted.accept_bi().await.unwrap();
            let stream = Stream::accept(send, recv, UnmarshalChain::default(), |s| {
                seen.lock().unwrap().push(s.id().to_string());
            })
            .await
            .unwrap();
            let bytes = stream.read_to_end().await.unwrap();
            (stream, bytes)
        });

        let mut data = Metadata::new();
        data.insert("purpose".into(), "test".into());
        let stream = Stream::open(&dialed, data, UnmarshalChain::default()).await.unwrap();
        assert_eq!(registry.lock().unwrap().as_slice(), [stream.id().to_string()]);

        stream.write_all(b"hello").await.unwrap();
        stream.finish().await.unwrap();

        let (remote, bytes) = acceptor.await.unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(remote.id(), stream.id());
        assert_eq!(remote.get("purpose"), Some("test"));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fires_exit() {
        let (dialed, accepted) = session_pair().await;
        tokio::spawn(async move {
            let (send, recv) = accepted.accept_bi().await.unwrap();
            let _ = Stream::accept(send, recv, UnmarshalChain::default(), |_| {}).await;
            std::future::pending::<()>().await;
        });

        let stream = Stream::open(&dialed, Metadata::new(), UnmarshalChain::default()).await.unwrap();
        let exited = stream.exited();
        stream.close().await;
        stream.close().await;
        assert!(stream.is_closed());
        assert!(exited.is_fired());
    }
}
