use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Result};
use tracing::{debug, warn};

use super::Connection;
use crate::message::Message;
use crate::stream::Stream;
use crate::util::{spawn_supervised, BoxFuture};

/// Handler for messages read from a [`MessageStream`].
pub type StreamMessageHandler = Arc<dyn Fn(Arc<MessageStream>, Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a [`StreamMessageHandler`].
pub fn stream_message_handler<F, Fut>(f: F) -> StreamMessageHandler
where
    F: Fn(Arc<MessageStream>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |stream, msg| Box::pin(f(stream, msg)))
}

/// A stream on a [`Connection`] that carries framed messages instead of raw
/// bytes.
pub struct MessageStream {
    me: Weak<MessageStream>,
    conn: Arc<Connection>,
    stream: Arc<Stream>,
    listening: AtomicBool,
    closed: AtomicBool,
}

impl MessageStream {
    pub(crate) fn new(conn: Arc<Connection>, stream: Arc<Stream>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            conn,
            stream,
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.stream.is_closed()
    }

    /// Starts the read loop. Each message runs `handler` in its own task; a
    /// read error closes the stream.
    pub fn listen(&self, handler: StreamMessageHandler) -> Result<()> {
        if self.is_closed() {
            bail!("message stream closed");
        }
        if self.listening.swap(true, Ordering::AcqRel) {
            bail!("message stream already listening");
        }
        let me = self.me.upgrade().ok_or_else(|| anyhow!("message stream dropped"))?;
        let faulted = Arc::clone(&me);

        let task = async move {
            loop {
                let msg = match me.stream.channel().read(true).await {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(conn = %me.conn.id(), stream = %me.stream.id(), error = %e, "message stream read ended");
                        me.close().await;
                        return;
                    }
                };
                tokio::spawn(handler(Arc::clone(&me), msg));
            }
        };
        spawn_supervised("message-stream", task, move || {
            tokio::spawn(async move { faulted.close().await });
        });
        Ok(())
    }

    /// Sends a message; returns the reply when it requests an ack.
    pub async fn send(&self, msg: Message) -> Result<Option<Message>> {
        Ok(self.stream.channel().send(msg).await?)
    }

    /// Sends and reads the reply without a listening loop.
    pub async fn send_and_read(&self, msg: Message) -> Result<Option<Message>> {
        Ok(self.stream.channel().send_and_read(msg).await?)
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stream.close().await;
        warn!(conn = %self.conn.id(), stream = %self.stream.id(), "message stream closed");
    }
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("conn", &self.conn.id())
            .field("stream", &self.stream.id())
            .finish()
    }
}
