//! # Channel
//!
//! Framing and acknowledgement correlation over one bidirectional stream.
//!
//! - Reads are serialized: only one reader holds the receive half at a time.
//! - Writes are serialized per frame so concurrent senders never interleave.
//! - A sender that requests an ack registers a single-slot waiter keyed by the
//!   message id before its frame is written. The reader that sees the matching
//!   `AckReply` removes the waiter and fulfils it, so a reply is delivered at
//!   most once. Duplicate replies find no waiter and are dropped.
//! - Closing the channel fails every pending waiter with
//!   [`ChannelError::Closed`] and wakes a blocked reader.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, trace};

use crate::error::ChannelError;
use crate::message::{encode_frame, read_frame, Message};
use crate::model::UnmarshalChain;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

type AckSlot = oneshot::Sender<Result<Message, ChannelError>>;

/// How long `close` waits for an in-flight write before leaving the stream
/// shutdown to that writer.
const WRITER_CLOSE_WAIT: Duration = Duration::from_secs(1);

pub struct Channel {
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    acks: DashMap<String, AckSlot>,
    decoders: UnmarshalChain,
    broken: AtomicBool,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl Channel {
    pub fn new<R, W>(reader: R, writer: W, decoders: UnmarshalChain) -> Arc<Self>
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            reader: Mutex::new(Box::pin(reader)),
            writer: Mutex::new(Box::pin(writer)),
            acks: DashMap::new(),
            decoders,
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closed_tx,
        })
    }

    /// Wraps an opened or accepted QUIC bidirectional stream.
    pub fn from_quic(
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        decoders: UnmarshalChain,
    ) -> Arc<Self> {
        Self::new(recv, send, decoders)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    /// Reads the next message.
    ///
    /// Acknowledgement replies are routed to their waiters. With `multiple`
    /// set, the reader keeps going after a reply and only returns a non-reply
    /// frame; otherwise it returns after the first frame of any kind.
    pub async fn read(&self, multiple: bool) -> Result<Message, ChannelError> {
        let mut reader = self.reader.lock().await;
        let mut closed = self.closed_tx.subscribe();

        loop {
            if *closed.borrow_and_update() {
                return Err(ChannelError::Closed);
            }
            let msg = tokio::select! {
                _ = closed.changed() => continue,
                frame = read_frame(&mut *reader, &self.decoders) => frame?,
            };
            debug!(id = %msg.ctx.id, msg_type = %msg.ctx.msg_type, ack = msg.ctx.needs_ack, "<- message");

            if !msg.ctx.is_ack_reply {
                return Ok(msg);
            }
            if multiple {
                self.deliver(msg);
                continue;
            }
            self.deliver(msg.clone());
            return Ok(msg);
        }
    }

    fn deliver(&self, msg: Message) {
        match self.acks.remove(&msg.ctx.id) {
            Some((_, slot)) => {
                let _ = slot.send(Ok(msg));
            }
            None => trace!(id = %msg.ctx.id, "dropping reply without a waiter"),
        }
    }

    /// Writes a message. When the message requests an ack, waits for the
    /// correlated reply or the message timeout, whichever comes first.
    pub async fn send(&self, mut msg: Message) -> Result<Option<Message>, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        if self.broken.load(Ordering::Acquire) {
            return Err(ChannelError::Broken);
        }
        msg.ensure_id();
        let id = msg.ctx.id.clone();

        let waiter = if msg.ctx.needs_ack {
            let (tx, rx) = oneshot::channel();
            self.acks.insert(id.clone(), tx);
            // close() may have drained the map between the check above and the insert.
            if self.is_closed() {
                self.acks.remove(&id);
                return Err(ChannelError::Closed);
            }
            Some(rx)
        } else {
            None
        };

        if let Err(e) = self.write(&msg).await {
            self.acks.remove(&id);
            return Err(e);
        }
        debug!(id = %id, msg_type = %msg.ctx.msg_type, ack = msg.ctx.needs_ack, "-> message");

        let Some(rx) = waiter else {
            return Ok(None);
        };
        match tokio::time::timeout(msg.opts.timeout, rx).await {
            Ok(Ok(reply)) => reply.map(Some),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.acks.remove(&id);
                Err(ChannelError::Timeout)
            }
        }
    }

    /// Sends a message that needs an ack and returns its reply.
    pub async fn request(&self, msg: Message) -> Result<Message, ChannelError> {
        if !msg.ctx.needs_ack {
            return Err(ChannelError::NotAckRequest);
        }
        self.send(msg).await?.ok_or(ChannelError::Closed)
    }

    /// Starts a single background read and then sends.
    ///
    /// Only valid while no other reader is active on this channel: the
    /// background read consumes exactly one frame, which must be the reply.
    pub async fn send_and_read(self: &Arc<Self>, msg: Message) -> Result<Option<Message>, ChannelError> {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = channel.read(false).await {
                trace!(error = %e, "background read ended");
            }
        });
        self.send(msg).await
    }

    async fn write(&self, msg: &Message) -> Result<(), ChannelError> {
        let frame = encode_frame(msg)?;
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            self.broken.store(true, Ordering::Release);
            return Err(e.into());
        }
        self.finish_if_closed(&mut writer).await;
        Ok(())
    }

    /// A close that ran while this writer held the lock left the shutdown to
    /// us.
    async fn finish_if_closed(&self, writer: &mut BoxedWriter) {
        if self.is_closed() {
            let _ = writer.shutdown().await;
        }
    }

    /// Reads raw bytes, bypassing framing. Returns 0 at end of stream.
    pub async fn read_raw(&self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        let mut reader = self.reader.lock().await;
        let mut closed = self.closed_tx.subscribe();
        if *closed.borrow_and_update() {
            return Err(ChannelError::Closed);
        }
        tokio::select! {
            _ = closed.changed() => Err(ChannelError::Closed),
            n = reader.read(buf) => Ok(n?),
        }
    }

    /// Writes raw bytes, bypassing framing.
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        self.finish_if_closed(&mut writer).await;
        Ok(())
    }

    /// Finishes the send half; the peer reads end of stream.
    pub async fn finish(&self) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    /// Copies everything readable from this channel into `dst` until end of
    /// stream or until either channel closes, then finishes `dst`.
    pub async fn pipe_to(&self, dst: &Channel) -> Result<u64, ChannelError> {
        let mut reader = self.reader.lock().await;
        let mut writer = dst.writer.lock().await;
        let mut src_closed = self.closed_tx.subscribe();
        let mut dst_closed = dst.closed_tx.subscribe();
        if *src_closed.borrow_and_update() || *dst_closed.borrow_and_update() {
            return Err(ChannelError::Closed);
        }

        let copied = tokio::select! {
            _ = src_closed.changed() => return Err(ChannelError::Closed),
            _ = dst_closed.changed() => return Err(ChannelError::Closed),
            copied = tokio::io::copy(&mut *reader, &mut *writer) => copied?,
        };
        let _ = writer.shutdown().await;
        Ok(copied)
    }

    /// Fails all waiters, wakes any reader and finishes the send half.
    /// Repeated calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed_tx.send_replace(true);

        let ids: Vec<String> = self.acks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, slot)) = self.acks.remove(&id) {
                let _ = slot.send(Err(ChannelError::Closed));
            }
        }

        // An in-flight write that outlasts the wait shuts the stream down
        // itself once it completes.
        match tokio::time::timeout(WRITER_CLOSE_WAIT, self.writer.lock()).await {
            Ok(mut writer) => {
                let _ = writer.shutdown().await;
            }
            Err(_) => debug!("writer busy at close, shutdown deferred to it"),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("pending_acks", &self.acks.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
