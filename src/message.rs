//! # Messages and Framing
//!
//! A [`Message`] is the typed envelope exchanged over a channel. On the wire
//! each message is one frame:
//!
//! ```text
//! [u32 BE header length N][N bytes header][content_length bytes body]
//! ```
//!
//! The header carries the frame kind, the message id, the content-type tag
//! and the body length. A message that needs an acknowledgement is sent as
//! `Ack`; its reply reuses the id and is sent as `AckReply`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::error::ChannelError;
use crate::model::{self, Body, ModelBody, UnmarshalChain, MAX_BODY_SIZE, MAX_HEADER_SIZE};

/// Default time a request waits for its acknowledgement reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed to establish a QUIC session or open a stream.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of the header length prefix.
pub const HEADER_PREFIX_SIZE: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    Normal,
    Ack,
    AckReply,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub id: String,
    pub content_type: String,
    pub content_length: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageContext {
    pub id: String,
    pub needs_ack: bool,
    pub is_ack_reply: bool,
    pub msg_type: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageOptions {
    pub timeout: Duration,
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self { timeout: REQUEST_TIMEOUT }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub ctx: MessageContext,
    pub opts: MessageOptions,
    pub body: Body,
}

impl Message {
    /// Fire-and-forget message.
    pub fn new(msg_type: &str, body: impl Into<Body>) -> Self {
        Self {
            ctx: MessageContext {
                id: new_message_id(),
                needs_ack: false,
                is_ack_reply: false,
                msg_type: msg_type.to_string(),
            },
            opts: MessageOptions::default(),
            body: body.into(),
        }
    }

    /// Message whose sender waits for a reply. A zero timeout selects
    /// [`REQUEST_TIMEOUT`].
    pub fn with_ack(msg_type: &str, body: impl Into<Body>, timeout: Duration) -> Self {
        let mut msg = Self::new(msg_type, body);
        msg.ctx.needs_ack = true;
        if !timeout.is_zero() {
            msg.opts.timeout = timeout;
        }
        msg
    }

    /// Builds the reply correlated with this request.
    pub fn reply(&self, msg_type: &str, body: impl Into<Body>) -> Result<Message, ChannelError> {
        if !self.ctx.needs_ack {
            return Err(ChannelError::NotAckRequest);
        }
        let mut reply = Self::new(msg_type, body);
        reply.ctx.id = self.ctx.id.clone();
        reply.ctx.is_ack_reply = true;
        Ok(reply)
    }

    pub fn msg_type(&self) -> &str {
        &self.ctx.msg_type
    }

    /// Borrows the body as model type `T`.
    pub fn body<T: ModelBody>(&self) -> Result<&T, ChannelError> {
        T::from_body(&self.body).ok_or_else(|| ChannelError::UnexpectedBody {
            expected: T::NAME,
            found: self.body.name().to_string(),
        })
    }

    pub fn frame_kind(&self) -> FrameKind {
        if self.ctx.needs_ack {
            FrameKind::Ack
        } else if self.ctx.is_ack_reply {
            FrameKind::AckReply
        } else {
            FrameKind::Normal
        }
    }

    /// Assigns an id if the message was built without one.
    pub(crate) fn ensure_id(&mut self) {
        if self.ctx.id.is_empty() {
            self.ctx.id = new_message_id();
        }
        if self.opts.timeout.is_zero() {
            self.opts.timeout = REQUEST_TIMEOUT;
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id({}) type({}) ack({}) reply({})",
            self.ctx.id, self.ctx.msg_type, self.ctx.needs_ack, self.ctx.is_ack_reply
        )
    }
}

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

// ============================================================================
// Frame codec
// ============================================================================

/// Serializes a message into a single wire frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, ChannelError> {
    let body = msg.body.encode()?;
    if body.len() > MAX_BODY_SIZE {
        return Err(ChannelError::BodyTooLarge(body.len() as u32));
    }
    let header = FrameHeader {
        kind: msg.frame_kind(),
        id: msg.ctx.id.clone(),
        content_type: msg.ctx.msg_type.clone(),
        content_length: body.len() as u32,
    };
    let header = model::encode(&header)?;
    if header.len() > MAX_HEADER_SIZE {
        return Err(ChannelError::HeaderTooLarge(header.len() as u32));
    }

    let mut frame = Vec::with_capacity(HEADER_PREFIX_SIZE + header.len() + body.len());
    frame.extend_from_slice(&(header.len() as u32).to_be_bytes());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reads exactly one frame and decodes its body through `decoders`.
pub async fn read_frame<R>(reader: &mut R, decoders: &UnmarshalChain) -> Result<Message, ChannelError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; HEADER_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;
    let header_len = u32::from_be_bytes(prefix);
    if header_len as usize > MAX_HEADER_SIZE {
        return Err(ChannelError::HeaderTooLarge(header_len));
    }

    let mut header_bytes = vec![0u8; header_len as usize];
    reader.read_exact(&mut header_bytes).await?;
    let header: FrameHeader = model::decode_bounded(&header_bytes)?;
    if header.content_length as usize > MAX_BODY_SIZE {
        return Err(ChannelError::BodyTooLarge(header.content_length));
    }

    let mut body_bytes = vec![0u8; header.content_length as usize];
    reader.read_exact(&mut body_bytes).await?;
    let body = decoders.decode(&header.content_type, &body_bytes)?;

    Ok(Message {
        ctx: MessageContext {
            id: header.id,
            needs_ack: header.kind == FrameKind::Ack,
            is_ack_reply: header.kind == FrameKind::AckReply,
            msg_type: header.content_type,
        },
        opts: MessageOptions::default(),
        body,
    })
}
