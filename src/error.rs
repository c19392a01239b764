//! Typed failures of the channel layer.
//!
//! Everything above the channel (registry, p2p, relay) propagates
//! `anyhow::Error`; `ChannelError` exists for the cases callers match on:
//! timeouts, closure, and malformed frames.

use std::io;

/// Error produced by a [`Channel`](crate::channel::Channel) read or send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel (or its underlying stream) was closed.
    Closed,
    /// An earlier write failed; the channel can no longer send.
    Broken,
    /// No acknowledgement reply arrived within the request timeout.
    Timeout,
    /// Frame header length prefix exceeds the header bound.
    HeaderTooLarge(u32),
    /// Frame body length exceeds the body bound.
    BodyTooLarge(u32),
    /// No registered decoder recognizes the content type.
    UnknownContentType(String),
    /// Header or body bytes did not decode.
    Decode(String),
    /// The message body is not of the expected model type.
    UnexpectedBody { expected: &'static str, found: String },
    /// A reply was requested for a message that did not ask for one.
    NotAckRequest,
    /// Transport-level I/O failure.
    Io(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "channel closed"),
            ChannelError::Broken => write!(f, "channel broken by an earlier write failure"),
            ChannelError::Timeout => write!(f, "request timeout"),
            ChannelError::HeaderTooLarge(len) => write!(f, "frame header too large: {} bytes", len),
            ChannelError::BodyTooLarge(len) => write!(f, "frame body too large: {} bytes", len),
            ChannelError::UnknownContentType(tag) => {
                write!(f, "no decoder for content type ({})", tag)
            }
            ChannelError::Decode(reason) => write!(f, "frame decode failed: {}", reason),
            ChannelError::UnexpectedBody { expected, found } => {
                write!(f, "expected body {} but found {}", expected, found)
            }
            ChannelError::NotAckRequest => {
                write!(f, "cannot generate a reply for a message without ack")
            }
            ChannelError::Io(reason) => write!(f, "channel i/o error: {}", reason),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected => ChannelError::Closed,
            _ => ChannelError::Io(err.to_string()),
        }
    }
}

impl From<bincode::Error> for ChannelError {
    fn from(err: bincode::Error) -> Self {
        ChannelError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_maps_to_closed() {
        let err: ChannelError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert_eq!(err, ChannelError::Closed);

        let err: ChannelError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, ChannelError::Io(_)));
    }

    #[test]
    fn display_names_content_type() {
        let err = ChannelError::UnknownContentType("made-up".into());
        assert!(err.to_string().contains("made-up"));
    }
}
