use std::io;

use thiserror::Error;

/// Failures raised by the on-disk queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid queue config: {0}")]
    InvalidConfig(String),

    #[error("queue corruption: {0}")]
    Corruption(String),

    #[error("packet codec error: {0}")]
    Codec(#[from] PacketError),
}

impl QueueError {
    pub fn is_closed(&self) -> bool {
        matches!(self, QueueError::Closed)
    }
}

/// Failures while encoding or decoding a [`Packet`](crate::core::packet::Packet).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("invalid destination name: {0:?}")]
    InvalidDestination(String),

    #[error("unsupported packet version: {0}")]
    UnsupportedVersion(u8),

    #[error("packet truncated while reading {0}")]
    Truncated(&'static str),

    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("field {field} too large: {len} bytes")]
    TooLarge { field: &'static str, len: usize },
}

/// Errors surfaced to callers of the async producer.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("invalid producer config: {0}")]
    InvalidConfig(String),

    #[error("no tokio runtime available to spawn delivery workers")]
    NoRuntime,

    #[error("packet for {packet} cannot be enqueued on producer for {producer}")]
    DestinationMismatch { producer: String, packet: String },

    #[error("no producer registered for topic {0:?}")]
    UnknownTopic(String),

    #[error("remote service init failed: {0}")]
    RemoteInit(String),
}

impl ProducerError {
    /// True when the failure means the underlying queue no longer accepts packets.
    pub fn is_queue_closed(&self) -> bool {
        matches!(self, ProducerError::Queue(e) if e.is_closed())
    }
}
