//! Boundary to the remote broker service.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::packet::Packet;

/// Why a remote send failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    /// The broker's own persistence layer rejected the packet.
    Storage,
    /// Transport-level failure reaching the broker.
    Network,
    /// Anything the client could not classify.
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Storage => "Storage",
            FailureCategory::Network => "Network",
            FailureCategory::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a delivery worker does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Wait out the backoff, then try again while attempts remain.
    RetryWithBackoff,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("remote storage failure: {0}")]
    Storage(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("unknown send failure: {0}")]
    Unknown(String),
}

impl SendError {
    pub fn category(&self) -> FailureCategory {
        match self {
            SendError::Storage(_) => FailureCategory::Storage,
            SendError::Network(_) => FailureCategory::Network,
            SendError::Unknown(_) => FailureCategory::Unknown,
        }
    }

    /// Maps every failure category to the retry treatment it gets.
    pub fn action(&self) -> FailureAction {
        match self.category() {
            FailureCategory::Storage | FailureCategory::Network | FailureCategory::Unknown => {
                FailureAction::RetryWithBackoff
            }
        }
    }
}

/// Performs the network call that hands one packet to the broker.
#[async_trait]
pub trait RemoteSendClient: Send + Sync + 'static {
    async fn send(&self, packet: &Packet) -> Result<(), SendError>;
}

#[async_trait]
impl<C: RemoteSendClient + ?Sized> RemoteSendClient for Arc<C> {
    async fn send(&self, packet: &Packet) -> Result<(), SendError> {
        (**self).send(packet).await
    }
}

/// Bounds every send with the remote call timeout. An elapsed timeout is
/// reported as a network failure.
#[derive(Debug, Clone)]
pub struct TimeoutClient<C> {
    inner: C,
    timeout: Duration,
}

impl<C> TimeoutClient<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<C: RemoteSendClient> RemoteSendClient for TimeoutClient<C> {
    async fn send(&self, packet: &Packet) -> Result<(), SendError> {
        match tokio::time::timeout(self.timeout, self.inner.send(packet)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Network(format!(
                "remote call timed out after {:?}",
                self.timeout
            ))),
        }
    }
}
