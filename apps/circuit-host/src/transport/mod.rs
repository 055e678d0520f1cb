pub mod mock;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

/// Identifies one physical connection. A circuit outlives many of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionToken(Uuid);

impl ConnectionToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("send timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether the connection can no longer carry anything.
    pub fn is_unusable(&self) -> bool {
        matches!(self, TransportError::Closed)
    }
}

/// Outbound half of a connection as seen by a circuit.
///
/// Implementations must deliver messages in the order `send_*` calls
/// complete; they are free to stop delivering altogether.
#[async_trait]
pub trait ClientChannel: Send + Sync {
    fn connection(&self) -> ConnectionToken;

    async fn send_batch(&self, batch_id: u64, payload: Bytes) -> Result<(), TransportError>;

    async fn send_error(&self, message: &str) -> Result<(), TransportError>;
}

pub type ChannelHandle = Arc<dyn ClientChannel>;
