use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The peer is permanently unreachable; the connection should be pruned.
    #[error("connection is gone")]
    Gone,
    #[error("delivery failed: {0}")]
    Other(String),
}

/// Single-attempt push of a payload to one live connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, connection_id: &str, payload: &[u8]) -> Result<(), DeliveryError>;
}
