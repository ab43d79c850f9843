use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Serialization/deserialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Conflicting update: {0}")]
    Conflict(String),

    #[error("Store backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Subscription error: {0}")]
    Subscription(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
