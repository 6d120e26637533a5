use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors raised by the relay core.
///
/// Lease and checkpoint failures end the owning controller; publish failures
/// leave the record unacknowledged so the engine redelivers it.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Lease error: {0}")]
    Lease(String),

    #[error("Lease lost: {0}")]
    LeaseLost(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Shutdown timed out: {0}")]
    ShutdownTimeout(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Transient bus failures; the record is redelivered on the next poll.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::Publish(_) | RelayError::Kafka(_))
    }

    /// Failures that must stop the controller and release its lease.
    pub fn is_fatal_for_controller(&self) -> bool {
        matches!(
            self,
            RelayError::Lease(_)
                | RelayError::LeaseLost(_)
                | RelayError::Checkpoint(_)
                | RelayError::Database(_)
        )
    }
}
