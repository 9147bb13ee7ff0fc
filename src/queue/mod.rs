//! Durable log seam.
//!
//! The ingress side appends encoded events through a [`LogProducer`]; the
//! processor side reads them back through a [`LogConsumer`] owned by exactly
//! one processor loop. Backends are selected at startup and dispatched through
//! the [`Producer`] and [`Consumer`] enums.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use std::fmt;

use thiserror::Error;

#[cfg(feature = "kafka")]
use self::kafka::{KafkaConsumer, KafkaProducer};
use self::memory::{MemoryConsumer, MemoryProducer};

/// Log-assigned location of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    pub partition: i32,
    pub offset: i64,
}

impl Position {
    pub const fn new(partition: i32, offset: i64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// A message fetched from the log: opaque payload plus its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub position: Position,
    pub payload: Vec<u8>,
}

/// Errors returned by the durable log.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("log unavailable: {0}")]
    Unavailable(String),

    #[error("partition {partition} is not assigned to this consumer")]
    NotAssigned { partition: i32 },

    #[error("log closed")]
    Closed,

    #[cfg(feature = "kafka")]
    #[error(transparent)]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// Appends payloads to the configured topic.
///
/// Implementations must be safe to share between concurrent requests.
pub trait LogProducer: Send + Sync {
    /// Appends one payload and resolves once the log has confirmed the write.
    fn append(
        &self,
        payload: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<Position, QueueError>> + Send;
}

/// Reads payloads for one member of a consumer group.
pub trait LogConsumer: Send {
    /// Suspends until the next message is available. Cancel-safe: dropping
    /// the future before it resolves does not lose a message.
    fn fetch(
        &mut self,
    ) -> impl std::future::Future<Output = Result<QueuedMessage, QueueError>> + Send;

    /// Moves the read cursor of `position.partition` back to `position` so the
    /// next fetch from that partition re-delivers it.
    fn rewind(
        &mut self,
        position: Position,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Records `position` (and everything before it in the partition) as
    /// processed for the consumer group.
    fn commit(
        &mut self,
        position: Position,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Leaves the consumer group and releases the connection.
    fn close(&mut self) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;
}

/// Producer backend selected from configuration.
pub enum Producer {
    Memory(MemoryProducer),
    #[cfg(feature = "kafka")]
    Kafka(KafkaProducer),
}

impl Producer {
    /// Returns the backend name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            #[cfg(feature = "kafka")]
            Self::Kafka(_) => "kafka",
        }
    }
}

impl LogProducer for Producer {
    async fn append(&self, payload: Vec<u8>) -> Result<Position, QueueError> {
        match self {
            Self::Memory(p) => p.append(payload).await,
            #[cfg(feature = "kafka")]
            Self::Kafka(p) => p.append(payload).await,
        }
    }
}

/// Consumer backend selected from configuration.
pub enum Consumer {
    Memory(MemoryConsumer),
    #[cfg(feature = "kafka")]
    Kafka(KafkaConsumer),
}

impl LogConsumer for Consumer {
    async fn fetch(&mut self) -> Result<QueuedMessage, QueueError> {
        match self {
            Self::Memory(c) => c.fetch().await,
            #[cfg(feature = "kafka")]
            Self::Kafka(c) => c.fetch().await,
        }
    }

    async fn rewind(&mut self, position: Position) -> Result<(), QueueError> {
        match self {
            Self::Memory(c) => c.rewind(position).await,
            #[cfg(feature = "kafka")]
            Self::Kafka(c) => c.rewind(position).await,
        }
    }

    async fn commit(&mut self, position: Position) -> Result<(), QueueError> {
        match self {
            Self::Memory(c) => c.commit(position).await,
            #[cfg(feature = "kafka")]
            Self::Kafka(c) => c.commit(position).await,
        }
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        match self {
            Self::Memory(c) => c.close().await,
            #[cfg(feature = "kafka")]
            Self::Kafka(c) => c.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_display() {
        assert_eq!(Position::new(3, 42).to_string(), "3@42");
    }

    #[test]
    fn test_position_orders_by_partition_then_offset() {
        assert!(Position::new(0, 9) < Position::new(1, 0));
        assert!(Position::new(1, 1) < Position::new(1, 2));
    }
}
