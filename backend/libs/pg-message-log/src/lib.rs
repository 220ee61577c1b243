//! # PostgreSQL Message Log
//!
//! Turns ordinary PostgreSQL tables into an append-only message log with
//! per-consumer-group offset tracking, exactly-once delivery per group and
//! strict per-topic ordering, without a broker process.
//!
//! ## Layout per topic
//!
//! - a messages table whose `BIGSERIAL` primary key is the offset
//! - a registry of consumer groups subscribed to the topic
//! - one offset ledger per consumer group (unacked offsets have `acked_at IS NULL`)
//! - a consumed marker table, keyed by consumer group
//! - an `AFTER INSERT` trigger copying every new offset into every ledger
//!
//! A group only sees messages inserted after it registered.
//!
//! ## Delivery
//!
//! Consumers of the same group compete for messages with
//! `FOR UPDATE SKIP LOCKED` on the ledger: a claim locks the smallest
//! unacked offset and other claimants skip it. Claiming, recording the
//! consumed marker, reading the payload and acknowledging all happen in one
//! transaction, held by [`Claim`].
//!
//! Claims of one group also serialize on the consumed marker: a second
//! `select_next` for the group waits until the open [`Claim`] ends.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use pg_message_log::{LogQueueConfig, MessageLog, NewMessage};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let log = MessageLog::new(pool, LogQueueConfig::default());
//!
//! // Creates tables on first use and registers the group
//! log.initialize_schema("orders", "billing").await?;
//!
//! log.insert(
//!     "orders",
//!     &[NewMessage::new(b"order #1".to_vec())
//!         .with_metadata(serde_json::json!({ "source": "checkout" }))],
//! )
//! .await?;
//!
//! if let Some(claim) = log.select_next("orders", "billing").await? {
//!     println!("offset {}: {:?}", claim.offset(), claim.record().payload);
//!     claim.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod config;
mod error;
pub mod initializer;
mod message_log;
mod metrics;
pub mod naming;
pub mod offsets;
pub mod registry;
pub mod schema;
pub mod validation;

pub use config::{create_pool, DbConfig, LogQueueConfig};
pub use error::{LogQueueError, LogQueueResult};
pub use initializer::SchemaInitializer;
pub use message_log::{Claim, MessageLog};
pub use naming::{PrefixedTableNaming, TableNaming};
pub use offsets::{OffsetLedger, OffsetLedgerEntry};
pub use registry::{ConsumerGroup, ConsumerGroupRegistry};
pub use schema::LogSchema;

/// A message stored in the log. Never updated once inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Position in the topic, assigned by the database
    pub offset: i64,

    /// Producer supplied identifier (at most 36 characters)
    pub id: String,

    /// Insert time
    pub created_at: DateTime<Utc>,

    /// Opaque payload
    pub payload: Option<Vec<u8>>,

    /// Structured key/value metadata
    pub metadata: Option<serde_json::Value>,
}

/// A message to append to a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: String,
    pub payload: Option<Vec<u8>>,
    pub metadata: Option<serde_json::Value>,
}

impl NewMessage {
    /// Create a message with a random UUID id.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload: Some(payload.into()),
            metadata: None,
        }
    }

    /// Create a message with an explicit id and no payload.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: None,
            metadata: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Serialize a value as the JSON payload.
    pub fn json<T: Serialize>(value: &T) -> LogQueueResult<Self> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_generates_uuid() {
        let message = NewMessage::new("hello");
        assert_eq!(message.id.len(), 36);
        assert!(Uuid::parse_str(&message.id).is_ok());
        assert_eq!(message.payload.as_deref(), Some(&b"hello"[..]));
        assert!(message.metadata.is_none());
    }

    #[test]
    fn test_builder() {
        let message = NewMessage::with_id("order-1")
            .with_payload(vec![1, 2, 3])
            .with_metadata(serde_json::json!({ "tenant": "eu" }));

        assert_eq!(message.id, "order-1");
        assert_eq!(message.payload, Some(vec![1, 2, 3]));
        assert_eq!(message.metadata.unwrap()["tenant"], "eu");
    }

    #[test]
    fn test_json_payload() {
        let message = NewMessage::json(&serde_json::json!({ "amount": 42 })).unwrap();
        let decoded: serde_json::Value =
            serde_json::from_slice(message.payload.as_deref().unwrap()).unwrap();
        assert_eq!(decoded["amount"], 42);
    }
}
