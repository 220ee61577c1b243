//! High-level entry point tying the log store, registry, ledger and
//! initializer together over a connection pool.

use anyhow::Context;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::LogQueueConfig;
use crate::error::{LogQueueError, LogQueueResult};
use crate::initializer::SchemaInitializer;
use crate::metrics;
use crate::naming::{PrefixedTableNaming, TableNaming};
use crate::offsets::{OffsetLedger, OffsetLedgerEntry};
use crate::registry::{ConsumerGroup, ConsumerGroupRegistry};
use crate::schema::LogSchema;
use crate::validation::{validate_consumer_group, validate_topic_name};
use crate::{MessageRecord, NewMessage};

/// Width of the messages table `id` column.
const MAX_MESSAGE_ID_LEN: usize = 36;

/// PostgreSQL-backed message log.
///
/// Cheap to clone; clones share the pool and the schema initializer.
#[derive(Clone)]
pub struct MessageLog {
    pool: PgPool,
    config: LogQueueConfig,
    schema: LogSchema,
    offsets: OffsetLedger,
    registry: ConsumerGroupRegistry,
    initializer: Arc<SchemaInitializer>,
}

impl MessageLog {
    /// Create a log using [`PrefixedTableNaming`] with the configured prefix.
    pub fn new(pool: PgPool, config: LogQueueConfig) -> Self {
        let naming = Arc::new(PrefixedTableNaming::new(config.table_prefix.clone()));
        Self::with_naming(pool, config, naming)
    }

    /// Create a log with a custom naming strategy.
    pub fn with_naming(
        pool: PgPool,
        config: LogQueueConfig,
        naming: Arc<dyn TableNaming>,
    ) -> Self {
        let initializer = Arc::new(SchemaInitializer::new(naming, config.advisory_lock));
        Self::with_initializer(pool, config, initializer)
    }

    /// Create a log around an existing initializer.
    ///
    /// Logs built from the same initializer share its naming and remember
    /// each other's initialized pairs. The initializer's advisory lock
    /// setting wins over `config.advisory_lock`.
    pub fn with_initializer(
        pool: PgPool,
        config: LogQueueConfig,
        initializer: Arc<SchemaInitializer>,
    ) -> Self {
        let naming = initializer.naming().clone();
        Self {
            schema: LogSchema::new(naming.clone()),
            offsets: OffsetLedger::new(naming.clone()),
            registry: ConsumerGroupRegistry::new(naming),
            initializer,
            pool,
            config,
        }
    }

    pub fn initializer(&self) -> &Arc<SchemaInitializer> {
        &self.initializer
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Normalize a consumer group name; empty means the default group.
    pub fn consumer_group(&self, name: &str) -> ConsumerGroup {
        ConsumerGroup::new(name, &self.config.default_consumer_group)
    }

    fn resolve(&self, topic: &str, consumer_group: &str) -> LogQueueResult<ConsumerGroup> {
        validate_topic_name(topic)?;
        let consumer_group = self.consumer_group(consumer_group);
        validate_consumer_group(&consumer_group)?;
        Ok(consumer_group)
    }

    /// Create the topic's tables and register the consumer group.
    ///
    /// Safe to call repeatedly; returns `false` once the pair is initialized.
    pub async fn initialize_schema(
        &self,
        topic: &str,
        consumer_group: &str,
    ) -> LogQueueResult<bool> {
        let consumer_group = self.consumer_group(consumer_group);
        self.initializer
            .initialize(&self.pool, topic, &consumer_group)
            .await
    }

    /// Append messages to a topic in one transaction.
    ///
    /// Offsets are assigned by the database and not returned. Every group
    /// registered at commit time receives each message exactly once.
    pub async fn insert(&self, topic: &str, messages: &[NewMessage]) -> LogQueueResult<()> {
        validate_topic_name(topic)?;

        if messages.is_empty() {
            debug!(topic = %topic, "No messages to insert");
            return Ok(());
        }

        if let Some(message) = messages.iter().find(|m| m.id.len() > MAX_MESSAGE_ID_LEN) {
            return Err(LogQueueError::InvalidMessage(format!(
                "Message id {:?} longer than {} characters",
                message.id, MAX_MESSAGE_ID_LEN
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin insert transaction")?;

        self.schema.insert(&mut tx, topic, messages).await?;

        tx.commit()
            .await
            .context("Failed to commit inserted messages")?;

        metrics::record_inserted(topic, messages.len());
        debug!(topic = %topic, count = messages.len(), "Messages appended to log");

        Ok(())
    }

    /// Claim the next unacked message of a consumer group.
    ///
    /// The returned [`Claim`] keeps the claiming transaction (and the row
    /// lock) open until it is acked or nacked. `None` means nothing is
    /// claimable right now. Claims that collide with a racing consumer are
    /// retried up to `max_claim_attempts` times before the conflict is
    /// returned.
    ///
    /// While a claim of the group is open, a further claim of the same group
    /// waits on the consumed marker until that claim is acked or nacked, so
    /// never hold two claims of one group in the same task.
    pub async fn select_next(
        &self,
        topic: &str,
        consumer_group: &str,
    ) -> LogQueueResult<Option<Claim>> {
        let consumer_group = self.resolve(topic, consumer_group)?;

        let max_attempts = self.config.max_claim_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.try_claim(topic, &consumer_group).await {
                Ok(claim) => return Ok(claim),
                Err(e) if e.is_conflict() && attempt < max_attempts => {
                    metrics::record_conflict(topic, consumer_group.as_str());
                    warn!(
                        topic = %topic,
                        consumer_group = %consumer_group,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Claim collided with another consumer, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_conflict() {
                        metrics::record_conflict(topic, consumer_group.as_str());
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn try_claim(
        &self,
        topic: &str,
        consumer_group: &ConsumerGroup,
    ) -> LogQueueResult<Option<Claim>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin claim transaction")?;

        let Some(record) = self
            .schema
            .select_next(&mut tx, topic, consumer_group, &self.offsets)
            .await?
        else {
            tx.rollback()
                .await
                .context("Failed to close empty claim transaction")?;
            return Ok(None);
        };

        // Dropping `tx` on error rolls the claim back.
        self.offsets
            .mark_consumed(&mut tx, topic, consumer_group, record.offset)
            .await?;

        metrics::record_claimed(topic, consumer_group.as_str());
        debug!(
            topic = %topic,
            consumer_group = %consumer_group,
            offset = record.offset,
            "Message claimed"
        );

        Ok(Some(Claim {
            tx,
            offsets: self.offsets.clone(),
            topic: topic.to_string(),
            consumer_group: consumer_group.clone(),
            record,
        }))
    }

    /// Acknowledge an offset outside of a claim.
    ///
    /// Returns `false` if it was already acknowledged.
    pub async fn acknowledge(
        &self,
        topic: &str,
        consumer_group: &str,
        offset: i64,
    ) -> LogQueueResult<bool> {
        let consumer_group = self.resolve(topic, consumer_group)?;

        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection for acknowledge")?;

        let acked = self
            .offsets
            .acknowledge(&mut conn, topic, &consumer_group, offset)
            .await?;

        if acked {
            metrics::record_acked(topic, consumer_group.as_str());
        }

        Ok(acked)
    }

    /// Number of unacked messages of a consumer group.
    pub async fn pending(&self, topic: &str, consumer_group: &str) -> LogQueueResult<i64> {
        let consumer_group = self.resolve(topic, consumer_group)?;
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        self.offsets
            .pending_count(&mut conn, topic, &consumer_group)
            .await
    }

    /// Ledger rows of a consumer group, ascending by offset.
    pub async fn ledger(
        &self,
        topic: &str,
        consumer_group: &str,
    ) -> LogQueueResult<Vec<OffsetLedgerEntry>> {
        let consumer_group = self.resolve(topic, consumer_group)?;
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        self.offsets.entries(&mut conn, topic, &consumer_group).await
    }

    /// Groups registered for a topic.
    pub async fn consumer_groups(&self, topic: &str) -> LogQueueResult<Vec<ConsumerGroup>> {
        validate_topic_name(topic)?;
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        self.registry.list(&mut conn, topic).await
    }

    /// Read a message by offset without claiming it.
    pub async fn message(
        &self,
        topic: &str,
        offset: i64,
    ) -> LogQueueResult<Option<MessageRecord>> {
        validate_topic_name(topic)?;
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        self.schema.select_by_offset(&mut conn, topic, offset).await
    }
}

/// A claimed message and the open transaction holding its ledger lock.
///
/// Dropping a claim without calling [`Claim::ack`] rolls the transaction
/// back and makes the message claimable again. Other claims of the same
/// group block until this one ends.
pub struct Claim {
    tx: Transaction<'static, Postgres>,
    offsets: OffsetLedger,
    topic: String,
    consumer_group: ConsumerGroup,
    record: MessageRecord,
}

impl Claim {
    pub fn record(&self) -> &MessageRecord {
        &self.record
    }

    pub fn offset(&self) -> i64 {
        self.record.offset
    }

    pub fn consumer_group(&self) -> &ConsumerGroup {
        &self.consumer_group
    }

    /// Acknowledge the message and commit the claim.
    pub async fn ack(self) -> LogQueueResult<MessageRecord> {
        let Claim {
            mut tx,
            offsets,
            topic,
            consumer_group,
            record,
        } = self;

        offsets
            .acknowledge(&mut tx, &topic, &consumer_group, record.offset)
            .await?;

        tx.commit().await.map_err(|source| {
            if crate::error::is_conflict_error(&source) {
                LogQueueError::Conflict {
                    offset: record.offset,
                    source,
                }
            } else {
                LogQueueError::Other(
                    anyhow::Error::new(source).context("Failed to commit acknowledgement"),
                )
            }
        })?;

        metrics::record_acked(&topic, consumer_group.as_str());
        info!(
            topic = %topic,
            consumer_group = %consumer_group,
            offset = record.offset,
            "Message acknowledged"
        );

        Ok(record)
    }

    /// Release the claim without acknowledging; the message is redelivered.
    pub async fn nack(self) -> LogQueueResult<()> {
        let offset = self.record.offset;
        self.tx
            .rollback()
            .await
            .context("Failed to release claim")?;

        debug!(
            topic = %self.topic,
            consumer_group = %self.consumer_group,
            offset,
            "Claim released"
        );

        Ok(())
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim")
            .field("topic", &self.topic)
            .field("consumer_group", &self.consumer_group)
            .field("record", &self.record)
            .finish()
    }
}
