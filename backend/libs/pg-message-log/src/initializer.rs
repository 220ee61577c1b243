//! Schema initialization.
//!
//! Creates every object a (topic, consumer group) pair needs, once per
//! process. All statements are idempotent, so a failed initialization is
//! recovered by running it again.

use anyhow::Context;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgConnection, PgPool, Postgres};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{LogQueueError, LogQueueResult};
use crate::naming::TableNaming;
use crate::offsets::OffsetLedger;
use crate::registry::{ConsumerGroup, ConsumerGroupRegistry};
use crate::schema::LogSchema;
use crate::validation;

lazy_static::lazy_static! {
    /// Serializes DDL across every initializer in the process.
    static ref DDL_LOCK: Mutex<()> = Mutex::new(());
}

/// What each initializing statement does, in execution order.
const STEPS: [&str; 7] = [
    "create messages table",
    "create consumer groups table",
    "create fan-out function",
    "drop fan-out trigger",
    "create fan-out trigger",
    "create offset ledger table",
    "create consumed marker table",
];

/// Mutex-guarded schema bootstrap.
///
/// DDL from any initializer in the process runs under one process-wide
/// mutex, held only while statements run. Pairs that initialized
/// successfully are remembered per initializer and skipped afterwards;
/// failed pairs are not. Share one initializer through
/// [`crate::MessageLog::with_initializer`] to share that memory.
pub struct SchemaInitializer {
    naming: Arc<dyn TableNaming>,
    schema: LogSchema,
    offsets: OffsetLedger,
    registry: ConsumerGroupRegistry,
    advisory_lock: bool,
    initialized: Mutex<HashSet<(String, ConsumerGroup)>>,
}

impl SchemaInitializer {
    pub fn new(naming: Arc<dyn TableNaming>, advisory_lock: bool) -> Self {
        Self {
            schema: LogSchema::new(naming.clone()),
            offsets: OffsetLedger::new(naming.clone()),
            registry: ConsumerGroupRegistry::new(naming.clone()),
            naming,
            advisory_lock,
            initialized: Mutex::new(HashSet::new()),
        }
    }

    pub fn naming(&self) -> &Arc<dyn TableNaming> {
        &self.naming
    }

    pub fn advisory_lock(&self) -> bool {
        self.advisory_lock
    }

    /// Every DDL statement for the pair, labelled, in execution order.
    pub fn initializing_queries(
        &self,
        topic: &str,
        consumer_group: &ConsumerGroup,
    ) -> Vec<(&'static str, String)> {
        let queries = self
            .schema
            .initializing_queries(topic)
            .into_iter()
            .chain(self.offsets.initializing_queries(topic, consumer_group));

        STEPS.iter().copied().zip(queries).collect()
    }

    /// Whether this process already initialized the pair.
    pub async fn is_initialized(&self, topic: &str, consumer_group: &ConsumerGroup) -> bool {
        self.initialized
            .lock()
            .await
            .contains(&(topic.to_string(), consumer_group.clone()))
    }

    /// Initialize the schema for a topic and register the consumer group.
    ///
    /// Returns `true` if statements were issued and `false` if the pair was
    /// already initialized by this process.
    ///
    /// # Errors
    ///
    /// - [`LogQueueError::InvalidName`] before any statement runs
    /// - [`LogQueueError::Schema`] if a statement fails
    pub async fn initialize(
        &self,
        pool: &PgPool,
        topic: &str,
        consumer_group: &ConsumerGroup,
    ) -> LogQueueResult<bool> {
        let mut initialized = self.initialized.lock().await;

        let key = (topic.to_string(), consumer_group.clone());
        if initialized.contains(&key) {
            debug!(topic = %topic, consumer_group = %consumer_group, "Schema already initialized");
            return Ok(false);
        }

        validation::validate(self.naming.as_ref(), topic, consumer_group)?;

        let queries = self.initializing_queries(topic, consumer_group);
        info!(
            topic = %topic,
            consumer_group = %consumer_group,
            statements = queries.len() + 1,
            "Initializing message log schema"
        );

        let _ddl = DDL_LOCK.lock().await;

        let mut conn = pool
            .acquire()
            .await
            .context("Failed to acquire connection for schema initialization")?;

        let lock_key = self.naming.messages_table(topic);
        if self.advisory_lock {
            sqlx::query("SELECT pg_advisory_lock(hashtext($1))")
                .bind(&lock_key)
                .execute(&mut *conn)
                .await
                .map_err(|source| LogQueueError::Schema {
                    context: "acquire advisory lock".to_string(),
                    source,
                })?;
        }

        let result = self
            .run_statements(&mut conn, topic, consumer_group, &queries)
            .await;

        if self.advisory_lock {
            release_advisory_lock(conn, &lock_key).await;
        }

        result?;
        initialized.insert(key);

        info!(topic = %topic, consumer_group = %consumer_group, "Message log schema initialized");
        Ok(true)
    }

    async fn run_statements(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        consumer_group: &ConsumerGroup,
        queries: &[(&'static str, String)],
    ) -> LogQueueResult<()> {
        for (step, query) in queries {
            debug!(topic = %topic, step = %step, "Running schema statement");
            sqlx::query(query)
                .execute(&mut *conn)
                .await
                .map_err(|source| LogQueueError::Schema {
                    context: (*step).to_string(),
                    source,
                })?;
        }

        self.registry
            .try_register(conn, topic, consumer_group)
            .await
            .map_err(|source| LogQueueError::Schema {
                context: "register consumer group".to_string(),
                source,
            })?;

        Ok(())
    }
}

/// Unlock, or close the connection so the session lock dies with it.
async fn release_advisory_lock(mut conn: PoolConnection<Postgres>, lock_key: &str) {
    let unlocked = sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
        .bind(lock_key)
        .execute(&mut *conn)
        .await;

    if let Err(e) = unlocked {
        error!(error = %e, "Failed to release schema advisory lock, closing connection");
        if let Err(e) = conn.detach().close().await {
            debug!(error = %e, "Closing connection after failed unlock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::PrefixedTableNaming;

    fn initializer() -> SchemaInitializer {
        SchemaInitializer::new(Arc::new(PrefixedTableNaming::default()), true)
    }

    #[test]
    fn test_steps_cover_every_statement() {
        let group = ConsumerGroup::new("billing", "__default__");
        let queries = initializer().initializing_queries("orders", &group);

        assert_eq!(queries.len(), STEPS.len());
        assert_eq!(queries[0].0, "create messages table");
        assert!(queries[5].1.contains("message_log/orders#offsets/billing"));
        assert!(queries[6].1.contains(r#""message_log/orders#consumed""#));
    }

    #[tokio::test]
    async fn test_invalid_topic_fails_before_connecting() {
        let pool = PgPool::connect_lazy("postgresql://localhost/unused").unwrap();
        let group = ConsumerGroup::new("", "__default__");
        let initializer = initializer();

        let result = initializer.initialize(&pool, "bad topic", &group).await;
        assert!(matches!(result, Err(LogQueueError::InvalidName(_))));
        assert!(!initializer.is_initialized("bad topic", &group).await);
    }
}
