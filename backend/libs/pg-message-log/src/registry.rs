//! Consumer group registry.
//!
//! One table per topic listing every group that subscribed to it. The
//! fan-out trigger reads this table on every insert; rows are never deleted.

use anyhow::Context;
use sqlx::{PgConnection, Row};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::LogQueueResult;
use crate::naming::{quote_ident, TableNaming};

/// Normalized consumer group name.
///
/// An empty name maps to the reserved default group so that schema
/// creation, claims and acknowledgements all agree on the same ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerGroup(String);

impl ConsumerGroup {
    pub fn new(name: impl AsRef<str>, default_group: &str) -> Self {
        let name = name.as_ref();
        if name.is_empty() {
            Self(default_group.to_string())
        } else {
            Self(name.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry of consumer groups per topic.
#[derive(Clone)]
pub struct ConsumerGroupRegistry {
    naming: Arc<dyn TableNaming>,
}

impl ConsumerGroupRegistry {
    pub fn new(naming: Arc<dyn TableNaming>) -> Self {
        Self { naming }
    }

    pub fn create_table_query(&self, topic: &str) -> String {
        format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
                "consumer_group" VARCHAR(64) NOT NULL PRIMARY KEY
            )"#,
            quote_ident(&self.naming.consumer_groups_table(topic))
        )
    }

    pub fn register_query(&self, topic: &str) -> String {
        format!(
            r#"INSERT INTO {} ("consumer_group") VALUES ($1) ON CONFLICT DO NOTHING"#,
            quote_ident(&self.naming.consumer_groups_table(topic))
        )
    }

    /// Register a group for a topic.
    ///
    /// Returns `true` if the group is new, `false` if it was already known.
    /// The group only receives messages inserted after this call.
    pub async fn register(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        consumer_group: &ConsumerGroup,
    ) -> LogQueueResult<bool> {
        let registered = self
            .try_register(conn, topic, consumer_group)
            .await
            .context("Failed to register consumer group")?;
        Ok(registered)
    }

    pub(crate) async fn try_register(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        consumer_group: &ConsumerGroup,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(&self.register_query(topic))
            .bind(consumer_group.as_str())
            .execute(&mut *conn)
            .await?;

        let registered = result.rows_affected() > 0;
        if registered {
            info!(topic = %topic, consumer_group = %consumer_group, "Consumer group registered");
        } else {
            debug!(topic = %topic, consumer_group = %consumer_group, "Consumer group already registered");
        }

        Ok(registered)
    }

    /// All groups registered for a topic, sorted by name.
    pub async fn list(
        &self,
        conn: &mut PgConnection,
        topic: &str,
    ) -> LogQueueResult<Vec<ConsumerGroup>> {
        let query = format!(
            r#"SELECT "consumer_group" FROM {} ORDER BY "consumer_group" ASC"#,
            quote_ident(&self.naming.consumer_groups_table(topic))
        );

        let rows = sqlx::query(&query)
            .fetch_all(&mut *conn)
            .await
            .context("Failed to list consumer groups")?;

        rows.into_iter()
            .map(|row| -> LogQueueResult<ConsumerGroup> {
                Ok(ConsumerGroup(row.try_get("consumer_group")?))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::PrefixedTableNaming;

    fn registry() -> ConsumerGroupRegistry {
        ConsumerGroupRegistry::new(Arc::new(PrefixedTableNaming::default()))
    }

    #[test]
    fn test_empty_group_normalizes_to_default() {
        let group = ConsumerGroup::new("", "__default__");
        assert_eq!(group.as_str(), "__default__");
        assert_eq!(group, ConsumerGroup::new("__default__", "__default__"));
        assert_eq!(ConsumerGroup::new("billing", "__default__").to_string(), "billing");
    }

    #[test]
    fn test_register_query_binds_group() {
        let query = registry().register_query("orders");
        assert_eq!(
            query,
            r#"INSERT INTO "message_log/orders#consumer_groups" ("consumer_group") VALUES ($1) ON CONFLICT DO NOTHING"#
        );
    }

    #[test]
    fn test_create_table_is_idempotent() {
        let query = registry().create_table_query("orders");
        assert!(query.starts_with(
            r#"CREATE TABLE IF NOT EXISTS "message_log/orders#consumer_groups""#
        ));
        assert!(query.contains("VARCHAR(64) NOT NULL PRIMARY KEY"));
    }
}
