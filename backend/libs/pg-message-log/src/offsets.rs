//! Per-group offset ledger.
//!
//! Every consumer group of a topic owns one ledger table with a row per
//! message inserted since the group registered. A row is unacked while
//! `acked_at` is NULL.
//!
//! Competing consumers of one group claim rows with
//! `FOR UPDATE SKIP LOCKED`: the claim locks the smallest unacked offset and
//! a concurrent claimant skips past it instead of waiting. The lock lives
//! as long as the claiming transaction, so the claim, the consumed marker
//! upsert, the payload select and the acknowledgement all have to run in
//! one transaction.
//!
//! The consumed marker is a second write path keyed by consumer group.
//! Claimants that somehow agree on the same offset collide on it and one of
//! them fails with a deadlock or serialization error, which callers treat as
//! "offset taken elsewhere".

use anyhow::Context;
use sqlx::{PgConnection, Row};
use std::sync::Arc;
use tracing::debug;

use crate::error::{is_conflict_error, LogQueueError, LogQueueResult};
use crate::naming::{quote_ident, TableNaming};
use crate::registry::ConsumerGroup;

/// Offset returned by the claim expression when nothing is claimable.
pub const NO_OFFSET: i64 = 0;

/// Ledger row of one consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetLedgerEntry {
    pub offset: i64,
    pub acked_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Query builder and executor for offset ledgers.
#[derive(Clone)]
pub struct OffsetLedger {
    naming: Arc<dyn TableNaming>,
}

impl OffsetLedger {
    pub fn new(naming: Arc<dyn TableNaming>) -> Self {
        Self { naming }
    }

    fn ledger(&self, topic: &str, consumer_group: &ConsumerGroup) -> String {
        quote_ident(&self.naming.ledger_table(topic, consumer_group))
    }

    /// DDL for the group's ledger and the topic's consumed marker table.
    pub fn initializing_queries(&self, topic: &str, consumer_group: &ConsumerGroup) -> Vec<String> {
        let create_ledger_table = format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
                "offset" BIGINT NOT NULL PRIMARY KEY,
                "acked_at" TIMESTAMPTZ
            )"#,
            self.ledger(topic, consumer_group)
        );

        let create_consumed_marker_table = format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
                "consumer_group" VARCHAR(64) NOT NULL PRIMARY KEY,
                "offset_consumed" BIGINT NOT NULL
            )"#,
            quote_ident(&self.naming.consumed_marker_table(topic))
        );

        vec![create_ledger_table, create_consumed_marker_table]
    }

    /// Scalar expression yielding the claimed offset, or 0 if none.
    ///
    /// Locks the returned ledger row until the surrounding transaction ends.
    pub fn next_offset_query(&self, topic: &str, consumer_group: &ConsumerGroup) -> String {
        format!(
            r#"SELECT COALESCE(
                (SELECT "offset"
                 FROM {}
                 WHERE "acked_at" IS NULL
                 ORDER BY "offset" ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
                ), {})"#,
            self.ledger(topic, consumer_group),
            NO_OFFSET
        )
    }

    pub fn ack_query(&self, topic: &str, consumer_group: &ConsumerGroup) -> String {
        format!(
            r#"UPDATE {} SET "acked_at" = NOW() WHERE "offset" = $1 AND "acked_at" IS NULL"#,
            self.ledger(topic, consumer_group)
        )
    }

    pub fn consumed_marker_query(&self, topic: &str) -> String {
        format!(
            r#"INSERT INTO {} ("offset_consumed", "consumer_group")
                VALUES ($1, $2)
                ON CONFLICT ("consumer_group") DO UPDATE SET "offset_consumed" = excluded."offset_consumed""#,
            quote_ident(&self.naming.consumed_marker_table(topic))
        )
    }

    /// Claim the smallest unacked offset on its own.
    ///
    /// Returns `None` if every unacked row is locked by another claimant or
    /// none exist. The claim is released when `conn`'s transaction ends.
    pub async fn claim_next(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        consumer_group: &ConsumerGroup,
    ) -> LogQueueResult<Option<i64>> {
        let offset: i64 = sqlx::query_scalar(&self.next_offset_query(topic, consumer_group))
            .fetch_one(&mut *conn)
            .await
            .context("Failed to claim next offset")?;

        if offset == NO_OFFSET {
            debug!(topic = %topic, consumer_group = %consumer_group, "No claimable offset");
            return Ok(None);
        }

        debug!(topic = %topic, consumer_group = %consumer_group, offset, "Offset claimed");
        Ok(Some(offset))
    }

    /// Acknowledge an offset.
    ///
    /// Returns `true` if this call acknowledged it, `false` if it was
    /// already acknowledged or is not in the ledger.
    pub async fn acknowledge(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        consumer_group: &ConsumerGroup,
        offset: i64,
    ) -> LogQueueResult<bool> {
        let result = sqlx::query(&self.ack_query(topic, consumer_group))
            .bind(offset)
            .execute(&mut *conn)
            .await
            .context("Failed to acknowledge offset")?;

        let acked = result.rows_affected() > 0;
        if acked {
            debug!(topic = %topic, consumer_group = %consumer_group, offset, "Offset acknowledged");
        } else {
            debug!(topic = %topic, consumer_group = %consumer_group, offset, "Offset already acknowledged");
        }

        Ok(acked)
    }

    /// Record the offset being processed by the group.
    ///
    /// A racing claimant surfaces here as [`LogQueueError::Conflict`].
    pub async fn mark_consumed(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        consumer_group: &ConsumerGroup,
        offset: i64,
    ) -> LogQueueResult<()> {
        sqlx::query(&self.consumed_marker_query(topic))
            .bind(offset)
            .bind(consumer_group.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|err| {
                if is_conflict_error(&err) {
                    LogQueueError::Conflict { offset, source: err }
                } else {
                    LogQueueError::Other(
                        anyhow::Error::new(err).context("Failed to mark offset as consumed"),
                    )
                }
            })?;

        Ok(())
    }

    /// Number of unacked rows in the group's ledger.
    pub async fn pending_count(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        consumer_group: &ConsumerGroup,
    ) -> LogQueueResult<i64> {
        let query = format!(
            r#"SELECT COUNT(*)::BIGINT AS pending FROM {} WHERE "acked_at" IS NULL"#,
            self.ledger(topic, consumer_group)
        );

        let row = sqlx::query(&query)
            .fetch_one(&mut *conn)
            .await
            .context("Failed to count pending offsets")?;

        Ok(row.try_get("pending")?)
    }

    /// Full ledger of a group, ascending by offset.
    pub async fn entries(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        consumer_group: &ConsumerGroup,
    ) -> LogQueueResult<Vec<OffsetLedgerEntry>> {
        let query = format!(
            r#"SELECT "offset", "acked_at" FROM {} ORDER BY "offset" ASC"#,
            self.ledger(topic, consumer_group)
        );

        let rows = sqlx::query(&query)
            .fetch_all(&mut *conn)
            .await
            .context("Failed to read offset ledger")?;

        rows.into_iter()
            .map(|row| -> LogQueueResult<OffsetLedgerEntry> {
                Ok(OffsetLedgerEntry {
                    offset: row.try_get("offset")?,
                    acked_at: row.try_get("acked_at")?,
                })
            })
            .collect()
    }
}
