//! Log store schema: messages table, consumer group registry and the
//! fan-out trigger that copies every new offset into each group's ledger.

use anyhow::Context;
use sqlx::{PgConnection, Row};
use std::sync::Arc;
use tracing::debug;

use crate::error::LogQueueResult;
use crate::naming::{quote_ident, quote_literal, TableNaming};
use crate::offsets::OffsetLedger;
use crate::registry::{ConsumerGroup, ConsumerGroupRegistry};
use crate::{MessageRecord, NewMessage};

/// PostgreSQL accepts at most this many bind parameters per statement.
const MAX_BIND_PARAMS: usize = 65_535;

/// Bind parameters per inserted message: id, payload, metadata.
const PARAMS_PER_MESSAGE: usize = 3;

/// Largest batch a single insert statement can carry.
pub const MAX_MESSAGES_PER_STATEMENT: usize = MAX_BIND_PARAMS / PARAMS_PER_MESSAGE;

/// Body of the fan-out trigger function.
///
/// `TG_ARGV[0]` is the ledger table prefix and `TG_ARGV[1]` the registry
/// table, so no topic-derived text ends up inside the function body.
const FANOUT_FUNCTION_BODY: &str = r#"
    DECLARE
        consumer_group_name TEXT;
    BEGIN
        FOR consumer_group_name IN
            EXECUTE format('SELECT "consumer_group" FROM %I', TG_ARGV[1])
        LOOP
            EXECUTE format('INSERT INTO %I ("offset") VALUES ($1)', TG_ARGV[0] || consumer_group_name)
            USING NEW."offset";
        END LOOP;
        RETURN NULL;
    END;
"#;

/// Query builder and executor for the messages table of each topic.
#[derive(Clone)]
pub struct LogSchema {
    naming: Arc<dyn TableNaming>,
    registry: ConsumerGroupRegistry,
}

impl LogSchema {
    pub fn new(naming: Arc<dyn TableNaming>) -> Self {
        Self {
            registry: ConsumerGroupRegistry::new(naming.clone()),
            naming,
        }
    }

    fn messages(&self, topic: &str) -> String {
        quote_ident(&self.naming.messages_table(topic))
    }

    /// DDL for a topic, in execution order. Every statement is idempotent.
    pub fn initializing_queries(&self, topic: &str) -> Vec<String> {
        let messages_table = self.messages(topic);
        let function = quote_ident(&self.naming.fanout_function(topic));
        let trigger = quote_ident(&self.naming.fanout_trigger(topic));

        let create_messages_table = format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
                "offset" BIGSERIAL PRIMARY KEY,
                "id" VARCHAR(36) NOT NULL,
                "created_at" TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                "payload" BYTEA DEFAULT NULL,
                "metadata" JSONB DEFAULT NULL
            )"#,
            messages_table
        );

        let create_consumer_groups_table = self.registry.create_table_query(topic);

        let create_fanout_function = format!(
            "CREATE OR REPLACE FUNCTION {}() RETURNS TRIGGER AS $fanout${}$fanout$ LANGUAGE plpgsql",
            function, FANOUT_FUNCTION_BODY
        );

        let drop_fanout_trigger = format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            trigger, messages_table
        );

        let create_fanout_trigger = format!(
            "CREATE TRIGGER {} AFTER INSERT ON {} FOR EACH ROW EXECUTE PROCEDURE {}({}, {})",
            trigger,
            messages_table,
            function,
            quote_literal(&self.naming.ledger_table_prefix(topic)),
            quote_literal(&self.naming.consumer_groups_table(topic)),
        );

        vec![
            create_messages_table,
            create_consumer_groups_table,
            create_fanout_function,
            drop_fanout_trigger,
            create_fanout_trigger,
        ]
    }

    /// Multi-row insert for `count` messages.
    pub fn insert_query(&self, topic: &str, count: usize) -> String {
        format!(
            r#"INSERT INTO {} ("id", "payload", "metadata") VALUES {}"#,
            self.messages(topic),
            insert_markers(count)
        )
    }

    /// Select the message at the offset the ledger claims for the group.
    pub fn select_query(
        &self,
        topic: &str,
        consumer_group: &ConsumerGroup,
        offsets: &OffsetLedger,
    ) -> String {
        format!(
            r#"SELECT "offset", "id", "created_at", "payload", "metadata" FROM {}
            WHERE "offset" = ({})
            ORDER BY "offset" ASC
            LIMIT 1"#,
            self.messages(topic),
            offsets.next_offset_query(topic, consumer_group)
        )
    }

    /// Insert messages; offsets come from the table's sequence.
    ///
    /// Each inserted row fires the fan-out trigger inside the same
    /// statement. Batches above [`MAX_MESSAGES_PER_STATEMENT`] are split, so
    /// pass a transaction if the whole batch must be atomic.
    pub async fn insert(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        messages: &[NewMessage],
    ) -> LogQueueResult<()> {
        for chunk in messages.chunks(MAX_MESSAGES_PER_STATEMENT) {
            let query = self.insert_query(topic, chunk.len());
            let mut statement = sqlx::query(&query);
            for message in chunk {
                statement = statement
                    .bind(&message.id)
                    .bind(&message.payload)
                    .bind(&message.metadata);
            }

            statement
                .execute(&mut *conn)
                .await
                .context("Failed to insert messages")?;

            debug!(topic = %topic, count = chunk.len(), "Messages inserted");
        }

        Ok(())
    }

    /// Claim and fetch the group's next unacked message.
    ///
    /// `None` means nothing is claimable right now, which is not an error.
    pub async fn select_next(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        consumer_group: &ConsumerGroup,
        offsets: &OffsetLedger,
    ) -> LogQueueResult<Option<MessageRecord>> {
        let row = sqlx::query(&self.select_query(topic, consumer_group, offsets))
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to select next message")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(MessageRecord {
            offset: row.try_get("offset")?,
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            payload: row.try_get("payload")?,
            metadata: row.try_get("metadata")?,
        }))
    }

    /// Read a message by offset without claiming it.
    pub async fn select_by_offset(
        &self,
        conn: &mut PgConnection,
        topic: &str,
        offset: i64,
    ) -> LogQueueResult<Option<MessageRecord>> {
        let query = format!(
            r#"SELECT "offset", "id", "created_at", "payload", "metadata" FROM {} WHERE "offset" = $1"#,
            self.messages(topic)
        );

        let row = sqlx::query(&query)
            .bind(offset)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to select message by offset")?;

        row.map(|row| -> LogQueueResult<MessageRecord> {
            Ok(MessageRecord {
                offset: row.try_get("offset")?,
                id: row.try_get("id")?,
                created_at: row.try_get("created_at")?,
                payload: row.try_get("payload")?,
                metadata: row.try_get("metadata")?,
            })
        })
        .transpose()
    }
}

/// `($1,$2,$3),($4,$5,$6),...` for `count` rows.
fn insert_markers(count: usize) -> String {
    (0..count)
        .map(|row| {
            let first = row * PARAMS_PER_MESSAGE + 1;
            format!("(${},${},${})", first, first + 1, first + 2)
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::PrefixedTableNaming;

    fn schema() -> (LogSchema, OffsetLedger) {
        let naming: Arc<dyn TableNaming> = Arc::new(PrefixedTableNaming::default());
        (LogSchema::new(naming.clone()), OffsetLedger::new(naming))
    }

    #[test]
    fn test_insert_markers() {
        assert_eq!(insert_markers(1), "($1,$2,$3)");
        assert_eq!(insert_markers(3), "($1,$2,$3),($4,$5,$6),($7,$8,$9)");
        assert_eq!(insert_markers(0), "");
    }

    #[test]
    fn test_insert_query() {
        let (schema, _) = schema();
        assert_eq!(
            schema.insert_query("orders", 2),
            r#"INSERT INTO "message_log/orders" ("id", "payload", "metadata") VALUES ($1,$2,$3),($4,$5,$6)"#
        );
    }

    #[test]
    fn test_statement_limit_fits_bind_params() {
        assert!(MAX_MESSAGES_PER_STATEMENT * PARAMS_PER_MESSAGE <= MAX_BIND_PARAMS);
    }

    #[test]
    fn test_initializing_queries_order() {
        let (schema, _) = schema();
        let queries = schema.initializing_queries("orders");

        assert_eq!(queries.len(), 5);
        assert!(queries[0].starts_with(r#"CREATE TABLE IF NOT EXISTS "message_log/orders""#));
        assert!(queries[0].contains(r#""offset" BIGSERIAL PRIMARY KEY"#));
        assert!(queries[1].contains("message_log/orders#consumer_groups"));
        assert!(queries[2].starts_with(
            r#"CREATE OR REPLACE FUNCTION "message_log/orders#fanout"() RETURNS TRIGGER"#
        ));
        assert_eq!(
            queries[3],
            r#"DROP TRIGGER IF EXISTS "message_log/orders#fanout_trigger" ON "message_log/orders""#
        );
        assert_eq!(
            queries[4],
            r#"CREATE TRIGGER "message_log/orders#fanout_trigger" AFTER INSERT ON "message_log/orders" FOR EACH ROW EXECUTE PROCEDURE "message_log/orders#fanout"('message_log/orders#offsets/', 'message_log/orders#consumer_groups')"#
        );
    }

    #[test]
    fn test_fanout_function_has_no_topic_text() {
        let (schema, _) = schema();
        let function = &schema.initializing_queries("orders$fanout$")[2];
        // Only the function name carries the topic; the body is shared.
        assert_eq!(function.matches("orders").count(), 1);
        assert!(FANOUT_FUNCTION_BODY.contains("TG_ARGV[0] || consumer_group_name"));
        assert!(!FANOUT_FUNCTION_BODY.contains("$fanout$"));
    }

    #[test]
    fn test_select_query_embeds_claim() {
        let (schema, offsets) = schema();
        let group = ConsumerGroup::new("billing", "__default__");
        let query = schema.select_query("orders", &group, &offsets);

        assert!(query.contains(r#"FROM "message_log/orders""#));
        assert!(query.contains(r#"WHERE "offset" = (SELECT COALESCE("#));
        assert!(query.contains("FOR UPDATE SKIP LOCKED"));
        assert!(query.trim_end().ends_with("LIMIT 1"));
    }
}
