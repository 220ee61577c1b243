//! Table naming strategy.
//!
//! Every database object the log creates is named by a [`TableNaming`]
//! implementation. Names returned here are raw (unquoted); statements quote
//! them with [`quote_ident`] when they are embedded.

use crate::registry::ConsumerGroup;

/// PostgreSQL truncates identifiers longer than this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Maps a topic (and consumer group) to the names of its database objects.
///
/// Implementations must be deterministic and injective in the topic: two
/// different topics may never share a messages table.
pub trait TableNaming: Send + Sync {
    /// Append-only messages table of a topic.
    fn messages_table(&self, topic: &str) -> String;

    /// Registry of consumer groups subscribed to a topic.
    fn consumer_groups_table(&self, topic: &str) -> String;

    /// PL/pgSQL function fanning new offsets out to every ledger.
    fn fanout_function(&self, topic: &str) -> String;

    /// Trigger on the messages table that calls [`Self::fanout_function`].
    fn fanout_trigger(&self, topic: &str) -> String;

    /// Common prefix of every per-group ledger table of a topic.
    ///
    /// The fan-out trigger builds ledger names as `prefix || consumer_group`
    /// at insert time, so this is the only part of a ledger name that may be
    /// customised.
    fn ledger_table_prefix(&self, topic: &str) -> String;

    /// Table holding the consumed marker of every group of a topic.
    fn consumed_marker_table(&self, topic: &str) -> String;

    /// Offset ledger of one consumer group.
    fn ledger_table(&self, topic: &str, consumer_group: &ConsumerGroup) -> String {
        format!(
            "{}{}",
            self.ledger_table_prefix(topic),
            consumer_group.as_str()
        )
    }

    /// Every identifier created for a (topic, group) pair.
    fn identifiers(&self, topic: &str, consumer_group: &ConsumerGroup) -> Vec<String> {
        vec![
            self.messages_table(topic),
            self.consumer_groups_table(topic),
            self.fanout_function(topic),
            self.fanout_trigger(topic),
            self.consumed_marker_table(topic),
            self.ledger_table(topic, consumer_group),
        ]
    }
}

/// Separates the prefix from the topic and a ledger kind from its group.
/// Never valid in a topic or group.
const TOPIC_SEPARATOR: char = '/';

/// Separates the topic from the object kind. Never valid in a topic or group.
const KIND_SEPARATOR: char = '#';

/// Default naming: a fixed prefix, the topic and the object kind joined with
/// characters that topic and group names may not contain, so no two topics
/// or groups can ever share an object.
///
/// - `orders` → `message_log/orders`
/// - `orders` / `billing` → `message_log/orders#offsets/billing`
#[derive(Debug, Clone)]
pub struct PrefixedTableNaming {
    prefix: String,
}

impl PrefixedTableNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for PrefixedTableNaming {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_TABLE_PREFIX)
    }
}

impl PrefixedTableNaming {
    fn object(&self, topic: &str, kind: &str) -> String {
        format!(
            "{}{}{}{}{}",
            self.prefix, TOPIC_SEPARATOR, topic, KIND_SEPARATOR, kind
        )
    }
}

impl TableNaming for PrefixedTableNaming {
    fn messages_table(&self, topic: &str) -> String {
        format!("{}{}{}", self.prefix, TOPIC_SEPARATOR, topic)
    }

    fn consumer_groups_table(&self, topic: &str) -> String {
        self.object(topic, "consumer_groups")
    }

    fn fanout_function(&self, topic: &str) -> String {
        self.object(topic, "fanout")
    }

    fn fanout_trigger(&self, topic: &str) -> String {
        self.object(topic, "fanout_trigger")
    }

    fn ledger_table_prefix(&self, topic: &str) -> String {
        format!("{}{}", self.object(topic, "offsets"), TOPIC_SEPARATOR)
    }

    fn consumed_marker_table(&self, topic: &str) -> String {
        self.object(topic, "consumed")
    }
}

/// Quote an identifier for embedding in SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for embedding in SQL text.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names() {
        let naming = PrefixedTableNaming::default();
        let group = ConsumerGroup::new("billing", "__default__");

        assert_eq!(naming.messages_table("orders"), "message_log/orders");
        assert_eq!(
            naming.consumer_groups_table("orders"),
            "message_log/orders#consumer_groups"
        );
        assert_eq!(naming.fanout_function("orders"), "message_log/orders#fanout");
        assert_eq!(
            naming.fanout_trigger("orders"),
            "message_log/orders#fanout_trigger"
        );
        assert_eq!(
            naming.ledger_table("orders", &group),
            "message_log/orders#offsets/billing"
        );
        assert_eq!(
            naming.consumed_marker_table("orders"),
            "message_log/orders#consumed"
        );
    }

    #[test]
    fn test_custom_prefix() {
        let naming = PrefixedTableNaming::new("mq");
        assert_eq!(naming.prefix(), "mq");
        assert_eq!(naming.messages_table("orders"), "mq/orders");
        assert_eq!(naming.ledger_table_prefix("orders"), "mq/orders#offsets/");
    }

    #[test]
    fn test_overlapping_topics_never_share_objects() {
        let naming = PrefixedTableNaming::default();
        let pairs = [
            ("a", "billing"),
            ("a_billing", "x"),
            ("a", "consumer_groups"),
            ("a_consumer_groups", "x"),
            ("a", "b_c"),
            ("a_b", "c"),
            ("a_offsets", "x"),
            ("a", "fanout"),
            ("a_fanout", "trigger"),
        ];

        let mut owners = std::collections::HashMap::new();
        for (topic, group) in pairs {
            let group = ConsumerGroup::new(group, "__default__");
            for identifier in naming.identifiers(topic, &group) {
                let owner = owners.entry(identifier.clone()).or_insert(topic);
                assert_eq!(*owner, topic, "{} shared by two topics", identifier);
            }
        }

        // Ledgers of distinct groups in one topic stay distinct as well
        let ledgers: std::collections::HashSet<_> = ["b_c", "b", "c", "consumed"]
            .iter()
            .map(|group| naming.ledger_table("a", &ConsumerGroup::new(group, "__default__")))
            .collect();
        assert_eq!(ledgers.len(), 4);
        assert!(!ledgers.contains(&naming.consumed_marker_table("a")));
    }

    #[test]
    fn test_custom_strategy_keeps_ledger_prefix_contract() {
        struct Schema;

        impl TableNaming for Schema {
            fn messages_table(&self, topic: &str) -> String {
                format!("log-{topic}")
            }
            fn consumer_groups_table(&self, topic: &str) -> String {
                format!("groups-{topic}")
            }
            fn fanout_function(&self, topic: &str) -> String {
                format!("fanout-{topic}")
            }
            fn fanout_trigger(&self, topic: &str) -> String {
                format!("trigger-{topic}")
            }
            fn ledger_table_prefix(&self, topic: &str) -> String {
                format!("ledger-{topic}-")
            }
            fn consumed_marker_table(&self, topic: &str) -> String {
                format!("marker-{topic}")
            }
        }

        let group = ConsumerGroup::new("", "__default__");
        assert_eq!(Schema.ledger_table("t", &group), "ledger-t-__default__");
        assert_eq!(Schema.identifiers("t", &group).len(), 6);
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}
