//! Name validation, run before any statement touches the database.

use crate::error::{LogQueueError, LogQueueResult};
use crate::naming::{TableNaming, MAX_IDENTIFIER_LEN};
use crate::registry::ConsumerGroup;

/// Longest consumer group name the registry column accepts.
pub const MAX_CONSUMER_GROUP_LEN: usize = 64;

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '$')
}

/// Validate topic name format
pub fn validate_topic_name(topic: &str) -> LogQueueResult<()> {
    if topic.is_empty() {
        return Err(LogQueueError::InvalidName(
            "Topic name cannot be empty".to_string(),
        ));
    }

    if let Some(c) = topic.chars().find(|c| !is_allowed_char(*c)) {
        return Err(LogQueueError::InvalidName(format!(
            "Topic name {:?} contains invalid character {:?}",
            topic, c
        )));
    }

    Ok(())
}

/// Validate a normalized consumer group name
pub fn validate_consumer_group(consumer_group: &ConsumerGroup) -> LogQueueResult<()> {
    let name = consumer_group.as_str();

    if name.len() > MAX_CONSUMER_GROUP_LEN {
        return Err(LogQueueError::InvalidName(format!(
            "Consumer group name too long: {} characters (max {})",
            name.len(),
            MAX_CONSUMER_GROUP_LEN
        )));
    }

    if let Some(c) = name.chars().find(|c| !is_allowed_char(*c)) {
        return Err(LogQueueError::InvalidName(format!(
            "Consumer group name {:?} contains invalid character {:?}",
            name, c
        )));
    }

    Ok(())
}

/// Reject names PostgreSQL would silently truncate.
///
/// Truncation could map two topics onto one table.
pub fn validate_identifiers(
    naming: &dyn TableNaming,
    topic: &str,
    consumer_group: &ConsumerGroup,
) -> LogQueueResult<()> {
    for identifier in naming.identifiers(topic, consumer_group) {
        if identifier.len() > MAX_IDENTIFIER_LEN {
            return Err(LogQueueError::InvalidName(format!(
                "Identifier {:?} exceeds {} bytes",
                identifier, MAX_IDENTIFIER_LEN
            )));
        }
    }

    Ok(())
}

/// All checks for a (topic, group) pair.
pub fn validate(
    naming: &dyn TableNaming,
    topic: &str,
    consumer_group: &ConsumerGroup,
) -> LogQueueResult<()> {
    validate_topic_name(topic)?;
    validate_consumer_group(consumer_group)?;
    validate_identifiers(naming, topic, consumer_group)
}
