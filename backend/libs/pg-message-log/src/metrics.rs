//! Prometheus metrics for the message log
//!
//! Tracks inserted, claimed and acknowledged messages plus claim conflicts

use prometheus::{register_int_counter_vec, IntCounterVec};

lazy_static::lazy_static! {
    /// Messages appended to a topic
    static ref MESSAGES_INSERTED: IntCounterVec = register_int_counter_vec!(
        "message_log_inserted_total",
        "Messages inserted into the log",
        &["topic"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Messages claimed by a consumer group
    static ref MESSAGES_CLAIMED: IntCounterVec = register_int_counter_vec!(
        "message_log_claimed_total",
        "Messages claimed by a consumer group",
        &["topic", "consumer_group"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Offsets acknowledged by a consumer group
    static ref MESSAGES_ACKED: IntCounterVec = register_int_counter_vec!(
        "message_log_acked_total",
        "Offsets acknowledged by a consumer group",
        &["topic", "consumer_group"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Claims lost to a racing consumer
    static ref CLAIM_CONFLICTS: IntCounterVec = register_int_counter_vec!(
        "message_log_claim_conflicts_total",
        "Claims that collided with a concurrent consumer",
        &["topic", "consumer_group"]
    ).expect("Prometheus metrics registration should succeed at startup");
}

pub(crate) fn record_inserted(topic: &str, count: usize) {
    MESSAGES_INSERTED
        .with_label_values(&[topic])
        .inc_by(count as u64);
}

pub(crate) fn record_claimed(topic: &str, consumer_group: &str) {
    MESSAGES_CLAIMED
        .with_label_values(&[topic, consumer_group])
        .inc();
}

pub(crate) fn record_acked(topic: &str, consumer_group: &str) {
    MESSAGES_ACKED
        .with_label_values(&[topic, consumer_group])
        .inc();
}

pub(crate) fn record_conflict(topic: &str, consumer_group: &str) {
    CLAIM_CONFLICTS
        .with_label_values(&[topic, consumer_group])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let before = MESSAGES_INSERTED.with_label_values(&["metrics-test"]).get();
        record_inserted("metrics-test", 3);
        record_inserted("metrics-test", 2);
        assert_eq!(
            MESSAGES_INSERTED.with_label_values(&["metrics-test"]).get(),
            before + 5
        );

        record_conflict("metrics-test", "billing");
        assert!(
            CLAIM_CONFLICTS
                .with_label_values(&["metrics-test", "billing"])
                .get()
                >= 1
        );
    }
}
