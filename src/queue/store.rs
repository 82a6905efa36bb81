use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::RetentionConfig;
use crate::model::{DeliveryRecord, DeliveryStatus, Message, RecordKey};

/// Where a message lives: its partition and position in the global feed.
#[derive(Debug, Clone, Copy)]
pub struct MessageLoc {
    pub partition: usize,
    pub feed_seq: u64,
}

/// Dedup entry for a clientMessageId within the dedup window.
#[derive(Debug, Clone)]
pub struct DedupEntry {
    pub message_id: Uuid,
    pub inserted_at: DateTime<Utc>,
}

/// One partition's worth of queue state. Owned by a single async mutex;
/// a conversation always hashes to the same partition, which is what
/// preserves per-conversation FIFO without global locks.
#[derive(Default)]
pub struct Partition {
    /// Next per-conversation sequence number.
    pub next_seq: HashMap<Uuid, u64>,
    pub messages: HashMap<Uuid, Message>,
    pub records: HashMap<RecordKey, DeliveryRecord>,
    /// Global-feed ordering of this partition's messages.
    pub by_feed: BTreeMap<u64, Uuid>,
}

pub struct PartitionPurge {
    pub records_purged: usize,
    pub messages_purged: usize,
    /// Locator entries to drop (message ids removed here).
    pub removed_messages: Vec<Uuid>,
}

impl Partition {
    pub fn allocate_seq(&mut self, conversation_id: Uuid) -> u64 {
        let next = self.next_seq.entry(conversation_id).or_insert(0);
        let seq = *next;
        *next += 1;
        seq
    }

    /// Remove terminal records and expired messages for one retention pass.
    ///
    /// DELIVERED records go after the delivered retention; FAILED/DROPPED
    /// are kept longer for audit. Messages leave with the delivered
    /// retention window (the sync backlog horizon); their still-pending
    /// records leave with them.
    pub fn purge(&mut self, retention: &RetentionConfig, now: DateTime<Utc>) -> PartitionPurge {
        let delivered_horizon = now - Duration::days(retention.delivered_retention_days);
        let failed_horizon = now - Duration::days(retention.failed_retention_days);

        let before_records = self.records.len();
        self.records.retain(|_, record| match record.status {
            DeliveryStatus::Delivered => record
                .delivered_at
                .map(|at| at > delivered_horizon)
                .unwrap_or(true),
            DeliveryStatus::Failed | DeliveryStatus::Dropped => {
                record.created_at > failed_horizon
            }
            DeliveryStatus::Pending => true,
        });

        let mut removed_messages = Vec::new();
        self.messages.retain(|id, message| {
            if message.created_at > delivered_horizon {
                return true;
            }
            removed_messages.push(*id);
            false
        });
        for id in &removed_messages {
            // Pending records leave with their message; FAILED/DROPPED stay
            // until the audit horizon.
            self.records.retain(|key, record| {
                key.0 != *id
                    || matches!(
                        record.status,
                        DeliveryStatus::Failed | DeliveryStatus::Dropped
                    )
            });
        }
        self.by_feed
            .retain(|_, message_id| !removed_messages.contains(message_id));

        PartitionPurge {
            records_purged: before_records.saturating_sub(self.records.len()),
            messages_purged: removed_messages.len(),
            removed_messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BillingState, MessageKind, Priority};

    fn message_at(created_at: DateTime<Utc>, feed_seq: u64) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            recipient_ids: vec![Uuid::new_v4()],
            payload_ref: "blob://p".to_string(),
            kind: MessageKind::Human,
            priority: Priority::Normal,
            created_at,
            origin_region: "eu-west".to_string(),
            billing_state: BillingState::none(),
            client_message_id: format!("c-{feed_seq}"),
            seq: 0,
            feed_seq,
        }
    }

    fn record_for(message: &Message, status: DeliveryStatus) -> DeliveryRecord {
        DeliveryRecord {
            message_id: message.id,
            recipient_id: message.recipient_ids[0],
            device_id: "phone".to_string(),
            status,
            attempts: 0,
            next_retry_at: None,
            last_error: None,
            delivered_at: if status == DeliveryStatus::Delivered {
                Some(message.created_at)
            } else {
                None
            },
            drop_reason: None,
            created_at: message.created_at,
            feed_seq: message.feed_seq,
        }
    }

    fn retention() -> RetentionConfig {
        RetentionConfig {
            delivered_retention_days: 7,
            failed_retention_days: 30,
            cleanup_interval_secs: 300,
            reconcile_interval_secs: 60,
            typing_ttl_secs: 10,
            receipt_ttl_secs: 60,
        }
    }

    #[test]
    fn sequences_are_monotonic_per_conversation() {
        let mut partition = Partition::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(partition.allocate_seq(a), 0);
        assert_eq!(partition.allocate_seq(a), 1);
        assert_eq!(partition.allocate_seq(b), 0);
        assert_eq!(partition.allocate_seq(a), 2);
    }

    #[test]
    fn purge_respects_the_two_retention_horizons() {
        let mut partition = Partition::default();
        let now = Utc::now();

        // Fresh message: untouched.
        let fresh = message_at(now, 1);
        partition.records.insert(
            record_for(&fresh, DeliveryStatus::Delivered).key(),
            record_for(&fresh, DeliveryStatus::Delivered),
        );
        partition.by_feed.insert(1, fresh.id);
        partition.messages.insert(fresh.id, fresh);

        // Ten days old: delivered record and message purged, dropped record
        // survives the longer audit horizon.
        let old = message_at(now - Duration::days(10), 2);
        partition.records.insert(
            record_for(&old, DeliveryStatus::Delivered).key(),
            record_for(&old, DeliveryStatus::Delivered),
        );
        let mut dropped = record_for(&old, DeliveryStatus::Dropped);
        dropped.device_id = "tablet".to_string();
        let dropped_key = dropped.key();
        partition.records.insert(dropped_key.clone(), dropped);
        partition.by_feed.insert(2, old.id);
        let old_id = old.id;
        partition.messages.insert(old.id, old);

        let purge = partition.purge(&retention(), now);
        assert_eq!(purge.messages_purged, 1);
        assert!(purge.removed_messages.contains(&old_id));
        assert_eq!(partition.messages.len(), 1);
        assert_eq!(partition.by_feed.len(), 1);
        // The dropped record outlives its purged message until the audit
        // horizon; the stale delivered record is gone.
        assert_eq!(partition.records.len(), 2);
        assert!(partition.records.contains_key(&dropped_key));
    }

    #[test]
    fn purge_keeps_recent_dropped_records_for_audit() {
        let mut partition = Partition::default();
        let now = Utc::now();

        let message = message_at(now - Duration::days(2), 3);
        let dropped = record_for(&message, DeliveryStatus::Dropped);
        partition.records.insert(dropped.key(), dropped);
        partition.by_feed.insert(3, message.id);
        partition.messages.insert(message.id, message);

        let purge = partition.purge(&retention(), now);
        assert_eq!(purge.records_purged, 0);
        assert_eq!(purge.messages_purged, 0);
        assert_eq!(partition.records.len(), 1);
    }
}
