// ============================================================================
// Message Queue - Durable, Partitioned, Per-Conversation FIFO
// ============================================================================
//
// Messages are append-only and partitioned by a hash of conversationId, so
// one conversation is always served by the same partition (and the same
// dispatcher worker). Enqueue creates the Message and every DeliveryRecord
// inside a single partition lock; readers never observe a partial message.
//
// Enqueue is idempotent on (senderId, clientMessageId) within the dedup
// window: client-side retransmission of the same send never creates a
// second Message.
//
// ============================================================================

mod store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Duration, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

pub use store::MessageLoc;
use store::{DedupEntry, Partition};

use crate::config::{QueueConfig, RetentionConfig};
use crate::error::{EngineError, EngineResult, RejectReason};
use crate::metrics;
use crate::model::{
    BillingState, DeliveryRecord, DeliveryStatus, DropReason, Message, MessageKind, Priority,
    RecordKey, SyncRecord,
};
use crate::utils::partition_for;

/// Input to `enqueue`: an admitted, billed, routed message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub client_message_id: String,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub recipient_ids: Vec<Uuid>,
    pub payload_ref: String,
    pub kind: MessageKind,
    pub priority: Priority,
    pub origin_region: String,
    pub billing_state: BillingState,
}

#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Enqueued {
        message_id: Uuid,
        partition: usize,
        records: Vec<RecordKey>,
    },
    /// The clientMessageId was seen inside the dedup window; no new state.
    Duplicate { message_id: Uuid },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PurgeStats {
    pub messages_purged: usize,
    pub records_purged: usize,
    pub dedup_purged: usize,
}

pub struct MessageQueue {
    cfg: QueueConfig,
    partitions: Vec<Mutex<Partition>>,
    locator: RwLock<HashMap<Uuid, MessageLoc>>,
    dedup: Mutex<HashMap<(Uuid, String), DedupEntry>>,
    feed_seq: AtomicU64,
}

impl MessageQueue {
    pub fn new(cfg: QueueConfig) -> Self {
        let partitions = (0..cfg.partition_count.max(1))
            .map(|_| Mutex::new(Partition::default()))
            .collect();
        Self {
            cfg,
            partitions,
            locator: RwLock::new(HashMap::new()),
            dedup: Mutex::new(HashMap::new()),
            feed_seq: AtomicU64::new(1),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition_of(&self, conversation_id: Uuid) -> usize {
        partition_for(&conversation_id, self.partitions.len())
    }

    /// Fast duplicate probe for the submit path, so billing is never
    /// consulted twice for a retransmission. The authoritative check runs
    /// again inside `enqueue`.
    pub async fn peek_duplicate(
        &self,
        sender_id: Uuid,
        client_message_id: &str,
    ) -> Option<Uuid> {
        let dedup = self.dedup.lock().await;
        dedup
            .get(&(sender_id, client_message_id.to_string()))
            .filter(|entry| self.dedup_fresh(entry))
            .map(|entry| entry.message_id)
    }

    fn dedup_fresh(&self, entry: &DedupEntry) -> bool {
        Utc::now() - entry.inserted_at < Duration::seconds(self.cfg.dedup_window_secs)
    }

    /// Atomically create the Message and one PENDING DeliveryRecord per
    /// (recipient, registered device). Devices registered after this point
    /// receive the message through sync backlog instead.
    pub async fn enqueue(
        &self,
        new: NewMessage,
        recipient_devices: HashMap<Uuid, Vec<String>>,
    ) -> EngineResult<EnqueueOutcome> {
        let message_id = Uuid::new_v4();

        {
            let mut dedup = self.dedup.lock().await;
            let key = (new.sender_id, new.client_message_id.clone());
            if let Some(entry) = dedup.get(&key) {
                if self.dedup_fresh(entry) {
                    metrics::MESSAGES_DUPLICATE_TOTAL.inc();
                    tracing::debug!(
                        message_id = %entry.message_id,
                        "Duplicate clientMessageId inside dedup window"
                    );
                    return Ok(EnqueueOutcome::Duplicate {
                        message_id: entry.message_id,
                    });
                }
            }
            dedup.insert(
                key,
                DedupEntry {
                    message_id,
                    inserted_at: Utc::now(),
                },
            );
        }

        let partition_idx = self.partition_of(new.conversation_id);
        let feed_seq = self.feed_seq.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();

        let mut records = Vec::new();
        {
            let mut partition = self.partitions[partition_idx].lock().await;
            let seq = partition.allocate_seq(new.conversation_id);

            let message = Message {
                id: message_id,
                conversation_id: new.conversation_id,
                sender_id: new.sender_id,
                recipient_ids: new.recipient_ids.clone(),
                payload_ref: new.payload_ref,
                kind: new.kind,
                priority: new.priority,
                created_at: now,
                origin_region: new.origin_region,
                billing_state: new.billing_state,
                client_message_id: new.client_message_id,
                seq,
                feed_seq,
            };

            for recipient_id in &new.recipient_ids {
                for device_id in recipient_devices
                    .get(recipient_id)
                    .map(|devices| devices.as_slice())
                    .unwrap_or(&[])
                {
                    let record = DeliveryRecord {
                        message_id,
                        recipient_id: *recipient_id,
                        device_id: device_id.clone(),
                        status: DeliveryStatus::Pending,
                        attempts: 0,
                        next_retry_at: None,
                        last_error: None,
                        delivered_at: None,
                        drop_reason: None,
                        created_at: now,
                        feed_seq,
                    };
                    records.push(record.key());
                    partition.records.insert(record.key(), record);
                }
            }

            partition.by_feed.insert(feed_seq, message_id);
            partition.messages.insert(message_id, message);
        }

        self.locator.write().await.insert(
            message_id,
            MessageLoc {
                partition: partition_idx,
                feed_seq,
            },
        );

        metrics::MESSAGES_ENQUEUED_TOTAL.inc();
        tracing::debug!(
            message_id = %message_id,
            partition = partition_idx,
            records = records.len(),
            "Message enqueued"
        );

        Ok(EnqueueOutcome::Enqueued {
            message_id,
            partition: partition_idx,
            records,
        })
    }

    pub async fn locate(&self, message_id: Uuid) -> Option<MessageLoc> {
        self.locator.read().await.get(&message_id).copied()
    }

    pub async fn get_message(&self, message_id: Uuid) -> Option<Message> {
        let loc = self.locate(message_id).await?;
        let partition = self.partitions[loc.partition].lock().await;
        partition.messages.get(&message_id).cloned()
    }

    pub async fn get_record(&self, key: &RecordKey) -> Option<DeliveryRecord> {
        let loc = self.locate(key.0).await?;
        let partition = self.partitions[loc.partition].lock().await;
        partition.records.get(key).cloned()
    }

    /// Reassign a message's owning region after reconciliation.
    pub async fn reassign_origin(&self, message_id: Uuid, region: &str) {
        if let Some(loc) = self.locate(message_id).await {
            let mut partition = self.partitions[loc.partition].lock().await;
            if let Some(message) = partition.messages.get_mut(&message_id) {
                message.origin_region = region.to_string();
            }
        }
    }

    /// Cancel a message inside the grace window, before its first delivery
    /// attempt. PENDING records become DROPPED(Cancelled); anything already
    /// delivered stays delivered (no retraction).
    pub async fn cancel(
        &self,
        message_id: Uuid,
        sender_id: Uuid,
    ) -> EngineResult<Vec<DeliveryRecord>> {
        let loc = self
            .locate(message_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("message {message_id}")))?;

        let mut partition = self.partitions[loc.partition].lock().await;
        let message = partition
            .messages
            .get(&message_id)
            .ok_or_else(|| EngineError::NotFound(format!("message {message_id}")))?;

        if message.sender_id != sender_id {
            return Err(EngineError::NotFound(format!("message {message_id}")));
        }
        let grace = Duration::milliseconds(self.cfg.cancel_grace_ms as i64);
        if Utc::now() - message.created_at > grace {
            return Err(EngineError::validation(RejectReason::CancelWindowElapsed));
        }

        let mut dropped = Vec::new();
        for record in partition.records.values_mut() {
            if record.message_id == message_id
                && record.status == DeliveryStatus::Pending
                && record.attempts == 0
            {
                record.status = DeliveryStatus::Dropped;
                record.drop_reason = Some(DropReason::Cancelled);
                dropped.push(record.clone());
            }
        }
        Ok(dropped)
    }

    // ========================================================================
    // Dispatcher-facing record state machine
    // ========================================================================

    /// Claim a record for one delivery attempt. A FAILED record re-enters
    /// PENDING here (the scheduled retry firing); terminal records return
    /// None and the attempt is skipped.
    pub async fn begin_attempt(
        &self,
        partition_idx: usize,
        key: &RecordKey,
    ) -> Option<(DeliveryRecord, Message)> {
        let mut partition = self.partitions[partition_idx].lock().await;
        let record = partition.records.get_mut(key)?;
        match record.status {
            DeliveryStatus::Pending => {}
            DeliveryStatus::Failed => {
                record.status = DeliveryStatus::Pending;
                record.next_retry_at = None;
            }
            DeliveryStatus::Delivered | DeliveryStatus::Dropped => return None,
        }
        let record = record.clone();
        let message = partition.messages.get(&key.0)?.clone();
        Some((record, message))
    }

    /// Pending -> Delivered. Returns false if the record moved elsewhere
    /// while the push was in flight (e.g. a racing cancel; at-least-once
    /// allows the push to have landed anyway).
    pub async fn complete(&self, partition_idx: usize, key: &RecordKey) -> bool {
        let mut partition = self.partitions[partition_idx].lock().await;
        let Some(record) = partition.records.get_mut(key) else {
            return false;
        };
        if !record.status.can_transition_to(DeliveryStatus::Delivered) {
            return false;
        }
        record.status = DeliveryStatus::Delivered;
        record.delivered_at = Some(Utc::now());
        record.last_error = None;
        true
    }

    /// Pending -> Failed with the attempt counted and the retry deadline
    /// recorded.
    pub async fn fail(
        &self,
        partition_idx: usize,
        key: &RecordKey,
        error: &str,
        next_retry_at: Option<chrono::DateTime<Utc>>,
    ) -> Option<DeliveryRecord> {
        let mut partition = self.partitions[partition_idx].lock().await;
        let record = partition.records.get_mut(key)?;
        if !record.status.can_transition_to(DeliveryStatus::Failed) {
            return None;
        }
        record.status = DeliveryStatus::Failed;
        record.attempts += 1;
        record.last_error = Some(error.to_string());
        record.next_retry_at = next_retry_at;
        Some(record.clone())
    }

    /// Terminal drop, from Pending or Failed.
    pub async fn drop_record(
        &self,
        partition_idx: usize,
        key: &RecordKey,
        reason: DropReason,
        error: Option<&str>,
    ) -> Option<DeliveryRecord> {
        let mut partition = self.partitions[partition_idx].lock().await;
        let record = partition.records.get_mut(key)?;
        if !record.status.can_transition_to(DeliveryStatus::Dropped) {
            return None;
        }
        record.status = DeliveryStatus::Dropped;
        record.drop_reason = Some(reason);
        if let Some(error) = error {
            record.last_error = Some(error.to_string());
        }
        Some(record.clone())
    }

    // ========================================================================
    // Sync-facing reads
    // ========================================================================

    /// Records still PENDING for one device, for the reconnect nudge.
    pub async fn pending_records_for(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> Vec<(usize, RecordKey, Priority)> {
        let mut out = Vec::new();
        for (idx, slot) in self.partitions.iter().enumerate() {
            let partition = slot.lock().await;
            for record in partition.records.values() {
                if record.recipient_id == user_id
                    && record.device_id == device_id
                    && record.status == DeliveryStatus::Pending
                {
                    let priority = partition
                        .messages
                        .get(&record.message_id)
                        .map(|m| m.priority)
                        .unwrap_or(Priority::Normal);
                    out.push((idx, record.key(), priority));
                }
            }
        }
        out
    }

    /// Snapshot scan of a user's feed after the given cursor, in feed
    /// order, annotated with this device's record status. Each partition is
    /// copied out under its own brief lock; writers are never blocked for
    /// the whole scan.
    pub async fn scan_feed(
        &self,
        user_id: Uuid,
        device_id: &str,
        after: u64,
        limit: usize,
    ) -> Vec<SyncRecord> {
        let mut merged: Vec<SyncRecord> = Vec::new();
        for slot in self.partitions.iter() {
            let partition = slot.lock().await;
            for (feed_seq, message_id) in partition.by_feed.range(after.saturating_add(1)..) {
                let Some(message) = partition.messages.get(message_id) else {
                    continue;
                };
                if !message.recipient_ids.contains(&user_id) {
                    continue;
                }
                let status = partition
                    .records
                    .get(&(*message_id, user_id, device_id.to_string()))
                    .map(|record| record.status)
                    .unwrap_or(DeliveryStatus::Pending);
                merged.push(SyncRecord {
                    cursor: *feed_seq,
                    message_id: *message_id,
                    conversation_id: message.conversation_id,
                    sender_id: message.sender_id,
                    seq: message.seq,
                    payload_ref: message.payload_ref.clone(),
                    kind: message.kind,
                    priority: message.priority,
                    created_at: message.created_at,
                    status,
                });
            }
        }
        merged.sort_by_key(|record| record.cursor);
        merged.truncate(limit);
        merged
    }

    /// Mark this device's PENDING records up to the acked feed position as
    /// DELIVERED (the device has them; the push lane no longer owes them).
    pub async fn settle_acked(
        &self,
        user_id: Uuid,
        device_id: &str,
        up_to_feed_seq: u64,
    ) -> usize {
        let now = Utc::now();
        let mut settled = 0;
        for slot in self.partitions.iter() {
            let mut partition = slot.lock().await;
            for record in partition.records.values_mut() {
                if record.recipient_id == user_id
                    && record.device_id == device_id
                    && record.feed_seq <= up_to_feed_seq
                    && !record.status.is_terminal()
                {
                    record.status = DeliveryStatus::Delivered;
                    record.delivered_at = Some(now);
                    settled += 1;
                }
            }
        }
        settled
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// One batched retention pass. Idempotent; runs off the hot path.
    pub async fn purge_expired(&self, retention: &RetentionConfig) -> PurgeStats {
        let now = Utc::now();
        let mut stats = PurgeStats::default();
        let mut removed = Vec::new();

        for slot in self.partitions.iter() {
            let mut partition = slot.lock().await;
            let purge = partition.purge(retention, now);
            stats.messages_purged += purge.messages_purged;
            stats.records_purged += purge.records_purged;
            removed.extend(purge.removed_messages);
        }

        if !removed.is_empty() {
            let mut locator = self.locator.write().await;
            for id in &removed {
                locator.remove(id);
            }
        }

        {
            let mut dedup = self.dedup.lock().await;
            let before = dedup.len();
            let window = Duration::seconds(self.cfg.dedup_window_secs);
            dedup.retain(|_, entry| now - entry.inserted_at < window);
            stats.dedup_purged = before - dedup.len();
        }

        if stats.messages_purged > 0 || stats.records_purged > 0 || stats.dedup_purged > 0 {
            tracing::info!(
                messages = stats.messages_purged,
                records = stats.records_purged,
                dedup = stats.dedup_purged,
                "Retention pass completed"
            );
        }
        stats
    }

    /// Liveness probe used by the health endpoint.
    pub async fn ping(&self) -> EngineResult<()> {
        let _ = self.partitions[0].lock().await;
        Ok(())
    }
}
