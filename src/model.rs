use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message class, as declared by the producing system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Human,
    Automated,
    System,
}

/// Delivery priority.
///
/// `Max` is the safety-critical class: exempt from throttling, pushed ahead
/// of all normal work, and escalated operationally when undeliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Priority {
    Normal,
    High,
    Max,
}

/// Billing state as returned by the billing collaborator.
///
/// Opaque to this engine: it is set exactly once before enqueue and carried
/// through delivery untouched. Retries never re-invoke billing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BillingState(pub String);

impl BillingState {
    pub fn none() -> Self {
        BillingState("NONE".to_string())
    }
}

/// A durable message, created once at ingress.
///
/// `seq` is monotonic within the conversation and never reassigned on retry;
/// `feed_seq` is a process-wide monotonic counter giving cross-conversation
/// creation order for sync feeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub recipient_ids: Vec<Uuid>,
    /// Opaque reference to the message content; never interpreted here.
    pub payload_ref: String,
    pub kind: MessageKind,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub origin_region: String,
    pub billing_state: BillingState,
    pub client_message_id: String,
    pub seq: u64,
    pub feed_seq: u64,
}

/// Delivery record status. Transitions move forward only:
/// Pending -> Delivered | Failed; Failed -> Pending (scheduled retry) |
/// Dropped. Delivered and Dropped are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Dropped,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Dropped)
    }

    /// Whether the forward-only state machine admits this edge.
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Delivered) | (Pending, Failed) | (Pending, Dropped) | (Failed, Pending) | (Failed, Dropped)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DropReason {
    MaxAttempts,
    Permanent,
    Cancelled,
    Escalated,
}

/// One per (message, recipient, device): tracks that device's delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub message_id: Uuid,
    pub recipient_id: Uuid,
    pub device_id: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub drop_reason: Option<DropReason>,
    pub created_at: DateTime<Utc>,
    pub feed_seq: u64,
}

/// Key addressing a single delivery record within its partition.
pub type RecordKey = (Uuid, Uuid, String);

impl DeliveryRecord {
    pub fn key(&self) -> RecordKey {
        (self.message_id, self.recipient_id, self.device_id.clone())
    }
}

/// Per-device sync progress. `last_acked_feed_seq` is non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSyncState {
    pub user_id: Uuid,
    pub device_id: String,
    pub platform: String,
    pub last_acked_feed_seq: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

/// Region health as reported by the health-check interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegionHealth {
    Ok,
    Degraded,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionProfile {
    pub region: String,
    pub health: RegionHealth,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalKind {
    Typing,
    ReadReceipt,
}

/// Best-effort typing/read-receipt signal. Short TTL, never durable, never
/// retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralSignal {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub kind: SignalKind,
    pub sent_at: DateTime<Utc>,
}

// ============================================================================
// API types
// ============================================================================

/// A send submission, before admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub client_message_id: String,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub recipient_ids: Vec<Uuid>,
    pub payload_ref: String,
    pub kind: MessageKind,
    pub priority: Priority,
}

impl SubmitRequest {
    pub fn validate(&self) -> Result<()> {
        if self.client_message_id.is_empty() {
            anyhow::bail!("client_message_id is required");
        }
        if self.recipient_ids.is_empty() {
            anyhow::bail!("at least one recipient is required");
        }
        if self.payload_ref.is_empty() {
            anyhow::bail!("payload_ref is required");
        }
        if self.recipient_ids.contains(&self.sender_id) {
            anyhow::bail!("sender cannot be a recipient");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubmitStatus {
    Accepted,
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub message_id: Uuid,
    pub status: SubmitStatus,
}

/// Payload pushed over a live device connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPush {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub seq: u64,
    pub payload_ref: String,
    pub kind: MessageKind,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

impl DeliveryPush {
    pub fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            seq: message.seq,
            payload_ref: message.payload_ref.clone(),
            kind: message.kind,
            priority: message.priority,
            created_at: message.created_at,
        }
    }
}

/// Everything a connected device session can receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum DevicePush {
    Message(DeliveryPush),
    Signal(EphemeralSignal),
    /// Best-effort terminal "not delivered" notice to the sender.
    DeliveryFailure {
        message_id: Uuid,
        recipient_id: Uuid,
        reason: DropReason,
    },
}

/// One entry of a sync page, ordered by `cursor` (the feed sequence).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub cursor: u64,
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub seq: u64,
    pub payload_ref: String,
    pub kind: MessageKind,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    /// Status of this device's delivery record, Pending when the device has
    /// none (registered after enqueue).
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPage {
    pub records: Vec<SyncRecord>,
    /// Continuation cursor; None when the backlog is drained.
    pub next_cursor: Option<String>,
}
