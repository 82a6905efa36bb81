// ============================================================================
// Audit Events - Operational Visibility
// ============================================================================
//
// Every DROPPED record, reroute, rate-limit rejection and MAX-priority
// escalation is reported to the audit collaborator. Audit records are
// append-only and structured for SIEM ingestion; the default sink writes
// them to the `audit` tracing target as JSON.
//
// ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    /// A delivery record reached DROPPED.
    RecordDropped,
    /// A message was admitted through a failover region.
    MessageRerouted,
    /// A rerouted message was replayed into its recovered home region.
    RegionReconciled,
    /// A sender was rejected by the rate limiter.
    RateLimitRejection,
    /// A MAX-priority record could not be delivered within its deadline;
    /// operational follow-up is mandatory.
    MaxPriorityEscalation,
    /// A sender cancelled a message within the grace window.
    MessageCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    pub kind: AuditEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AuditRecord {
    pub fn new(kind: AuditEventKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
            message_id: None,
            user_id: None,
            region: None,
            details: None,
        }
    }

    pub fn message(mut self, message_id: Uuid) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Audit/observability collaborator.
///
/// Implementations must be cheap and non-blocking; the engine calls this
/// inline from delivery workers.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Default sink: structured log line on the `audit` target.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        tracing::info!(
            target: "audit",
            kind = ?record.kind,
            message_id = ?record.message_id,
            user_id = ?record.user_id,
            region = record.region.as_deref(),
            details = record.details.as_deref(),
            json = %record.to_json(),
            "Audit event"
        );
    }
}

/// Test/inspection sink collecting records in memory.
#[derive(Default)]
pub struct CollectingAuditSink {
    records: std::sync::Mutex<Vec<AuditRecord>>,
}

impl CollectingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().expect("audit sink poisoned").clone()
    }

    pub fn count_of(&self, kind: AuditEventKind) -> usize {
        self.records().iter().filter(|r| r.kind == kind).count()
    }
}

impl AuditSink for CollectingAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records.lock().expect("audit sink poisoned").push(record);
    }
}
