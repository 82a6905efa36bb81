// ============================================================================
// Delivery Dispatcher - Per-Partition Workers
// ============================================================================
//
// One worker task per queue partition: a conversation is always handled by
// the same worker, which preserves per-conversation delivery order without
// any global lock. Workers sleep on a Notify plus the earliest retry
// deadline; there is no polling loop.
//
// The MAX-priority lane is drained ahead of all normal work, retries with
// no backoff delay, and escalates operationally when its small attempt cap
// is exhausted.
//
// ============================================================================

mod backoff;

pub use backoff::retry_delay;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::audit::{AuditEventKind, AuditRecord, AuditSink};
use crate::config::{DispatchConfig, LoggingConfig};
use crate::error::EngineResult;
use crate::metrics;
use crate::model::{DeliveryPush, DeliveryRecord, DevicePush, DropReason, Message, Priority, RecordKey};
use crate::presence::SharedRegistry;
use crate::queue::MessageQueue;
use crate::utils::log_safe_id;

/// Result of a transport push that completed without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// No live connection for the device; the record stays PENDING for
    /// pull via offline sync (normal lanes) or escalates (MAX lane).
    NotConnected,
}

/// Push seam between the dispatcher and whatever carries bytes to devices.
/// The in-process connection registry is the default implementation; tests
/// inject flaky ones.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(
        &self,
        recipient_id: Uuid,
        device_id: &str,
        push: DeliveryPush,
    ) -> EngineResult<DeliveryOutcome>;
}

#[derive(Default)]
struct Schedule {
    max_lane: VecDeque<RecordKey>,
    ready: VecDeque<RecordKey>,
    delayed: BinaryHeap<Reverse<(Instant, RecordKey)>>,
}

impl Schedule {
    /// Promote due retries, then hand out MAX work ahead of everything.
    fn pop_due(&mut self, now: Instant) -> Option<RecordKey> {
        loop {
            match self.delayed.peek() {
                Some(Reverse((at, _))) if *at <= now => {
                    let Reverse((_, key)) = self.delayed.pop().expect("peeked entry");
                    self.ready.push_back(key);
                }
                _ => break,
            }
        }
        self.max_lane.pop_front().or_else(|| self.ready.pop_front())
    }

    fn earliest_delay(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((at, _))| *at)
    }
}

struct Shard {
    schedule: std::sync::Mutex<Schedule>,
    notify: Notify,
}

impl Shard {
    fn new() -> Self {
        Self {
            schedule: std::sync::Mutex::new(Schedule::default()),
            notify: Notify::new(),
        }
    }

    fn push(&self, key: RecordKey, priority: Priority) {
        {
            let mut schedule = self.schedule.lock().expect("shard schedule poisoned");
            if priority == Priority::Max {
                schedule.max_lane.push_back(key);
            } else {
                schedule.ready.push_back(key);
            }
        }
        self.notify.notify_one();
    }

    fn push_delayed(&self, key: RecordKey, at: Instant) {
        {
            let mut schedule = self.schedule.lock().expect("shard schedule poisoned");
            schedule.delayed.push(Reverse((at, key)));
        }
        // The new deadline may be earlier than the one the worker sleeps on.
        self.notify.notify_one();
    }
}

pub struct Dispatcher {
    cfg: DispatchConfig,
    logging: LoggingConfig,
    queue: Arc<MessageQueue>,
    transport: Arc<dyn DeliveryTransport>,
    presence: SharedRegistry,
    audit: Arc<dyn AuditSink>,
    shards: Vec<Shard>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        cfg: DispatchConfig,
        logging: LoggingConfig,
        queue: Arc<MessageQueue>,
        transport: Arc<dyn DeliveryTransport>,
        presence: SharedRegistry,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let shards = (0..queue.partition_count()).map(|_| Shard::new()).collect();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            cfg,
            logging,
            queue,
            transport,
            presence,
            audit,
            shards,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Identifier for log output, hashed unless raw identifiers are enabled.
    fn loggable(&self, id: &Uuid) -> String {
        if self.logging.enable_user_identifiers {
            id.to_string()
        } else {
            log_safe_id(&id.to_string(), &self.logging.hash_salt)
        }
    }

    /// Hand freshly enqueued records to their partition's worker.
    pub fn dispatch(&self, partition: usize, keys: &[RecordKey], priority: Priority) {
        let shard = &self.shards[partition];
        for key in keys {
            shard.push(key.clone(), priority);
        }
    }

    /// Reconnect nudge: push every still-pending record for the device so
    /// it is delivered now instead of waiting for a pull.
    pub async fn nudge_device(&self, user_id: Uuid, device_id: &str) {
        let pending = self.queue.pending_records_for(user_id, device_id).await;
        for (partition, key, priority) in pending {
            self.shards[partition].push(key, priority);
        }
    }

    /// Spawn one worker per partition. Workers run until `shutdown`.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.shards.len())
            .map(|idx| {
                let dispatcher = Arc::clone(self);
                tokio::spawn(async move { dispatcher.run_worker(idx).await })
            })
            .collect()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for shard in &self.shards {
            shard.notify.notify_one();
        }
    }

    async fn run_worker(self: Arc<Self>, idx: usize) {
        let shard = &self.shards[idx];
        let mut shutdown_rx = self.shutdown_rx.clone();
        tracing::debug!(partition = idx, "Delivery worker started");

        loop {
            loop {
                let key = {
                    let mut schedule = shard.schedule.lock().expect("shard schedule poisoned");
                    schedule.pop_due(Instant::now())
                };
                match key {
                    Some(key) => self.attempt(idx, key).await,
                    None => break,
                }
            }

            if *shutdown_rx.borrow() {
                break;
            }

            let deadline = {
                let schedule = shard.schedule.lock().expect("shard schedule poisoned");
                schedule.earliest_delay()
            };

            tokio::select! {
                _ = shard.notify.notified() => {}
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
                _ = shutdown_rx.changed() => {}
            }

            if *shutdown_rx.borrow() {
                break;
            }
        }
        tracing::debug!(partition = idx, "Delivery worker stopped");
    }

    /// One delivery attempt for one record.
    async fn attempt(&self, partition: usize, key: RecordKey) {
        let Some((record, message)) = self.queue.begin_attempt(partition, &key).await else {
            // Terminal (delivered, dropped, cancelled) since scheduling.
            return;
        };

        let push = DeliveryPush::from_message(&message);
        let timer = metrics::DELIVERY_ATTEMPT_SECONDS.start_timer();
        let outcome = tokio::time::timeout(
            self.cfg.attempt_timeout(),
            self.transport
                .deliver(record.recipient_id, &record.device_id, push),
        )
        .await;
        drop(timer);

        match outcome {
            Ok(Ok(DeliveryOutcome::Delivered)) => {
                if self.queue.complete(partition, &key).await {
                    metrics::DELIVERIES_TOTAL.inc();
                    tracing::debug!(
                        message_id = %record.message_id,
                        recipient_hash = %self.loggable(&record.recipient_id),
                        "Delivered"
                    );
                }
            }
            Ok(Ok(DeliveryOutcome::NotConnected)) => {
                if message.priority == Priority::Max {
                    // A safety message cannot sit and wait for a pull.
                    self.handle_failure(partition, &key, &record, &message, "recipient device offline")
                        .await;
                }
                // Otherwise the record stays PENDING; offline sync owns it
                // and a reconnect nudges this shard.
            }
            Ok(Err(err)) if !err.is_retryable() => {
                metrics::DELIVERY_FAILURES_TOTAL.inc();
                let detail = err.to_string();
                if let Some(dropped) = self
                    .queue
                    .drop_record(partition, &key, DropReason::Permanent, Some(&detail))
                    .await
                {
                    self.report_drop(&message, &dropped).await;
                }
            }
            Ok(Err(err)) => {
                self.handle_failure(partition, &key, &record, &message, &err.to_string())
                    .await;
            }
            Err(_) => {
                self.handle_failure(partition, &key, &record, &message, "delivery attempt timed out")
                    .await;
            }
        }
    }

    /// Transient failure: count the attempt, then retry or drop.
    async fn handle_failure(
        &self,
        partition: usize,
        key: &RecordKey,
        record: &DeliveryRecord,
        message: &Message,
        error: &str,
    ) {
        metrics::DELIVERY_FAILURES_TOTAL.inc();
        let is_max = message.priority == Priority::Max;
        let attempts_after = record.attempts + 1;
        let cap = if is_max {
            self.cfg.max_lane_attempts
        } else {
            self.cfg.max_attempts
        };

        if attempts_after >= cap {
            self.queue.fail(partition, key, error, None).await;
            let reason = if is_max {
                DropReason::Escalated
            } else {
                DropReason::MaxAttempts
            };
            if let Some(dropped) = self
                .queue
                .drop_record(partition, key, reason, Some(error))
                .await
            {
                self.report_drop(message, &dropped).await;
            }
            return;
        }

        if is_max {
            // No backoff on the safety lane: fail, requeue ahead of
            // everything, attempt again immediately.
            self.queue
                .fail(partition, key, error, Some(Utc::now()))
                .await;
            self.shards[partition].push(key.clone(), Priority::Max);
        } else {
            let delay = retry_delay(attempts_after, self.cfg.backoff_base(), self.cfg.backoff_cap());
            let retry_at = Utc::now()
                + chrono::Duration::milliseconds(delay.as_millis() as i64);
            self.queue
                .fail(partition, key, error, Some(retry_at))
                .await;
            self.shards[partition].push_delayed(key.clone(), Instant::now() + delay);
            tracing::debug!(
                message_id = %record.message_id,
                attempts = attempts_after,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Delivery failed, retry scheduled"
            );
        }
    }

    /// Terminal drop: audit entry, metrics, best-effort sender notice.
    async fn report_drop(&self, message: &Message, dropped: &DeliveryRecord) {
        metrics::RECORDS_DROPPED_TOTAL.inc();
        let reason = dropped.drop_reason.unwrap_or(DropReason::MaxAttempts);

        self.audit.record(
            AuditRecord::new(AuditEventKind::RecordDropped)
                .message(dropped.message_id)
                .user(dropped.recipient_id)
                .details(format!(
                    "device {} after {} attempts: {}",
                    dropped.device_id,
                    dropped.attempts,
                    dropped.last_error.as_deref().unwrap_or("unknown")
                )),
        );
        if reason == DropReason::Escalated {
            self.audit.record(
                AuditRecord::new(AuditEventKind::MaxPriorityEscalation)
                    .message(dropped.message_id)
                    .user(dropped.recipient_id)
                    .details("safety-priority delivery undeliverable, operational follow-up required"),
            );
        }

        let notified = self
            .presence
            .send_to_user(
                message.sender_id,
                DevicePush::DeliveryFailure {
                    message_id: dropped.message_id,
                    recipient_id: dropped.recipient_id,
                    reason,
                },
            )
            .await;
        tracing::warn!(
            message_id = %dropped.message_id,
            recipient_hash = %self.loggable(&dropped.recipient_id),
            reason = ?reason,
            sender_sessions_notified = notified,
            "Delivery record dropped"
        );
    }
}
