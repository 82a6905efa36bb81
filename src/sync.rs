use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{EngineError, EngineResult, RejectReason};
use crate::metrics;
use crate::model::{DeviceSyncState, SyncPage};
use crate::queue::MessageQueue;

/// Offline sync: per-device cursors and catch-up retrieval on reconnect.
///
/// Each device tracks its own progress through the user's feed; there is no
/// cross-device deduplication, only per-device monotonic advance via `ack`.
/// A freshly registered device (no cursor) receives the full backlog within
/// the retention window.
pub struct SyncService {
    cfg: SyncConfig,
    queue: Arc<MessageQueue>,
    devices: RwLock<HashMap<(Uuid, String), DeviceSyncState>>,
}

impl SyncService {
    pub fn new(cfg: SyncConfig, queue: Arc<MessageQueue>) -> Self {
        Self {
            cfg,
            queue,
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_device(&self, user_id: Uuid, device_id: &str, platform: &str) {
        let mut devices = self.devices.write().await;
        devices
            .entry((user_id, device_id.to_string()))
            .or_insert_with(|| DeviceSyncState {
                user_id,
                device_id: device_id.to_string(),
                platform: platform.to_string(),
                last_acked_feed_seq: 0,
                last_sync_at: None,
                registered_at: Utc::now(),
            });
        tracing::debug!(device_id = %device_id, platform = %platform, "Device registered");
    }

    pub async fn device_state(&self, user_id: Uuid, device_id: &str) -> Option<DeviceSyncState> {
        self.devices
            .read()
            .await
            .get(&(user_id, device_id.to_string()))
            .cloned()
    }

    /// Devices registered for one user, used at enqueue time to
    /// materialize delivery records.
    pub async fn devices_for(&self, user_id: Uuid) -> Vec<String> {
        self.devices
            .read()
            .await
            .keys()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, device)| device.clone())
            .collect()
    }

    pub async fn devices_for_recipients(
        &self,
        recipient_ids: &[Uuid],
    ) -> HashMap<Uuid, Vec<String>> {
        let mut out = HashMap::new();
        for recipient_id in recipient_ids {
            out.insert(*recipient_id, self.devices_for(*recipient_id).await);
        }
        out
    }

    /// One page of catch-up, ordered and deduplicated, with a continuation
    /// cursor while more remains. With no explicit cursor the device resumes
    /// from its acked position, which is zero for a fresh device: the full
    /// backlog.
    pub async fn sync(
        &self,
        user_id: Uuid,
        device_id: &str,
        cursor: Option<&str>,
    ) -> EngineResult<SyncPage> {
        let after = match cursor {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| EngineError::validation(RejectReason::Malformed))?,
            None => self
                .device_state(user_id, device_id)
                .await
                .map(|state| state.last_acked_feed_seq)
                .unwrap_or(0),
        };

        let records = self
            .queue
            .scan_feed(user_id, device_id, after, self.cfg.page_size)
            .await;
        let next_cursor = if records.len() == self.cfg.page_size {
            records.last().map(|record| record.cursor.to_string())
        } else {
            None
        };

        {
            // First contact from an unknown device registers it implicitly;
            // its records start with the next enqueue.
            let mut devices = self.devices.write().await;
            let state = devices
                .entry((user_id, device_id.to_string()))
                .or_insert_with(|| DeviceSyncState {
                    user_id,
                    device_id: device_id.to_string(),
                    platform: "unknown".to_string(),
                    last_acked_feed_seq: 0,
                    last_sync_at: None,
                    registered_at: Utc::now(),
                });
            state.last_sync_at = Some(Utc::now());
        }

        metrics::SYNC_PAGES_TOTAL.inc();
        tracing::debug!(
            device_id = %device_id,
            after = after,
            records = records.len(),
            "Sync page served"
        );

        Ok(SyncPage {
            records,
            next_cursor,
        })
    }

    /// Advance the device cursor to the acked message. Monotonic: a stale
    /// ack never moves the cursor backwards. Pending records up to the new
    /// cursor settle as delivered.
    pub async fn ack(
        &self,
        user_id: Uuid,
        device_id: &str,
        last_acked_message_id: Uuid,
    ) -> EngineResult<u64> {
        let loc = self
            .queue
            .locate(last_acked_message_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("message {last_acked_message_id}")))?;

        let cursor = {
            let mut devices = self.devices.write().await;
            let state = devices
                .get_mut(&(user_id, device_id.to_string()))
                .ok_or_else(|| EngineError::NotFound(format!("device {device_id}")))?;
            if loc.feed_seq > state.last_acked_feed_seq {
                state.last_acked_feed_seq = loc.feed_seq;
            }
            state.last_acked_feed_seq
        };

        self.queue.settle_acked(user_id, device_id, cursor).await;
        Ok(cursor)
    }
}
