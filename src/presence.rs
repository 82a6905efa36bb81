use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::dispatcher::{DeliveryOutcome, DeliveryTransport};
use crate::error::EngineResult;
use crate::model::{DeliveryPush, DevicePush};

/// In-process registry of live device connections.
///
/// Each connected device session owns the receiving half of an unbounded
/// channel; the registry holds the senders, keyed by user then device. The
/// registry doubles as the default [`DeliveryTransport`]: a device without a
/// live channel is simply not connected, which leaves its records PENDING
/// for pull via offline sync.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<Uuid, HashMap<String, mpsc::UnboundedSender<DevicePush>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device session, returning its push stream. An existing
    /// session for the same device is replaced; its stream ends.
    pub async fn connect(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> mpsc::UnboundedReceiver<DevicePush> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.write().await;
        inner
            .entry(user_id)
            .or_default()
            .insert(device_id.to_string(), tx);
        tracing::debug!(device_id = %device_id, "Device connected");
        rx
    }

    pub async fn disconnect(&self, user_id: Uuid, device_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(devices) = inner.get_mut(&user_id) {
            devices.remove(device_id);
            if devices.is_empty() {
                inner.remove(&user_id);
            }
        }
        tracing::debug!(device_id = %device_id, "Device disconnected");
    }

    pub async fn is_connected(&self, user_id: Uuid, device_id: &str) -> bool {
        self.inner
            .read()
            .await
            .get(&user_id)
            .is_some_and(|devices| devices.contains_key(device_id))
    }

    pub async fn connected_devices(&self, user_id: Uuid) -> Vec<String> {
        self.inner
            .read()
            .await
            .get(&user_id)
            .map(|devices| devices.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Push to one device. Returns false when the device has no live
    /// session (including the race where its receiver was just dropped).
    pub async fn send(&self, user_id: Uuid, device_id: &str, push: DevicePush) -> bool {
        let sent = {
            let inner = self.inner.read().await;
            inner
                .get(&user_id)
                .and_then(|devices| devices.get(device_id))
                .map(|tx| tx.send(push).is_ok())
        };
        match sent {
            Some(true) => true,
            Some(false) => {
                // Receiver dropped without a disconnect; clean up the entry.
                self.disconnect(user_id, device_id).await;
                false
            }
            None => false,
        }
    }

    /// Best-effort fan-out to every connected device of a user.
    pub async fn send_to_user(&self, user_id: Uuid, push: DevicePush) -> usize {
        let devices = self.connected_devices(user_id).await;
        let mut delivered = 0;
        for device_id in devices {
            if self.send(user_id, &device_id, push.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl DeliveryTransport for ConnectionRegistry {
    async fn deliver(
        &self,
        recipient_id: Uuid,
        device_id: &str,
        push: DeliveryPush,
    ) -> EngineResult<DeliveryOutcome> {
        if self.send(recipient_id, device_id, DevicePush::Message(push)).await {
            Ok(DeliveryOutcome::Delivered)
        } else {
            Ok(DeliveryOutcome::NotConnected)
        }
    }
}

/// Shared handle used across the engine.
pub type SharedRegistry = Arc<ConnectionRegistry>;
