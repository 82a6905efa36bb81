use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::model::{DevicePush, EphemeralSignal, SignalKind};
use crate::presence::SharedRegistry;

/// Best-effort bus for typing indicators and read receipts.
///
/// Signals are not Messages: they live in a TTL cache with passive expiry,
/// go only to currently connected participants, and are silently dropped on
/// failure. Nothing here is backlogged, retried, or promoted to durable
/// history.
pub struct SignalBus {
    presence: SharedRegistry,
    typing_ttl: Duration,
    receipt_ttl: Duration,
    entries: Mutex<HashMap<Uuid, Vec<(EphemeralSignal, Instant)>>>,
}

impl SignalBus {
    pub fn new(presence: SharedRegistry, typing_ttl: Duration, receipt_ttl: Duration) -> Self {
        Self {
            presence,
            typing_ttl,
            receipt_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn ttl_for(&self, kind: SignalKind) -> Duration {
        match kind {
            SignalKind::Typing => self.typing_ttl,
            SignalKind::ReadReceipt => self.receipt_ttl,
        }
    }

    /// Publish to every connected device of the given participants.
    /// Returns how many device sessions received it; zero is not an error.
    pub async fn publish(
        &self,
        kind: SignalKind,
        conversation_id: Uuid,
        sender_id: Uuid,
        participants: &[Uuid],
    ) -> usize {
        let signal = EphemeralSignal {
            conversation_id,
            sender_id,
            kind,
            sent_at: Utc::now(),
        };

        {
            let mut entries = self.entries.lock().await;
            let expires = Instant::now() + self.ttl_for(kind);
            let slot = entries.entry(conversation_id).or_default();
            slot.retain(|(_, at)| *at > Instant::now());
            slot.push((signal.clone(), expires));
        }

        let mut delivered = 0;
        for participant in participants {
            if *participant == sender_id {
                continue;
            }
            delivered += self
                .presence
                .send_to_user(*participant, DevicePush::Signal(signal.clone()))
                .await;
        }
        delivered
    }

    /// Live (unexpired) signals for a conversation.
    pub async fn recent(&self, conversation_id: Uuid) -> Vec<EphemeralSignal> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&conversation_id) {
            Some(slot) => {
                slot.retain(|(_, at)| *at > now);
                slot.iter().map(|(signal, _)| signal.clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Passive-expiry sweep, called by the cleanup job.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let mut removed = 0;
        entries.retain(|_, slot| {
            let before = slot.len();
            slot.retain(|(_, at)| *at > now);
            removed += before - slot.len();
            !slot.is_empty()
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::ConnectionRegistry;
    use std::sync::Arc;

    fn bus(typing_ms: u64) -> SignalBus {
        SignalBus::new(
            Arc::new(ConnectionRegistry::new()),
            Duration::from_millis(typing_ms),
            Duration::from_millis(typing_ms * 6),
        )
    }

    #[tokio::test]
    async fn delivers_only_to_connected_participants() {
        let presence = Arc::new(ConnectionRegistry::new());
        let bus = SignalBus::new(
            presence.clone(),
            Duration::from_secs(10),
            Duration::from_secs(60),
        );
        let sender = Uuid::new_v4();
        let online = Uuid::new_v4();
        let offline = Uuid::new_v4();
        let mut rx = presence.connect(online, "phone").await;

        let delivered = bus
            .publish(SignalKind::Typing, Uuid::new_v4(), sender, &[online, offline])
            .await;
        assert_eq!(delivered, 1);
        assert!(matches!(rx.recv().await, Some(DevicePush::Signal(_))));
    }

    #[tokio::test]
    async fn sender_does_not_receive_its_own_signal() {
        let presence = Arc::new(ConnectionRegistry::new());
        let bus = SignalBus::new(
            presence.clone(),
            Duration::from_secs(10),
            Duration::from_secs(60),
        );
        let sender = Uuid::new_v4();
        let _rx = presence.connect(sender, "phone").await;

        let delivered = bus
            .publish(SignalKind::Typing, Uuid::new_v4(), sender, &[sender])
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn signals_expire_passively() {
        let bus = bus(20);
        let conversation = Uuid::new_v4();
        bus.publish(SignalKind::Typing, conversation, Uuid::new_v4(), &[])
            .await;
        assert_eq!(bus.recent(conversation).await.len(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(bus.recent(conversation).await.is_empty());
    }

    #[tokio::test]
    async fn prune_reaps_expired_entries() {
        let bus = bus(10);
        let conversation = Uuid::new_v4();
        bus.publish(SignalKind::Typing, conversation, Uuid::new_v4(), &[])
            .await;
        bus.publish(SignalKind::ReadReceipt, conversation, Uuid::new_v4(), &[])
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Typing expired, the longer-lived receipt survives.
        assert_eq!(bus.prune().await, 1);
        assert_eq!(bus.recent(conversation).await.len(), 1);
    }
}
