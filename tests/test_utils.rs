#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use courier::audit::CollectingAuditSink;
use courier::config::Config;
use courier::dispatcher::{DeliveryOutcome, DeliveryTransport};
use courier::error::{EngineError, EngineResult};
use courier::ingress::{BillingClient, UserDirectory};
use courier::model::{BillingState, DeliveryPush, MessageKind, Priority, SubmitRequest};
use courier::ratelimit::RiskScorer;
use courier::{Collaborators, Engine};

/// Engine config with millisecond-scale timings so retry paths complete
/// inside a test run.
pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.queue.partition_count = 4;
    cfg.queue.cancel_grace_ms = 500;
    cfg.dispatch.max_attempts = 3;
    cfg.dispatch.backoff_base_ms = 20;
    cfg.dispatch.backoff_cap_ms = 200;
    cfg.dispatch.attempt_timeout_ms = 250;
    cfg
}

/// Build an engine around a collecting audit sink and start its workers.
pub fn start_engine(cfg: Config) -> (Engine, Arc<CollectingAuditSink>) {
    let audit = Arc::new(CollectingAuditSink::new());
    let mut collaborators = Collaborators::in_process(&cfg);
    collaborators.audit = audit.clone();
    start_engine_with(cfg, collaborators, audit)
}

pub fn start_engine_with(
    cfg: Config,
    collaborators: Collaborators,
    audit: Arc<CollectingAuditSink>,
) -> (Engine, Arc<CollectingAuditSink>) {
    let engine = Engine::new(cfg, collaborators);
    engine.spawn_background();
    (engine, audit)
}

pub fn send_request(
    sender: Uuid,
    recipient: Uuid,
    conversation: Uuid,
    client_id: &str,
) -> SubmitRequest {
    SubmitRequest {
        client_message_id: client_id.to_string(),
        conversation_id: conversation,
        sender_id: sender,
        recipient_ids: vec![recipient],
        payload_ref: format!("blob://{client_id}"),
        kind: MessageKind::Human,
        priority: Priority::Normal,
    }
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Transport fakes
// ============================================================================

/// Fails the first N attempts with a transient error, then delivers.
pub struct FlakyTransport {
    failures_left: AtomicU32,
    pub attempts: AtomicU32,
}

impl FlakyTransport {
    pub fn failing(times: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(times),
            attempts: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl DeliveryTransport for FlakyTransport {
    async fn deliver(
        &self,
        _recipient_id: Uuid,
        _device_id: &str,
        _push: DeliveryPush,
    ) -> EngineResult<DeliveryOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(EngineError::transient("connection reset"));
        }
        Ok(DeliveryOutcome::Delivered)
    }
}

/// Every attempt fails with a transient error.
pub struct AlwaysFailTransport {
    pub attempts: AtomicU32,
}

impl AlwaysFailTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl DeliveryTransport for AlwaysFailTransport {
    async fn deliver(
        &self,
        _recipient_id: Uuid,
        _device_id: &str,
        _push: DeliveryPush,
    ) -> EngineResult<DeliveryOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::transient("socket write failed"))
    }
}

/// Hangs longer than any attempt timeout; every attempt times out.
pub struct HangingTransport;

#[async_trait]
impl DeliveryTransport for HangingTransport {
    async fn deliver(
        &self,
        _recipient_id: Uuid,
        _device_id: &str,
        _push: DeliveryPush,
    ) -> EngineResult<DeliveryOutcome> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(DeliveryOutcome::Delivered)
    }
}

/// Fails permanently: the recipient account is gone.
pub struct PermanentFailTransport;

#[async_trait]
impl DeliveryTransport for PermanentFailTransport {
    async fn deliver(
        &self,
        _recipient_id: Uuid,
        _device_id: &str,
        _push: DeliveryPush,
    ) -> EngineResult<DeliveryOutcome> {
        Err(EngineError::permanent("recipient account no longer exists"))
    }
}

// ============================================================================
// Collaborator fakes
// ============================================================================

/// Billing client that counts invocations.
pub struct CountingBilling {
    pub calls: AtomicU32,
}

impl CountingBilling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl BillingClient for CountingBilling {
    async fn authorize(&self, _request: &SubmitRequest) -> EngineResult<BillingState> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(BillingState("PAID".to_string()))
    }
}

/// Directory with scripted block/freeze/age behavior.
#[derive(Default)]
pub struct ScriptedDirectory {
    pub blocked: Vec<(Uuid, Uuid)>,
    pub frozen: Vec<Uuid>,
    pub underage: Vec<Uuid>,
    pub countries: Vec<(Uuid, String)>,
}

#[async_trait]
impl UserDirectory for ScriptedDirectory {
    async fn is_blocked(&self, sender_id: Uuid, recipient_id: Uuid) -> bool {
        self.blocked.contains(&(sender_id, recipient_id))
    }

    async fn age_years(&self, user_id: Uuid) -> Option<u32> {
        if self.underage.contains(&user_id) {
            Some(12)
        } else {
            Some(25)
        }
    }

    async fn exists(&self, _user_id: Uuid) -> bool {
        true
    }

    async fn country(&self, user_id: Uuid) -> Option<String> {
        self.countries
            .iter()
            .find(|(user, _)| *user == user_id)
            .map(|(_, country)| country.clone())
    }

    async fn is_conversation_frozen(&self, conversation_id: Uuid) -> bool {
        self.frozen.contains(&conversation_id)
    }
}

/// Risk scorer returning a fixed multiplier.
pub struct FixedRisk(pub f64);

#[async_trait]
impl RiskScorer for FixedRisk {
    async fn risk_multiplier(&self, _user_id: Uuid) -> f64 {
        self.0
    }
}
