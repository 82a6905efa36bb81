use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::audit::{AuditEventKind, AuditRecord, AuditSink, TracingAuditSink};
use crate::cleanup;
use crate::config::Config;
use crate::dispatcher::{DeliveryTransport, Dispatcher};
use crate::ephemeral::SignalBus;
use crate::error::EngineResult;
use crate::ingress::{BillingClient, IngressValidator, NoopBillingClient, OpenDirectory, UserDirectory};
use crate::model::{
    DevicePush, DeviceSyncState, EphemeralSignal, Priority, SignalKind, SubmitReceipt,
    SubmitRequest, SubmitStatus, SyncPage,
};
use crate::presence::ConnectionRegistry;
use crate::queue::{EnqueueOutcome, MessageQueue, NewMessage};
use crate::ratelimit::{ActionKind, BaselineRiskScorer, RateLimiter, RiskScorer};
use crate::router::{RegionDirectory, RegionRouter, StaticRegionDirectory};

/// External collaborators the engine consumes but does not own.
///
/// `in_process` wires permissive defaults for single-node deployments and
/// tests; production replaces each seam individually.
pub struct Collaborators {
    pub directory: Arc<dyn UserDirectory>,
    pub billing: Arc<dyn BillingClient>,
    pub risk: Arc<dyn RiskScorer>,
    pub regions: Arc<dyn RegionDirectory>,
    pub audit: Arc<dyn AuditSink>,
    /// Override the push transport; defaults to the in-process registry.
    pub transport: Option<Arc<dyn DeliveryTransport>>,
}

impl Collaborators {
    pub fn in_process(config: &Config) -> Self {
        Self {
            directory: Arc::new(OpenDirectory),
            billing: Arc::new(NoopBillingClient),
            risk: Arc::new(BaselineRiskScorer),
            regions: Arc::new(StaticRegionDirectory::single_region(
                &config.region.default_region,
            )),
            audit: Arc::new(TracingAuditSink),
            transport: None,
        }
    }
}

/// The wired engine: every component plus the shared handles they need.
/// Cloning is cheap; all state lives behind Arcs.
#[derive(Clone)]
pub struct Engine {
    pub config: Arc<Config>,
    pub queue: Arc<MessageQueue>,
    pub dispatcher: Arc<Dispatcher>,
    pub sync: Arc<crate::sync::SyncService>,
    pub router: Arc<RegionRouter>,
    pub limiter: Arc<RateLimiter>,
    pub signals: Arc<SignalBus>,
    pub presence: Arc<ConnectionRegistry>,
    ingress: Arc<IngressValidator>,
    directory: Arc<dyn UserDirectory>,
    billing: Arc<dyn BillingClient>,
    audit: Arc<dyn AuditSink>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Engine {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let config = Arc::new(config);
        let presence = Arc::new(ConnectionRegistry::new());
        let queue = Arc::new(MessageQueue::new(config.queue.clone()));
        let transport: Arc<dyn DeliveryTransport> = match collaborators.transport {
            Some(transport) => transport,
            None => presence.clone(),
        };

        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatch.clone(),
            config.logging.clone(),
            queue.clone(),
            transport,
            presence.clone(),
            collaborators.audit.clone(),
        ));
        let sync = Arc::new(crate::sync::SyncService::new(
            config.sync.clone(),
            queue.clone(),
        ));
        let router = Arc::new(RegionRouter::new(
            config.region.clone(),
            collaborators.regions,
            collaborators.audit.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            config.rate.clone(),
            collaborators.risk,
            collaborators.audit.clone(),
        ));
        let signals = Arc::new(SignalBus::new(
            presence.clone(),
            std::time::Duration::from_secs(config.retention.typing_ttl_secs),
            std::time::Duration::from_secs(config.retention.receipt_ttl_secs),
        ));
        let ingress = Arc::new(IngressValidator::new(collaborators.directory.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            queue,
            dispatcher,
            sync,
            router,
            limiter,
            signals,
            presence,
            ingress,
            directory: collaborators.directory,
            billing: collaborators.billing,
            audit: collaborators.audit,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    // ========================================================================
    // Ingress pipeline
    // ========================================================================

    /// Admit one send: validate, rate-limit, bill, route, enqueue, and hand
    /// the records to the dispatcher. Idempotent on clientMessageId.
    pub async fn submit(&self, request: SubmitRequest) -> EngineResult<SubmitReceipt> {
        // Retransmissions short-circuit before any collaborator is touched;
        // billing in particular must fire at most once per client send.
        if let Some(message_id) = self
            .queue
            .peek_duplicate(request.sender_id, &request.client_message_id)
            .await
        {
            return Ok(SubmitReceipt {
                message_id,
                status: SubmitStatus::Duplicate,
            });
        }

        self.ingress.check(&request).await?;

        // Safety-priority traffic is exempt from throttling.
        if request.priority != Priority::Max {
            self.limiter
                .admit(request.sender_id, ActionKind::SendMessage)
                .await?;
        }

        let billing_state = self.billing.authorize(&request).await?;

        let country = self.directory.country(request.sender_id).await;
        let decision = self.router.route(country.as_deref()).await;

        let devices = self
            .sync
            .devices_for_recipients(&request.recipient_ids)
            .await;

        let new = NewMessage {
            client_message_id: request.client_message_id.clone(),
            conversation_id: request.conversation_id,
            sender_id: request.sender_id,
            recipient_ids: request.recipient_ids.clone(),
            payload_ref: request.payload_ref.clone(),
            kind: request.kind,
            priority: request.priority,
            origin_region: decision.assigned.clone(),
            billing_state,
        };

        match self.queue.enqueue(new, devices).await? {
            EnqueueOutcome::Enqueued {
                message_id,
                partition,
                records,
            } => {
                if decision.rerouted {
                    self.router
                        .record_reroute(message_id, &request.client_message_id, &decision)
                        .await;
                }
                self.dispatcher.dispatch(partition, &records, request.priority);
                Ok(SubmitReceipt {
                    message_id,
                    status: SubmitStatus::Accepted,
                })
            }
            EnqueueOutcome::Duplicate { message_id } => Ok(SubmitReceipt {
                message_id,
                status: SubmitStatus::Duplicate,
            }),
        }
    }

    /// Rate-limit admission for actions outside the send path (the
    /// conversation CRUD lives elsewhere but shares this throttle).
    pub async fn admit(&self, user_id: Uuid, action: ActionKind) -> EngineResult<()> {
        self.limiter.admit(user_id, action).await
    }

    /// Cancel a message inside the grace window.
    pub async fn cancel(&self, message_id: Uuid, sender_id: Uuid) -> EngineResult<usize> {
        let dropped = self.queue.cancel(message_id, sender_id).await?;
        if !dropped.is_empty() {
            self.audit.record(
                AuditRecord::new(AuditEventKind::MessageCancelled)
                    .message(message_id)
                    .user(sender_id)
                    .details(format!("{} pending records dropped", dropped.len())),
            );
        }
        Ok(dropped.len())
    }

    // ========================================================================
    // Device lifecycle and sync
    // ========================================================================

    pub async fn register_device(&self, user_id: Uuid, device_id: &str, platform: &str) {
        self.sync.register_device(user_id, device_id, platform).await;
    }

    /// Attach a live device session. Pending records for the device are
    /// nudged onto the push lane immediately.
    pub async fn connect(
        &self,
        user_id: Uuid,
        device_id: &str,
    ) -> mpsc::UnboundedReceiver<DevicePush> {
        let rx = self.presence.connect(user_id, device_id).await;
        self.dispatcher.nudge_device(user_id, device_id).await;
        rx
    }

    pub async fn disconnect(&self, user_id: Uuid, device_id: &str) {
        self.presence.disconnect(user_id, device_id).await;
    }

    pub async fn sync_page(
        &self,
        user_id: Uuid,
        device_id: &str,
        cursor: Option<&str>,
    ) -> EngineResult<SyncPage> {
        self.sync.sync(user_id, device_id, cursor).await
    }

    pub async fn ack(
        &self,
        user_id: Uuid,
        device_id: &str,
        last_acked_message_id: Uuid,
    ) -> EngineResult<u64> {
        self.sync.ack(user_id, device_id, last_acked_message_id).await
    }

    pub async fn device_state(&self, user_id: Uuid, device_id: &str) -> Option<DeviceSyncState> {
        self.sync.device_state(user_id, device_id).await
    }

    // ========================================================================
    // Ephemeral signals
    // ========================================================================

    pub async fn publish_signal(
        &self,
        kind: SignalKind,
        conversation_id: Uuid,
        sender_id: Uuid,
        participants: &[Uuid],
    ) -> usize {
        self.signals
            .publish(kind, conversation_id, sender_id, participants)
            .await
    }

    /// Signals still inside their TTL, for a participant rendering the
    /// conversation right now.
    pub async fn recent_signals(&self, conversation_id: Uuid) -> Vec<EphemeralSignal> {
        self.signals.recent(conversation_id).await
    }

    // ========================================================================
    // Background jobs
    // ========================================================================

    /// Spawn dispatcher workers plus the cleanup and reconciliation loops.
    pub fn spawn_background(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = self.dispatcher.spawn_workers();

        {
            let engine = self.clone();
            let mut shutdown = self.shutdown_rx.clone();
            let interval =
                std::time::Duration::from_secs(engine.config.retention.cleanup_interval_secs);
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.changed() => {}
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                    engine.run_cleanup_once().await;
                }
            }));
        }

        {
            let engine = self.clone();
            let mut shutdown = self.shutdown_rx.clone();
            let interval =
                std::time::Duration::from_secs(engine.config.retention.reconcile_interval_secs);
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = shutdown.changed() => {}
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(err) = engine.run_reconcile_once().await {
                        err.log();
                    }
                }
            }));
        }

        handles
    }

    pub async fn run_cleanup_once(&self) -> cleanup::CleanupStats {
        cleanup::run_once(
            &self.queue,
            &self.limiter,
            &self.signals,
            &self.config.retention,
        )
        .await
    }

    pub async fn run_reconcile_once(&self) -> EngineResult<usize> {
        self.router.reconcile(&self.queue).await
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        let _ = self.shutdown_tx.send(true);
    }

    /// Liveness probe for the health endpoint.
    pub async fn ping(&self) -> EngineResult<()> {
        self.queue.ping().await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("partitions", &self.queue.partition_count())
            .finish()
    }
}
