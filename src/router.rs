use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::audit::{AuditEventKind, AuditRecord, AuditSink};
use crate::config::RegionConfig;
use crate::error::EngineResult;
use crate::metrics;
use crate::model::{RegionHealth, RegionProfile};
use crate::queue::{EnqueueOutcome, MessageQueue, NewMessage};

/// Region-configuration collaborator: country -> home region plus the
/// precomputed failover chain. Consumed, never owned, by this engine.
#[async_trait]
pub trait RegionDirectory: Send + Sync {
    async fn home_region(&self, country_code: &str) -> Option<String>;
    async fn failover_chain(&self, region: &str) -> Vec<String>;
}

/// Static directory built from configuration; the default wiring when no
/// external region service is attached.
pub struct StaticRegionDirectory {
    home_by_country: HashMap<String, String>,
    chains: HashMap<String, Vec<String>>,
}

impl StaticRegionDirectory {
    pub fn new(
        home_by_country: HashMap<String, String>,
        chains: HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            home_by_country,
            chains,
        }
    }

    pub fn single_region(region: &str) -> Self {
        Self {
            home_by_country: HashMap::new(),
            chains: HashMap::from([(region.to_string(), Vec::new())]),
        }
    }
}

#[async_trait]
impl RegionDirectory for StaticRegionDirectory {
    async fn home_region(&self, country_code: &str) -> Option<String> {
        self.home_by_country.get(country_code).cloned()
    }

    async fn failover_chain(&self, region: &str) -> Vec<String> {
        self.chains.get(region).cloned().unwrap_or_default()
    }
}

/// Routing decision for one admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub home: String,
    pub assigned: String,
    pub rerouted: bool,
}

/// A message admitted through a failover region, kept until the home
/// region recovers and the reconciliation job replays it.
#[derive(Debug, Clone)]
pub struct RerouteEvent {
    pub message_id: Uuid,
    pub client_message_id: String,
    pub from_region: String,
    pub to_region: String,
    pub at: DateTime<Utc>,
}

/// Resolves the owning region for a conversation and fails over along the
/// precomputed chain when the home region is unhealthy. Reroutes are
/// recorded so reconciliation can replay them, idempotently, once the home
/// region recovers.
pub struct RegionRouter {
    cfg: RegionConfig,
    directory: Arc<dyn RegionDirectory>,
    audit: Arc<dyn AuditSink>,
    health: RwLock<HashMap<String, RegionProfile>>,
    reroutes: Mutex<Vec<RerouteEvent>>,
}

impl RegionRouter {
    pub fn new(
        cfg: RegionConfig,
        directory: Arc<dyn RegionDirectory>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            cfg,
            directory,
            audit,
            health: RwLock::new(HashMap::new()),
            reroutes: Mutex::new(Vec::new()),
        }
    }

    /// Ingest a health-check result for a region.
    pub async fn report_health(
        &self,
        region: &str,
        health: RegionHealth,
        last_heartbeat: DateTime<Utc>,
    ) {
        let mut map = self.health.write().await;
        map.insert(
            region.to_string(),
            RegionProfile {
                region: region.to_string(),
                health,
                last_heartbeat,
            },
        );
        tracing::info!(region = %region, health = ?health, "Region health updated");
    }

    pub async fn region_profile(&self, region: &str) -> Option<RegionProfile> {
        self.health.read().await.get(region).cloned()
    }

    /// A region is usable unless it reported Down or its heartbeat went
    /// stale. Regions with no report yet are assumed usable.
    async fn is_usable(&self, region: &str) -> bool {
        let map = self.health.read().await;
        match map.get(region) {
            None => true,
            Some(profile) => {
                let stale = Utc::now() - profile.last_heartbeat
                    > Duration::seconds(self.cfg.heartbeat_ttl_secs);
                !stale && profile.health != RegionHealth::Down
            }
        }
    }

    /// Pick the region for a conversation from the sender's declared
    /// country. Falls back along the failover chain; when nothing in the
    /// chain is usable, the home region is still assigned so the message
    /// queues instead of failing the caller.
    pub async fn route(&self, country: Option<&str>) -> RouteDecision {
        let home = match country {
            Some(code) => self
                .directory
                .home_region(code)
                .await
                .unwrap_or_else(|| self.cfg.default_region.clone()),
            None => self.cfg.default_region.clone(),
        };

        if self.is_usable(&home).await {
            return RouteDecision {
                assigned: home.clone(),
                home,
                rerouted: false,
            };
        }

        for candidate in self.directory.failover_chain(&home).await {
            if self.is_usable(&candidate).await {
                tracing::warn!(home = %home, assigned = %candidate, "Home region unavailable, failing over");
                return RouteDecision {
                    home,
                    assigned: candidate,
                    rerouted: true,
                };
            }
        }

        tracing::warn!(home = %home, "No healthy region in failover chain, queueing in home region");
        RouteDecision {
            assigned: home.clone(),
            home,
            rerouted: false,
        }
    }

    /// Record an admitted reroute so reconciliation can replay it later.
    pub async fn record_reroute(
        &self,
        message_id: Uuid,
        client_message_id: &str,
        decision: &RouteDecision,
    ) {
        metrics::REROUTES_TOTAL.inc();
        self.reroutes.lock().await.push(RerouteEvent {
            message_id,
            client_message_id: client_message_id.to_string(),
            from_region: decision.home.clone(),
            to_region: decision.assigned.clone(),
            at: Utc::now(),
        });
        self.audit.record(
            AuditRecord::new(AuditEventKind::MessageRerouted)
                .message(message_id)
                .region(decision.assigned.clone())
                .details(format!("home region {} unavailable", decision.home)),
        );
    }

    pub async fn pending_reroutes(&self) -> usize {
        self.reroutes.lock().await.len()
    }

    /// Replay rerouted messages whose home region recovered.
    ///
    /// The replay goes back through `enqueue` with the original
    /// clientMessageId; the dedup window guarantees no second copy, after
    /// which the stored message is reassigned to its home region and the
    /// event retired. Batched and idempotent, run off the hot path.
    pub async fn reconcile(&self, queue: &MessageQueue) -> EngineResult<usize> {
        let events = {
            let reroutes = self.reroutes.lock().await;
            reroutes.clone()
        };

        let mut reconciled = 0;
        let mut retired = Vec::new();

        for event in events {
            if !self.is_usable(&event.from_region).await {
                continue;
            }

            let Some(message) = queue.get_message(event.message_id).await else {
                // Already past retention; nothing left to replay.
                retired.push(event.message_id);
                continue;
            };

            let replay = NewMessage {
                client_message_id: message.client_message_id.clone(),
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                recipient_ids: message.recipient_ids.clone(),
                payload_ref: message.payload_ref.clone(),
                kind: message.kind,
                priority: message.priority,
                origin_region: event.from_region.clone(),
                billing_state: message.billing_state.clone(),
            };

            match queue.enqueue(replay, HashMap::new()).await? {
                EnqueueOutcome::Duplicate { message_id } => {
                    queue.reassign_origin(message_id, &event.from_region).await;
                    self.audit.record(
                        AuditRecord::new(AuditEventKind::RegionReconciled)
                            .message(message_id)
                            .region(event.from_region.clone())
                            .details(format!("replayed from {}", event.to_region)),
                    );
                    reconciled += 1;
                    retired.push(message_id);
                }
                EnqueueOutcome::Enqueued { message_id, .. } => {
                    // Dedup window expired before reconciliation; the replay
                    // materialized a fresh copy, which must not happen on a
                    // healthy schedule. Surface loudly and retire.
                    tracing::error!(
                        message_id = %message_id,
                        "Reconciliation replay fell outside the dedup window"
                    );
                    retired.push(event.message_id);
                }
            }
        }

        if !retired.is_empty() {
            let mut reroutes = self.reroutes.lock().await;
            reroutes.retain(|event| !retired.contains(&event.message_id));
        }

        Ok(reconciled)
    }
}
