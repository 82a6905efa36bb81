use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::{AuditEventKind, AuditRecord, AuditSink};
use crate::config::RateLimitConfig;
use crate::error::{EngineError, EngineResult};
use crate::metrics;

/// Risk-scoring collaborator. Returns a multiplier applied to base limits:
/// 1.0 at baseline, down to the configured floor at the highest risk tier.
#[async_trait]
pub trait RiskScorer: Send + Sync {
    async fn risk_multiplier(&self, user_id: Uuid) -> f64;
}

/// Default scorer: everyone at baseline.
pub struct BaselineRiskScorer;

#[async_trait]
impl RiskScorer for BaselineRiskScorer {
    async fn risk_multiplier(&self, _user_id: Uuid) -> f64 {
        1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    SendMessage,
    CreateConversation,
}

impl ActionKind {
    fn as_str(&self) -> &'static str {
        match self {
            ActionKind::SendMessage => "send_message",
            ActionKind::CreateConversation => "create_conversation",
        }
    }
}

/// Sliding-window rate limiter with fraud-aware limits.
///
/// Counters are isolated per (user, action, window-start) key and pruned
/// once two windows old; there is no global counter. The effective limit is
/// the base limit scaled by the risk multiplier. MAX-priority admissions
/// never reach this limiter (the engine skips it).
pub struct RateLimiter {
    cfg: RateLimitConfig,
    risk: Arc<dyn RiskScorer>,
    audit: Arc<dyn AuditSink>,
    counters: Mutex<HashMap<(Uuid, ActionKind, i64), u32>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig, risk: Arc<dyn RiskScorer>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            cfg,
            risk,
            audit,
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn base_limit(&self, action: ActionKind) -> u32 {
        match action {
            ActionKind::SendMessage => self.cfg.sends_per_window,
            ActionKind::CreateConversation => self.cfg.conversation_creates_per_window,
        }
    }

    /// Admit one action, counting it on success.
    ///
    /// The current window's count plus the previous window weighted by its
    /// remaining overlap approximates a true sliding window without keeping
    /// per-event timestamps.
    pub async fn admit(&self, user_id: Uuid, action: ActionKind) -> EngineResult<()> {
        let window = self.cfg.window_secs.max(1);
        let now_secs = Utc::now().timestamp();
        let window_start = now_secs - now_secs.rem_euclid(window);
        let elapsed_fraction = (now_secs - window_start) as f64 / window as f64;

        let multiplier = self
            .risk
            .risk_multiplier(user_id)
            .await
            .clamp(self.cfg.min_risk_multiplier, 1.0);
        let limit = ((self.base_limit(action) as f64) * multiplier).floor().max(1.0);

        let mut counters = self.counters.lock().await;
        let previous = counters
            .get(&(user_id, action, window_start - window))
            .copied()
            .unwrap_or(0);
        let current = counters.entry((user_id, action, window_start)).or_insert(0);
        let weighted = *current as f64 + previous as f64 * (1.0 - elapsed_fraction);

        if weighted + 1.0 > limit {
            let retry_after_secs = (window - (now_secs - window_start)).max(1) as u64;
            drop(counters);
            metrics::RATE_LIMITED_TOTAL.inc();
            self.audit.record(
                AuditRecord::new(AuditEventKind::RateLimitRejection)
                    .user(user_id)
                    .details(format!(
                        "{}: weighted count {:.1} at limit {}",
                        action.as_str(),
                        weighted,
                        limit
                    )),
            );
            tracing::debug!(
                action = action.as_str(),
                limit = limit,
                retry_after_secs = retry_after_secs,
                "Rate limit exceeded"
            );
            return Err(EngineError::RateLimited { retry_after_secs });
        }

        *current += 1;
        Ok(())
    }

    /// Drop counters older than two windows. Idempotent, called by the
    /// cleanup job; the explicit expiry replaces any global reset.
    pub async fn prune(&self) -> usize {
        let window = self.cfg.window_secs.max(1);
        let now_secs = Utc::now().timestamp();
        let horizon = now_secs - 2 * window;
        let mut counters = self.counters.lock().await;
        let before = counters.len();
        counters.retain(|(_, _, window_start), _| *window_start >= horizon);
        before - counters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::CollectingAuditSink;

    struct FixedRisk(f64);

    #[async_trait]
    impl RiskScorer for FixedRisk {
        async fn risk_multiplier(&self, _user_id: Uuid) -> f64 {
            self.0
        }
    }

    fn config(limit: u32) -> RateLimitConfig {
        RateLimitConfig {
            sends_per_window: limit,
            conversation_creates_per_window: 2,
            window_secs: 60,
            min_risk_multiplier: 0.25,
        }
    }

    #[tokio::test]
    async fn admits_up_to_the_limit_then_rejects() {
        let limiter = RateLimiter::new(
            config(5),
            Arc::new(BaselineRiskScorer),
            Arc::new(CollectingAuditSink::new()),
        );
        let user = Uuid::new_v4();

        let mut accepted = 0;
        for _ in 0..8 {
            if limiter.admit(user, ActionKind::SendMessage).await.is_ok() {
                accepted += 1;
            }
        }
        // The previous window may bleed in, so at least the budget minus
        // the overlap is admitted and never more than the budget.
        assert!(accepted <= 5);
        assert!(accepted >= 4);
    }

    #[tokio::test]
    async fn rejection_carries_retry_after_and_audits() {
        let audit = Arc::new(CollectingAuditSink::new());
        let limiter = RateLimiter::new(config(1), Arc::new(BaselineRiskScorer), audit.clone());
        let user = Uuid::new_v4();

        limiter.admit(user, ActionKind::SendMessage).await.unwrap();
        match limiter.admit(user, ActionKind::SendMessage).await {
            Err(EngineError::RateLimited { retry_after_secs }) => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            other => panic!("expected RateLimited, got {:?}", other.map(|_| ())),
        }
        assert_eq!(audit.count_of(AuditEventKind::RateLimitRejection), 1);
    }

    #[tokio::test]
    async fn risk_multiplier_scales_the_limit() {
        let limiter = RateLimiter::new(
            config(8),
            Arc::new(FixedRisk(0.25)),
            Arc::new(CollectingAuditSink::new()),
        );
        let user = Uuid::new_v4();

        let mut accepted = 0;
        for _ in 0..8 {
            if limiter.admit(user, ActionKind::SendMessage).await.is_ok() {
                accepted += 1;
            }
        }
        // 8 * 0.25 = 2 effective slots.
        assert!(accepted <= 2);
    }

    #[tokio::test]
    async fn users_do_not_share_counters() {
        let limiter = RateLimiter::new(
            config(1),
            Arc::new(BaselineRiskScorer),
            Arc::new(CollectingAuditSink::new()),
        );
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        limiter.admit(first, ActionKind::SendMessage).await.unwrap();
        limiter.admit(second, ActionKind::SendMessage).await.unwrap();
        assert!(limiter.admit(first, ActionKind::SendMessage).await.is_err());
    }

    #[tokio::test]
    async fn actions_are_counted_independently() {
        let limiter = RateLimiter::new(
            config(1),
            Arc::new(BaselineRiskScorer),
            Arc::new(CollectingAuditSink::new()),
        );
        let user = Uuid::new_v4();

        limiter.admit(user, ActionKind::SendMessage).await.unwrap();
        limiter
            .admit(user, ActionKind::CreateConversation)
            .await
            .unwrap();
        assert!(limiter.admit(user, ActionKind::SendMessage).await.is_err());
    }

    #[tokio::test]
    async fn prune_removes_only_stale_windows() {
        let limiter = RateLimiter::new(
            config(10),
            Arc::new(BaselineRiskScorer),
            Arc::new(CollectingAuditSink::new()),
        );
        let user = Uuid::new_v4();
        limiter.admit(user, ActionKind::SendMessage).await.unwrap();

        // Fresh counters survive.
        assert_eq!(limiter.prune().await, 0);

        // Stale window keys are reaped.
        let window = 60;
        let stale_start = Utc::now().timestamp() - 10 * window;
        limiter
            .counters
            .lock()
            .await
            .insert((user, ActionKind::SendMessage, stale_start), 3);
        assert_eq!(limiter.prune().await, 1);
    }
}
