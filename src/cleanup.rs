use std::sync::Arc;

use crate::config::RetentionConfig;
use crate::ephemeral::SignalBus;
use crate::queue::{MessageQueue, PurgeStats};
use crate::ratelimit::RateLimiter;

/// Outcome of one retention pass, for logs and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupStats {
    pub queue: PurgeStats,
    pub rate_windows_pruned: usize,
    pub signals_pruned: usize,
}

/// One batched retention pass across every store with expiring state:
/// terminal delivery records, expired messages and dedup entries, stale
/// rate-limit windows, dead ephemeral signals. Idempotent; never runs
/// inline with message traffic.
pub async fn run_once(
    queue: &Arc<MessageQueue>,
    limiter: &Arc<RateLimiter>,
    signals: &Arc<SignalBus>,
    retention: &RetentionConfig,
) -> CleanupStats {
    let stats = CleanupStats {
        queue: queue.purge_expired(retention).await,
        rate_windows_pruned: limiter.prune().await,
        signals_pruned: signals.prune().await,
    };
    tracing::debug!(
        messages = stats.queue.messages_purged,
        records = stats.queue.records_purged,
        dedup = stats.queue.dedup_purged,
        rate_windows = stats.rate_windows_pruned,
        signals = stats.signals_pruned,
        "Cleanup pass finished"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::CollectingAuditSink;
    use crate::config::Config;
    use crate::presence::ConnectionRegistry;
    use crate::ratelimit::BaselineRiskScorer;
    use tokio::time::Duration;

    #[tokio::test]
    async fn cleanup_on_empty_state_is_a_no_op() {
        let cfg = Config::default();
        let queue = Arc::new(MessageQueue::new(cfg.queue.clone()));
        let limiter = Arc::new(RateLimiter::new(
            cfg.rate.clone(),
            Arc::new(BaselineRiskScorer),
            Arc::new(CollectingAuditSink::new()),
        ));
        let signals = Arc::new(SignalBus::new(
            Arc::new(ConnectionRegistry::new()),
            Duration::from_secs(10),
            Duration::from_secs(60),
        ));

        let stats = run_once(&queue, &limiter, &signals, &cfg.retention).await;
        assert_eq!(stats.queue.messages_purged, 0);
        assert_eq!(stats.rate_windows_pruned, 0);
        assert_eq!(stats.signals_pruned, 0);
    }
}
