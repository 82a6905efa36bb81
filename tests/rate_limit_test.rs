// ============================================================================
// Rate Limiter & Fraud Throttle Tests
// ============================================================================
//
// Budget enforcement under burst load, risk-scaled limits, and the
// safety-priority exemption, exercised through the engine facade.
//
// ============================================================================

use std::sync::Arc;

use courier::audit::{AuditEventKind, CollectingAuditSink};
use courier::error::EngineError;
use courier::model::Priority;
use courier::ratelimit::ActionKind;
use courier::Collaborators;
use uuid::Uuid;

mod test_utils;
use test_utils::*;

#[tokio::test]
async fn burst_of_100_sends_against_a_60_budget_accepts_exactly_60() {
    let mut cfg = test_config();
    cfg.rate.sends_per_window = 60;
    // A wide window keeps the whole burst inside one window-start key.
    cfg.rate.window_secs = 600;
    let (engine, audit) = start_engine(cfg);

    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();
    let conversation = Uuid::new_v4();

    let mut accepted = 0;
    let mut rejected = 0;
    for i in 0..100 {
        match engine
            .submit(send_request(sender, recipient, conversation, &format!("burst-{i}")))
            .await
        {
            Ok(_) => accepted += 1,
            Err(EngineError::RateLimited { retry_after_secs }) => {
                assert!(retry_after_secs >= 1);
                rejected += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(accepted, 60);
    assert_eq!(rejected, 40);
    assert_eq!(audit.count_of(AuditEventKind::RateLimitRejection), 40);
}

#[tokio::test]
async fn max_priority_messages_bypass_the_throttle() {
    let mut cfg = test_config();
    cfg.rate.sends_per_window = 2;
    cfg.rate.window_secs = 600;
    let (engine, _audit) = start_engine(cfg);

    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();
    let conversation = Uuid::new_v4();

    // Exhaust the normal budget.
    for i in 0..2 {
        engine
            .submit(send_request(sender, recipient, conversation, &format!("n-{i}")))
            .await
            .unwrap();
    }
    assert!(engine
        .submit(send_request(sender, recipient, conversation, "n-overflow"))
        .await
        .is_err());

    // Safety-priority traffic still goes through.
    for i in 0..5 {
        let mut request = send_request(sender, recipient, conversation, &format!("sos-{i}"));
        request.priority = Priority::Max;
        engine.submit(request).await.unwrap();
    }
}

#[tokio::test]
async fn high_risk_senders_get_a_quartered_budget() {
    let mut cfg = test_config();
    cfg.rate.sends_per_window = 40;
    cfg.rate.window_secs = 600;
    let audit = Arc::new(CollectingAuditSink::new());
    let mut collaborators = Collaborators::in_process(&cfg);
    collaborators.risk = Arc::new(FixedRisk(0.25));
    collaborators.audit = audit.clone();
    let (engine, _) = start_engine_with(cfg, collaborators, audit);

    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();
    let conversation = Uuid::new_v4();

    let mut accepted = 0;
    for i in 0..40 {
        if engine
            .submit(send_request(sender, recipient, conversation, &format!("risk-{i}")))
            .await
            .is_ok()
        {
            accepted += 1;
        }
    }
    // 40 * 0.25 = 10 effective slots.
    assert_eq!(accepted, 10);
}

#[tokio::test]
async fn conversation_creation_shares_the_throttle_but_not_the_budget() {
    let mut cfg = test_config();
    cfg.rate.sends_per_window = 1;
    cfg.rate.conversation_creates_per_window = 2;
    cfg.rate.window_secs = 600;
    let (engine, _audit) = start_engine(cfg);

    let user = Uuid::new_v4();
    engine.admit(user, ActionKind::CreateConversation).await.unwrap();
    engine.admit(user, ActionKind::CreateConversation).await.unwrap();
    assert!(engine
        .admit(user, ActionKind::CreateConversation)
        .await
        .is_err());

    // The send budget is untouched by conversation creates.
    engine.admit(user, ActionKind::SendMessage).await.unwrap();
}

#[tokio::test]
async fn rejected_sends_leave_no_trace_in_the_queue() {
    let mut cfg = test_config();
    cfg.rate.sends_per_window = 1;
    cfg.rate.window_secs = 600;
    let (engine, _audit) = start_engine(cfg);

    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();
    let conversation = Uuid::new_v4();

    engine
        .submit(send_request(sender, recipient, conversation, "ok-1"))
        .await
        .unwrap();
    let _ = engine
        .submit(send_request(sender, recipient, conversation, "limited-1"))
        .await
        .unwrap_err();

    let page = engine.sync_page(recipient, "phone", None).await.unwrap();
    assert_eq!(page.records.len(), 1);
}
