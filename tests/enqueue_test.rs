// ============================================================================
// Enqueue & Admission Tests
// ============================================================================
//
// Idempotent enqueue, validation rejections, billing pass-through and the
// cancellation grace window, exercised through the engine facade.
//
// ============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use courier::audit::{AuditEventKind, CollectingAuditSink};
use courier::error::{EngineError, RejectReason};
use courier::model::{DeliveryStatus, SubmitStatus};
use courier::Collaborators;
use uuid::Uuid;

mod test_utils;
use test_utils::*;

#[tokio::test]
async fn duplicate_client_message_id_yields_exactly_one_message() {
    let (engine, _audit) = start_engine(test_config());
    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();
    let conversation = Uuid::new_v4();

    let first = engine
        .submit(send_request(sender, recipient, conversation, "retry-me"))
        .await
        .unwrap();
    assert_eq!(first.status, SubmitStatus::Accepted);

    // Client-side retransmission of the same send.
    let second = engine
        .submit(send_request(sender, recipient, conversation, "retry-me"))
        .await
        .unwrap();
    assert_eq!(second.status, SubmitStatus::Duplicate);
    assert_eq!(second.message_id, first.message_id);

    // Exactly one message visible to the recipient.
    let page = engine.sync_page(recipient, "phone", None).await.unwrap();
    assert_eq!(page.records.len(), 1);
}

#[tokio::test]
async fn retransmission_does_not_reinvoke_billing() {
    let cfg = test_config();
    let billing = CountingBilling::new();
    let audit = Arc::new(CollectingAuditSink::new());
    let mut collaborators = Collaborators::in_process(&cfg);
    collaborators.billing = billing.clone();
    collaborators.audit = audit.clone();
    let (engine, _) = start_engine_with(cfg, collaborators, audit);

    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();
    let conversation = Uuid::new_v4();

    engine
        .submit(send_request(sender, recipient, conversation, "paid-1"))
        .await
        .unwrap();
    engine
        .submit(send_request(sender, recipient, conversation, "paid-1"))
        .await
        .unwrap();

    assert_eq!(billing.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn blocked_sender_is_rejected_synchronously() {
    let cfg = test_config();
    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();
    let audit = Arc::new(CollectingAuditSink::new());
    let mut collaborators = Collaborators::in_process(&cfg);
    collaborators.directory = Arc::new(ScriptedDirectory {
        blocked: vec![(sender, recipient)],
        ..Default::default()
    });
    collaborators.audit = audit.clone();
    let (engine, _) = start_engine_with(cfg, collaborators, audit);

    let err = engine
        .submit(send_request(sender, recipient, Uuid::new_v4(), "blocked-1"))
        .await
        .unwrap_err();
    match err {
        EngineError::Validation(reason) => assert_eq!(reason, RejectReason::SenderBlocked),
        other => panic!("expected validation rejection, got {other}"),
    }

    // Nothing was enqueued.
    let page = engine.sync_page(recipient, "phone", None).await.unwrap();
    assert!(page.records.is_empty());
}

#[tokio::test]
async fn frozen_conversation_is_rejected() {
    let cfg = test_config();
    let conversation = Uuid::new_v4();
    let audit = Arc::new(CollectingAuditSink::new());
    let mut collaborators = Collaborators::in_process(&cfg);
    collaborators.directory = Arc::new(ScriptedDirectory {
        frozen: vec![conversation],
        ..Default::default()
    });
    collaborators.audit = audit.clone();
    let (engine, _) = start_engine_with(cfg, collaborators, audit);

    let err = engine
        .submit(send_request(
            Uuid::new_v4(),
            Uuid::new_v4(),
            conversation,
            "frozen-1",
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(RejectReason::ConversationFrozen)
    ));
}

#[tokio::test]
async fn cancel_within_grace_drops_pending_records() {
    let mut cfg = test_config();
    cfg.queue.cancel_grace_ms = 2000;
    let (engine, audit) = start_engine(cfg);

    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();
    // Registered device, no live connection: records stay PENDING.
    engine.register_device(recipient, "phone", "ios").await;

    let receipt = engine
        .submit(send_request(sender, recipient, Uuid::new_v4(), "cancel-1"))
        .await
        .unwrap();

    let dropped = engine.cancel(receipt.message_id, sender).await.unwrap();
    assert_eq!(dropped, 1);
    assert_eq!(audit.count_of(AuditEventKind::MessageCancelled), 1);

    // The cancelled record never reaches the device's push lane.
    let page = engine.sync_page(recipient, "phone", None).await.unwrap();
    assert_eq!(page.records.len(), 1);
    assert_eq!(page.records[0].status, DeliveryStatus::Dropped);
}

#[tokio::test]
async fn cancel_after_grace_window_is_rejected() {
    let mut cfg = test_config();
    cfg.queue.cancel_grace_ms = 50;
    let (engine, _audit) = start_engine(cfg);

    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();
    engine.register_device(recipient, "phone", "ios").await;

    let receipt = engine
        .submit(send_request(sender, recipient, Uuid::new_v4(), "late-cancel"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;

    let err = engine.cancel(receipt.message_id, sender).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(RejectReason::CancelWindowElapsed)
    ));
}

#[tokio::test]
async fn delivered_records_survive_cancellation() {
    let mut cfg = test_config();
    cfg.queue.cancel_grace_ms = 10_000;
    let (engine, _audit) = start_engine(cfg);

    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();
    engine.register_device(recipient, "phone", "ios").await;
    let mut rx = engine.connect(recipient, "phone").await;

    let receipt = engine
        .submit(send_request(sender, recipient, Uuid::new_v4(), "too-late"))
        .await
        .unwrap();

    // Wait for the live push to land.
    assert!(
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .is_ok()
    );
    let delivered = wait_until(Duration::from_secs(1), || async {
        engine
            .sync_page(recipient, "phone", None)
            .await
            .unwrap()
            .records
            .first()
            .map(|r| r.status == DeliveryStatus::Delivered)
            .unwrap_or(false)
    })
    .await;
    assert!(delivered);

    // Cancel inside the grace window: nothing left to drop, no retraction.
    let dropped = engine.cancel(receipt.message_id, sender).await.unwrap();
    assert_eq!(dropped, 0);
    let page = engine.sync_page(recipient, "phone", None).await.unwrap();
    assert_eq!(page.records[0].status, DeliveryStatus::Delivered);
}
