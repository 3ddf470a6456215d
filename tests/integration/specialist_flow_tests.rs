use cloister::models::agent::CompletionReason;
use cloister::models::specialist::{Priority, QueuePayload, SpecialistType};
use cloister::AppError;

use super::test_helpers::Harness;

const REVIEW: SpecialistType = SpecialistType::ReviewAgent;

fn payload(issue: &str) -> QueuePayload {
    QueuePayload {
        issue_id: Some(issue.to_owned()),
        ..QueuePayload::default()
    }
}

#[tokio::test]
async fn concurrent_wakes_start_one_session() {
    let h = Harness::new().await;
    let q = &h.state.specialists;

    let (a, b) = tokio::join!(q.wake(REVIEW, None), q.wake(REVIEW, None));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(u8::from(a.spawned) + u8::from(b.spawned), 1);
    assert_eq!(h.sessions.created().await, vec!["cloister-review-agent"]);
    assert_eq!(a.agent_id, b.agent_id);
}

#[tokio::test]
async fn wake_of_running_specialist_only_sends_message() {
    let h = Harness::new().await;
    let q = &h.state.specialists;
    q.wake(REVIEW, None).await.unwrap();

    let outcome = q.wake(REVIEW, Some("look at PAN-4")).await.unwrap();
    assert!(!outcome.spawned);
    assert!(outcome.message_sent);
    assert_eq!(
        h.sessions.inputs("cloister-review-agent").await,
        vec!["look at PAN-4"]
    );
    assert_eq!(h.sessions.created().await.len(), 1);
}

#[tokio::test]
async fn wake_resumes_saved_session() {
    let h = Harness::new().await;
    let q = &h.state.specialists;
    q.record_session_id(REVIEW, "sess-41").await.unwrap();

    let outcome = q.wake(REVIEW, None).await.unwrap();
    assert!(outcome.spawned);
    assert!(outcome.resumed);

    let session = h.sessions.session("cloister-review-agent").await.expect("session");
    let command = session.command.expect("launch command");
    assert!(command.contains("--resume sess-41"), "{command}");
    assert!(command.contains("CLOISTER_AGENT_ID="));
}

#[tokio::test]
async fn wake_after_session_loss_retires_previous_agent() {
    let h = Harness::new().await;
    let q = &h.state.specialists;
    let first = q.wake(REVIEW, None).await.unwrap();
    let first_id = first.agent_id.expect("agent id");

    h.sessions.vanish("cloister-review-agent").await;
    let second = q.wake(REVIEW, None).await.unwrap();
    assert!(second.spawned);
    assert_ne!(second.agent_id.as_deref(), Some(first_id.as_str()));

    let retired = h.state.agents.require(&first_id).await.unwrap();
    assert_eq!(retired.completion_reason, Some(CompletionReason::SessionGone));

    let review = q
        .list_specialists()
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.specialist_type == REVIEW)
        .expect("review specialist listed");
    assert!(review.running);
    assert_eq!(review.wake_count, 2);
    assert_eq!(review.current_agent_id, second.agent_id);
}

#[tokio::test]
async fn dispatch_hands_over_highest_priority_item() {
    let h = Harness::new().await;
    let q = &h.state.specialists;
    q.enqueue(REVIEW, Priority::Low, "test", payload("PAN-1")).await.unwrap();
    q.enqueue(REVIEW, Priority::Urgent, "test", payload("PAN-2")).await.unwrap();

    let outcome = q.dispatch_next(REVIEW).await.unwrap().expect("work dispatched");
    assert_eq!(outcome.item.payload.issue_id.as_deref(), Some("PAN-2"));
    assert!(outcome.wake.spawned);

    let session = h.sessions.session("cloister-review-agent").await.unwrap();
    assert!(session.command.unwrap_or_default().contains("Issue: PAN-2"));

    let outcome = q.dispatch_next(REVIEW).await.unwrap().expect("second item");
    assert_eq!(outcome.item.payload.issue_id.as_deref(), Some("PAN-1"));
    assert!(outcome.wake.message_sent);
    assert_eq!(
        h.sessions.inputs("cloister-review-agent").await,
        vec!["Issue: PAN-1"]
    );

    assert!(q.dispatch_next(REVIEW).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_dispatch_restores_the_item() {
    let h = Harness::new().await;
    let q = &h.state.specialists;
    let queued = q
        .enqueue(REVIEW, Priority::High, "test", payload("PAN-7"))
        .await
        .unwrap();
    h.sessions.fail_create("review-agent").await;

    let err = q.dispatch_next(REVIEW).await.expect_err("wake fails");
    assert!(matches!(err, AppError::ExternalTool(_)));

    let snapshot = q.peek_queue(REVIEW).await.unwrap();
    assert_eq!(snapshot.items.len(), 1);
    assert_eq!(snapshot.items[0].id, queued.id);
    assert_eq!(snapshot.items[0].priority, Priority::High);
    assert!(h.state.agents.list_live().await.unwrap().is_empty());
}

#[tokio::test]
async fn review_requests_trip_the_circuit_breaker() {
    let h = Harness::new().await;
    let q = &h.state.specialists;

    for expected in [2, 1, 0] {
        let receipt = q.request_review("PAN-9", None).await.unwrap();
        assert_eq!(receipt.remaining_requeues, expected);
        assert_eq!(receipt.item.source, "request-review");
    }
    let err = q.request_review("PAN-9", None).await.expect_err("open");
    assert_eq!(err.kind(), "circuit_open");
    assert_eq!(q.peek_queue(REVIEW).await.unwrap().items.len(), 3);

    q.reset_requeue("PAN-9").await.unwrap();
    assert_eq!(
        q.request_review("PAN-9", Some("again".into())).await.unwrap().remaining_requeues,
        2
    );
}

#[tokio::test]
async fn queues_do_not_leak_between_specialists() {
    let h = Harness::new().await;
    let q = &h.state.specialists;
    q.enqueue(SpecialistType::MergeAgent, Priority::Normal, "test", payload("PAN-1"))
        .await
        .unwrap();

    assert!(q.dispatch_next(SpecialistType::TestAgent).await.unwrap().is_none());
    assert!(h.sessions.created().await.is_empty());

    let listed = q.list_specialists().await.unwrap();
    assert_eq!(listed.len(), 3);
    let merge = listed
        .iter()
        .find(|s| s.specialist_type == SpecialistType::MergeAgent)
        .unwrap();
    assert_eq!(merge.queue_depth, 1);
    assert!(!merge.running);
}
