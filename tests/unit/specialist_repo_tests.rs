use std::sync::Arc;

use chrono::Utc;

use cloister::models::specialist::SpecialistType;
use cloister::persistence::db;
use cloister::persistence::specialist_repo::SpecialistRepo;
use cloister::AppError;

async fn repo() -> SpecialistRepo {
    SpecialistRepo::new(Arc::new(db::connect_memory().await.expect("db")))
}

#[tokio::test]
async fn unknown_specialist_has_empty_state() {
    let state = repo().await.get_state(SpecialistType::MergeAgent).await.unwrap();
    assert_eq!(state.wake_count, 0);
    assert!(state.saved_session_id.is_none());
    assert!(state.last_wake_at.is_none());
}

#[tokio::test]
async fn wakes_are_counted() {
    let repo = repo().await;
    repo.record_wake(SpecialistType::TestAgent, "t-1", Utc::now()).await.unwrap();
    let state = repo
        .record_wake(SpecialistType::TestAgent, "t-2", Utc::now())
        .await
        .unwrap();
    assert_eq!(state.wake_count, 2);
    assert_eq!(state.current_agent_id.as_deref(), Some("t-2"));
    assert!(state.last_wake_at.is_some());
}

#[tokio::test]
async fn session_id_is_trimmed_and_replaceable() {
    let repo = repo().await;
    let state = repo
        .record_session_id(SpecialistType::ReviewAgent, "  sess-77 ")
        .await
        .unwrap();
    assert_eq!(state.saved_session_id.as_deref(), Some("sess-77"));

    let state = repo
        .record_session_id(SpecialistType::ReviewAgent, "sess-78")
        .await
        .unwrap();
    assert_eq!(state.saved_session_id.as_deref(), Some("sess-78"));
}

#[tokio::test]
async fn empty_session_id_is_rejected() {
    assert!(matches!(
        repo().await.record_session_id(SpecialistType::ReviewAgent, "   ").await,
        Err(AppError::Validation(_))
    ));
}
