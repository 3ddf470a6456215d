use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cloister::models::agent::CompletionReason;
use cloister::models::convoy::{ConvoyParams, ConvoyStatus, MemberStatus};
use cloister::orchestrator::agents;
use cloister::orchestrator::convoy::NOT_STARTED;
use cloister::AppError;

use super::test_helpers::{Harness, SlowSessions};

fn params() -> ConvoyParams {
    ConvoyParams {
        files: vec!["src/lib.rs".into()],
        pr_url: Some("https://example.com/pr/12".into()),
        issue_id: Some("PAN-12".into()),
        project_path: None,
    }
}

fn member_agent(convoy: &cloister::models::convoy::Convoy, role: &str) -> String {
    convoy
        .agents
        .iter()
        .find(|m| m.role == role)
        .and_then(|m| m.agent_id.clone())
        .expect("member agent")
}

#[tokio::test]
async fn start_spawns_every_role_in_order() {
    let h = Harness::new().await;
    let convoy = h.state.convoys.start("code-review", params()).await.unwrap();

    assert_eq!(convoy.status, ConvoyStatus::Running);
    let roles: Vec<&str> = convoy.agents.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(roles, vec!["correctness", "security", "performance", "synthesis"]);
    assert!(convoy.agents.iter().all(|m| m.status == MemberStatus::Running));
    assert!(Path::new(&convoy.output_dir).is_dir());

    let expected: Vec<String> = roles
        .iter()
        .map(|r| format!("cloister-{}-{r}", convoy.id))
        .collect();
    assert_eq!(h.sessions.created().await, expected);

    let correctness = h
        .state
        .agents
        .require(&member_agent(&convoy, "correctness"))
        .await
        .unwrap();
    assert_eq!(correctness.linked_work_item.as_deref(), Some("PAN-12"));

    let session = h.sessions.session(&expected[0]).await.unwrap();
    let command = session.command.unwrap_or_default();
    assert!(command.contains("Files: src/lib.rs"));
    assert!(command.contains("correctness.md"));
}

#[tokio::test]
async fn unknown_template_spawns_nothing() {
    let h = Harness::new().await;
    let err = h.state.convoys.start("nope", params()).await.expect_err("unknown");
    assert!(matches!(err, AppError::TemplateNotFound(ref name) if name == "nope"));
    assert!(h.sessions.created().await.is_empty());
    assert!(h.state.convoys.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn spawn_failure_fails_the_member_and_everything_after_it() {
    let h = Harness::new().await;
    h.sessions.fail_create("-security").await;

    let convoy = h.state.convoys.start("code-review", params()).await.unwrap();
    let status: Vec<MemberStatus> = convoy.agents.iter().map(|m| m.status).collect();
    assert_eq!(
        status,
        vec![
            MemberStatus::Running,
            MemberStatus::Failed,
            MemberStatus::Failed,
            MemberStatus::Failed
        ]
    );
    assert!(convoy.agents[1]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("cannot create session")));
    assert_eq!(convoy.agents[2].error.as_deref(), Some(NOT_STARTED));
    assert_eq!(h.sessions.created().await.len(), 1);

    agents::report_completion(&h.state.agents, &member_agent(&convoy, "correctness"), true)
        .await
        .unwrap();
    let refreshed = h.state.convoys.status(&convoy.id).await.unwrap();
    assert_eq!(refreshed.status, ConvoyStatus::Partial);
    assert!(refreshed.completed_at.is_some());
}

#[tokio::test]
async fn status_follows_member_completion() {
    let h = Harness::new().await;
    let convoy = h.state.convoys.start("planning", params()).await.unwrap();

    agents::report_completion(&h.state.agents, &member_agent(&convoy, "explore"), true)
        .await
        .unwrap();
    let midway = h.state.convoys.status(&convoy.id).await.unwrap();
    assert_eq!(midway.status, ConvoyStatus::Running);
    assert_eq!(midway.agents[0].status, MemberStatus::Completed);

    agents::report_completion(&h.state.agents, &member_agent(&convoy, "plan"), true)
        .await
        .unwrap();
    let done = h.state.convoys.status(&convoy.id).await.unwrap();
    assert_eq!(done.status, ConvoyStatus::Completed);
    assert!(done.completed_at.is_some());

    let finished = h
        .state
        .convoys
        .list(Some(ConvoyStatus::Completed))
        .await
        .unwrap();
    assert_eq!(finished.len(), 1);
    assert!(h
        .state
        .convoys
        .list(Some(ConvoyStatus::Running))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn vanished_member_counts_as_done_only_with_output() {
    let h = Harness::new().await;
    let convoy = h.state.convoys.start("planning", params()).await.unwrap();

    let explore = member_agent(&convoy, "explore");
    let plan = member_agent(&convoy, "plan");
    tokio::fs::write(Path::new(&convoy.output_dir).join("explore.md"), "findings")
        .await
        .unwrap();
    for id in [&explore, &plan] {
        h.state
            .agents
            .mark_terminal(id, CompletionReason::SessionGone)
            .await
            .unwrap();
    }

    let refreshed = h.state.convoys.status(&convoy.id).await.unwrap();
    assert_eq!(refreshed.agents[0].status, MemberStatus::Completed);
    assert_eq!(refreshed.agents[1].status, MemberStatus::Failed);
    assert_eq!(refreshed.agents[1].error.as_deref(), Some("session-gone"));
    assert_eq!(refreshed.status, ConvoyStatus::Partial);
}

#[tokio::test]
async fn graceful_stop_interrupts_before_killing() {
    let h = Harness::new().await;
    let convoy = h.state.convoys.start("planning", params()).await.unwrap();
    let plan_session = format!("cloister-{}-plan", convoy.id);
    h.sessions.fail_kill(&plan_session).await;

    let report = h.state.convoys.stop(&convoy.id, false).await.unwrap();
    assert_eq!(report.stopped, vec!["explore"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "plan");

    let survivor = h.sessions.session(&plan_session).await.expect("still alive");
    assert_eq!(survivor.interrupts, 1);
    assert_eq!(report.convoy.agents[0].status, MemberStatus::Failed);
    assert_eq!(report.convoy.agents[1].status, MemberStatus::Running);
    assert_eq!(report.convoy.status, ConvoyStatus::Running);

    let explore = h
        .state
        .agents
        .require(&member_agent(&convoy, "explore"))
        .await
        .unwrap();
    assert_eq!(explore.completion_reason, Some(CompletionReason::StoppedByOperator));
}

#[tokio::test]
async fn forced_stop_skips_the_interrupt() {
    let h = Harness::new().await;
    let convoy = h.state.convoys.start("planning", params()).await.unwrap();
    let plan_session = format!("cloister-{}-plan", convoy.id);
    h.sessions.fail_kill(&plan_session).await;

    let report = h.state.convoys.stop(&convoy.id, true).await.unwrap();
    assert_eq!(report.stopped, vec!["explore"]);
    assert_eq!(h.sessions.session(&plan_session).await.unwrap().interrupts, 0);
}

#[tokio::test]
async fn stop_of_unknown_convoy_is_not_found() {
    let h = Harness::new().await;
    assert!(matches!(
        h.state.convoys.stop("convoy-missing", true).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn stop_during_start_waits_and_wins() {
    let h = Harness::with_process(|sessions| {
        SlowSessions::wrap(sessions, Duration::from_millis(100), Duration::ZERO)
    })
    .await;
    let state = Arc::clone(&h.state);
    let starting = tokio::spawn(async move { state.convoys.start("code-review", params()).await });

    let first = loop {
        if let Some(name) = h.sessions.created().await.first().cloned() {
            break name;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    let convoy_id = first
        .strip_prefix("cloister-")
        .and_then(|rest| rest.strip_suffix("-correctness"))
        .expect("convoy session name")
        .to_owned();

    let report = h.state.convoys.stop(&convoy_id, true).await.unwrap();
    starting.await.unwrap().unwrap();

    assert_eq!(
        report.stopped,
        vec!["correctness", "security", "performance", "synthesis"]
    );
    assert!(h.sessions.live().await.is_empty());
    let convoy = h.state.convoys.status(&convoy_id).await.unwrap();
    assert_eq!(convoy.status, ConvoyStatus::Failed);
    assert!(convoy.agents.iter().all(|m| m.status == MemberStatus::Failed));
}

#[tokio::test]
async fn member_finishing_during_stop_keeps_its_result() {
    let h = Harness::with_process(|sessions| {
        SlowSessions::wrap(sessions, Duration::ZERO, Duration::from_millis(200))
    })
    .await;
    let convoy = h.state.convoys.start("planning", params()).await.unwrap();
    let explore = member_agent(&convoy, "explore");

    let (report, _) = tokio::join!(h.state.convoys.stop(&convoy.id, false), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        agents::report_completion(&h.state.agents, &explore, true)
            .await
            .unwrap();
    });
    let report = report.unwrap();

    assert_eq!(report.stopped, vec!["plan"]);
    assert!(report.failures.is_empty());
    assert_eq!(report.convoy.agents[0].status, MemberStatus::Completed);
    assert_eq!(report.convoy.agents[0].error, None);
    assert_eq!(report.convoy.agents[1].status, MemberStatus::Failed);
    assert_eq!(report.convoy.status, ConvoyStatus::Partial);

    let record = h.state.agents.require(&explore).await.unwrap();
    assert_eq!(record.completion_reason, Some(CompletionReason::Finished));
}
