use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use cloister::models::agent::CompletionReason;
use cloister::models::health::HealthState;
use cloister::orchestrator::agents;

use super::test_helpers::Harness;

#[tokio::test]
async fn warning_transition_pokes_exactly_once() {
    let h = Harness::new().await;
    let agent = h.agent("a1", 20, "building\n").await;

    let first = h.state.monitor.tick().await.unwrap().expect("tick ran");
    assert_eq!(first.poked, vec!["a1"]);
    assert_eq!(first.transitions.len(), 1);
    assert_eq!(first.transitions[0].from, HealthState::Active);
    assert_eq!(first.transitions[0].to, HealthState::Warning);

    let second = h.state.monitor.tick().await.unwrap().expect("tick ran");
    assert!(second.poked.is_empty());
    assert!(second.transitions.is_empty());

    assert_eq!(
        h.sessions.inputs(&agent.session_handle).await,
        vec!["ping from supervisor"]
    );
    let stored = h.state.agents.require("a1").await.unwrap();
    assert_eq!(stored.health, HealthState::Warning);
}

#[tokio::test]
async fn new_output_counts_as_activity() {
    let h = Harness::new().await;
    let agent = h.agent("a1", 20, "building\n").await;
    h.state.monitor.tick().await.unwrap();

    h.sessions
        .append_output(&agent.session_handle, "compiled 12 crates\n")
        .await;
    let report = h.state.monitor.tick().await.unwrap().expect("tick ran");

    assert_eq!(report.transitions.len(), 1);
    assert_eq!(report.transitions[0].to, HealthState::Active);
    let stored = h.state.agents.require("a1").await.unwrap();
    assert_eq!(stored.health, HealthState::Active);
    assert!((Utc::now() - stored.last_heartbeat).num_minutes() < 1);
}

#[tokio::test]
async fn first_capture_is_only_a_baseline() {
    let h = Harness::new().await;
    h.agent("a1", 7, "idle prompt\n").await;

    let report = h.state.monitor.tick().await.unwrap().expect("tick ran");
    let stored = h.state.agents.require("a1").await.unwrap();
    assert!(stored.output_digest.is_some());
    assert_eq!(stored.health, HealthState::Stale);
    assert_eq!(report.transitions[0].to, HealthState::Stale);
    assert!(report.poked.is_empty());
}

#[tokio::test]
async fn stuck_agent_is_killed_when_enabled() {
    let h = Harness::with_config(|c| c.auto_actions.kill_on_stuck = true).await;
    let agent = h.agent("a1", 40, "spinning\n").await;

    let report = h.state.monitor.tick().await.unwrap().expect("tick ran");
    assert_eq!(report.killed, vec!["a1"]);
    assert_eq!(h.sessions.killed().await, vec![agent.session_handle.clone()]);

    let stored = h.state.agents.require("a1").await.unwrap();
    assert_eq!(stored.completion_reason, Some(CompletionReason::AutoKilledStuck));
    assert_eq!(stored.health, HealthState::Stuck);
    assert!(h.state.agents.list_live().await.unwrap().is_empty());
}

#[tokio::test]
async fn stuck_agent_is_left_alone_by_default() {
    let h = Harness::new().await;
    let agent = h.agent("a1", 40, "spinning\n").await;

    let report = h.state.monitor.tick().await.unwrap().expect("tick ran");
    assert!(report.killed.is_empty());
    assert!(h.sessions.session(&agent.session_handle).await.is_some());
    let stored = h.state.agents.require("a1").await.unwrap();
    assert_eq!(stored.health, HealthState::Stuck);
    assert!(!stored.is_terminal());
}

#[tokio::test]
async fn failed_kill_is_retried_next_tick() {
    let h = Harness::with_config(|c| c.auto_actions.kill_on_stuck = true).await;
    let agent = h.agent("a1", 40, "spinning\n").await;
    h.sessions.fail_kill(&agent.session_handle).await;

    for _ in 0..2 {
        let report = h.state.monitor.tick().await.unwrap().expect("tick ran");
        assert!(report.killed.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].agent_id, "a1");
        let stored = h.state.agents.require("a1").await.unwrap();
        assert_eq!(stored.health, HealthState::Active);
        assert!(!stored.is_terminal());
    }
}

#[tokio::test]
async fn vanished_session_marks_agent_terminal() {
    let h = Harness::new().await;
    let agent = h.agent("a1", 1, "").await;
    h.agent("a2", 1, "").await;
    h.sessions.vanish(&agent.session_handle).await;

    let report = h.state.monitor.tick().await.unwrap().expect("tick ran");
    assert_eq!(report.checked, 2);
    assert_eq!(report.session_gone, vec!["a1"]);
    let stored = h.state.agents.require("a1").await.unwrap();
    assert_eq!(stored.completion_reason, Some(CompletionReason::SessionGone));
    assert!(!h.state.agents.require("a2").await.unwrap().is_terminal());
}

#[tokio::test]
async fn overlapping_tick_is_skipped() {
    let h = Harness::new().await;
    h.agent("a1", 1, "work\n").await;
    h.sessions.set_capture_delay(Duration::from_millis(300)).await;

    let monitor = Arc::clone(&h.state.monitor);
    let (first, second) = tokio::join!(monitor.tick(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.tick().await
    });

    assert!(first.unwrap().is_some());
    assert!(second.unwrap().is_none());
    assert!(monitor.tick().await.unwrap().is_some());
}

#[tokio::test]
async fn emergency_stop_reports_partial_failure() {
    let h = Harness::new().await;
    h.agent("a1", 1, "").await;
    let stubborn = h.agent("a2", 1, "").await;
    h.agent("a3", 1, "").await;
    h.sessions.fail_kill(&stubborn.session_handle).await;

    let report = h.state.monitor.emergency_stop().await.unwrap();
    let mut killed = report.killed.clone();
    killed.sort();
    assert_eq!(killed, vec!["a1", "a3"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].agent_id, "a2");

    let live = h.state.agents.list_live().await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, "a2");
    assert_eq!(
        h.state.agents.require("a1").await.unwrap().completion_reason,
        Some(CompletionReason::EmergencyStop)
    );
}

#[tokio::test]
async fn status_counts_without_touching_sessions() {
    let h = Harness::new().await;
    h.agent("fresh", 0, "").await;
    h.agent("stale", 7, "").await;
    h.agent("warn", 20, "").await;
    h.agent("stuck", 40, "").await;

    let status = h.state.monitor.get_status().await.unwrap();
    assert_eq!(status.counts.active, 1);
    assert_eq!(status.counts.stale, 1);
    assert_eq!(status.counts.warning, 1);
    assert_eq!(status.counts.stuck, 1);
    assert_eq!(status.counts.total(), 4);

    let mut attention: Vec<&str> = status
        .needs_attention
        .iter()
        .map(|a| a.agent_id.as_str())
        .collect();
    attention.sort_unstable();
    assert_eq!(attention, vec!["stuck", "warn"]);
    assert!(!status.running);
    assert!(status.last_tick.is_none());

    // get_status is read-only.
    assert_eq!(
        h.state.agents.require("warn").await.unwrap().health,
        HealthState::Active
    );
    assert!(h.sessions.inputs("cloister-agent-warn").await.is_empty());
}

#[tokio::test]
async fn scheduler_start_and_stop_are_idempotent() {
    let h = Harness::new().await;
    let monitor = &h.state.monitor;

    assert!(monitor.start().await);
    assert!(!monitor.start().await);
    assert!(monitor.is_running().await);

    assert!(monitor.stop().await);
    assert!(!monitor.stop().await);
    assert!(!monitor.is_running().await);
}

#[tokio::test]
async fn heartbeat_during_capture_keeps_agent_alive() {
    let h = Harness::with_config(|c| c.auto_actions.kill_on_stuck = true).await;
    let agent = h.agent("a1", 40, "spinning\n").await;
    h.sessions
        .set_capture_delay(Duration::from_millis(300))
        .await;

    let (report, _) = tokio::join!(h.state.monitor.tick(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        agents::record_heartbeat(&h.state.agents, "a1", None)
            .await
            .unwrap();
    });
    let report = report.unwrap().expect("tick ran");

    assert!(report.killed.is_empty());
    assert!(report.poked.is_empty());
    assert!(h.sessions.killed().await.is_empty());
    assert!(h.sessions.live().await.contains(&agent.session_handle));
    let stored = h.state.agents.require("a1").await.unwrap();
    assert!(!stored.is_terminal());
    assert_eq!(stored.health, HealthState::Active);
}

#[tokio::test]
async fn completion_during_capture_is_not_overwritten() {
    let h = Harness::with_config(|c| c.auto_actions.kill_on_stuck = true).await;
    h.agent("a1", 40, "spinning\n").await;
    h.sessions
        .set_capture_delay(Duration::from_millis(300))
        .await;

    let (report, _) = tokio::join!(h.state.monitor.tick(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        agents::report_completion(&h.state.agents, "a1", true)
            .await
            .unwrap();
    });
    let report = report.unwrap().expect("tick ran");

    assert!(report.killed.is_empty());
    assert!(report.transitions.is_empty());
    assert!(h.sessions.killed().await.is_empty());
    let stored = h.state.agents.require("a1").await.unwrap();
    assert_eq!(stored.completion_reason, Some(CompletionReason::Finished));
}

#[tokio::test]
async fn poke_is_not_repeated_when_the_baseline_cannot_be_read() {
    let h = Harness::new().await;
    let agent = h.agent("a1", 20, "building\n").await;
    h.sessions.fail_capture(&agent.session_handle).await;

    let first = h.state.monitor.tick().await.unwrap().expect("tick ran");
    assert_eq!(first.poked, vec!["a1"]);
    assert!(!first.failures.is_empty());
    let stored = h.state.agents.require("a1").await.unwrap();
    assert_eq!(stored.health, HealthState::Warning);

    let second = h.state.monitor.tick().await.unwrap().expect("tick ran");
    assert!(second.poked.is_empty());
    assert_eq!(h.sessions.inputs(&agent.session_handle).await.len(), 1);
}
