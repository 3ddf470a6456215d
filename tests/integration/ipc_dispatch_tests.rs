use serde_json::json;

use cloister::ipc::server::{dispatch_command, IpcRequest};
use cloister::models::specialist::QueuePayload;

use super::test_helpers::Harness;

#[tokio::test]
async fn unknown_command_is_a_validation_error() {
    let h = Harness::new().await;
    let response = dispatch_command(&IpcRequest::command("frobnicate"), &h.state).await;
    assert!(!response.ok);
    assert_eq!(response.kind.as_deref(), Some("validation"));
    assert!(response.error.unwrap().contains("frobnicate"));
}

#[tokio::test]
async fn missing_field_is_reported() {
    let h = Harness::new().await;
    let response = dispatch_command(&IpcRequest::command("convoy-stop"), &h.state).await;
    assert!(!response.ok);
    assert_eq!(response.kind.as_deref(), Some("validation"));
}

#[tokio::test]
async fn watchdog_start_status_stop() {
    let h = Harness::new().await;

    let started = dispatch_command(&IpcRequest::command("watchdog-start"), &h.state).await;
    assert!(started.ok);
    assert_eq!(started.data.unwrap()["started"], json!(true));

    let status = dispatch_command(&IpcRequest::command("watchdog-status"), &h.state).await;
    let data = status.data.expect("status data");
    assert_eq!(data["running"], json!(true));
    assert_eq!(data["thresholds"]["warning"], json!(15));

    let stopped = dispatch_command(&IpcRequest::command("watchdog-stop"), &h.state).await;
    assert_eq!(stopped.data.unwrap()["stopped"], json!(true));
}

#[tokio::test]
async fn convoy_lifecycle_over_ipc() {
    let h = Harness::new().await;

    let mut start = IpcRequest::command("convoy-start");
    start.template = Some("merge-pipeline".into());
    start.issue_id = Some("PAN-5".into());
    let started = dispatch_command(&start, &h.state).await;
    assert!(started.ok, "{:?}", started.error);
    let convoy = started.data.unwrap();
    let id = convoy["id"].as_str().unwrap().to_owned();
    assert_eq!(convoy["agents"].as_array().unwrap().len(), 3);

    let running = dispatch_command(&IpcRequest::command("convoy-status"), &h.state).await;
    assert_eq!(running.data.unwrap().as_array().unwrap().len(), 1);

    let mut stop = IpcRequest::command("convoy-stop");
    stop.id = Some(id.clone());
    stop.force = true;
    let stopped = dispatch_command(&stop, &h.state).await;
    assert!(stopped.ok);
    assert_eq!(stopped.data.unwrap()["convoy"]["status"], json!("failed"));

    let mut filtered = IpcRequest::command("convoy-list");
    filtered.status = Some("failed".into());
    let listed = dispatch_command(&filtered, &h.state).await;
    assert_eq!(listed.data.unwrap()[0]["id"], json!(id));

    let mut bad = IpcRequest::command("convoy-list");
    bad.status = Some("sideways".into());
    assert!(!dispatch_command(&bad, &h.state).await.ok);
}

#[tokio::test]
async fn unknown_template_maps_to_its_kind() {
    let h = Harness::new().await;
    let mut start = IpcRequest::command("convoy-start");
    start.template = Some("nope".into());
    let response = dispatch_command(&start, &h.state).await;
    assert_eq!(response.kind.as_deref(), Some("template_not_found"));
}

#[tokio::test]
async fn enqueue_then_dispatch_over_ipc() {
    let h = Harness::new().await;

    let mut enqueue = IpcRequest::command("enqueue");
    enqueue.specialist = Some("test".into());
    enqueue.priority = Some("urgent".into());
    enqueue.payload = Some(QueuePayload {
        issue_id: Some("PAN-8".into()),
        ..QueuePayload::default()
    });
    let queued = dispatch_command(&enqueue, &h.state).await;
    assert!(queued.ok, "{:?}", queued.error);
    assert_eq!(queued.data.unwrap()["source"], json!("ctl"));

    let mut peek = IpcRequest::command("specialists-queue");
    peek.specialist = Some("test-agent".into());
    let snapshot = dispatch_command(&peek, &h.state).await.data.unwrap();
    assert_eq!(snapshot["urgent_count"], json!(1));

    let mut dispatch = IpcRequest::command("dispatch");
    dispatch.specialist = Some("test-agent".into());
    let outcome = dispatch_command(&dispatch, &h.state).await.data.unwrap();
    assert_eq!(outcome["wake"]["spawned"], json!(true));
    assert_eq!(h.sessions.created().await, vec!["cloister-test-agent"]);
}

#[tokio::test]
async fn heartbeat_and_done_over_ipc() {
    let h = Harness::new().await;
    h.agent("a1", 20, "").await;

    let mut beat = IpcRequest::command("heartbeat");
    beat.id = Some("a1".into());
    beat.context_tokens = Some(190_000);
    let ack = dispatch_command(&beat, &h.state).await;
    assert!(ack.ok, "{:?}", ack.error);
    let data = ack.data.unwrap();
    assert_eq!(data["agent"]["context_tokens"], json!(190_000));
    assert_eq!(data["rotation"]["should_rotate"], json!(true));

    let mut done = IpcRequest::command("agent-done");
    done.id = Some("a1".into());
    done.success = Some(false);
    let record = dispatch_command(&done, &h.state).await.data.unwrap();
    assert_eq!(record["completion_reason"], json!("failed"));

    let again = dispatch_command(&beat, &h.state).await;
    assert_eq!(again.kind.as_deref(), Some("validation"));
}

#[tokio::test]
async fn specialists_reset_without_counter_is_not_found() {
    let h = Harness::new().await;
    let mut reset = IpcRequest::command("specialists-reset");
    reset.work_item_id = Some("PAN-404".into());
    let response = dispatch_command(&reset, &h.state).await;
    assert_eq!(response.kind.as_deref(), Some("not_found"));
}

#[tokio::test]
async fn session_health_scans_the_given_path() {
    let h = Harness::new().await;
    let transcripts = h.dir.path().join("transcripts");
    std::fs::create_dir_all(transcripts.join("proj")).unwrap();
    std::fs::write(transcripts.join("proj/s1.jsonl"), "{\"type\":\"user\"}\n").unwrap();

    let mut scan = IpcRequest::command("session-health");
    scan.path = Some(transcripts);
    let report = dispatch_command(&scan, &h.state).await;
    assert!(report.ok, "{:?}", report.error);
    let data = report.data.unwrap();
    assert_eq!(data["total"], json!(1));
    assert_eq!(data["problematic"], json!(0));
}
