use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use cloister::diagnostics::{analyze_transcript, check_sessions, find_transcripts, Severity};
use cloister::AppError;

fn warmup_line() -> String {
    serde_json::json!({
        "type": "user",
        "isSidechain": true,
        "message": {"content": [{"type": "tool_result", "content": "Warmup", "is_error": true}]}
    })
    .to_string()
}

fn tool_use_line(command: &str) -> String {
    serde_json::json!({
        "type": "assistant",
        "message": {"content": [{"type": "tool_use", "name": "Bash", "input": {"command": command}}]}
    })
    .to_string()
}

fn write_lines(path: &Path, lines: &[String]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, lines.join("\n") + "\n").unwrap();
}

#[test]
fn healthy_transcript_has_no_issues() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ok.jsonl");
    write_lines(&path, &[tool_use_line("cargo test"), "not json".to_owned()]);

    let stats = analyze_transcript(&path);
    assert_eq!(stats.message_count, 2);
    assert_eq!(stats.warmup_errors, 0);
    assert!(!stats.is_sidechain);
    assert!(!stats.is_problematic());
}

#[test]
fn warmup_loop_is_critical() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loop.jsonl");
    write_lines(&path, &vec![warmup_line(); 11]);

    let stats = analyze_transcript(&path);
    assert_eq!(stats.warmup_errors, 11);
    assert!(stats.is_sidechain);
    assert!(stats.is_critical());
    assert_eq!(stats.issues[0].severity, Severity::Critical);
}

#[test]
fn ten_warmup_errors_are_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edge.jsonl");
    write_lines(&path, &vec![warmup_line(); 10]);
    assert!(!analyze_transcript(&path).is_critical());
}

#[test]
fn repeated_command_and_message_count_are_warnings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("retry.jsonl");
    let mut lines = vec![tool_use_line("npm test"); 51];
    lines.extend(vec!["{}".to_owned(); 450]);
    write_lines(&path, &lines);

    let stats = analyze_transcript(&path);
    assert_eq!(stats.message_count, 501);
    assert!(!stats.is_critical());
    let messages: Vec<&str> = stats.issues.iter().map(|i| i.message.as_str()).collect();
    assert!(messages.iter().any(|m| m.contains("excessive messages (501)")));
    assert!(messages.iter().any(|m| m.contains("repeated 51x: npm test")));
}

#[test]
fn tool_calls_without_input_count_under_their_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bare.jsonl");
    let bare = serde_json::json!({
        "type": "assistant",
        "message": {"content": [{"type": "tool_use", "name": "Read"}]}
    })
    .to_string();
    write_lines(&path, &vec![bare; 51]);

    let stats = analyze_transcript(&path);
    let messages: Vec<&str> = stats.issues.iter().map(|i| i.message.as_str()).collect();
    assert!(messages.iter().any(|m| m.contains("repeated 51x: Read")));
}

#[test]
fn large_file_is_flagged() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.jsonl");
    let mut body = String::new();
    for _ in 0..30 {
        let _ = writeln!(body, "{{\"pad\":\"{}\"}}", "x".repeat(80 * 1024));
    }
    fs::write(&path, body).unwrap();

    let stats = analyze_transcript(&path);
    assert!(stats.size_kb > 2000.0);
    assert!(stats.issues.iter().any(|i| i.message.contains("large session file")));
}

#[test]
fn finds_nested_transcripts() {
    let dir = tempfile::tempdir().unwrap();
    write_lines(&dir.path().join("a/one.jsonl"), &["{}".to_owned()]);
    write_lines(&dir.path().join("b/c/two.jsonl"), &["{}".to_owned()]);
    fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

    let found = find_transcripts(dir.path()).unwrap();
    assert_eq!(found.len(), 2);
}

#[test]
fn fix_removes_only_critical_transcripts() {
    let dir = tempfile::tempdir().unwrap();
    let bad = dir.path().join("p/bad.jsonl");
    let noisy = dir.path().join("p/noisy.jsonl");
    let fine = dir.path().join("p/fine.jsonl");
    write_lines(&bad, &vec![warmup_line(); 12]);
    write_lines(&noisy, &vec!["{}".to_owned(); 600]);
    write_lines(&fine, &["{}".to_owned()]);

    let report = check_sessions(dir.path(), true).unwrap();
    assert_eq!(report.total, 3);
    assert_eq!(report.problematic, 2);
    assert_eq!(report.removed, vec![bad.clone()]);
    assert!(!bad.exists());
    assert!(noisy.exists());
    assert!(fine.exists());
}

#[test]
fn scan_without_fix_removes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let bad = dir.path().join("bad.jsonl");
    write_lines(&bad, &vec![warmup_line(); 12]);

    let report = check_sessions(dir.path(), false).unwrap();
    assert_eq!(report.problematic, 1);
    assert!(report.removed.is_empty());
    assert!(bad.exists());
}

#[test]
fn missing_directory_is_not_found() {
    let err = check_sessions(Path::new("/definitely/not/here"), false).expect_err("missing");
    assert!(matches!(err, AppError::NotFound(_)));
}
