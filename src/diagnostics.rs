//! Transcript health check.
//!
//! Scans agent transcripts (`*.jsonl`, one JSON message per line) and
//! flags sessions that are looping or bloated. `fix` removes transcripts
//! with a critical finding so the runtime cannot resume into them.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::{AppError, Result};

/// More warmup errors than this is a critical loop.
pub const WARMUP_ERROR_LIMIT: u32 = 10;
/// More messages than this is excessive.
pub const MESSAGE_LIMIT: u64 = 500;
/// A single command issued more often than this is a retry loop.
pub const REPEATED_COMMAND_LIMIT: u32 = 50;
/// Transcripts above this size (KiB) are flagged.
pub const SIZE_LIMIT_KB: f64 = 2000.0;

/// Only the most frequent commands are checked for repetition.
const TOP_COMMANDS: usize = 5;
const COMMAND_PREVIEW_CHARS: usize = 50;

/// Finding severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Transcript is unusable; `fix` removes it.
    Critical,
    /// Worth a look.
    Warning,
}

/// One finding on a transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TranscriptIssue {
    /// Severity.
    pub severity: Severity,
    /// Description.
    pub message: String,
}

/// Statistics and findings for one transcript file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TranscriptStats {
    /// Full path.
    pub path: PathBuf,
    /// File name.
    pub name: String,
    /// Size in KiB.
    pub size_kb: f64,
    /// Lines in the file, parseable or not.
    pub message_count: u64,
    /// Tool results that came back as a `Warmup` error.
    pub warmup_errors: u32,
    /// Whether any message belongs to a sidechain.
    pub is_sidechain: bool,
    /// Findings.
    pub issues: Vec<TranscriptIssue>,
}

impl TranscriptStats {
    /// Whether any finding is critical.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }

    /// Whether there is any finding at all.
    #[must_use]
    pub fn is_problematic(&self) -> bool {
        !self.issues.is_empty()
    }
}

/// Outcome of a scan, plus removals when `fix` was requested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionHealthReport {
    /// Directory scanned.
    pub base_path: PathBuf,
    /// Transcripts found.
    pub total: usize,
    /// Transcripts with at least one finding.
    pub problematic: usize,
    /// Per-transcript results, sorted by path.
    pub transcripts: Vec<TranscriptStats>,
    /// Files removed by `fix`.
    pub removed: Vec<PathBuf>,
    /// Files `fix` could not remove, with the error.
    pub remove_failures: Vec<(PathBuf, String)>,
}

/// `$HOME/.claude/projects`, where the agent runtime keeps transcripts.
#[must_use]
pub fn default_transcript_root() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".claude").join("projects"))
}

/// Key for a `tool_use` block: its `command` input, else the tool name.
fn command_key(block: &Value) -> String {
    block
        .get("input")
        .and_then(|input| input.get("command"))
        .and_then(Value::as_str)
        .or_else(|| block.get("name").and_then(Value::as_str))
        .unwrap_or("unknown")
        .to_owned()
}

fn content_blocks(msg: &Value) -> &[Value] {
    msg.get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map_or(&[], Vec::as_slice)
}

fn preview(command: &str) -> String {
    command.chars().take(COMMAND_PREVIEW_CHARS).collect()
}

/// Analyze a single transcript. Unparseable lines still count as
/// messages; an unreadable file yields a finding instead of an error.
#[must_use]
pub fn analyze_transcript(path: &Path) -> TranscriptStats {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    #[allow(clippy::cast_precision_loss)]
    let size_kb = fs::metadata(path).map_or(0.0, |m| m.len() as f64 / 1024.0);

    let mut stats = TranscriptStats {
        path: path.to_path_buf(),
        name,
        size_kb,
        message_count: 0,
        warmup_errors: 0,
        is_sidechain: false,
        issues: Vec::new(),
    };

    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) => {
            stats.issues.push(TranscriptIssue {
                severity: Severity::Warning,
                message: format!("error reading file: {err}"),
            });
            return stats;
        }
    };

    let mut tool_calls: HashMap<String, u32> = HashMap::new();
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                stats.issues.push(TranscriptIssue {
                    severity: Severity::Warning,
                    message: format!("error reading file: {err}"),
                });
                return stats;
            }
        };
        stats.message_count += 1;

        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            continue;
        };

        if msg.get("isSidechain").and_then(Value::as_bool) == Some(true) {
            stats.is_sidechain = true;
        }

        match msg.get("type").and_then(Value::as_str) {
            Some("user") => {
                stats.warmup_errors += u32::try_from(
                    content_blocks(&msg)
                        .iter()
                        .filter(|b| {
                            b.get("content").and_then(Value::as_str) == Some("Warmup")
                                && b.get("is_error").and_then(Value::as_bool) == Some(true)
                        })
                        .count(),
                )
                .unwrap_or(u32::MAX);
            }
            Some("assistant") => {
                for block in content_blocks(&msg) {
                    if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                        continue;
                    }
                    *tool_calls.entry(command_key(block)).or_default() += 1;
                }
            }
            _ => {}
        }
    }

    if stats.warmup_errors > WARMUP_ERROR_LIMIT {
        stats.issues.push(TranscriptIssue {
            severity: Severity::Critical,
            message: format!("warmup loop detected ({} warmup errors)", stats.warmup_errors),
        });
    }

    if stats.message_count > MESSAGE_LIMIT {
        stats.issues.push(TranscriptIssue {
            severity: Severity::Warning,
            message: format!("excessive messages ({})", stats.message_count),
        });
    }

    let mut ranked: Vec<(String, u32)> = tool_calls.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    for (command, count) in ranked.into_iter().take(TOP_COMMANDS) {
        if count > REPEATED_COMMAND_LIMIT {
            stats.issues.push(TranscriptIssue {
                severity: Severity::Warning,
                message: format!("command repeated {count}x: {}", preview(&command)),
            });
        }
    }

    if stats.size_kb > SIZE_LIMIT_KB {
        stats.issues.push(TranscriptIssue {
            severity: Severity::Warning,
            message: format!("large session file ({:.0}KB)", stats.size_kb),
        });
    }

    stats
}

/// Every `*.jsonl` under `base`, sorted.
///
/// # Errors
///
/// Returns `AppError::Io` if the search pattern is invalid.
pub fn find_transcripts(base: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/**/*.jsonl",
        glob::Pattern::escape(&base.to_string_lossy())
    );
    let entries =
        glob::glob(&pattern).map_err(|err| AppError::Io(format!("bad transcript pattern: {err}")))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(path) if path.is_file() => Some(path),
            Ok(_) => None,
            Err(err) => {
                warn!(%err, "skipping unreadable transcript path");
                None
            }
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// Scan `base` and, when `fix` is set, delete critical transcripts.
///
/// # Errors
///
/// Returns `AppError::NotFound` if `base` does not exist.
pub fn check_sessions(base: &Path, fix: bool) -> Result<SessionHealthReport> {
    if !base.exists() {
        return Err(AppError::NotFound(format!(
            "transcript directory {}",
            base.display()
        )));
    }

    let transcripts: Vec<TranscriptStats> = find_transcripts(base)?
        .iter()
        .map(|p| analyze_transcript(p))
        .collect();
    let problematic = transcripts.iter().filter(|t| t.is_problematic()).count();

    let mut removed = Vec::new();
    let mut remove_failures = Vec::new();
    if fix {
        for stats in transcripts.iter().filter(|t| t.is_critical()) {
            match fs::remove_file(&stats.path) {
                Ok(()) => {
                    info!(path = %stats.path.display(), "removed critical transcript");
                    removed.push(stats.path.clone());
                }
                Err(err) => {
                    warn!(path = %stats.path.display(), %err, "failed to remove transcript");
                    remove_failures.push((stats.path.clone(), err.to_string()));
                }
            }
        }
    }

    Ok(SessionHealthReport {
        base_path: base.to_path_buf(),
        total: transcripts.len(),
        problematic,
        transcripts,
        removed,
        remove_failures,
    })
}
