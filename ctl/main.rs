#![forbid(unsafe_code)]

//! `cloister-ctl`: local CLI companion for the `cloister` daemon.
//!
//! Connects to the IPC socket and sends one JSON command per invocation.
//! With `--json` the daemon's payload is printed verbatim; otherwise a
//! short human summary is shown.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};
use serde_json::Value;

use cloister::ipc::server::{IpcRequest, IpcResponse};
use cloister::models::specialist::QueuePayload;

#[derive(Debug, Parser)]
#[command(
    name = "cloister-ctl",
    about = "Local CLI for the cloister supervisor",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the daemon's `ipc_name` config).
    #[arg(long, default_value = "cloister", global = true)]
    ipc_name: String,

    /// Print the raw JSON payload instead of a summary.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Health watchdog.
    #[command(subcommand)]
    Watchdog(WatchdogCommand),

    /// Convoys of cooperating agents.
    #[command(subcommand)]
    Convoy(ConvoyCommand),

    /// Specialist queues and sessions.
    #[command(subcommand)]
    Specialists(SpecialistCommand),

    /// Reports on behalf of a running agent.
    #[command(subcommand)]
    Agent(AgentCommand),

    /// Scan agent transcripts for loops and bloat.
    Health {
        /// Transcript directory (defaults to ~/.claude/projects).
        #[arg(long)]
        path: Option<PathBuf>,
        /// Remove transcripts with a critical finding.
        #[arg(long)]
        fix: bool,
    },
}

#[derive(Debug, Subcommand)]
enum WatchdogCommand {
    /// Aggregate health and attention list.
    Status,
    /// Start the periodic health check.
    Start,
    /// Stop the periodic health check; agents keep running.
    Stop,
    /// Kill every live agent.
    EmergencyStop {
        /// Skip the confirmation prompt.
        #[arg(long, short)]
        yes: bool,
    },
}

#[derive(Debug, Args)]
struct ConvoyStartArgs {
    /// Template name.
    template: String,
    /// Files under review (repeatable).
    #[arg(long = "files", num_args = 1..)]
    files: Vec<String>,
    /// Pull request URL.
    #[arg(long)]
    pr_url: Option<String>,
    /// Issue identifier.
    #[arg(long)]
    issue_id: Option<String>,
    /// Project directory the agents work in.
    #[arg(long)]
    project_path: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ConvoyCommand {
    /// Start a convoy from a template.
    Start(ConvoyStartArgs),
    /// One convoy, or every running convoy when no id is given.
    Status {
        /// Convoy id.
        id: Option<String>,
    },
    /// All convoys, newest first.
    List {
        /// Filter: running, completed, failed or partial.
        #[arg(long)]
        status: Option<String>,
    },
    /// Stop a convoy's members.
    Stop {
        /// Convoy id.
        id: String,
        /// Kill without interrupting first, and skip confirmation.
        #[arg(long)]
        force: bool,
    },
    /// Available templates.
    Templates,
}

#[derive(Debug, Subcommand)]
enum SpecialistCommand {
    /// Every specialist with queue depth and session state.
    List,
    /// Pending items for one specialist.
    Queue {
        /// merge-agent, review-agent or test-agent.
        name: String,
    },
    /// Make sure a specialist session is running.
    Wake {
        /// merge-agent, review-agent or test-agent.
        name: String,
        /// Message to deliver.
        #[arg(long)]
        task: Option<String>,
    },
    /// Reset a work item's requeue counter.
    Reset {
        /// Work item id.
        work_item: String,
    },
    /// Hand the next queued item to the specialist.
    Dispatch {
        /// merge-agent, review-agent or test-agent.
        name: String,
    },
    /// Queue work for a specialist.
    Enqueue {
        /// merge-agent, review-agent or test-agent.
        name: String,
        /// low, normal, high or urgent.
        #[arg(long, default_value = "normal")]
        priority: String,
        /// Issue identifier.
        #[arg(long)]
        issue_id: Option<String>,
        /// Pull request URL.
        #[arg(long)]
        pr_url: Option<String>,
        /// Branch under work.
        #[arg(long)]
        branch: Option<String>,
        /// Free-form instructions.
        #[arg(long)]
        message: Option<String>,
    },
    /// Save the runtime session id so the next wake resumes it.
    RecordSession {
        /// merge-agent, review-agent or test-agent.
        name: String,
        /// Runtime session id.
        session_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum AgentCommand {
    /// Record activity and get the rotation verdict.
    Heartbeat {
        /// Agent id.
        id: String,
        /// Current context size.
        #[arg(long)]
        context_tokens: Option<u64>,
    },
    /// Report the agent's work as done.
    Done {
        /// Agent id.
        id: String,
        /// Report failure instead of success.
        #[arg(long)]
        failed: bool,
    },
}

fn build_request(command: &Command) -> Option<IpcRequest> {
    let request = match command {
        Command::Watchdog(cmd) => match cmd {
            WatchdogCommand::Status => IpcRequest::command("watchdog-status"),
            WatchdogCommand::Start => IpcRequest::command("watchdog-start"),
            WatchdogCommand::Stop => IpcRequest::command("watchdog-stop"),
            WatchdogCommand::EmergencyStop { yes } => {
                if !yes && !confirm("Kill every live agent?") {
                    return None;
                }
                IpcRequest::command("emergency-stop")
            }
        },
        Command::Convoy(cmd) => match cmd {
            ConvoyCommand::Start(args) => IpcRequest {
                template: Some(args.template.clone()),
                files: args.files.clone(),
                pr_url: args.pr_url.clone(),
                issue_id: args.issue_id.clone(),
                project_path: args.project_path.clone(),
                ..IpcRequest::command("convoy-start")
            },
            ConvoyCommand::Status { id } => IpcRequest {
                id: id.clone(),
                ..IpcRequest::command("convoy-status")
            },
            ConvoyCommand::List { status } => IpcRequest {
                status: status.clone(),
                ..IpcRequest::command("convoy-list")
            },
            ConvoyCommand::Stop { id, force } => {
                if !force && !confirm(&format!("Stop convoy {id}?")) {
                    return None;
                }
                IpcRequest {
                    id: Some(id.clone()),
                    force: *force,
                    ..IpcRequest::command("convoy-stop")
                }
            }
            ConvoyCommand::Templates => IpcRequest::command("templates"),
        },
        Command::Specialists(cmd) => match cmd {
            SpecialistCommand::List => IpcRequest::command("specialists-list"),
            SpecialistCommand::Queue { name } => specialist_request("specialists-queue", name),
            SpecialistCommand::Wake { name, task } => IpcRequest {
                task: task.clone(),
                ..specialist_request("specialists-wake", name)
            },
            SpecialistCommand::Reset { work_item } => IpcRequest {
                work_item_id: Some(work_item.clone()),
                ..IpcRequest::command("specialists-reset")
            },
            SpecialistCommand::Dispatch { name } => specialist_request("dispatch", name),
            SpecialistCommand::Enqueue {
                name,
                priority,
                issue_id,
                pr_url,
                branch,
                message,
            } => IpcRequest {
                priority: Some(priority.clone()),
                payload: Some(QueuePayload {
                    issue_id: issue_id.clone(),
                    pr_url: pr_url.clone(),
                    branch: branch.clone(),
                    message: message.clone(),
                    ..QueuePayload::default()
                }),
                ..specialist_request("enqueue", name)
            },
            SpecialistCommand::RecordSession { name, session_id } => IpcRequest {
                session_id: Some(session_id.clone()),
                ..specialist_request("record-session", name)
            },
        },
        Command::Agent(cmd) => match cmd {
            AgentCommand::Heartbeat { id, context_tokens } => IpcRequest {
                id: Some(id.clone()),
                context_tokens: *context_tokens,
                ..IpcRequest::command("heartbeat")
            },
            AgentCommand::Done { id, failed } => IpcRequest {
                id: Some(id.clone()),
                success: Some(!failed),
                ..IpcRequest::command("agent-done")
            },
        },
        Command::Health { path, fix } => IpcRequest {
            path: path.clone(),
            fix: *fix,
            ..IpcRequest::command("session-health")
        },
    };
    Some(request)
}

fn specialist_request(command: &str, name: &str) -> IpcRequest {
    IpcRequest {
        specialist: Some(name.to_owned()),
        ..IpcRequest::command(command)
    }
}

fn confirm(question: &str) -> bool {
    print!("{question} [y/N] ");
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

fn main() {
    let args = Cli::parse();

    let Some(request) = build_request(&args.command) else {
        println!("Aborted.");
        return;
    };

    match send_ipc_command(&args.ipc_name, &request) {
        Ok(response) if response.ok => {
            let data = response.data.unwrap_or(Value::Null);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&data).unwrap_or_default());
            } else {
                print_summary(&request.command, &data);
            }
        }
        Ok(response) => {
            let err_msg = response.error.as_deref().unwrap_or("unknown error");
            if args.json {
                let body = serde_json::json!({
                    "ok": false,
                    "error": err_msg,
                    "kind": response.kind,
                });
                println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
            } else {
                eprintln!("Error: {err_msg}");
            }
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("Failed to connect to supervisor: {err}");
            eprintln!("Is cloister running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("-")
}

/// Short human rendering of the common payloads; anything else is
/// printed as pretty JSON.
fn print_summary(command: &str, data: &Value) {
    match command {
        "watchdog-status" => {
            let running = data.get("running").and_then(Value::as_bool).unwrap_or(false);
            println!("Watchdog: {}", if running { "running" } else { "stopped" });
            if let Some(counts) = data.get("counts") {
                println!(
                    "Agents: active {} | stale {} | warning {} | stuck {}",
                    counts.get("active").unwrap_or(&Value::Null),
                    counts.get("stale").unwrap_or(&Value::Null),
                    counts.get("warning").unwrap_or(&Value::Null),
                    counts.get("stuck").unwrap_or(&Value::Null),
                );
            }
            for item in data
                .get("needs_attention")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                println!(
                    "  ! {} {} ({} min idle)",
                    str_field(item, "agent_id"),
                    str_field(item, "health"),
                    item.get("minutes_silent").unwrap_or(&Value::Null),
                );
            }
        }
        "convoy-list" | "convoy-status" if data.is_array() => {
            for convoy in data.as_array().into_iter().flatten() {
                println!(
                    "{}  {}  {}",
                    str_field(convoy, "id"),
                    str_field(convoy, "template"),
                    str_field(convoy, "status"),
                );
            }
        }
        "convoy-start" | "convoy-status" => {
            println!(
                "Convoy {} ({}) {}",
                str_field(data, "id"),
                str_field(data, "template"),
                str_field(data, "status"),
            );
            for member in data
                .get("agents")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                println!(
                    "  {:<12} {:<10} {}",
                    str_field(member, "role"),
                    str_field(member, "status"),
                    str_field(member, "agent_id"),
                );
            }
        }
        "specialists-list" => {
            for row in data.as_array().into_iter().flatten() {
                let running = row.get("running").and_then(Value::as_bool).unwrap_or(false);
                println!(
                    "{:<13} {:<8} queue {} (urgent {})",
                    str_field(row, "specialist_type"),
                    if running { "running" } else { "idle" },
                    row.get("queue_depth").unwrap_or(&Value::Null),
                    row.get("urgent_count").unwrap_or(&Value::Null),
                );
            }
        }
        _ => println!("{}", serde_json::to_string_pretty(data).unwrap_or_default()),
    }
}

/// Connect to the IPC socket, send one request, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &IpcRequest,
) -> std::result::Result<IpcResponse, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    Ok(serde_json::from_str(response_line.trim())?)
}
