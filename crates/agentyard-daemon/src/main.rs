//! `agentyard` Daemon
//!
//! Runs the given prompts as coding-agent tasks, streams their events to the
//! log, and takes permission answers on stdin.

use std::io::BufRead;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use agentyard_core::config::load_config;
use agentyard_core::tracing_init::{default_filter, init_tracing};
use agentyard_daemon::permission::PermissionResponse;
use agentyard_daemon::task::{TaskEvent, TaskEvents, TaskManager, TaskResult, TaskSpec, TaskStatus};

#[derive(Parser, Debug)]
#[command(name = "agentyard-daemon")]
#[command(version, about = "agentyard daemon - coding-agent task runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, global = true, default_value = "info", env = "AGENTYARD_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "AGENTYARD_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run prompts as tasks and answer their permission requests on stdin
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Prompt to run as a task (repeat for several tasks)
    #[arg(long = "prompt", required = true)]
    prompts: Vec<String>,

    /// Allocate a browser-automation port pair for every task
    #[arg(long)]
    browser: bool,

    /// Model passed to the agent
    #[arg(long, env = "AGENTYARD_MODEL")]
    model: Option<String>,

    /// Project directory (reads `.agentyard/settings.json`, used as the agents' working directory)
    #[arg(long, env = "AGENTYARD_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Tasks allowed to run at once
    #[arg(long)]
    max_concurrent_tasks: Option<usize>,

    /// Warm agent servers kept ahead of demand
    #[arg(long)]
    min_idle: Option<usize>,

    /// Upper bound on alive agent servers
    #[arg(long)]
    max_total: Option<usize>,

    /// Path to the agent CLI binary
    #[arg(long)]
    agent_bin: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(
        &default_filter(env!("CARGO_PKG_NAME"), &cli.log_level),
        cli.log_json,
    );

    match cli.command {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.project_dir.as_deref())?;
    if let Some(n) = args.max_concurrent_tasks {
        config.tasks.max_concurrent_tasks = n;
    }
    if let Some(n) = args.min_idle {
        config.pool.min_idle = n;
    }
    if let Some(n) = args.max_total {
        config.pool.max_total = n;
    }
    if let Some(bin) = args.agent_bin {
        config.pool.agent_bin = bin;
    }
    if config.pool.working_directory.is_none() {
        config.pool.working_directory.clone_from(&args.project_dir);
    }
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        tasks = args.prompts.len(),
        max_concurrent_tasks = config.tasks.max_concurrent_tasks,
        min_idle = config.pool.min_idle,
        max_total = config.pool.max_total,
        agent_bin = %config.pool.agent_bin.display(),
        "Starting agentyard-daemon"
    );

    let manager = TaskManager::new(config)?;

    let mut watchers = JoinSet::new();
    for prompt in args.prompts {
        let mut spec = TaskSpec::new(prompt);
        spec.model.clone_from(&args.model);
        spec.working_directory.clone_from(&args.project_dir);
        spec.needs_browser = args.browser;

        let (task_id, events) = manager.submit(spec)?;
        info!(%task_id, "Submitted task");
        watchers.spawn(watch_task(events));
    }

    let answers = tokio::spawn(read_answers(
        manager.clone(),
        spawn_line_reader(std::io::BufReader::new(std::io::stdin())),
    ));

    let mut failed = 0usize;
    let mut interrupted = false;
    loop {
        tokio::select! {
            joined = watchers.join_next() => {
                let Some(joined) = joined else { break };
                match joined {
                    Ok(Some(result)) if result.status == TaskStatus::Completed => {}
                    Ok(_) => failed += 1,
                    Err(e) => {
                        warn!(error = %e, "Task watcher panicked");
                        failed += 1;
                    }
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                info!("Received Ctrl+C, cancelling tasks");
                interrupted = true;
                let manager = manager.clone();
                tokio::spawn(async move { manager.shutdown().await });
            }
        }
    }

    answers.abort();
    manager.shutdown().await;
    info!(failed, "Daemon stopped");

    if failed > 0 {
        anyhow::bail!("{failed} task(s) did not complete");
    }
    Ok(())
}

/// Log every event of one task; returns its final result.
async fn watch_task(mut events: TaskEvents) -> Option<TaskResult> {
    let task_id = events.task_id().to_string();
    while let Some(event) = events.next().await {
        match event {
            TaskEvent::Status { status, .. } => info!(%task_id, %status, "Task status"),
            TaskEvent::Message { message, .. } => {
                info!(%task_id, role = %message.role, content = %message.content, "Agent message");
            }
            TaskEvent::Progress { stage, message, .. } => {
                info!(%task_id, %stage, message = ?message, "Progress");
            }
            TaskEvent::Session { session_id, .. } => info!(%task_id, %session_id, "Agent session"),
            TaskEvent::PermissionRequested { request, .. } => {
                info!(
                    %task_id,
                    request_id = %request.id,
                    kind = ?request.kind,
                    tool = ?request.tool_name,
                    question = ?request.question,
                    options = ?request.options,
                    "Permission requested; answer with `allow|deny <request_id>` or `answer <request_id> <text>`"
                );
            }
            TaskEvent::PermissionResolved { resolution, .. } => {
                info!(
                    %task_id,
                    request_id = %resolution.request_id,
                    allowed = resolution.is_allowed(),
                    source = ?resolution.source,
                    "Permission resolved"
                );
            }
            TaskEvent::Finished { result, .. } => {
                if let Some(error) = &result.error {
                    warn!(%task_id, status = %result.status, %error, failure = ?result.failure, "Task finished");
                } else {
                    info!(
                        %task_id,
                        status = %result.status,
                        summary = ?result.summary,
                        duration_ms = result.duration_ms,
                        "Task finished"
                    );
                }
                return Some(result);
            }
        }
    }
    None
}

/// One permission answer typed on stdin.
#[derive(Debug, PartialEq, Eq)]
enum Answer {
    Allow(String),
    Deny(String),
    Text { request_id: String, text: String },
}

impl Answer {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (verb, rest) = line.split_once(char::is_whitespace)?;
        let rest = rest.trim();
        match verb {
            "allow" if !rest.is_empty() => Some(Self::Allow(rest.to_string())),
            "deny" if !rest.is_empty() => Some(Self::Deny(rest.to_string())),
            "answer" => {
                let (request_id, text) = rest.split_once(char::is_whitespace)?;
                Some(Self::Text {
                    request_id: request_id.to_string(),
                    text: text.trim().to_string(),
                })
            }
            _ => None,
        }
    }

    fn into_response(self) -> PermissionResponse {
        match self {
            Self::Allow(request_id) => PermissionResponse::allow(request_id),
            Self::Deny(request_id) => PermissionResponse::deny(request_id),
            Self::Text { request_id, text } => PermissionResponse::allow(request_id).with_text(text),
        }
    }
}

/// Forward lines of `reader` from a dedicated OS thread.
///
/// A read blocked on an idle terminal must not keep the runtime alive at
/// exit, so this stays off tokio's blocking pool.
fn spawn_line_reader<R>(reader: R) -> mpsc::UnboundedReceiver<String>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read stdin");
                        return;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Could not start stdin reader; permission answers disabled");
    }
    rx
}

async fn read_answers(manager: TaskManager, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let Some(answer) = Answer::parse(&line) else {
            warn!(%line, "Unrecognised input; expected `allow|deny <request_id>` or `answer <request_id> <text>`");
            continue;
        };
        let response = answer.into_response();
        let request_id = response.request_id.clone();
        if !manager.resolve_permission(response) {
            warn!(%request_id, "No pending permission request with that id");
        }
    }
}
