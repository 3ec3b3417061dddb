//! Drives one admitted task from lease acquisition to cleanup.

use std::sync::Arc;
use std::time::Duration;

use agentyard_core::ndjson::{
    AgentEvent, BrowserEndpoint, Outbound, PermissionPrompt, TaskEnvelope, parse_line,
};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::events::EventSink;
use super::manager::{ManagerInner, StopKind};
use super::types::{TaskError, TaskEvent, TaskMessage, TaskSpec, TaskStatus};
use crate::lease::Lease;
use crate::permission::PermissionRequest;
use crate::ports::PortAllocation;
use crate::process::{AgentProcess, wait_for_exit, wait_for_exit_timeout};

/// How a run ended.
#[derive(Debug)]
pub(crate) enum RunEnd {
    Completed { summary: Option<String> },
    Failed(TaskError),
    Stopped(StopKind),
}

/// Resolves once a stop is requested; a dropped sender counts as cancel.
async fn stop_signal(stop_rx: &mut watch::Receiver<Option<StopKind>>) -> StopKind {
    loop {
        let current = *stop_rx.borrow_and_update();
        if let Some(kind) = current {
            return kind;
        }
        if stop_rx.changed().await.is_err() {
            return StopKind::Cancel;
        }
    }
}

pub(crate) async fn run(
    inner: &ManagerInner,
    task_id: &str,
    spec: TaskSpec,
    sink: &EventSink,
    mut stop_rx: watch::Receiver<Option<StopKind>>,
) -> RunEnd {
    let lease = match inner.pool.acquire().await {
        Ok(lease) => lease,
        Err(e) => return RunEnd::Failed(e.into()),
    };

    // Acquire runs to completion so a lease is never lost mid-spawn; the stop
    // request is honoured right after.
    let stop = *stop_rx.borrow_and_update();
    if let Some(kind) = stop {
        if let Some(lease) = lease {
            lease.release().await;
        }
        return RunEnd::Stopped(kind);
    }

    let allocation = if spec.needs_browser {
        match inner.ports.find_available_ports().await {
            Ok(allocation) => {
                info!(
                    task_id,
                    pair = %allocation.pair,
                    reuse_existing = allocation.reuses_existing(),
                    "Allocated browser ports"
                );
                Some(allocation)
            }
            Err(e) => {
                if let Some(lease) = lease {
                    lease.release().await;
                }
                return RunEnd::Failed(e.into());
            }
        }
    } else {
        None
    };

    // Port probing can take a while; do not start the agent for a task that
    // was stopped meanwhile.
    let stop = *stop_rx.borrow_and_update();
    if let Some(kind) = stop {
        debug!(task_id, ?kind, "Task stopped before the agent was started");
        if let Some(lease) = lease {
            lease.release().await;
        }
        return RunEnd::Stopped(kind);
    }

    let process = match &lease {
        Some(lease) => Arc::clone(lease.process()),
        None => match inner
            .launcher
            .spawn_direct(spec.working_directory.clone())
            .await
        {
            Ok(process) => process,
            Err(e) => return RunEnd::Failed(e.into()),
        },
    };
    info!(
        task_id,
        process_id = %process.id(),
        source = %lease
            .as_ref()
            .map_or_else(|| "direct".to_string(), |lease| lease.source().to_string()),
        "Task bound to agent process"
    );

    let run = TaskRun {
        inner,
        task_id,
        spec: &spec,
        sink,
        process: process.as_ref(),
        direct: lease.is_none(),
        grace: inner.config.tasks.interrupt_grace(),
    };
    let end = run.drive(allocation.as_ref(), &mut stop_rx).await;
    run.cleanup(&end, lease).await;
    drop(allocation);
    end
}

struct TaskRun<'a> {
    inner: &'a ManagerInner,
    task_id: &'a str,
    spec: &'a TaskSpec,
    sink: &'a EventSink,
    process: &'a dyn AgentProcess,
    /// One-shot process outside the pool.
    direct: bool,
    grace: Duration,
}

impl TaskRun<'_> {
    async fn drive(
        &self,
        allocation: Option<&PortAllocation>,
        stop_rx: &mut watch::Receiver<Option<StopKind>>,
    ) -> RunEnd {
        let envelope = Outbound::Task(TaskEnvelope {
            task_id: self.task_id.to_string(),
            prompt: self.spec.prompt.clone(),
            session_id: self.spec.session_id.clone(),
            model: self.spec.model.clone(),
            working_directory: self.spec.working_directory.clone(),
            browser: allocation.map(|allocation| BrowserEndpoint {
                http_port: allocation.pair.http_port,
                cdp_port: allocation.pair.cdp_port,
                reuse_existing: allocation.reuses_existing(),
            }),
        });
        // A stop that raced the direct spawn must not reach the agent.
        let stop = *stop_rx.borrow_and_update();
        if let Some(kind) = stop {
            return RunEnd::Stopped(kind);
        }
        let line = match envelope.to_line() {
            Ok(line) => line,
            Err(e) => return RunEnd::Failed(e.into()),
        };
        if let Err(e) = self.process.send_line(line).await {
            return RunEnd::Failed(e.into());
        }

        loop {
            let next = tokio::select! {
                biased;
                kind = stop_signal(stop_rx) => return RunEnd::Stopped(kind),
                line = self.process.next_line() => line,
            };
            let Some(line) = next else {
                return self.stdout_closed().await;
            };
            if line.trim().is_empty() {
                continue;
            }

            let event = match parse_line(&line) {
                Ok(event) => event,
                Err(e) => {
                    debug!(task_id = self.task_id, error = %e, "Ignoring unparseable agent line");
                    continue;
                }
            };

            match event {
                AgentEvent::Session { session_id } => {
                    debug!(task_id = self.task_id, %session_id, "Agent session");
                    self.inner.record_session(self.task_id, session_id, self.sink);
                }
                AgentEvent::Message(message) => {
                    let message = TaskMessage {
                        role: message.role,
                        content: message.content,
                        timestamp: Utc::now(),
                    };
                    self.inner.record_message(self.task_id, message, self.sink);
                }
                AgentEvent::Progress { stage, message } => {
                    self.sink.emit(TaskEvent::Progress {
                        task_id: self.task_id.to_string(),
                        stage,
                        message,
                    });
                }
                AgentEvent::PermissionRequest(prompt) => {
                    if let Err(end) = self.handle_permission(prompt, stop_rx).await {
                        return end;
                    }
                }
                AgentEvent::Complete { summary } => return RunEnd::Completed { summary },
                AgentEvent::Error { message } => return RunEnd::Failed(TaskError::Agent(message)),
                AgentEvent::Unknown { msg_type, .. } => {
                    debug!(task_id = self.task_id, %msg_type, "Ignoring unknown agent event");
                }
            }
        }
    }

    /// Park the task on the broker until the request is resolved.
    async fn handle_permission(
        &self,
        prompt: PermissionPrompt,
        stop_rx: &mut watch::Receiver<Option<StopKind>>,
    ) -> Result<(), RunEnd> {
        let request = PermissionRequest::from_prompt(self.task_id, prompt, self.spec.permission_timeout);
        let pending = match self.inner.broker.register(request.clone()) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(task_id = self.task_id, error = %e, "Ignoring permission request");
                return Ok(());
            }
        };

        self.inner
            .set_status(self.task_id, TaskStatus::WaitingPermission, self.sink);
        self.sink.emit(TaskEvent::PermissionRequested {
            task_id: self.task_id.to_string(),
            request,
        });

        let resolution = tokio::select! {
            biased;
            kind = stop_signal(stop_rx) => {
                self.inner.broker.cancel_for_task(self.task_id);
                return Err(RunEnd::Stopped(kind));
            }
            exit = wait_for_exit(self.process) => {
                self.inner.broker.cancel_for_task(self.task_id);
                return Err(RunEnd::Failed(TaskError::ProcessExited { code: exit.code() }));
            }
            resolution = pending.wait() => resolution,
        };

        info!(
            task_id = self.task_id,
            request_id = %resolution.request_id,
            allowed = resolution.is_allowed(),
            source = ?resolution.source,
            "Permission resolved"
        );
        self.sink.emit(TaskEvent::PermissionResolved {
            task_id: self.task_id.to_string(),
            resolution: resolution.clone(),
        });

        let reply = Outbound::PermissionResponse(resolution.to_reply())
            .to_line()
            .map_err(|e| RunEnd::Failed(e.into()))?;
        self.process
            .send_line(reply)
            .await
            .map_err(|e| RunEnd::Failed(e.into()))?;

        self.inner
            .set_status(self.task_id, TaskStatus::Running, self.sink);
        Ok(())
    }

    /// Stdout closed without a terminal event.
    async fn stdout_closed(&self) -> RunEnd {
        match wait_for_exit_timeout(self.process, self.grace).await {
            // One-shot agents may simply exit when done.
            Some(exit) if self.direct && exit.is_success() => RunEnd::Completed { summary: None },
            Some(exit) => RunEnd::Failed(TaskError::ProcessExited { code: exit.code() }),
            None => RunEnd::Failed(TaskError::ProcessExited { code: None }),
        }
    }

    /// Return or retire the process according to how the run ended.
    async fn cleanup(&self, end: &RunEnd, lease: Option<Lease>) {
        match end {
            RunEnd::Completed { .. } => {
                if let Some(lease) = lease {
                    let outcome = lease.release().await;
                    debug!(task_id = self.task_id, ?outcome, "Released lease");
                } else if wait_for_exit_timeout(self.process, self.grace).await.is_none() {
                    self.process.terminate().await;
                }
                return;
            }
            RunEnd::Stopped(StopKind::Interrupt) => self.interrupt_gracefully().await,
            RunEnd::Stopped(StopKind::Cancel) | RunEnd::Failed(_) => {}
        }

        match lease {
            Some(lease) => lease.retire().await,
            None => self.process.terminate().await,
        }
    }

    async fn interrupt_gracefully(&self) {
        if let Ok(line) = Outbound::Interrupt.to_line() {
            if let Err(e) = self.process.send_line(line).await {
                debug!(task_id = self.task_id, error = %e, "Could not send interrupt line");
            }
        }
        if let Err(e) = self.process.interrupt() {
            warn!(task_id = self.task_id, error = %e, "Failed to interrupt agent process");
        }
        if wait_for_exit_timeout(self.process, self.grace).await.is_none() {
            warn!(
                task_id = self.task_id,
                grace = ?self.grace,
                "Agent did not stop within grace period, killing"
            );
        }
    }
}
