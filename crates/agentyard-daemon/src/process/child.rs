//! Tokio-backed agent process.

use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::types::{AgentProcess, ProcessError, ProcessExit, wait_for_exit};

/// Buffered stdout lines per process before the reader applies backpressure.
const STDOUT_BUFFER: usize = 256;

/// Agent process spawned from a [`Command`].
///
/// Background tasks own the pipes: a stdin writer, a stdout line reader, a
/// stderr logger and a monitor that owns the child and publishes its exit.
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct ChildProcess {
    id: String,
    port: Option<u16>,
    pid: Option<u32>,
    stdin_tx: mpsc::Sender<String>,
    stdout_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ChildProcess {
    /// Spawn `cmd` with piped stdio.
    ///
    /// `port` is recorded for health checks; the caller is responsible for
    /// passing it to the process (argument or environment).
    pub fn spawn(mut cmd: Command, port: Option<u16>) -> Result<Self, ProcessError> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            reason: e.to_string(),
        })?;

        let id = uuid::Uuid::new_v4().to_string();
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed {
                reason: "Failed to capture stdin".to_string(),
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed {
                reason: "Failed to capture stdout".to_string(),
            })?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(32);
        let writer_id = id.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    error!(process_id = %writer_id, "Failed to write to stdin: {}", e);
                    break;
                }
                if let Err(e) = stdin.write_all(b"\n").await {
                    error!(process_id = %writer_id, "Failed to write newline: {}", e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    error!(process_id = %writer_id, "Failed to flush stdin: {}", e);
                    break;
                }
            }
        });

        let (stdout_tx, stdout_rx) = mpsc::channel::<String>(STDOUT_BUFFER);
        let reader_id = id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(process_id = %reader_id, "stdout: {}", line);
                if stdout_tx.send(line).await.is_err() {
                    break;
                }
            }
            debug!(process_id = %reader_id, "stdout reader finished");
        });

        if let Some(stderr) = child.stderr.take() {
            let stderr_id = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(process_id = %stderr_id, "stderr: {}", line);
                }
            });
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);
        let monitor_id = id.clone();
        tokio::spawn(async move {
            // A dropped sender resolves `kill_rx` too, so an abandoned handle
            // still takes its process down.
            let exit = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => ProcessExit::Exited { code: status.code() },
                    Err(e) => ProcessExit::Errored { reason: e.to_string() },
                },
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(process_id = %monitor_id, error = %e, "Failed to kill agent process");
                    }
                    ProcessExit::Killed
                }
            };
            info!(process_id = %monitor_id, %exit, "Agent process finished");
            let _ = exit_tx.send(Some(exit));
        });

        Ok(Self {
            id,
            port,
            pid,
            stdin_tx,
            stdout_rx: tokio::sync::Mutex::new(stdout_rx),
            kill_tx: Mutex::new(Some(kill_tx)),
            exit_rx,
        })
    }

    /// OS process id, if the process was still running at spawn time.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl AgentProcess for ChildProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn port(&self) -> Option<u16> {
        self.port
    }

    async fn send_line(&self, line: String) -> Result<(), ProcessError> {
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| ProcessError::StdinClosed {
                id: self.id.clone(),
            })
    }

    async fn next_line(&self) -> Option<String> {
        self.stdout_rx.lock().await.recv().await
    }

    #[cfg(unix)]
    fn interrupt(&self) -> Result<(), ProcessError> {
        if self.has_exited() {
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid).map_err(|e| ProcessError::SignalFailed {
            id: self.id.clone(),
            reason: e.to_string(),
        })?;
        // SAFETY: pid comes from our own child handle and the monitor task
        // has not reaped it yet (checked above); kill(2) with SIGINT has no
        // memory-safety preconditions.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid, libc::SIGINT) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            return Err(ProcessError::SignalFailed {
                id: self.id.clone(),
                reason: err.to_string(),
            });
        }
        debug!(process_id = %self.id, pid, "Sent SIGINT");
        Ok(())
    }

    #[cfg(not(unix))]
    fn interrupt(&self) -> Result<(), ProcessError> {
        Err(ProcessError::SignalFailed {
            id: self.id.clone(),
            reason: "graceful interrupt is only supported on unix".to_string(),
        })
    }

    async fn terminate(&self) {
        let kill_tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }
        let exit = wait_for_exit(self).await;
        debug!(process_id = %self.id, %exit, "Agent process terminated");
    }

    fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }
}
