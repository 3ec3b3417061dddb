//! Correlates permission requests with their out-of-band answers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::types::{
    Decision, PermissionError, PermissionRequest, PermissionResolution, PermissionResponse,
    ResolutionSource,
};

/// Resolutions buffered per subscriber before it starts lagging.
const RESOLUTION_BUFFER: usize = 64;

struct PendingEntry {
    request: PermissionRequest,
    tx: oneshot::Sender<PermissionResolution>,
    timer: AbortHandle,
}

struct BrokerInner {
    pending: Mutex<HashMap<String, PendingEntry>>,
    default_timeout: Duration,
    resolved_tx: broadcast::Sender<PermissionResolution>,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle the requesting task awaits.
#[derive(Debug)]
pub struct PendingPermission {
    request_id: String,
    task_id: String,
    rx: oneshot::Receiver<PermissionResolution>,
}

impl PendingPermission {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the resolution (user answer, timeout, or cancellation).
    pub async fn wait(self) -> PermissionResolution {
        match self.rx.await {
            Ok(resolution) => resolution,
            // The broker went away with the request still pending.
            Err(_) => PermissionResolution {
                request_id: self.request_id,
                task_id: self.task_id,
                decision: Decision::Deny,
                selected_options: Vec::new(),
                custom_text: None,
                source: ResolutionSource::Cancelled,
            },
        }
    }
}

/// Permission/question broker.
///
/// Each request id resolves exactly once: the first of a user response,
/// its timeout, or cancellation wins and later attempts are no-ops.
#[derive(Clone)]
pub struct PermissionBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for PermissionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionBroker")
            .field("pending", &self.pending_count())
            .field("default_timeout", &self.inner.default_timeout)
            .finish()
    }
}

impl PermissionBroker {
    pub fn new(default_timeout: Duration) -> Self {
        let (resolved_tx, _) = broadcast::channel(RESOLUTION_BUFFER);
        Self {
            inner: Arc::new(BrokerInner {
                pending: Mutex::new(HashMap::new()),
                default_timeout,
                resolved_tx,
            }),
        }
    }

    /// Store `request` and start its timeout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, request: PermissionRequest) -> Result<PendingPermission, PermissionError> {
        if request.id.is_empty() {
            return Err(PermissionError::InvalidRequest(
                "request id must not be empty".to_string(),
            ));
        }
        let timeout = request.timeout.unwrap_or(self.inner.default_timeout);
        let request_id = request.id.clone();
        let task_id = request.task_id.clone();

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.lock();
            if pending.contains_key(&request_id) {
                return Err(PermissionError::AlreadyPending { request_id });
            }

            let inner = Arc::clone(&self.inner);
            let timer_id = request_id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if finish(&inner, &timer_id, None, ResolutionSource::Timeout) {
                    warn!(request_id = %timer_id, "Permission request timed out, denying");
                }
            })
            .abort_handle();

            pending.insert(request_id.clone(), PendingEntry { request, tx, timer });
        }

        info!(
            request_id = %request_id,
            task_id = %task_id,
            timeout_secs = timeout.as_secs(),
            "Registered permission request"
        );
        Ok(PendingPermission {
            request_id,
            task_id,
            rx,
        })
    }

    /// Resolve a pending request. Returns `false` if it is not pending.
    pub fn resolve(&self, request_id: &str, response: PermissionResponse) -> bool {
        let resolved = finish(&self.inner, request_id, Some(response), ResolutionSource::User);
        if !resolved {
            debug!(request_id, "Ignoring response for unknown or resolved request");
        }
        resolved
    }

    /// Deny every outstanding request of `task_id`. Returns how many.
    pub fn cancel_for_task(&self, task_id: &str) -> usize {
        let ids: Vec<String> = self
            .inner
            .lock()
            .values()
            .filter(|entry| entry.request.task_id == task_id)
            .map(|entry| entry.request.id.clone())
            .collect();
        let cancelled = ids
            .iter()
            .filter(|id| finish(&self.inner, id, None, ResolutionSource::Cancelled))
            .count();
        if cancelled > 0 {
            info!(task_id, cancelled, "Cancelled pending permission requests");
        }
        cancelled
    }

    /// Outstanding requests of `task_id`.
    pub fn pending_for_task(&self, task_id: &str) -> Vec<PermissionRequest> {
        self.inner
            .lock()
            .values()
            .filter(|entry| entry.request.task_id == task_id)
            .map(|entry| entry.request.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Receive every resolution, whatever its source.
    pub fn subscribe(&self) -> broadcast::Receiver<PermissionResolution> {
        self.inner.resolved_tx.subscribe()
    }
}

/// Remove and resolve `request_id`. `None` resolves with the default deny.
fn finish(
    inner: &BrokerInner,
    request_id: &str,
    response: Option<PermissionResponse>,
    source: ResolutionSource,
) -> bool {
    let Some(entry) = inner.lock().remove(request_id) else {
        return false;
    };
    if source != ResolutionSource::Timeout {
        entry.timer.abort();
    }

    let resolution = match response {
        Some(response) => {
            let selected_options = sanitize_options(&entry.request, response.selected_options);
            PermissionResolution {
                request_id: entry.request.id.clone(),
                task_id: entry.request.task_id.clone(),
                decision: response.decision,
                selected_options,
                custom_text: response.custom_text,
                source,
            }
        }
        None => PermissionResolution {
            request_id: entry.request.id.clone(),
            task_id: entry.request.task_id.clone(),
            decision: Decision::Deny,
            selected_options: Vec::new(),
            custom_text: None,
            source,
        },
    };

    debug!(
        request_id,
        task_id = %resolution.task_id,
        decision = ?resolution.decision,
        source = ?resolution.source,
        "Resolved permission request"
    );
    let _ = entry.tx.send(resolution.clone());
    let _ = inner.resolved_tx.send(resolution);
    true
}

/// Keep only offered options; single-select keeps the first.
fn sanitize_options(request: &PermissionRequest, selected: Vec<String>) -> Vec<String> {
    let mut kept: Vec<String> = selected
        .into_iter()
        .filter(|option| request.options.contains(option))
        .collect();
    if !request.multi_select {
        kept.truncate(1);
    }
    kept
}
