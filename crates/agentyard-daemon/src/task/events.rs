//! Task-scoped event delivery.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::debug;

use super::types::{TaskEvent, TaskResult};

struct SinkInner {
    task_id: String,
    tx: mpsc::UnboundedSender<TaskEvent>,
    /// Set once `Finished` went out.
    closed: Mutex<bool>,
}

/// Sending half of a task's event channel.
///
/// Only events of its own task are delivered, and nothing after the
/// terminal `Finished` event.
#[derive(Clone)]
pub(crate) struct EventSink {
    inner: Arc<SinkInner>,
}

impl EventSink {
    pub(crate) fn channel(task_id: &str) -> (Self, TaskEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            inner: Arc::new(SinkInner {
                task_id: task_id.to_string(),
                tx,
                closed: Mutex::new(false),
            }),
        };
        let events = TaskEvents {
            task_id: task_id.to_string(),
            rx,
        };
        (sink, events)
    }

    pub(crate) fn emit(&self, event: TaskEvent) {
        if event.task_id() != self.inner.task_id {
            debug!(
                task_id = %self.inner.task_id,
                event_task = %event.task_id(),
                "Dropping event addressed to another task"
            );
            return;
        }
        let mut closed = self
            .inner
            .closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return;
        }
        if event.is_terminal() {
            *closed = true;
        }
        // The receiver may be gone; the task keeps running regardless.
        let _ = self.inner.tx.send(event);
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        *self
            .inner
            .closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving half of a task's event channel; also a [`Stream`].
#[derive(Debug)]
pub struct TaskEvents {
    task_id: String,
    rx: mpsc::UnboundedReceiver<TaskEvent>,
}

impl TaskEvents {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next event, or `None` after the last one.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain events until the task finishes.
    pub async fn finished(mut self) -> Option<TaskResult> {
        while let Some(event) = self.rx.recv().await {
            if let TaskEvent::Finished { result, .. } = event {
                return Some(result);
            }
        }
        None
    }
}

impl Stream for TaskEvents {
    type Item = TaskEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TaskEvent>> {
        self.rx.poll_recv(cx)
    }
}
