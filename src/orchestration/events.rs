//! Progress events emitted during execution.
//!
//! The bus fans each event out to bounded `mpsc` subscribers. Publishing
//! awaits capacity on every live subscriber; closed subscribers are dropped
//! on the next publish.

use crate::core::{BatchId, TaskId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    TaskStarted,
    TaskProgress { percentage: u8 },
    TaskCompleted,
    TaskFailed,
    BatchStarted,
    BatchCompleted,
    AgentSwitched,
    RetryAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EventSubject {
    Task(TaskId),
    Batch(BatchId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub kind: EventKind,
    pub subject: EventSubject,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl ExecutionEvent {
    pub fn task(kind: EventKind, task_id: &TaskId, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: EventSubject::Task(task_id.clone()),
            timestamp: Utc::now(),
            message: message.into(),
        }
    }

    pub fn batch(kind: EventKind, batch_id: &BatchId, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: EventSubject::Batch(batch_id.clone()),
            timestamp: Utc::now(),
            message: message.into(),
        }
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        match &self.subject {
            EventSubject::Task(id) => Some(id),
            EventSubject::Batch(_) => None,
        }
    }
}

pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<ExecutionEvent>>>,
    buffer: usize,
    enabled: bool,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer: buffer.max(1),
            enabled: true,
        }
    }

    /// A bus that drops every event and refuses subscribers.
    pub fn disabled() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer: 1,
            enabled: false,
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<ExecutionEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        if self.enabled {
            self.subscribers.lock().push(tx);
        }
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub async fn publish(&self, event: ExecutionEvent) {
        if !self.enabled {
            return;
        }
        let senders: Vec<mpsc::Sender<ExecutionEvent>> = self.subscribers.lock().clone();
        if senders.is_empty() {
            return;
        }
        let mut closed = false;
        for sender in &senders {
            if sender.send(event.clone()).await.is_err() {
                closed = true;
            }
        }
        if closed {
            self.subscribers.lock().retain(|sender| !sender.is_closed());
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
