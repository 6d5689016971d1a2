//! Broker-side task record and its lifecycle.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use warren_core::message::TaskRequest;

/// Lifecycle status of a task.
///
/// Moves strictly forward through
/// `Created → Queued → SentToWorker → Ready`; `Failed` is reachable from any
/// non-terminal state and is terminal itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Created,
    Queued,
    SentToWorker,
    Ready,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Ready | TaskStatus::Failed)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Ready | Failed, _) => false,
            (_, Failed) => true,
            (Created, Queued) | (Queued, SentToWorker) | (SentToWorker, Ready) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub job_name: String,
    pub input: String,
    pub output: Option<String>,
    pub cores: u32,
    pub status: TaskStatus,
    /// Every status the task has held, in order.
    pub history: Vec<TaskStatus>,
    pub owning_client: String,
    pub assigned_worker: Option<String>,
    pub created_at: Instant,
}

impl Task {
    pub fn new(owning_client: &str, request: TaskRequest) -> Self {
        Self {
            id: request.id,
            job_name: request.func,
            input: request.data,
            output: None,
            cores: request.cores,
            status: TaskStatus::Created,
            history: vec![TaskStatus::Created],
            owning_client: owning_client.to_string(),
            assigned_worker: None,
            created_at: Instant::now(),
        }
    }

    /// Move to `next`. Returns false and leaves the task untouched if the
    /// transition is not allowed.
    pub fn advance(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        self.history.push(next);
        true
    }

    /// The request sent to a worker for this task.
    pub fn to_request(&self) -> TaskRequest {
        TaskRequest {
            id: self.id.clone(),
            func: self.job_name.clone(),
            data: self.input.clone(),
            cores: self.cores,
        }
    }
}
