//! Admission control and dispatch.
//!
//! All registries and the pending queue live behind one lock. Every public
//! operation takes that lock once, so capacity checks, core reservation and
//! status transitions happen as one unit: two concurrent dispatch attempts
//! can never hand out the same free cores.
//!
//! The scheduler never performs I/O. Operations return [`Dispatch`] and
//! [`Delivery`] values describing which peer link must receive what; the
//! caller sends them after the lock is released.

use serde_json::json;
use tokio::sync::Mutex;
use warren_core::message::{TaskRequest, TaskResult};

use crate::registry::{ClientRegistry, PendingQueue, TaskStore, WorkerEntry, WorkerRegistry};
use crate::task::{Task, TaskStatus};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("task {0} already exists")]
    DuplicateTask(String),

    #[error("unknown task {0}")]
    UnknownTask(String),

    #[error("worker {0} is already registered")]
    DuplicateWorker(String),

    #[error("unknown worker {0}")]
    UnknownWorker(String),

    #[error("client {0} is already registered")]
    DuplicateClient(String),

    #[error("unknown client {0}")]
    UnknownClient(String),

    #[error("task {task} is assigned to {expected:?}, not {actual}")]
    WrongWorker {
        task: String,
        expected: Option<String>,
        actual: String,
    },

    #[error("task {task} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {0} requests zero cores")]
    InvalidCores(String),

    #[error("worker {worker} has {free} free cores, {requested} requested")]
    CapacityViolation {
        worker: String,
        requested: u32,
        free: u32,
    },
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

/// A task assigned to a worker: send `request` over `link`.
#[derive(Debug, Clone)]
pub struct Dispatch<L> {
    pub worker_id: String,
    pub link: L,
    pub request: TaskRequest,
}

/// A result owed to a client: send `result` over `link` if it is still
/// connected.
#[derive(Debug, Clone)]
pub struct Delivery<L> {
    pub client_id: String,
    pub link: Option<L>,
    pub result: TaskResult,
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome<L> {
    Dispatched(Dispatch<L>),
    Queued,
}

/// Point-in-time view for status logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub workers: Vec<WorkerLoad>,
    pub clients: usize,
    pub pending: usize,
    pub in_flight: usize,
    /// Tasks finished since start, including evicted ones.
    pub ready: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLoad {
    pub id: String,
    pub total_cores: u32,
    pub used_cores: u32,
    pub tasks: usize,
}

/// Result payload reported to a client when its task could not finish.
pub fn failure_payload(reason: &str) -> String {
    json!({ "error": reason }).to_string()
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

struct State<L> {
    workers: WorkerRegistry<L>,
    clients: ClientRegistry<L>,
    tasks: TaskStore,
    pending: PendingQueue,
}

pub struct Scheduler<L> {
    state: Mutex<State<L>>,
}

impl<L: Clone> Default for Scheduler<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Clone> Scheduler<L> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                workers: WorkerRegistry::default(),
                clients: ClientRegistry::default(),
                tasks: TaskStore::default(),
                pending: PendingQueue::default(),
            }),
        }
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Add a worker and hand it whatever pending work now fits.
    pub async fn register_worker(
        &self,
        id: &str,
        cores: u32,
        link: L,
    ) -> Result<Vec<Dispatch<L>>, SchedulerError> {
        let mut state = self.state.lock().await;
        state.workers.register(id, cores, link)?;
        tracing::info!(worker = id, cores, "worker registered");
        Ok(state.drain_for_worker(id))
    }

    pub async fn register_client(&self, id: &str, link: L) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        state.clients.register(id, link)?;
        tracing::info!(client = id, "client registered");
        Ok(())
    }

    // ── Task flow ────────────────────────────────────────────────────────────

    /// Record a submission and dispatch it right away if any worker has room.
    pub async fn submit(
        &self,
        client_id: &str,
        request: TaskRequest,
    ) -> Result<SubmitOutcome<L>, SchedulerError> {
        let mut state = self.state.lock().await;
        if state.clients.get(client_id).is_none() {
            return Err(SchedulerError::UnknownClient(client_id.to_string()));
        }
        if request.cores == 0 {
            return Err(SchedulerError::InvalidCores(request.id));
        }

        let mut task = Task::new(client_id, request);
        task.advance(TaskStatus::Queued);
        let task_id = task.id.clone();
        let cores = task.cores;
        state.tasks.insert(task)?;

        tracing::info!(task_id = %task_id, client = client_id, cores, "task queued");

        let Some(worker_id) = state.workers.best_fit(cores).map(str::to_string) else {
            state.pending.push_back(task_id.clone());
            tracing::debug!(task_id = %task_id, pending = state.pending.len(), "no capacity, task pending");
            return Ok(SubmitOutcome::Queued);
        };
        match state.assign(&task_id, &worker_id) {
            Some(dispatch) => Ok(SubmitOutcome::Dispatched(dispatch)),
            None => Ok(SubmitOutcome::Queued),
        }
    }

    /// First pending task (FIFO order) that fits the worker's free cores.
    pub async fn next_for_worker(&self, worker_id: &str) -> Option<Dispatch<L>> {
        self.state.lock().await.next_for_worker(worker_id)
    }

    /// Every pending task that fits, in FIFO order, until the worker is full.
    pub async fn drain_for_worker(&self, worker_id: &str) -> Vec<Dispatch<L>> {
        self.state.lock().await.drain_for_worker(worker_id)
    }

    /// Record a worker's result: the task becomes Ready and its committed
    /// cores return to the worker.
    pub async fn complete(
        &self,
        worker_id: &str,
        result: TaskResult,
    ) -> Result<Delivery<L>, SchedulerError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&result.id)
            .ok_or_else(|| SchedulerError::UnknownTask(result.id.clone()))?;

        if task.assigned_worker.as_deref() != Some(worker_id) {
            return Err(SchedulerError::WrongWorker {
                task: task.id.clone(),
                expected: task.assigned_worker.clone(),
                actual: worker_id.to_string(),
            });
        }
        let from = task.status;
        if !task.advance(TaskStatus::Ready) {
            return Err(SchedulerError::InvalidTransition {
                task: task.id.clone(),
                from,
                to: TaskStatus::Ready,
            });
        }
        task.output = Some(result.data.clone());
        let cores = task.cores;
        let client_id = task.owning_client.clone();
        let elapsed_ms = task.created_at.elapsed().as_millis() as u64;

        if cores != result.cores {
            tracing::debug!(
                task_id = %result.id,
                committed = cores,
                reported = result.cores,
                "worker reported a different core count"
            );
        }
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.release(&result.id, cores);
        }
        state.tasks.retire(&result.id);

        tracing::info!(task_id = %result.id, worker = worker_id, elapsed_ms, "task ready");

        Ok(Delivery {
            link: state.clients.get(&client_id).map(|c| c.link.clone()),
            client_id,
            result: TaskResult {
                id: result.id,
                data: result.data,
                cores,
            },
        })
    }

    /// The send of a dispatched task failed: fail it and free its cores.
    pub async fn abort_dispatch(&self, task_id: &str, reason: &str) -> Option<Delivery<L>> {
        self.state.lock().await.fail_task(task_id, reason)
    }

    // ── Departures ───────────────────────────────────────────────────────────

    /// Remove a worker. Tasks it still held become Failed; the returned
    /// deliveries tell their clients.
    pub async fn remove_worker(&self, id: &str) -> Vec<Delivery<L>> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.workers.remove(id) else {
            return Vec::new();
        };
        let orphans: Vec<Delivery<L>> = entry
            .tasks
            .iter()
            .filter_map(|task_id| state.fail_task(task_id, "worker disconnected"))
            .collect();
        tracing::info!(worker = id, orphaned = orphans.len(), "worker removed");
        orphans
    }

    /// Remove a client. Its still-pending tasks are failed and dropped from
    /// the queue; tasks already on a worker run to completion.
    pub async fn remove_client(&self, id: &str) -> usize {
        let mut state = self.state.lock().await;
        if state.clients.remove(id).is_none() {
            return 0;
        }
        let State { pending, tasks, .. } = &mut *state;
        let dropped = pending.drain_where(|task_id| {
            tasks.get(task_id).is_some_and(|t| t.owning_client == id)
        });
        for task_id in &dropped {
            if let Some(task) = tasks.get_mut(task_id) {
                task.advance(TaskStatus::Failed);
            }
            tasks.retire(task_id);
        }
        tracing::info!(client = id, dropped_pending = dropped.len(), "client removed");
        dropped.len()
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub async fn task(&self, id: &str) -> Option<Task> {
        self.state.lock().await.tasks.get(id).cloned()
    }

    pub async fn worker(&self, id: &str) -> Option<WorkerEntry<L>> {
        self.state.lock().await.workers.get(id).cloned()
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.state.lock().await;
        let mut workers: Vec<WorkerLoad> = state
            .workers
            .iter()
            .map(|w| WorkerLoad {
                id: w.id.clone(),
                total_cores: w.total_cores,
                used_cores: w.used_cores,
                tasks: w.tasks.len(),
            })
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        SchedulerSnapshot {
            workers,
            clients: state.clients.len(),
            pending: state.pending.len(),
            in_flight: state.tasks.count_by_status(TaskStatus::SentToWorker),
            ready: state.tasks.ready_total(),
            failed: state.tasks.failed_total(),
        }
    }
}

// ── Lock-held helpers ─────────────────────────────────────────────────────────

impl<L: Clone> State<L> {
    /// Reserve the worker's cores and mark the task sent. On a capacity
    /// violation the task goes back to the head of the queue.
    fn assign(&mut self, task_id: &str, worker_id: &str) -> Option<Dispatch<L>> {
        let task = self.tasks.get_mut(task_id)?;
        let worker = self.workers.get_mut(worker_id)?;

        if let Err(e) = worker.commit(task_id, task.cores) {
            tracing::error!(task_id, error = %e, "capacity invariant violated, task re-enqueued");
            self.pending.push_front(task_id.to_string());
            return None;
        }
        task.advance(TaskStatus::SentToWorker);
        task.assigned_worker = Some(worker_id.to_string());

        tracing::info!(
            task_id,
            worker = worker_id,
            cores = task.cores,
            free = worker.free_cores(),
            "task sent to worker"
        );
        Some(Dispatch {
            worker_id: worker_id.to_string(),
            link: worker.link.clone(),
            request: task.to_request(),
        })
    }

    fn next_for_worker(&mut self, worker_id: &str) -> Option<Dispatch<L>> {
        let free = self.workers.get(worker_id)?.free_cores();
        let tasks = &self.tasks;
        let task_id = self
            .pending
            .take_first(|id| tasks.get(id).is_some_and(|t| t.cores <= free))?;
        self.assign(&task_id, worker_id)
    }

    fn drain_for_worker(&mut self, worker_id: &str) -> Vec<Dispatch<L>> {
        std::iter::from_fn(|| self.next_for_worker(worker_id)).collect()
    }

    /// Fail a live task, release its cores, and build the client notice.
    fn fail_task(&mut self, task_id: &str, reason: &str) -> Option<Delivery<L>> {
        let task = self.tasks.get_mut(task_id)?;
        if !task.advance(TaskStatus::Failed) {
            return None;
        }
        let cores = task.cores;
        let client_id = task.owning_client.clone();
        if let Some(worker_id) = task.assigned_worker.as_deref() {
            if let Some(worker) = self.workers.get_mut(worker_id) {
                worker.release(task_id, cores);
            }
        }
        self.tasks.retire(task_id);
        tracing::warn!(task_id, reason, "task failed");

        Some(Delivery {
            link: self.clients.get(&client_id).map(|c| c.link.clone()),
            client_id,
            result: TaskResult {
                id: task_id.to_string(),
                data: failure_payload(reason),
                cores,
            },
        })
    }
}
