//! In-memory directories: workers, clients, tasks and the pending queue.
//!
//! None of these types lock anything. They are only ever touched through
//! [`Scheduler`](crate::scheduler::Scheduler), which keeps all of them
//! behind a single lock so compound operations stay atomic.
//!
//! `L` is the handle used to reach a peer (a transport connection in the
//! broker, anything `Clone` in tests).

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::scheduler::SchedulerError;
use crate::task::{Task, TaskStatus};

// ── Workers ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkerEntry<L> {
    pub id: String,
    pub total_cores: u32,
    pub used_cores: u32,
    pub link: L,
    /// Registration order, for tie-breaking.
    pub seq: u64,
    /// Tasks currently assigned to this worker.
    pub tasks: BTreeSet<String>,
}

impl<L> WorkerEntry<L> {
    pub fn free_cores(&self) -> u32 {
        self.total_cores - self.used_cores
    }

    /// Reserve `cores` for a task. Fails without side effects if they are
    /// not free.
    pub fn commit(&mut self, task_id: &str, cores: u32) -> Result<(), SchedulerError> {
        if cores > self.free_cores() {
            return Err(SchedulerError::CapacityViolation {
                worker: self.id.clone(),
                requested: cores,
                free: self.free_cores(),
            });
        }
        self.used_cores += cores;
        self.tasks.insert(task_id.to_string());
        Ok(())
    }

    /// Return the cores of a finished task.
    pub fn release(&mut self, task_id: &str, cores: u32) {
        if self.tasks.remove(task_id) {
            self.used_cores = self.used_cores.saturating_sub(cores);
        }
    }
}

#[derive(Debug)]
pub struct WorkerRegistry<L> {
    workers: HashMap<String, WorkerEntry<L>>,
    next_seq: u64,
}

impl<L> Default for WorkerRegistry<L> {
    fn default() -> Self {
        Self {
            workers: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<L> WorkerRegistry<L> {
    pub fn register(&mut self, id: &str, cores: u32, link: L) -> Result<(), SchedulerError> {
        if self.workers.contains_key(id) {
            return Err(SchedulerError::DuplicateWorker(id.to_string()));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.workers.insert(
            id.to_string(),
            WorkerEntry {
                id: id.to_string(),
                total_cores: cores,
                used_cores: 0,
                link,
                seq,
                tasks: BTreeSet::new(),
            },
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&WorkerEntry<L>> {
        self.workers.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut WorkerEntry<L>> {
        self.workers.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<WorkerEntry<L>> {
        self.workers.remove(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerEntry<L>> {
        self.workers.values()
    }

    /// Worker with the most free cores that can take `cores`; ties go to
    /// the earliest registration.
    pub fn best_fit(&self, cores: u32) -> Option<&str> {
        self.workers
            .values()
            .filter(|w| w.free_cores() >= cores)
            .max_by(|a, b| {
                a.free_cores()
                    .cmp(&b.free_cores())
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|w| w.id.as_str())
    }
}

// ── Clients ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientEntry<L> {
    pub id: String,
    pub link: L,
}

#[derive(Debug)]
pub struct ClientRegistry<L> {
    clients: HashMap<String, ClientEntry<L>>,
}

impl<L> Default for ClientRegistry<L> {
    fn default() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }
}

impl<L> ClientRegistry<L> {
    pub fn register(&mut self, id: &str, link: L) -> Result<(), SchedulerError> {
        if self.clients.contains_key(id) {
            return Err(SchedulerError::DuplicateClient(id.to_string()));
        }
        self.clients.insert(
            id.to_string(),
            ClientEntry {
                id: id.to_string(),
                link,
            },
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ClientEntry<L>> {
        self.clients.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<ClientEntry<L>> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

/// Finished tasks kept for queries before the oldest are evicted.
pub const RETAINED_FINISHED_TASKS: usize = 4096;

/// Owner of every task record. Live tasks stay until they finish; finished
/// ones are kept up to a retention limit, oldest evicted first. Ready and
/// failed totals count every task ever finished.
#[derive(Debug)]
pub struct TaskStore {
    tasks: HashMap<String, Task>,
    finished: VecDeque<String>,
    retain_finished: usize,
    ready_total: usize,
    failed_total: usize,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::with_retention(RETAINED_FINISHED_TASKS)
    }
}

impl TaskStore {
    pub fn with_retention(retain_finished: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            finished: VecDeque::new(),
            retain_finished,
            ready_total: 0,
            failed_total: 0,
        }
    }

    pub fn insert(&mut self, task: Task) -> Result<(), SchedulerError> {
        if self.tasks.contains_key(&task.id) {
            return Err(SchedulerError::DuplicateTask(task.id));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Count a task that just reached `Ready` or `Failed` and evict the
    /// oldest finished records past the retention limit.
    pub fn retire(&mut self, id: &str) {
        match self.tasks.get(id).map(|t| t.status) {
            Some(TaskStatus::Ready) => self.ready_total += 1,
            Some(TaskStatus::Failed) => self.failed_total += 1,
            _ => return,
        }
        self.finished.push_back(id.to_string());
        while self.finished.len() > self.retain_finished {
            if let Some(oldest) = self.finished.pop_front() {
                self.tasks.remove(&oldest);
            }
        }
    }

    pub fn ready_total(&self) -> usize {
        self.ready_total
    }

    pub fn failed_total(&self) -> usize {
        self.failed_total
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }
}

// ── Pending queue ─────────────────────────────────────────────────────────────

/// FIFO of task ids waiting for capacity. Holds references into the
/// [`TaskStore`], never the tasks themselves.
#[derive(Debug, Default)]
pub struct PendingQueue {
    queue: VecDeque<String>,
}

impl PendingQueue {
    pub fn push_back(&mut self, id: String) {
        self.queue.push_back(id);
    }

    /// Put a task back at the head, ahead of everything queued after it.
    pub fn push_front(&mut self, id: String) {
        self.queue.push_front(id);
    }

    /// Remove and return the first id satisfying `fits`.
    pub fn take_first(&mut self, mut fits: impl FnMut(&str) -> bool) -> Option<String> {
        let pos = self.queue.iter().position(|id| fits(id))?;
        self.queue.remove(pos)
    }

    /// Remove every id matching `matches`. Returns the removed ids in order.
    pub fn drain_where(&mut self, mut matches: impl FnMut(&str) -> bool) -> Vec<String> {
        let mut dropped = Vec::new();
        self.queue.retain(|id| {
            if matches(id) {
                dropped.push(id.clone());
                false
            } else {
                true
            }
        });
        dropped
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.queue.iter()
    }
}
