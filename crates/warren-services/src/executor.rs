//! Job executor: runs task requests through the handler table.
//!
//! Every job runs on tokio's blocking pool. A semaphore caps how many run at
//! once; requests beyond the cap wait for a slot. Failures of any kind turn
//! into an error result so the broker always gets an answer and can release
//! the task's cores.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use warren_core::message::{TaskRequest, TaskResult};

use crate::handler::HandlerTable;
use crate::scheduler::failure_payload;

#[derive(Clone)]
pub struct JobExecutor {
    handlers: Arc<HandlerTable>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl JobExecutor {
    pub fn new(handlers: HandlerTable, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            handlers: Arc::new(handlers),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Jobs currently holding a slot.
    pub fn running(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    /// Run one job to completion and build its result record.
    pub async fn execute(&self, request: TaskRequest) -> TaskResult {
        let TaskRequest {
            id,
            func,
            data,
            cores,
        } = request;

        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                return TaskResult {
                    id,
                    data: failure_payload("executor closed"),
                    cores,
                }
            }
        };

        let handlers = Arc::clone(&self.handlers);
        let job = func.clone();
        let start = Instant::now();
        let outcome =
            tokio::task::spawn_blocking(move || handlers.dispatch(&job, &data, cores)).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        drop(permit);

        let data = match outcome {
            Ok(Some(Ok(output))) => {
                tracing::info!(task_id = %id, job = %func, elapsed_ms, "job finished");
                output
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(task_id = %id, job = %func, error = %e, "job failed");
                failure_payload(&e.to_string())
            }
            Ok(None) => failure_payload(&format!("unknown job {func}")),
            Err(e) => {
                tracing::error!(task_id = %id, job = %func, error = %e, "job panicked");
                failure_payload("job panicked")
            }
        };

        TaskResult { id, data, cores }
    }
}
