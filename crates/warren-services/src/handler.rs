//! Job handlers, looked up by job name on the worker.

use std::collections::HashMap;
use std::sync::Arc;

/// Failure inside a job handler. Reported to the client as an error result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Compute(String),
}

impl From<serde_json::Error> for JobError {
    fn from(e: serde_json::Error) -> Self {
        JobError::InvalidInput(e.to_string())
    }
}

/// A compute kernel. Runs on a blocking thread; `cores` is the budget the
/// broker reserved for this job and bounds its internal parallelism.
pub trait JobHandler: Send + Sync {
    fn run(&self, input: &str, cores: u32) -> Result<String, JobError>;
}

impl<F> JobHandler for F
where
    F: Fn(&str, u32) -> Result<String, JobError> + Send + Sync,
{
    fn run(&self, input: &str, cores: u32) -> Result<String, JobError> {
        self(input, cores)
    }
}

/// Job name → handler, populated at worker start.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, handler: impl JobHandler + 'static) -> &mut Self {
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `job_name`. An unknown name is logged and
    /// yields `None`.
    pub fn dispatch(&self, job_name: &str, payload: &str, cores: u32) -> Option<Result<String, JobError>> {
        match self.handlers.get(job_name) {
            Some(handler) => Some(handler.run(payload, cores)),
            None => {
                tracing::warn!(job = job_name, "no handler registered for job");
                None
            }
        }
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable").field("jobs", &self.names()).finish()
    }
}
