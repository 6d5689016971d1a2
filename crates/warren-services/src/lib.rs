//! warren-services: everything above the transport.
//!
//! Broker side: task records, registries and the [`Scheduler`] that admits
//! and dispatches work. Peer side: job handlers, the built-in kernels, the
//! bounded executor and the worker and client runtimes.

pub mod client;
pub mod executor;
pub mod handler;
pub mod kernels;
pub mod peer;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod worker;

pub use client::Client;
pub use executor::JobExecutor;
pub use handler::{HandlerTable, JobError, JobHandler};
pub use peer::RuntimeError;
pub use scheduler::{Delivery, Dispatch, Scheduler, SchedulerError, SchedulerSnapshot, SubmitOutcome};
pub use task::{Task, TaskStatus};
pub use worker::Worker;
