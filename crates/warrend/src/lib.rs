//! warrend: the Warren broker.
//!
//! Accepts peers on one UDP endpoint, classifies each by its registration
//! message and runs a client or worker serve loop for it. All admission and
//! dispatch decisions are made by the shared [`Scheduler`](warren_services::Scheduler).

pub mod broker;

pub use broker::Broker;
