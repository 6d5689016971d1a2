//! CLI command modules.

pub mod submit;
pub mod worker;
