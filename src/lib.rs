//! skein: a resumable batch job engine.
//!
//! Jobs are [`flow`] state machines whose step states run chunk-oriented
//! [`step`]s with [`retry`] and skip handling. Execution metadata lives in
//! [`execution`]; [`job`] ties a flow to a launch.

pub mod cli;
pub mod config;
pub mod demo;
pub mod error;
pub mod execution;
pub mod flow;
pub mod job;
pub mod retry;
pub mod status;
pub mod step;
pub mod task;
pub mod ui;

pub use error::{BatchError, Failure, Result};
