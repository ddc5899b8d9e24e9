//! # xjob-worker
//!
//! Stateless task executor: reserves task messages from the workers tube,
//! runs the matching executor, posts the result or the typed error back on
//! the reply tube.

pub mod runtime;
pub mod tasks;

pub use runtime::{Worker, WorkerConfig};
