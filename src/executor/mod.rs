//! Task executor module
//!
//! Handles the task execution lifecycle:
//! - Reacting to driver callbacks
//! - Running task commands through a [`TaskRunner`]
//! - Tracking in-flight tasks and their cancellation
//! - Reporting status updates

mod lifecycle;
mod runner;
mod state;

pub use lifecycle::*;
pub use runner::*;
