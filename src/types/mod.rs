//! Type definitions for the node executor
//!
//! Task descriptions, task states and status records, plus the
//! executor/framework/node descriptions delivered at registration.

mod node;
mod task;

pub use node::*;
pub use task::*;
