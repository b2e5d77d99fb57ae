//! Node agent driver module
//!
//! Connects the executor core to a node agent:
//! - Callback and outbound traits the core is written against
//! - WebSocket connection with auto-reconnect
//! - Registration and callback dispatch

mod client;
mod traits;

pub use client::*;
pub use traits::*;
