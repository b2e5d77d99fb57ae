//! Protocol module for node agent communication
//!
//! Defines the message types and serialization for the executor/agent
//! protocol: JSON envelopes over WebSocket with versioning support.

mod messages;
mod version;

pub use messages::*;
pub use version::*;
