//! Protocol versioning
//!
//! The agent announces its protocol version in `REGISTERED`; the driver
//! refuses to operate against an incompatible agent.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Protocol version spoken by this executor
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0, 0);

/// Protocol version identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Major versions must match; our minor must be at least the peer's.
    pub fn is_compatible_with(&self, peer: &ProtocolVersion) -> bool {
        self.major == peer.major && self.minor >= peer.minor
    }

    /// Like [`is_compatible_with`](Self::is_compatible_with) but as an error
    pub fn check_compatible(&self, peer: &ProtocolVersion) -> Result<()> {
        if self.is_compatible_with(peer) {
            Ok(())
        } else {
            Err(Error::ProtocolVersion {
                expected: self.to_string(),
                actual: peer.to_string(),
            })
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
