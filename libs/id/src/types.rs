//! Identifier definitions.

use serde::{Deserialize, Serialize};

use crate::define_ulid_id;
use crate::IdError;

// =============================================================================
// Machine Identity
// =============================================================================

/// Maximum accepted length of a [`SystemId`].
pub const MAX_SYSTEM_ID_LEN: usize = 64;

/// Opaque machine identifier assigned by the controller.
///
/// Correlates every execution, event channel and task queue belonging to one
/// machine (or to the agent itself, which is also a managed machine).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SystemId(String);

impl SystemId {
    /// Parses and validates a machine identifier.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        if s.len() > MAX_SYSTEM_ID_LEN {
            return Err(IdError::TooLong {
                len: s.len(),
                max: MAX_SYSTEM_ID_LEN,
            });
        }

        if let Some(ch) = s
            .chars()
            .find(|c| c.is_whitespace() || *c == ':' || *c == '@')
        {
            return Err(IdError::InvalidCharacter {
                ch,
                value: s.to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SystemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for SystemId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SystemId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SystemId> for String {
    fn from(id: SystemId) -> Self {
        id.0
    }
}

impl AsRef<str> for SystemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Network Segments
// =============================================================================

/// Network segment (VLAN) identifier as reported by the controller.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SegmentId(i64);

impl SegmentId {
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SegmentId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>()
            .map(Self)
            .map_err(|e| IdError::InvalidNumber(e.to_string()))
    }
}

impl From<i64> for SegmentId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// =============================================================================
// Agent-generated Identifiers
// =============================================================================

define_ulid_id!(
    /// Identifies one execution of a workflow on a task queue.
    ExecutionId,
    "exec"
);

define_ulid_id!(
    /// Identifies one worker polling a task queue.
    WorkerId,
    "wkr"
);

// =============================================================================
// Tests
// =============================================================================
