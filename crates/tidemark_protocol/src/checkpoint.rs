//! Opaque replication checkpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The direction of one replication stream.
///
/// Each direction owns its own checkpoint slot; the pull and push
/// engines never share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Remote-to-local.
    Pull,
    /// Local-to-remote.
    Push,
}

impl Direction {
    /// Returns a stable short name, used in persisted checkpoint keys
    /// and log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque, backend-defined replication progress marker.
///
/// The engine never interprets a pull checkpoint; it only hands the last
/// one back to the backend to request "everything newer than this".
/// Push checkpoints are the local store's sequence numbers, carried in
/// the same envelope.
///
/// A checkpoint is persisted only after the batch it covers has been
/// durably applied, so progress never runs ahead of the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(Value);

impl Checkpoint {
    /// Wraps a backend-defined checkpoint value.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Creates a checkpoint from a plain sequence number.
    pub fn from_sequence(sequence: u64) -> Self {
        Self(Value::from(sequence))
    }

    /// Reads the checkpoint as a sequence number, if it is one.
    pub fn as_sequence(&self) -> Option<u64> {
        self.0.as_u64()
    }

    /// Returns the underlying backend-defined value.
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Consumes the checkpoint, returning the underlying value.
    pub fn into_value(self) -> Value {
        self.0
    }
}
