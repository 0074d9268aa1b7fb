//! Canonical change record
//!
//! Both envelope shapes normalize into [`ChangeRecord`]; the translator
//! consumes it without knowing which shape it came from.

use serde_json::{Map, Value};

/// Change operation type, derived from the source op code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ChangeOp {
    /// Row created (`c`)
    Create,
    /// Row updated (`u`)
    Update,
    /// Row deleted (`d`)
    Delete,
    /// Snapshot read during initial sync (`r`)
    Snapshot,
}

impl ChangeOp {
    /// Map a source op code to an operation.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "c" => Some(Self::Create),
            "u" => Some(Self::Update),
            "d" => Some(Self::Delete),
            "r" => Some(Self::Snapshot),
            _ => None,
        }
    }

    /// The source op code for this operation.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Create => "c",
            Self::Update => "u",
            Self::Delete => "d",
            Self::Snapshot => "r",
        }
    }
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeOp::Create => write!(f, "CREATE"),
            ChangeOp::Update => write!(f, "UPDATE"),
            ChangeOp::Delete => write!(f, "DELETE"),
            ChangeOp::Snapshot => write!(f, "SNAPSHOT"),
        }
    }
}

/// The canonical unit the pipeline operates on.
///
/// Created by the envelope parser, consumed exactly once by the translator.
/// Invariants the parser upholds: `table` is non-empty, the payload is
/// non-null, and the configured id field is present in the payload.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChangeRecord {
    /// Unqualified table name (schema/db prefix stripped)
    pub table: String,
    /// Operation type
    pub op: ChangeOp,
    /// Source primary-key value
    pub id: Value,
    /// Source commit timestamp in epoch milliseconds; becomes the
    /// valid-from boundary of the write
    pub event_time_ms: i64,
    /// Row image: the "after" image for Create/Update/Snapshot, the
    /// "before" image for Delete
    pub payload: Map<String, Value>,
    /// True when the record represents a logical delete, independent
    /// of `op`
    pub deleted: bool,
}

impl ChangeRecord {
    /// Create a new change record. `deleted` defaults to whether the
    /// operation is a delete.
    pub fn new(
        table: impl Into<String>,
        op: ChangeOp,
        id: Value,
        event_time_ms: i64,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            table: table.into(),
            op,
            id,
            event_time_ms,
            payload,
            deleted: op == ChangeOp::Delete,
        }
    }

    /// Override the deletion flag (flat envelopes carry it separately).
    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    /// Field names of the row image, in payload order.
    pub fn field_names(&self) -> Vec<String> {
        self.payload.keys().cloned().collect()
    }
}
