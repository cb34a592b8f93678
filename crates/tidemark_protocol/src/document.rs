//! Replicated documents and write rows.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Replication-internal metadata attached to every document.
///
/// Metadata is carried alongside the document body but is ignored by
/// structural equality: two documents that differ only in metadata are
/// the same document as far as conflict detection is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// Last-write time in milliseconds since the Unix epoch.
    pub lwt: u64,
}

/// A replicated document.
///
/// Documents are soft-deleted: a deletion produces a tombstone with
/// `deleted = true` that keeps replicating like any other write. A
/// document is never represented by absence once it has existed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Primary key, unique within one replicated collection.
    pub id: String,
    /// Soft-delete flag. Tombstones are first-class documents.
    pub deleted: bool,
    /// Document body.
    pub data: Map<String, Value>,
    /// Replication metadata, excluded from structural equality.
    pub meta: DocumentMeta,
}

impl Document {
    /// Creates a live document with the given body.
    pub fn new(id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            deleted: false,
            data,
            meta: DocumentMeta::default(),
        }
    }

    /// Creates a tombstone for the given primary key.
    pub fn tombstone(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deleted: true,
            data: Map::new(),
            meta: DocumentMeta::default(),
        }
    }

    /// Sets a body field, returning the modified document.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Sets the last-write time, returning the modified document.
    #[must_use]
    pub fn with_lwt(mut self, lwt: u64) -> Self {
        self.meta.lwt = lwt;
        self
    }

    /// Returns a body field by name.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Deep structural comparison ignoring replication metadata.
    ///
    /// This is the equality used everywhere conflict detection asks
    /// "is this the same state": primary key, deletion flag and body
    /// must match; `meta` is deliberately excluded.
    pub fn same_state(&self, other: &Document) -> bool {
        self.id == other.id && self.deleted == other.deleted && self.data == other.data
    }
}

/// Compares an assumed master state against an actual current state.
///
/// Used by storage and backends alike: a write is conflict-free exactly
/// when the writer's assumption about the prior state matches reality.
/// Two absent states match; an absent assumption against an existing
/// document (or vice versa) does not.
pub fn assumed_state_matches(assumed: Option<&Document>, current: Option<&Document>) -> bool {
    match (assumed, current) {
        (None, None) => true,
        (Some(a), Some(c)) => a.same_state(c),
        _ => false,
    }
}

/// A single write as seen by the replication protocol.
///
/// `assumed_master` is the writer's belief about the remote state before
/// this change (`None` for an insert); `new_document` is the desired new
/// state. The receiving side rejects the row as a conflict whenever the
/// assumption no longer holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRow {
    /// The state the writer believes the receiver currently holds.
    pub assumed_master: Option<Document>,
    /// The desired new state.
    pub new_document: Document,
}

impl WriteRow {
    /// Creates a write row.
    pub fn new(assumed_master: Option<Document>, new_document: Document) -> Self {
        Self {
            assumed_master,
            new_document,
        }
    }

    /// Creates an insert row (no assumed prior state).
    pub fn insert(new_document: Document) -> Self {
        Self::new(None, new_document)
    }

    /// Returns the primary key of the document being written.
    pub fn document_id(&self) -> &str {
        &self.new_document.id
    }
}
