//! Local storage collaborator contract.
//!
//! The replication core never owns the document store; it borrows this
//! interface. The store supplies a sequenced change log for the push
//! engine, atomic assumed-state-checked batch writes for the pull
//! engine, and a live change feed for wake-ups in live mode.

use crate::backend::BoxFuture;
use crate::error::ReplicationResult;
use std::collections::HashMap;
use tidemark_protocol::{Document, WriteRow};
use tokio::sync::broadcast;

/// Who performed a write.
///
/// Documents written by the replication engine itself (pulled data,
/// conflict resolutions) are tagged `Replication` so they never
/// re-enter the push queue. The tag lives on the write call and the
/// change feed, never inside the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// An application write on this peer.
    Local,
    /// A write performed by the replication engine.
    Replication,
}

/// One committed change, as emitted on the live change feed.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Store sequence number of the commit.
    pub sequence: u64,
    /// Primary key of the changed document.
    pub document_id: String,
    /// Who wrote it.
    pub origin: WriteOrigin,
}

/// A write row paired with the store sequence it was read at.
#[derive(Debug, Clone)]
pub struct SequencedRow {
    /// Store sequence number; push checkpoints are these.
    pub sequence: u64,
    /// The unreplicated write.
    pub row: WriteRow,
}

/// A finite slice of the store's change log.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    /// Unreplicated local-origin rows in sequence order, at most one per
    /// document (the latest state supersedes earlier edits).
    pub rows: Vec<SequencedRow>,
    /// The highest sequence number scanned, including replication-origin
    /// events that produced no row. Equals the requested sequence when
    /// nothing was scanned.
    pub last_sequence: u64,
}

/// A row the store refused because its assumed state no longer matched.
#[derive(Debug, Clone)]
pub struct WriteConflict {
    /// The rejected row.
    pub row: WriteRow,
    /// The state the store actually holds (`None` if the document does
    /// not exist).
    pub current: Option<Document>,
}

/// Result of an atomic batch write.
#[derive(Debug, Clone, Default)]
pub struct BulkWriteOutcome {
    /// Rows that were not applied. Everything else committed.
    pub conflicts: Vec<WriteConflict>,
}

impl BulkWriteOutcome {
    /// Returns true if every row was applied.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// The document store the engine replicates.
///
/// All failures map to [`crate::ReplicationError::Storage`], which is
/// fatal for the owning replication.
pub trait LocalStore: Send + Sync {
    /// Returns unreplicated local writes with sequence numbers strictly
    /// greater than `sequence`, at most `limit` rows, restartable from
    /// any prior sequence. Rows carry the last state known replicated as
    /// their `assumed_master`.
    fn changes_since(
        &self,
        sequence: u64,
        limit: usize,
    ) -> BoxFuture<'_, ReplicationResult<ChangeBatch>>;

    /// Fetches the current state of the given documents. Absent keys are
    /// simply missing from the result.
    fn fetch(
        &self,
        ids: Vec<String>,
    ) -> BoxFuture<'_, ReplicationResult<HashMap<String, Document>>>;

    /// Fetches the last state per document known to match the remote
    /// master. The pull engine skips incoming documents that match this
    /// snapshot, so a pending local edit on top of an unchanged master
    /// state survives a re-delivered pull.
    fn replicated_state(
        &self,
        ids: Vec<String>,
    ) -> BoxFuture<'_, ReplicationResult<HashMap<String, Document>>>;

    /// Writes a batch atomically. A row applies only when its
    /// `assumed_master` matches the store's current state; mismatches
    /// come back as conflicts with nothing written for them. Writes with
    /// [`WriteOrigin::Replication`] also update the replicated-state
    /// snapshot and are excluded from future [`Self::changes_since`]
    /// results.
    fn bulk_write(
        &self,
        rows: Vec<WriteRow>,
        origin: WriteOrigin,
    ) -> BoxFuture<'_, ReplicationResult<BulkWriteOutcome>>;

    /// Records that the given states are now known to the remote master,
    /// after an accepted push or a converged conflict. Subsequent change
    /// rows for these documents assume these states.
    fn confirm_replicated(&self, documents: Vec<Document>) -> BoxFuture<'_, ReplicationResult<()>>;

    /// Subscribes to the live change feed. Infinite, cancellable by
    /// dropping the receiver; events are tagged with their origin.
    fn observe_changes(&self) -> broadcast::Receiver<ChangeEvent>;
}
