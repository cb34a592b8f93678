//! Backend adapter contract.
//!
//! A backend is anything that can hand out ordered batches of documents
//! newer than a checkpoint and accept-or-reject pushed write rows: an
//! HTTP document API, a message-bus stream, a peer channel. The engine
//! only ever talks to this trait; wire formats, transport encryption and
//! authentication are the adapter's business.

use crate::error::ReplicationResult;
use std::future::Future;
use std::pin::Pin;
use tidemark_protocol::{Checkpoint, Document, WriteRow};
use tokio::sync::broadcast;

/// Boxed async future, the shape of every suspension point in the
/// adapter contracts. Keeps the traits object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One batch of remote deltas.
#[derive(Debug, Clone)]
pub struct PullBatch {
    /// Documents strictly newer than the requested checkpoint, in the
    /// backend's canonical order.
    pub documents: Vec<Document>,
    /// Checkpoint covering everything up to and including this batch.
    pub checkpoint: Checkpoint,
}

/// A pushed row the backend refused, with its authoritative state.
#[derive(Debug, Clone)]
pub struct RejectedRow {
    /// The row as it was pushed.
    pub row: WriteRow,
    /// The state the backend actually holds for this document.
    pub real_master: Document,
}

/// The backend's verdict on one pushed batch.
#[derive(Debug, Clone, Default)]
pub struct PushOutcome {
    /// Rows rejected as conflicts. Everything not listed was accepted.
    pub rejected: Vec<RejectedRow>,
}

/// The minimum capability set the replication core requires of a remote.
///
/// Any backend satisfying this contract is pluggable. Implementations
/// map their transport failures onto [`crate::ReplicationError`]:
/// unreachable/timeout as `Network`, malformed responses as `Protocol`.
pub trait ReplicationBackend: Send + Sync {
    /// Requests a batch of at most `limit` documents strictly newer than
    /// `checkpoint` (`None` means from the beginning), together with the
    /// new checkpoint. Asking again with the same checkpoint must be
    /// safe and yield the same or newer data.
    fn pull(
        &self,
        checkpoint: Option<Checkpoint>,
        limit: usize,
    ) -> BoxFuture<'_, ReplicationResult<PullBatch>>;

    /// Offers write rows to the backend. Each row is accepted iff its
    /// assumed master state matches the backend's current state;
    /// rejected rows come back with the authoritative state attached.
    fn push(&self, rows: Vec<WriteRow>) -> BoxFuture<'_, ReplicationResult<PushOutcome>>;

    /// Whether the backend can notify about remote changes. When false,
    /// live mode degrades to polling at the configured interval.
    fn supports_live_subscribe(&self) -> bool {
        false
    }

    /// Subscribes to remote change notifications, if supported. Each
    /// received unit means "something changed, pull again".
    fn subscribe(&self) -> Option<broadcast::Receiver<()>> {
        None
    }
}
