//! In-memory reference implementations.
//!
//! [`MemoryStore`] is a local document store and [`MemoryBackend`] an
//! in-process remote master. They implement the collaborator contracts
//! faithfully (sequenced change log, assumed-state checks, origin
//! tagging, change notifications) and are suitable for tests, examples
//! and ephemeral replications. Cloning a [`MemoryBackend`] yields a
//! handle to the same master, so several peers can replicate through it.

use crate::backend::{BoxFuture, PullBatch, PushOutcome, RejectedRow, ReplicationBackend};
use crate::error::ReplicationResult;
use crate::store::{
    BulkWriteOutcome, ChangeBatch, ChangeEvent, LocalStore, SequencedRow, WriteConflict,
    WriteOrigin,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tidemark_protocol::{assumed_state_matches, Checkpoint, Document, WriteRow};
use tokio::sync::broadcast;

fn now_millis() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone)]
struct LogEntry {
    sequence: u64,
    document_id: String,
    origin: WriteOrigin,
}

#[derive(Debug, Default)]
struct StoreInner {
    documents: BTreeMap<String, Document>,
    /// Last state per document known to match the remote master.
    replicated: HashMap<String, Document>,
    log: Vec<LogEntry>,
    sequence: u64,
}

/// An in-memory document store.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(StoreInner::default()),
            changes,
        }
    }

    /// Writes a document as an application write. The last-write time is
    /// stamped here; the change is queued for push.
    pub fn write_local(&self, mut document: Document) {
        document.meta.lwt = now_millis();
        let event = {
            let mut inner = self.inner.write();
            inner.sequence += 1;
            let event = ChangeEvent {
                sequence: inner.sequence,
                document_id: document.id.clone(),
                origin: WriteOrigin::Local,
            };
            inner.log.push(LogEntry {
                sequence: event.sequence,
                document_id: document.id.clone(),
                origin: WriteOrigin::Local,
            });
            inner.documents.insert(document.id.clone(), document);
            event
        };
        let _ = self.changes.send(event);
    }

    /// Soft-deletes a document as an application write.
    pub fn delete_local(&self, id: impl Into<String>) {
        self.write_local(Document::tombstone(id));
    }

    /// Returns the current state of a document, tombstones included.
    pub fn get(&self, id: &str) -> Option<Document> {
        self.inner.read().documents.get(id).cloned()
    }

    /// Counts live documents, excluding tombstones.
    pub fn document_count(&self) -> usize {
        self.inner
            .read()
            .documents
            .values()
            .filter(|d| !d.deleted)
            .count()
    }

    /// Returns all documents including tombstones, ordered by primary key.
    pub fn snapshot(&self) -> BTreeMap<String, Document> {
        self.inner.read().documents.clone()
    }

    /// Returns the highest committed sequence number.
    pub fn highest_sequence(&self) -> u64 {
        self.inner.read().sequence
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryStore {
    fn changes_since(
        &self,
        sequence: u64,
        limit: usize,
    ) -> BoxFuture<'_, ReplicationResult<ChangeBatch>> {
        let inner = self.inner.read();

        // Latest event per document within the scanned prefix; replication
        // origin supersedes earlier local edits (they are already settled).
        let mut latest: BTreeMap<String, (u64, WriteOrigin)> = BTreeMap::new();
        let mut last_sequence = sequence;

        for entry in inner.log.iter().filter(|e| e.sequence > sequence) {
            if !latest.contains_key(&entry.document_id) && latest.len() >= limit {
                break;
            }
            latest.insert(entry.document_id.clone(), (entry.sequence, entry.origin));
            last_sequence = entry.sequence;
        }

        let mut rows = Vec::new();
        for (id, (seq, origin)) in latest {
            if origin != WriteOrigin::Local {
                continue;
            }
            if let Some(document) = inner.documents.get(&id) {
                rows.push(SequencedRow {
                    sequence: seq,
                    row: WriteRow::new(inner.replicated.get(&id).cloned(), document.clone()),
                });
            }
        }
        rows.sort_by_key(|r| r.sequence);

        let batch = ChangeBatch {
            rows,
            last_sequence,
        };
        Box::pin(async move { Ok(batch) })
    }

    fn fetch(
        &self,
        ids: Vec<String>,
    ) -> BoxFuture<'_, ReplicationResult<HashMap<String, Document>>> {
        let inner = self.inner.read();
        let result: HashMap<String, Document> = ids
            .into_iter()
            .filter_map(|id| inner.documents.get(&id).cloned().map(|doc| (id, doc)))
            .collect();
        Box::pin(async move { Ok(result) })
    }

    fn replicated_state(
        &self,
        ids: Vec<String>,
    ) -> BoxFuture<'_, ReplicationResult<HashMap<String, Document>>> {
        let inner = self.inner.read();
        let result: HashMap<String, Document> = ids
            .into_iter()
            .filter_map(|id| inner.replicated.get(&id).cloned().map(|doc| (id, doc)))
            .collect();
        Box::pin(async move { Ok(result) })
    }

    fn bulk_write(
        &self,
        rows: Vec<WriteRow>,
        origin: WriteOrigin,
    ) -> BoxFuture<'_, ReplicationResult<BulkWriteOutcome>> {
        let mut conflicts = Vec::new();
        let mut events = Vec::new();
        {
            let mut inner = self.inner.write();
            for row in rows {
                let current = inner.documents.get(row.document_id()).cloned();
                if !assumed_state_matches(row.assumed_master.as_ref(), current.as_ref()) {
                    conflicts.push(WriteConflict { row, current });
                    continue;
                }

                inner.sequence += 1;
                let sequence = inner.sequence;
                let document = row.new_document;
                events.push(ChangeEvent {
                    sequence,
                    document_id: document.id.clone(),
                    origin,
                });
                inner.log.push(LogEntry {
                    sequence,
                    document_id: document.id.clone(),
                    origin,
                });
                if origin == WriteOrigin::Replication {
                    inner.replicated.insert(document.id.clone(), document.clone());
                }
                inner.documents.insert(document.id.clone(), document);
            }
        }
        for event in events {
            let _ = self.changes.send(event);
        }
        Box::pin(async move { Ok(BulkWriteOutcome { conflicts }) })
    }

    fn confirm_replicated(&self, documents: Vec<Document>) -> BoxFuture<'_, ReplicationResult<()>> {
        {
            let mut inner = self.inner.write();
            for document in documents {
                inner.replicated.insert(document.id.clone(), document);
            }
        }
        Box::pin(async move { Ok(()) })
    }

    fn observe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

#[derive(Debug, Clone)]
struct MasterDoc {
    sequence: u64,
    document: Document,
}

#[derive(Debug, Default)]
struct BackendInner {
    documents: BTreeMap<String, MasterDoc>,
    sequence: u64,
}

/// An in-process remote master.
///
/// Pull order is the master's write order (a total order, so ties on
/// last-write time never arise); push applies the assumed-state check
/// per row and rejects mismatches with the authoritative state attached.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<RwLock<BackendInner>>,
    notify: broadcast::Sender<()>,
    fail_pulls: Arc<AtomicU32>,
    fail_pushes: Arc<AtomicU32>,
}

impl MemoryBackend {
    /// Creates an empty master.
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(BackendInner::default())),
            notify,
            fail_pulls: Arc::new(AtomicU32::new(0)),
            fail_pushes: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Returns the master state of a document.
    pub fn get(&self, id: &str) -> Option<Document> {
        self.inner.read().documents.get(id).map(|m| m.document.clone())
    }

    /// Counts live master documents, excluding tombstones.
    pub fn document_count(&self) -> usize {
        self.inner
            .read()
            .documents
            .values()
            .filter(|m| !m.document.deleted)
            .count()
    }

    /// Returns all master documents in write order.
    pub fn all_documents(&self) -> Vec<Document> {
        let inner = self.inner.read();
        let mut masters: Vec<&MasterDoc> = inner.documents.values().collect();
        masters.sort_by_key(|m| m.sequence);
        masters.iter().map(|m| m.document.clone()).collect()
    }

    /// Makes the next `count` pull requests fail with a network error.
    pub fn inject_pull_failures(&self, count: u32) {
        self.fail_pulls.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` push requests fail with a network error.
    pub fn inject_push_failures(&self, count: u32) {
        self.fail_pushes.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationBackend for MemoryBackend {
    fn pull(
        &self,
        checkpoint: Option<Checkpoint>,
        limit: usize,
    ) -> BoxFuture<'_, ReplicationResult<PullBatch>> {
        if Self::take_failure(&self.fail_pulls) {
            return Box::pin(async move {
                Err(crate::ReplicationError::Network("injected pull failure".into()))
            });
        }

        let since = checkpoint
            .as_ref()
            .and_then(Checkpoint::as_sequence)
            .unwrap_or(0);

        let inner = self.inner.read();
        let mut masters: Vec<&MasterDoc> = inner
            .documents
            .values()
            .filter(|m| m.sequence > since)
            .collect();
        masters.sort_by_key(|m| m.sequence);
        masters.truncate(limit);

        let new_checkpoint = masters.last().map_or(since, |m| m.sequence);
        let batch = PullBatch {
            documents: masters.iter().map(|m| m.document.clone()).collect(),
            checkpoint: Checkpoint::from_sequence(new_checkpoint),
        };
        Box::pin(async move { Ok(batch) })
    }

    fn push(&self, rows: Vec<WriteRow>) -> BoxFuture<'_, ReplicationResult<PushOutcome>> {
        if Self::take_failure(&self.fail_pushes) {
            return Box::pin(async move {
                Err(crate::ReplicationError::Network("injected push failure".into()))
            });
        }

        let mut rejected = Vec::new();
        let mut accepted_any = false;
        {
            let mut inner = self.inner.write();
            for row in rows {
                let current = inner.documents.get(row.document_id()).cloned();
                match current {
                    Some(master)
                        if !assumed_state_matches(
                            row.assumed_master.as_ref(),
                            Some(&master.document),
                        ) =>
                    {
                        rejected.push(RejectedRow {
                            row,
                            real_master: master.document,
                        });
                    }
                    _ => {
                        inner.sequence += 1;
                        let sequence = inner.sequence;
                        inner.documents.insert(
                            row.new_document.id.clone(),
                            MasterDoc {
                                sequence,
                                document: row.new_document,
                            },
                        );
                        accepted_any = true;
                    }
                }
            }
        }
        if accepted_any {
            let _ = self.notify.send(());
        }
        Box::pin(async move { Ok(PushOutcome { rejected }) })
    }

    fn supports_live_subscribe(&self) -> bool {
        true
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.notify.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn doc(id: &str, age: i64) -> Document {
        Document::new(id, Map::new()).with_field("age", json!(age))
    }

    #[tokio::test]
    async fn local_writes_appear_in_change_log() {
        let store = MemoryStore::new();
        store.write_local(doc("a", 1));
        store.write_local(doc("b", 2));

        let batch = store.changes_since(0, 10).await.unwrap();
        assert_eq!(batch.rows.len(), 2);
        assert_eq!(batch.rows[0].row.document_id(), "a");
        assert!(batch.rows[0].row.assumed_master.is_none());
        assert_eq!(batch.last_sequence, 2);
    }

    #[tokio::test]
    async fn replication_writes_do_not_enter_push_queue() {
        let store = MemoryStore::new();
        store
            .bulk_write(vec![WriteRow::insert(doc("pulled", 1))], WriteOrigin::Replication)
            .await
            .unwrap();

        let batch = store.changes_since(0, 10).await.unwrap();
        assert!(batch.rows.is_empty());
        // The scanned sequence still advances past the skipped event.
        assert_eq!(batch.last_sequence, 1);
        assert_eq!(store.get("pulled").unwrap().field("age"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn pull_overwrite_supersedes_pending_local_edit() {
        let store = MemoryStore::new();
        store.write_local(doc("x", 1));

        // A pulled write (e.g. an adopted conflict resolution) replaces the
        // local edit; nothing is left to push.
        let current = store.get("x");
        store
            .bulk_write(
                vec![WriteRow::new(current, doc("x", 99))],
                WriteOrigin::Replication,
            )
            .await
            .unwrap();

        let batch = store.changes_since(0, 10).await.unwrap();
        assert!(batch.rows.is_empty());
    }

    #[tokio::test]
    async fn changes_since_returns_latest_state_once_per_document() {
        let store = MemoryStore::new();
        store.write_local(doc("x", 1));
        store.write_local(doc("x", 2));
        store.write_local(doc("x", 3));

        let batch = store.changes_since(0, 10).await.unwrap();
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(
            batch.rows[0].row.new_document.field("age"),
            Some(&json!(3))
        );
        assert_eq!(batch.rows[0].sequence, 3);
    }

    #[tokio::test]
    async fn bulk_write_rejects_stale_assumptions() {
        let store = MemoryStore::new();
        store.write_local(doc("x", 1));

        let stale = WriteRow::new(Some(doc("x", 0)), doc("x", 2));
        let outcome = store
            .bulk_write(vec![stale], WriteOrigin::Replication)
            .await
            .unwrap();

        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(
            outcome.conflicts[0].current.as_ref().unwrap().field("age"),
            Some(&json!(1))
        );
        // Nothing was written
        assert_eq!(store.get("x").unwrap().field("age"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn reapplying_a_pull_batch_is_idempotent() {
        let store = MemoryStore::new();
        let row = WriteRow::insert(doc("x", 1));

        store
            .bulk_write(vec![row.clone()], WriteOrigin::Replication)
            .await
            .unwrap();
        let after_once = store.snapshot();

        // Crash-before-checkpoint replay: same rows again.
        let outcome = store
            .bulk_write(vec![row], WriteOrigin::Replication)
            .await
            .unwrap();
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(store.snapshot(), after_once);
    }

    #[tokio::test]
    async fn change_feed_tags_origins() {
        let store = MemoryStore::new();
        let mut feed = store.observe_changes();

        store.write_local(doc("a", 1));
        store
            .bulk_write(vec![WriteRow::insert(doc("b", 2))], WriteOrigin::Replication)
            .await
            .unwrap();

        assert_eq!(feed.recv().await.unwrap().origin, WriteOrigin::Local);
        assert_eq!(feed.recv().await.unwrap().origin, WriteOrigin::Replication);
    }

    #[tokio::test]
    async fn backend_pull_pages_in_order() {
        let backend = MemoryBackend::new();
        for i in 0..5 {
            backend
                .push(vec![WriteRow::insert(doc(&format!("d{i}"), i))])
                .await
                .unwrap();
        }

        let first = backend.pull(None, 3).await.unwrap();
        assert_eq!(first.documents.len(), 3);
        assert_eq!(first.documents[0].id, "d0");

        let second = backend.pull(Some(first.checkpoint), 3).await.unwrap();
        assert_eq!(second.documents.len(), 2);
        assert_eq!(second.documents[0].id, "d3");

        // Caught up: same checkpoint, empty batch
        let third = backend.pull(Some(second.checkpoint.clone()), 3).await.unwrap();
        assert!(third.documents.is_empty());
        assert_eq!(third.checkpoint, second.checkpoint);
    }

    #[tokio::test]
    async fn backend_rejects_conflicting_push() {
        let backend = MemoryBackend::new();
        backend
            .push(vec![WriteRow::insert(doc("x", 1))])
            .await
            .unwrap();

        // Writer assumed an older state
        let outcome = backend
            .push(vec![WriteRow::new(Some(doc("x", 0)), doc("x", 2))])
            .await
            .unwrap();
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(
            outcome.rejected[0].real_master.field("age"),
            Some(&json!(1))
        );

        // Master unchanged
        assert_eq!(backend.get("x").unwrap().field("age"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn backend_notifies_on_accepted_push() {
        let backend = MemoryBackend::new();
        let mut notifications = backend.subscribe().unwrap();

        backend
            .push(vec![WriteRow::insert(doc("x", 1))])
            .await
            .unwrap();
        notifications.recv().await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let backend = MemoryBackend::new();
        backend.inject_pull_failures(1);

        assert!(backend.pull(None, 10).await.is_err());
        assert!(backend.pull(None, 10).await.is_ok());
    }
}
