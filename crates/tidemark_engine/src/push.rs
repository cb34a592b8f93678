//! The push engine: local writes to the remote master.

use crate::error::{ReplicationError, ReplicationResult};
use crate::retry::{RetryController, RetryDecision};
use crate::state::Shared;
use crate::store::{ChangeEvent, WriteOrigin};
use std::collections::HashSet;
use std::sync::Arc;
use tidemark_protocol::{Checkpoint, ConflictInput, ConflictResolution, Direction, Document, WriteRow};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Drains the local change log into the backend in checkpointed
/// batches, routing rejected rows through the conflict resolver. Runs
/// until cancelled, or until the first empty flush in one-shot mode.
pub(crate) struct PushEngine {
    shared: Arc<Shared>,
    last_checkpoint: Option<Checkpoint>,
}

impl PushEngine {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            last_checkpoint: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let mut retry = RetryController::new(shared.config.retry.clone());
        // Subscribed before the first cycle so writes landing during the
        // initial flush are not missed.
        let mut local_events = shared.store.observe_changes();
        debug!(identifier = %shared.config.identifier, "push engine started");

        loop {
            shared.gate().await;
            if shared.cancel.is_cancelled() {
                break;
            }

            match self.cycle().await {
                Ok(exhausted) => {
                    retry.reset();
                    shared.bump_cycle(Direction::Push);
                    if !exhausted {
                        continue;
                    }
                    shared.set_synced(Direction::Push, true);
                    shared.mark_initial_done(Direction::Push);
                    if !shared.config.live {
                        break;
                    }
                    if !self.wait_for_local_activity(&mut local_events).await {
                        break;
                    }
                }
                Err(ReplicationError::Cancelled) => break,
                Err(err) => {
                    shared.emit_error(Direction::Push, err.clone(), self.last_checkpoint.clone());
                    match retry.decide(&err) {
                        RetryDecision::Retry(delay) => {
                            shared.add_retry();
                            trace!(attempt = retry.attempts(), ?delay, "push retry scheduled");
                            if !shared.sleep(delay).await {
                                break;
                            }
                        }
                        RetryDecision::Fatal => {
                            shared.fail(Direction::Push, &err);
                            break;
                        }
                    }
                }
            }
        }
        debug!(identifier = %self.shared.config.identifier, "push engine stopped");
    }

    /// One push cycle: read unreplicated rows, offer them, settle
    /// conflicts, advance the checkpoint over the settled prefix.
    /// Returns true when the change log is drained.
    async fn cycle(&mut self) -> ReplicationResult<bool> {
        let shared = &self.shared;
        let identifier = &shared.config.identifier;
        let limit = shared.config.push_batch_size;

        let stored = shared.checkpoints.get(identifier, Direction::Push).await?;
        self.last_checkpoint = stored.clone();
        let since = stored.and_then(|c| c.as_sequence()).unwrap_or(0);

        let batch = shared.store.changes_since(since, limit).await?;
        if batch.rows.is_empty() {
            // Only replication-origin events were scanned; skip past them.
            if batch.last_sequence > since {
                shared
                    .checkpoints
                    .set(
                        identifier,
                        Direction::Push,
                        Checkpoint::from_sequence(batch.last_sequence),
                    )
                    .await?;
            }
            return Ok(true);
        }
        shared.set_synced(Direction::Push, false);
        trace!(identifier = %identifier, rows = batch.rows.len(), "pushing batch");

        let rows: Vec<WriteRow> = batch.rows.iter().map(|r| r.row.clone()).collect();
        let outcome = shared.backend.push(rows).await?;

        let rejected_ids: HashSet<String> = outcome
            .rejected
            .iter()
            .map(|r| r.row.document_id().to_owned())
            .collect();
        let accepted: Vec<Document> = batch
            .rows
            .iter()
            .filter(|r| !rejected_ids.contains(r.row.document_id()))
            .map(|r| r.row.new_document.clone())
            .collect();
        if !accepted.is_empty() {
            shared.add_pushed(accepted.len() as u64);
            shared.store.confirm_replicated(accepted).await?;
        }

        // A rejected row is settled once local and master agree on its
        // state again; a row whose resolution write raced yet another
        // local edit stays unsettled and is retried next cycle.
        let mut unsettled: HashSet<String> = HashSet::new();
        for rejected in outcome.rejected {
            let id = rejected.row.document_id().to_owned();
            let input = ConflictInput {
                new_document: rejected.row.new_document.clone(),
                assumed_master: rejected.row.assumed_master.clone(),
                real_master: rejected.real_master.clone(),
            };
            match shared.resolver.resolve(&input) {
                ConflictResolution::Unchanged => {
                    // Both sides already hold the master state.
                    shared
                        .store
                        .confirm_replicated(vec![rejected.real_master])
                        .await?;
                }
                ConflictResolution::Resolved(resolved) => {
                    debug!(document = %id, "adopting conflict resolution");
                    let current = shared.store.fetch(vec![id.clone()]).await?.remove(&id);
                    let write = WriteRow::new(current, resolved);
                    let applied = shared
                        .store
                        .bulk_write(vec![write], WriteOrigin::Replication)
                        .await?;
                    if !applied.is_clean() {
                        unsettled.insert(id.clone());
                    }
                }
            }
            shared.add_conflict();
        }

        // Advance over the longest settled prefix so a crash never skips
        // an unsettled row.
        let mut watermark = since;
        let mut all_settled = true;
        for sequenced in &batch.rows {
            if unsettled.contains(sequenced.row.document_id()) {
                all_settled = false;
                break;
            }
            watermark = sequenced.sequence;
        }
        if all_settled {
            watermark = watermark.max(batch.last_sequence);
        }
        if watermark > since {
            shared
                .checkpoints
                .set(identifier, Direction::Push, Checkpoint::from_sequence(watermark))
                .await?;
        }

        Ok(all_settled && batch.rows.len() < limit)
    }

    /// Waits for a local-origin write, ignoring the engine's own writes.
    /// Returns false on cancellation.
    async fn wait_for_local_activity(
        &self,
        events: &mut broadcast::Receiver<ChangeEvent>,
    ) -> bool {
        let shared = &self.shared;
        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => return false,
                _ = shared.push_wake.notified() => return true,
                received = events.recv() => match received {
                    Ok(event) if event.origin == WriteOrigin::Local => {
                        shared.set_synced(Direction::Push, false);
                        return true;
                    }
                    // Replication-origin writes never re-enter the queue.
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => return true,
                    Err(broadcast::error::RecvError::Closed) => {
                        // Feed gone; degrade to polling.
                        return shared.sleep(shared.config.poll_interval).await;
                    }
                },
            }
        }
    }
}
