//! The pull engine: remote master to local store.

use crate::retry::{RetryController, RetryDecision};
use crate::state::Shared;
use crate::store::WriteOrigin;
use std::sync::Arc;
use tidemark_protocol::{Direction, WriteRow};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Outcome of one wait in live mode.
enum Wakeup {
    Cancelled,
    Woken,
    /// The remote notification stream closed; fall back to polling.
    StreamClosed,
}

/// Pulls remote deltas in checkpointed batches and applies them to the
/// local store. Runs until cancelled, or until the first caught-up pass
/// in one-shot mode.
pub(crate) struct PullEngine {
    shared: Arc<Shared>,
    last_checkpoint: Option<tidemark_protocol::Checkpoint>,
}

impl PullEngine {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            last_checkpoint: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let mut retry = RetryController::new(shared.config.retry.clone());
        let mut remote_events = if shared.backend.supports_live_subscribe() {
            shared.backend.subscribe()
        } else {
            None
        };
        debug!(identifier = %shared.config.identifier, "pull engine started");

        loop {
            shared.gate().await;
            if shared.cancel.is_cancelled() {
                break;
            }

            match self.cycle().await {
                Ok(caught_up) => {
                    retry.reset();
                    shared.bump_cycle(Direction::Pull);
                    if !caught_up {
                        // More batches pending, keep draining.
                        continue;
                    }
                    shared.set_synced(Direction::Pull, true);
                    shared.mark_initial_done(Direction::Pull);
                    if !shared.config.live {
                        break;
                    }
                    match self.wait_for_remote_activity(&mut remote_events).await {
                        Wakeup::Cancelled => break,
                        Wakeup::Woken => {}
                        Wakeup::StreamClosed => remote_events = None,
                    }
                }
                Err(crate::error::ReplicationError::Cancelled) => break,
                Err(err) => {
                    shared.emit_error(Direction::Pull, err.clone(), self.last_checkpoint.clone());
                    match retry.decide(&err) {
                        RetryDecision::Retry(delay) => {
                            shared.add_retry();
                            trace!(attempt = retry.attempts(), ?delay, "pull retry scheduled");
                            if !shared.sleep(delay).await {
                                break;
                            }
                        }
                        RetryDecision::Fatal => {
                            shared.fail(Direction::Pull, &err);
                            break;
                        }
                    }
                }
            }
        }
        debug!(identifier = %self.shared.config.identifier, "pull engine stopped");
    }

    /// One pull cycle: checkpoint, batch, apply, advance. Returns true
    /// when the batch came back short, meaning the remote is drained.
    async fn cycle(&mut self) -> crate::error::ReplicationResult<bool> {
        let shared = &self.shared;
        let identifier = &shared.config.identifier;
        let limit = shared.config.pull_batch_size;

        let checkpoint = shared.checkpoints.get(identifier, Direction::Pull).await?;
        self.last_checkpoint = checkpoint.clone();

        let batch = shared.backend.pull(checkpoint, limit).await?;
        let fetched = batch.documents.len();
        trace!(identifier = %identifier, fetched, "pulled batch");

        if fetched > 0 {
            shared.set_synced(Direction::Pull, false);

            let ids: Vec<String> = batch.documents.iter().map(|d| d.id.clone()).collect();
            let mut locals = shared.store.fetch(ids.clone()).await?;
            let mut known = shared.store.replicated_state(ids).await?;

            let mut rows = Vec::new();
            let mut confirmed = Vec::new();
            for document in batch.documents {
                // A master state the store already knows is a no-op even
                // when the current local state differs: that difference is
                // a pending local edit, which belongs to the push engine.
                if known
                    .remove(&document.id)
                    .is_some_and(|k| k.same_state(&document))
                {
                    continue;
                }
                match locals.remove(&document.id) {
                    // Converged by other means; just refresh the snapshot.
                    Some(local) if local.same_state(&document) => confirmed.push(document),
                    local => rows.push(WriteRow::new(local, document)),
                }
            }
            if !confirmed.is_empty() {
                shared.store.confirm_replicated(confirmed).await?;
            }

            if !rows.is_empty() {
                let offered = rows.len();
                let outcome = shared.store.bulk_write(rows, WriteOrigin::Replication).await?;
                if !outcome.is_clean() {
                    // A local write raced this batch. Nothing is lost: the
                    // racing write reaches the backend through the push
                    // engine, gets rejected there and goes through the
                    // conflict resolver.
                    debug!(
                        deferred = outcome.conflicts.len(),
                        "pulled rows deferred to conflict resolution"
                    );
                }
                shared.add_pulled((offered - outcome.conflicts.len()) as u64);
            }
        }

        // The checkpoint moves only after the batch is applied locally. A
        // crash between the write and this point re-applies the batch,
        // which the assumed-state check makes harmless.
        shared
            .checkpoints
            .set(identifier, Direction::Pull, batch.checkpoint)
            .await?;

        Ok(fetched < limit)
    }

    async fn wait_for_remote_activity(
        &self,
        remote: &mut Option<broadcast::Receiver<()>>,
    ) -> Wakeup {
        let shared = &self.shared;
        match remote {
            Some(events) => {
                tokio::select! {
                    _ = shared.cancel.cancelled() => Wakeup::Cancelled,
                    _ = shared.pull_wake.notified() => Wakeup::Woken,
                    received = events.recv() => match received {
                        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            shared.set_synced(Direction::Pull, false);
                            Wakeup::Woken
                        }
                        Err(broadcast::error::RecvError::Closed) => Wakeup::StreamClosed,
                    },
                }
            }
            None => {
                tokio::select! {
                    _ = shared.cancel.cancelled() => Wakeup::Cancelled,
                    _ = shared.pull_wake.notified() => Wakeup::Woken,
                    _ = tokio::time::sleep(shared.config.poll_interval) => Wakeup::Woken,
                }
            }
        }
    }
}
