//! Replication lifecycle and coordination.
//!
//! [`Replication`] owns one replication state: it launches the pull and
//! push engines as independent tasks, multiplexes their failures onto a
//! shared error channel, and exposes the two coordination signals,
//! [`Replication::await_initial_replication`] and
//! [`Replication::await_in_sync`].

use crate::backend::ReplicationBackend;
use crate::checkpoints::CheckpointStore;
use crate::config::ReplicationConfig;
use crate::error::{ErrorEvent, ReplicationError, ReplicationResult};
use crate::pull::PullEngine;
use crate::push::PushEngine;
use crate::registry::ReplicationRegistry;
use crate::store::LocalStore;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidemark_protocol::{Checkpoint, ConflictHandler, Direction};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// The lifecycle phase of one replication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationPhase {
    /// Constructed but not yet running.
    Created,
    /// Working through the first pull pass and the first push flush.
    InitialReplication,
    /// Caught up and reacting to notifications.
    Live,
    /// Engines are holding at their next cycle boundary.
    Paused,
    /// Finished, either explicitly or after a one-shot pass.
    Stopped,
    /// Halted by an unrecoverable local fault.
    Errored,
}

impl ReplicationPhase {
    /// Returns true once the replication can never make progress again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplicationPhase::Stopped | ReplicationPhase::Errored)
    }

    /// Returns true while engines are running or holding.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ReplicationPhase::InitialReplication | ReplicationPhase::Live | ReplicationPhase::Paused
        )
    }
}

/// Counters describing one replication state.
#[derive(Debug, Clone, Default)]
pub struct ReplicationStats {
    /// Completed pull cycles.
    pub pull_cycles: u64,
    /// Completed push cycles.
    pub push_cycles: u64,
    /// Documents applied locally from pulls.
    pub documents_pulled: u64,
    /// Rows accepted by the backend.
    pub documents_pushed: u64,
    /// Conflicts routed through the resolver.
    pub conflicts_resolved: u64,
    /// Scheduled retries across both engines.
    pub retries: u64,
    /// Most recent failure, if any.
    pub last_error: Option<String>,
}

/// Cooperative cancellation: set once, observed at suspension points.
#[derive(Debug, Default)]
pub(crate) struct CancelFlag {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub(crate) fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation is requested.
    pub(crate) async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// State shared between the handle and both engines.
pub(crate) struct Shared {
    pub(crate) config: ReplicationConfig,
    pub(crate) backend: Arc<dyn ReplicationBackend>,
    pub(crate) store: Arc<dyn LocalStore>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) resolver: Arc<dyn ConflictHandler>,
    pub(crate) cancel: CancelFlag,
    /// Wakes the pull engine out of its live-mode wait.
    pub(crate) pull_wake: Notify,
    /// Wakes the push engine out of its live-mode wait.
    pub(crate) push_wake: Notify,
    phase: RwLock<ReplicationPhase>,
    errors: broadcast::Sender<ErrorEvent>,
    paused: watch::Sender<bool>,
    pull_synced: watch::Sender<bool>,
    push_synced: watch::Sender<bool>,
    pull_gen: watch::Sender<u64>,
    push_gen: watch::Sender<u64>,
    initial_done: watch::Sender<bool>,
    first_pull_done: AtomicBool,
    first_push_done: AtomicBool,
    stats: RwLock<ReplicationStats>,
}

impl Shared {
    fn new(
        config: ReplicationConfig,
        backend: Arc<dyn ReplicationBackend>,
        store: Arc<dyn LocalStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        resolver: Arc<dyn ConflictHandler>,
    ) -> Self {
        let (errors, _) = broadcast::channel(256);
        Self {
            config,
            backend,
            store,
            checkpoints,
            resolver,
            cancel: CancelFlag::default(),
            pull_wake: Notify::new(),
            push_wake: Notify::new(),
            phase: RwLock::new(ReplicationPhase::Created),
            errors,
            paused: watch::channel(false).0,
            pull_synced: watch::channel(false).0,
            push_synced: watch::channel(false).0,
            pull_gen: watch::channel(0).0,
            push_gen: watch::channel(0).0,
            initial_done: watch::channel(false).0,
            first_pull_done: AtomicBool::new(false),
            first_push_done: AtomicBool::new(false),
            stats: RwLock::new(ReplicationStats::default()),
        }
    }

    pub(crate) fn phase(&self) -> ReplicationPhase {
        *self.phase.read()
    }

    fn set_phase(&self, phase: ReplicationPhase) {
        *self.phase.write() = phase;
    }

    /// Delivers a failure on the error channel. Every engine failure
    /// passes through here, including ones that will be retried.
    pub(crate) fn emit_error(
        &self,
        direction: Direction,
        error: ReplicationError,
        checkpoint: Option<Checkpoint>,
    ) {
        warn!(
            identifier = %self.config.identifier,
            %direction,
            %error,
            "replication cycle failed"
        );
        self.stats.write().last_error = Some(error.to_string());
        let _ = self.errors.send(ErrorEvent {
            direction,
            error,
            checkpoint,
        });
    }

    /// Halts the replication on an unrecoverable fault.
    pub(crate) fn fail(&self, direction: Direction, error: &ReplicationError) {
        warn!(
            identifier = %self.config.identifier,
            %direction,
            %error,
            "replication halted"
        );
        self.set_phase(ReplicationPhase::Errored);
        self.cancel.cancel();
    }

    pub(crate) fn set_synced(&self, direction: Direction, synced: bool) {
        let slot = match direction {
            Direction::Pull => &self.pull_synced,
            Direction::Push => &self.push_synced,
        };
        slot.send_if_modified(|value| {
            let changed = *value != synced;
            *value = synced;
            changed
        });
    }

    pub(crate) fn is_synced(&self, direction: Direction) -> bool {
        match direction {
            Direction::Pull => *self.pull_synced.borrow(),
            Direction::Push => *self.push_synced.borrow(),
        }
    }

    /// Marks the end of one successful engine cycle. Failed cycles never
    /// bump, so in-sync awaiters cannot resolve while a direction is
    /// exhausting retries.
    pub(crate) fn bump_cycle(&self, direction: Direction) {
        let (gen, cycles) = {
            let mut stats = self.stats.write();
            match direction {
                Direction::Pull => {
                    stats.pull_cycles += 1;
                    (&self.pull_gen, stats.pull_cycles)
                }
                Direction::Push => {
                    stats.push_cycles += 1;
                    (&self.push_gen, stats.push_cycles)
                }
            }
        };
        gen.send_replace(cycles);
    }

    pub(crate) fn mark_initial_done(&self, direction: Direction) {
        let flag = match direction {
            Direction::Pull => &self.first_pull_done,
            Direction::Push => &self.first_push_done,
        };
        flag.store(true, Ordering::SeqCst);

        if self.initial_is_done() && !*self.initial_done.borrow() {
            debug!(identifier = %self.config.identifier, "initial replication complete");
            self.initial_done.send_replace(true);
            let mut phase = self.phase.write();
            if *phase == ReplicationPhase::InitialReplication && self.config.live {
                *phase = ReplicationPhase::Live;
            }
        }
    }

    pub(crate) fn initial_is_done(&self) -> bool {
        self.first_pull_done.load(Ordering::SeqCst) && self.first_push_done.load(Ordering::SeqCst)
    }

    pub(crate) fn add_pulled(&self, count: u64) {
        self.stats.write().documents_pulled += count;
    }

    pub(crate) fn add_pushed(&self, count: u64) {
        self.stats.write().documents_pushed += count;
    }

    pub(crate) fn add_conflict(&self) {
        self.stats.write().conflicts_resolved += 1;
    }

    pub(crate) fn add_retry(&self) {
        self.stats.write().retries += 1;
    }

    /// Holds while paused; returns immediately on cancellation.
    pub(crate) async fn gate(&self) {
        let mut paused = self.paused.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = paused.wait_for(|p| !*p) => {}
        }
    }

    /// Sleeps unless cancelled first. Returns false when cancelled.
    pub(crate) async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// A running replication state.
///
/// Created by [`Replication::start`]; torn down by [`Replication::stop`].
/// The pull and push engines run as independent tasks and fail and
/// retry independently; a fault in one direction never silently halts
/// the other.
pub struct Replication {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Replication {
    /// Validates the configuration, claims the identifier and launches
    /// both engines. Must be called within a tokio runtime.
    pub fn start(
        config: ReplicationConfig,
        backend: Arc<dyn ReplicationBackend>,
        store: Arc<dyn LocalStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        resolver: Arc<dyn ConflictHandler>,
        registry: &ReplicationRegistry,
    ) -> ReplicationResult<Self> {
        config.validate()?;
        let guard = registry.claim(&config.identifier)?;

        let shared = Arc::new(Shared::new(config, backend, store, checkpoints, resolver));
        shared.set_phase(ReplicationPhase::InitialReplication);
        debug!(identifier = %shared.config.identifier, live = shared.config.live, "replication started");

        let pull = tokio::spawn(PullEngine::new(Arc::clone(&shared)).run());
        let push = tokio::spawn(PushEngine::new(Arc::clone(&shared)).run());

        let supervisor_shared = Arc::clone(&shared);
        let supervisor = tokio::spawn(async move {
            let _ = tokio::join!(pull, push);
            {
                let mut phase = supervisor_shared.phase.write();
                if !phase.is_terminal() {
                    *phase = ReplicationPhase::Stopped;
                }
            }
            // Unblock awaiters: they re-check the terminal phase.
            supervisor_shared.cancel.cancel();
            debug!(identifier = %supervisor_shared.config.identifier, "replication finished");
            drop(guard);
        });

        Ok(Self {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// The replication identifier.
    pub fn identifier(&self) -> &str {
        &self.shared.config.identifier
    }

    /// The current lifecycle phase.
    pub fn phase(&self) -> ReplicationPhase {
        self.shared.phase()
    }

    /// A snapshot of the replication counters.
    pub fn stats(&self) -> ReplicationStats {
        self.shared.stats.read().clone()
    }

    /// Subscribes to the shared error channel. Every engine failure is
    /// delivered here as a value, retried or not.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.shared.errors.subscribe()
    }

    /// Resolves once the first pull pass and the first push flush have
    /// both completed. Resolves immediately when called again afterwards.
    pub async fn await_initial_replication(&self) -> ReplicationResult<()> {
        let mut initial = self.shared.initial_done.subscribe();
        if *initial.borrow() {
            return Ok(());
        }
        tokio::select! {
            _ = self.shared.cancel.cancelled() => {
                if self.shared.initial_is_done() {
                    Ok(())
                } else {
                    Err(ReplicationError::Cancelled)
                }
            }
            result = initial.wait_for(|done| *done) => match result {
                Ok(_) => Ok(()),
                Err(_) => Err(ReplicationError::Cancelled),
            },
        }
    }

    /// Resolves when both directions are simultaneously caught up: the
    /// last pull cycle returned a short batch and no local writes are
    /// pending past the push checkpoint.
    ///
    /// Re-awaitable: a later local or remote write invalidates the
    /// condition and a subsequent call waits for the next convergence.
    /// Never resolves while a direction is exhausting retries.
    pub async fn await_in_sync(&self) -> ReplicationResult<()> {
        let mut pull_gen = self.shared.pull_gen.subscribe();
        let mut push_gen = self.shared.push_gen.subscribe();

        loop {
            if self.shared.cancel.is_cancelled() || self.phase().is_terminal() {
                return if self.in_sync_now().await? {
                    Ok(())
                } else {
                    Err(ReplicationError::Cancelled)
                };
            }

            let p0 = *pull_gen.borrow();
            let q0 = *push_gen.borrow();

            // Nudge both engines and require one full verification cycle
            // from each before trusting the synced flags.
            self.shared.pull_wake.notify_one();
            self.shared.push_wake.notify_one();

            let cycled = tokio::select! {
                _ = self.shared.cancel.cancelled() => false,
                result = async {
                    pull_gen.wait_for(|g| *g > p0).await?;
                    push_gen.wait_for(|g| *g > q0).await?;
                    Ok::<_, watch::error::RecvError>(())
                } => result.is_ok(),
            };

            if cycled && self.in_sync_now().await? {
                return Ok(());
            }
        }
    }

    async fn in_sync_now(&self) -> ReplicationResult<bool> {
        let shared = &self.shared;
        if !shared.is_synced(Direction::Pull) || !shared.is_synced(Direction::Push) {
            return Ok(false);
        }
        let since = shared
            .checkpoints
            .get(&shared.config.identifier, Direction::Push)
            .await?
            .and_then(|c| c.as_sequence())
            .unwrap_or(0);
        let pending = shared.store.changes_since(since, 1).await?;
        Ok(pending.rows.is_empty())
    }

    /// Holds both engines at their next cycle boundary.
    pub fn pause(&self) {
        if self.phase().is_active() {
            self.shared.paused.send_replace(true);
            self.shared.set_phase(ReplicationPhase::Paused);
        }
    }

    /// Releases paused engines.
    pub fn resume(&self) {
        if self.phase() == ReplicationPhase::Paused {
            let next = if self.shared.initial_is_done() && self.shared.config.live {
                ReplicationPhase::Live
            } else {
                ReplicationPhase::InitialReplication
            };
            self.shared.set_phase(next);
            self.shared.paused.send_replace(false);
            self.shared.pull_wake.notify_one();
            self.shared.push_wake.notify_one();
        }
    }

    /// Stops the replication: both engines finish their in-flight cycle
    /// and do not start another. Idempotent; waits for teardown.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        {
            let mut phase = self.shared.phase.write();
            if !phase.is_terminal() {
                *phase = ReplicationPhase::Stopped;
            }
        }
        let supervisor = { self.supervisor.lock().take() };
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_predicates() {
        assert!(ReplicationPhase::Stopped.is_terminal());
        assert!(ReplicationPhase::Errored.is_terminal());
        assert!(!ReplicationPhase::Live.is_terminal());

        assert!(ReplicationPhase::InitialReplication.is_active());
        assert!(ReplicationPhase::Paused.is_active());
        assert!(!ReplicationPhase::Created.is_active());
        assert!(!ReplicationPhase::Stopped.is_active());
    }

    #[tokio::test]
    async fn cancel_flag_wakes_waiters() {
        let flag = Arc::new(CancelFlag::default());
        assert!(!flag.is_cancelled());

        let waiter = {
            let flag = Arc::clone(&flag);
            tokio::spawn(async move { flag.cancelled().await })
        };

        flag.cancel();
        waiter.await.unwrap();
        assert!(flag.is_cancelled());

        // Idempotent and immediate once set
        flag.cancel();
        flag.cancelled().await;
    }
}
