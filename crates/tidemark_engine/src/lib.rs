//! Checkpoint-based bidirectional replication between a local document
//! store and a remote master.
//!
//! The remote is always authoritative. One [`Replication`] runs two
//! independent engines: the pull engine streams remote deltas into the
//! local store, the push engine offers local writes to the backend and
//! routes rejected rows through a [`ConflictHandler`]. Progress in each
//! direction is persisted as an opaque checkpoint, so a restart resumes
//! where it left off instead of replicating from scratch.
//!
//! The engine owns no storage and no transport: plug in anything that
//! implements [`ReplicationBackend`], [`LocalStore`] and
//! [`CheckpointStore`]. In-memory implementations of all three ship with
//! the crate for tests and ephemeral setups.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tidemark_engine::{
//!     MemoryBackend, MemoryCheckpointStore, MemoryStore, Replication, ReplicationConfig,
//!     ReplicationRegistry,
//! };
//! use tidemark_protocol::MasterWins;
//!
//! # async fn example() -> Result<(), tidemark_engine::ReplicationError> {
//! let registry = ReplicationRegistry::new();
//! let backend = Arc::new(MemoryBackend::new());
//! let store = Arc::new(MemoryStore::new());
//!
//! let replication = Replication::start(
//!     ReplicationConfig::new("users-remote1").with_poll_interval(Duration::from_millis(100)),
//!     backend,
//!     store,
//!     Arc::new(MemoryCheckpointStore::new()),
//!     Arc::new(MasterWins),
//!     &registry,
//! )?;
//!
//! replication.await_initial_replication().await?;
//! replication.await_in_sync().await?;
//! replication.stop().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod checkpoints;
mod config;
mod error;
mod memory;
mod pull;
mod push;
mod registry;
mod retry;
mod state;
mod store;

pub use backend::{BoxFuture, PullBatch, PushOutcome, RejectedRow, ReplicationBackend};
pub use checkpoints::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{ReplicationConfig, RetryConfig};
pub use error::{ErrorEvent, ReplicationError, ReplicationResult};
pub use memory::{MemoryBackend, MemoryStore};
pub use registry::{RegistryGuard, ReplicationRegistry};
pub use retry::{RetryController, RetryDecision};
pub use state::{Replication, ReplicationPhase, ReplicationStats};
pub use store::{
    BulkWriteOutcome, ChangeBatch, ChangeEvent, LocalStore, SequencedRow, WriteConflict,
    WriteOrigin,
};

pub use tidemark_protocol::{
    Checkpoint, ConflictHandler, ConflictInput, ConflictResolution, Direction, Document,
    DocumentMeta, MasterWins, WriteRow,
};
