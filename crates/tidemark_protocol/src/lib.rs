//! # Tidemark Protocol
//!
//! Replication data model for Tidemark.
//!
//! This crate provides:
//! - [`Document`]: replicated documents with soft-delete tombstones
//! - [`WriteRow`]: assumed-state/new-state pairs for push and conflict detection
//! - [`Checkpoint`]: opaque, backend-defined progress markers
//! - [`ConflictHandler`]: pluggable conflict resolution with a
//!   master-wins default
//!
//! This is a pure data crate with no I/O operations. The replication
//! engine itself lives in `tidemark_engine`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod conflict;
mod document;

pub use checkpoint::{Checkpoint, Direction};
pub use conflict::{ConflictHandler, ConflictInput, ConflictResolution, MasterWins};
pub use document::{assumed_state_matches, Document, DocumentMeta, WriteRow};
