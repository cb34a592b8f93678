//! Conflict detection and resolution.
//!
//! A conflict exists when a writer's assumed master state no longer
//! matches the actual master state. Resolution is a pure decision: it
//! looks at the three involved states and picks the state everyone
//! should converge on. Handlers must be total and must not panic for
//! any well-formed input; all I/O stays in the engine.

use crate::document::Document;

/// The three states involved in a write collision.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictInput {
    /// The state the losing writer wanted to establish.
    pub new_document: Document,
    /// The state the writer believed the master held (`None` for inserts).
    pub assumed_master: Option<Document>,
    /// The state the master actually holds.
    pub real_master: Document,
}

/// The outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    /// Both sides already converged on the same state; nothing to write.
    Unchanged,
    /// The state to adopt everywhere.
    Resolved(Document),
}

impl ConflictResolution {
    /// Returns the resolved document, if the conflict was real.
    pub fn document(&self) -> Option<&Document> {
        match self {
            ConflictResolution::Unchanged => None,
            ConflictResolution::Resolved(doc) => Some(doc),
        }
    }
}

/// A pluggable conflict resolution policy.
///
/// Implementations must be pure: no side effects, no I/O, terminating
/// for every input. An implementation that cannot decide should fall
/// back to the master state rather than fail.
pub trait ConflictHandler: Send + Sync {
    /// Resolves one write collision.
    fn resolve(&self, input: &ConflictInput) -> ConflictResolution;
}

/// The default policy: the master state wins outright.
///
/// When the real master already equals the attempted new state the
/// conflict is spurious and resolves to [`ConflictResolution::Unchanged`].
/// Otherwise the master version is adopted everywhere and the local
/// change is discarded, not merged.
#[derive(Debug, Clone, Copy, Default)]
pub struct MasterWins;

impl ConflictHandler for MasterWins {
    fn resolve(&self, input: &ConflictInput) -> ConflictResolution {
        if input.real_master.same_state(&input.new_document) {
            ConflictResolution::Unchanged
        } else {
            ConflictResolution::Resolved(input.real_master.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Map};

    fn doc(id: &str, first_name: &str) -> Document {
        Document::new(id, Map::new()).with_field("firstName", json!(first_name))
    }

    #[test]
    fn master_wins_keeps_master_state() {
        let input = ConflictInput {
            new_document: doc("alice", "c1"),
            assumed_master: Some(doc("alice", "a")),
            real_master: doc("alice", "c2"),
        };

        let resolution = MasterWins.resolve(&input);
        let resolved = resolution.document().unwrap();
        assert_eq!(resolved.field("firstName"), Some(&json!("c2")));
    }

    #[test]
    fn converged_states_resolve_to_unchanged() {
        let input = ConflictInput {
            new_document: doc("alice", "same").with_lwt(1),
            assumed_master: None,
            real_master: doc("alice", "same").with_lwt(2),
        };

        assert_eq!(MasterWins.resolve(&input), ConflictResolution::Unchanged);
    }

    #[test]
    fn master_wins_on_insert_race() {
        // Both sides inserted independently; the master copy stays.
        let input = ConflictInput {
            new_document: doc("alice", "mine"),
            assumed_master: None,
            real_master: doc("alice", "theirs"),
        };

        let resolution = MasterWins.resolve(&input);
        assert_eq!(
            resolution.document().unwrap().field("firstName"),
            Some(&json!("theirs"))
        );
    }

    fn arb_document() -> impl Strategy<Value = Document> {
        (
            "[a-z]{1,8}",
            any::<bool>(),
            proptest::option::of("[a-z0-9]{0,6}"),
            any::<u64>(),
        )
            .prop_map(|(id, deleted, field, lwt)| {
                let mut doc = Document::new(id, Map::new()).with_lwt(lwt);
                doc.deleted = deleted;
                if let Some(value) = field {
                    doc = doc.with_field("v", json!(value));
                }
                doc
            })
    }

    proptest! {
        // Total over all (new, assumed, real) triples: always yields either
        // Unchanged or exactly the master state, never the local change.
        #[test]
        fn master_wins_is_total_and_never_picks_local(
            new_document in arb_document(),
            assumed_master in proptest::option::of(arb_document()),
            real_master in arb_document(),
        ) {
            let input = ConflictInput { new_document: new_document.clone(), assumed_master, real_master: real_master.clone() };
            match MasterWins.resolve(&input) {
                ConflictResolution::Unchanged => {
                    prop_assert!(real_master.same_state(&new_document));
                }
                ConflictResolution::Resolved(doc) => {
                    prop_assert!(doc.same_state(&real_master));
                }
            }
        }
    }
}
