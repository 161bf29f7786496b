//! Backlog state: the data model and the single-writer store that owns it.

pub mod model;
pub mod store;

pub use model::{
    AcceptanceCriterion, AlertState, ArchivedStoryState, Backlog, Checkpoint, CriterionStatus,
    GateAttempt, GateOutcome, Lease, Story, StoryStatus,
};
pub use store::{parse_backlog, StateStore, StoreError, StoreResult};
