//! Asynchronous state persistence for lotbot.
//!
//! State changes are scheduled as [`Mutation`]s on a bounded priority queue
//! that never blocks the caller. A single background consumer applies them
//! in submission order to a [`StateStore`]:
//!
//! - [`JsonLinesStore`]: append-only daily journal, replayable for recovery
//! - [`MemoryStore`]: in-process store for tests and offline runs

pub mod error;
pub mod mutation;
pub mod queue;
pub mod store;
pub mod worker;

pub use error::{PersistenceError, PersistenceResult};
pub use mutation::{EntityKind, Mutation, MutationReason, Payload, Priority};
pub use queue::{MutationQueue, ScheduleOutcome};
pub use store::{JsonLinesStore, MemoryStore, StateSnapshot, StateStore};
pub use worker::{
    LogOptions, PersistStats, PersistenceConfig, PersistenceWorker, StopPolicy, StopReport,
};
