//! Local persistence for the agent.
//!
//! Workflow journals live in a SQLite database under the data directory so
//! that an execution restarted with the same workflow id replays the steps
//! it already completed instead of repeating them.

mod store;

pub use store::{SqliteJournal, StateStoreError};
