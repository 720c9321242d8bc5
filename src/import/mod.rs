//! The import pipeline.
//!
//! The [`Coordinator`] is the producer: it fetches sources, canonicalizes
//! entries and enqueues them under their [`queue_key`]. The [`WorkerPool`]
//! consumes the queue, upserts postings and updates the run ledger. The two
//! sides share nothing in memory; they meet only in the database.

pub mod coordinator;
pub mod queue_key;
pub mod scheduler;
pub mod worker;

pub use coordinator::{Coordinator, ImportSettings, RunSummary, StartedRun};
pub use queue_key::queue_key;
pub use scheduler::spawn_schedule;
pub use worker::{process_item, ItemOutcome, WorkerPool};
