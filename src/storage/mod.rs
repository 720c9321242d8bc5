mod postings;
mod queue;
mod runs;
mod schema;
mod types;

pub use postings::MAX_PAGE_SIZE;
pub use runs::{DEFAULT_RUN_LIMIT, MAX_RUN_LIMIT};
pub use schema::{Database, DEFAULT_CLAIM_TIMEOUT, DEFAULT_FAILURE_LIMIT};
pub use types::{
    DatabaseError, EnqueueOutcome, ImportRun, NormalizedPosting, PostingPage, QueueStatus,
    QueuedImportItem, RunCounter, RunFailure, StoredPosting, UpsertOutcome,
};
