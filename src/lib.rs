//! Job-posting feed importer.
//!
//! Fetches RSS/Atom job feeds, canonicalizes each entry into a
//! [`NormalizedPosting`](storage::NormalizedPosting), moves it through a
//! durable SQLite work queue, and upserts it into the posting store while
//! tracking per-run statistics and broadcasting live progress events.

pub mod config;
pub mod events;
pub mod feed;
pub mod import;
pub mod maintenance;
pub mod storage;
