//! Deterministic work-queue keys derived from a posting's external id.

use chrono::{DateTime, Utc};

/// Maximum key length in characters
pub const MAX_QUEUE_KEY_LEN: usize = 160;

/// Reserved delimiter in the queue's addressing scheme
const RESERVED_DELIMITER: char = ':';

/// Derive the dedup key for one posting.
///
/// Strips whitespace and `:` from `external_id` and truncates to
/// [`MAX_QUEUE_KEY_LEN`] characters. If nothing survives, falls back to
/// `job_<unix millis>`, which never deduplicates against anything.
pub fn queue_key(external_id: &str) -> String {
    queue_key_at(external_id, Utc::now())
}

/// [`queue_key`] with an explicit clock for the fallback.
pub fn queue_key_at(external_id: &str, now: DateTime<Utc>) -> String {
    let key: String = external_id
        .chars()
        .filter(|c| !c.is_whitespace() && *c != RESERVED_DELIMITER)
        .take(MAX_QUEUE_KEY_LEN)
        .collect();

    if key.is_empty() {
        format!("job_{}", now.timestamp_millis())
    } else {
        key
    }
}
