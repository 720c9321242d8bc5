//! Feed retrieval and canonicalization.
//!
//! - [`fetcher`] - bounded HTTP retrieval of one source
//! - [`parser`] - XML bytes into a generic [`Node`] tree, with entry discovery
//!   for RSS `channel.item`, RDF `item` and Atom `entry`
//! - [`document`] - the tagged-variant tree and its candidate-field accessors
//! - [`canonical`] - one entry tree into a [`NormalizedPosting`](crate::storage::NormalizedPosting)

pub mod canonical;
pub mod document;
pub mod fetcher;
pub mod parser;

pub use canonical::canonicalize;
pub use document::{Fields, Node};
pub use fetcher::{build_client, fetch_bytes, fetch_document, FetchError, FetchLimits};
pub use parser::{parse_document, Document, ParseError};
