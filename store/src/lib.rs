//! The store library is a topic-indexed, time-ordered message store. Messages are appended
//! to a topic within a contract (a 32-bit tenant namespace) and read back most-recent-first
//! with a bounded limit.
//!
//! Writes are grouped into batches that are committed atomically: each batch becomes one
//! checksummed frame in an append-only record log, which is replayed on open to rebuild the
//! in-memory index. A batch that was cut off mid-write is discarded on recovery, so callers
//! never observe half a batch.
//!
//! The [`Engine`](crate::engine::Engine) is the main interface and is safe to share across
//! threads. The [`adapter`] module exposes it under the generic storage-adapter contract so a
//! larger system can pick a storage engine by name.

pub mod adapter;
pub mod batch;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod id;
pub mod index;
mod log;
mod ser;

pub use crossbeam_channel;

/// Maximum number of payloads a single query will ever return.
pub const MAX_RESULTS: usize = 1024;

/// The longest time-to-live an entry can be given, in seconds (24h).
pub const MAX_TTL_SECS: u64 = 24 * 60 * 60;
