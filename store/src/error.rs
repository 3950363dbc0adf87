//! The main error enum for the project lives here, and documents the various
//! conditions that can arise while interacting with the store.

use thiserror::Error;

/// This is our error enum. It contains an entry for any part of the system in
/// which an expectation is not met or a problem occurs.
#[derive(Error, Debug)]
pub enum Error {
    /// An adapter with this name is already registered
    #[error("Adapter already registered: {0}")]
    AdapterExists(String),

    /// No adapter was registered under this name
    #[error("Adapter not found: {0}")]
    AdapterNotFound(String),

    /// `open()` was called on an engine that's already open
    #[error("Store is already open")]
    AlreadyOpen,

    /// Something was queued onto (or committed from) a batch that was already committed
    #[error("Batch has already been committed")]
    BatchClosed,

    /// The engine isn't open
    #[error("Store is not open")]
    Closed,

    /// The configuration couldn't be parsed
    #[error("Error parsing store config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// A stored record could not be decoded
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// Tried to generate an ID with no contract, topic, or payload to derive it from
    #[error("Key is empty")]
    EmptyKey,

    /// Plain old IO
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query failed partway through. Whatever payloads were read before the failure are
    /// handed back here.
    #[error("Query failed after {} results: {source}", payloads.len())]
    PartialScan {
        payloads: Vec<Vec<u8>>,
        #[source]
        source: Box<Error>,
    },

    /// Error serializing an object
    #[error("Error serializing: {0}")]
    Serde(#[from] bincode::Error),

    /// The storage medium couldn't be opened/created
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A batch failed to commit. Nothing from the batch was applied.
    #[error("Error committing batch: {0}")]
    WriteConflict(String),
}

impl Error {
    /// Wrap any error that happened while getting a batch onto disk into a
    /// [`WriteConflict`][Error::WriteConflict].
    pub(crate) fn write_conflict<E: std::fmt::Display>(err: E) -> Self {
        Self::WriteConflict(err.to_string())
    }

    /// Same idea as [`Error::write_conflict`] but for open-time failures.
    pub(crate) fn unavailable<E: std::fmt::Display>(err: E) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

/// Wraps `std::result::Result` around our `Error` enum
pub type Result<T> = std::result::Result<T, Error>;
