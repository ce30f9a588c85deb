//! Error types for Ripple.
//!
//! Errors fall into four groups: transient store failures (recovered locally by
//! the live query layer), contract violations (caller bugs, surfaced
//! immediately), optimistic write races (surfaced after bounded retries) and
//! serialization failures.

use thiserror::Error;

/// Result type alias for Ripple operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error types for Ripple operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The backing store failed to answer a read or a write.
    #[error("store error on {collection}: {message}")]
    Store { collection: String, message: String },

    /// An insert collided with an existing document id.
    #[error("duplicate key {id} in collection {collection}")]
    DuplicateKey { collection: String, id: String },

    /// A cursor descriptor cannot be observed.
    #[error("invalid cursor descriptor: {message}")]
    InvalidDescriptor { message: String },

    /// The very first poll of a result set failed, so it never became ready.
    #[error("initial query failed for {collection}: {message}")]
    InitialQuery { collection: String, message: String },

    /// A task tried to enqueue and wait on its own serialized queue.
    #[error("reentrant call into result set {result_set} from inside its own task")]
    ReentrantTask { result_set: u64 },

    /// A handle id was registered twice on the same result set.
    #[error("handle {handle} is already registered on result set {result_set}")]
    DuplicateHandle { result_set: u64, handle: u64 },

    /// `stop()` was called on a handle that is no longer attached.
    #[error("observe handle {handle} has already been stopped")]
    HandleStopped { handle: u64 },

    /// A handle was added to a result set that has been torn down.
    #[error("result set {result_set} has been torn down")]
    ResultSetStopped { result_set: u64 },

    /// The serialized queue worker is gone.
    #[error("task queue {name} is closed")]
    QueueClosed { name: String },

    /// `begin_write` was called on a fence that already fired.
    #[error("write fence has already fired")]
    FenceFired,

    /// `begin_write` was called on a retired fence.
    #[error("write fence has been retired")]
    FenceRetired,

    /// The change-log tailer was used after `stop()`.
    #[error("change-log tailer has been stopped")]
    TailerStopped,

    /// An upsert kept losing races against concurrent writers.
    #[error("upsert into {collection} failed after {attempts} attempts")]
    UpsertRetriesExhausted { collection: String, attempts: u32 },

    /// Encoding a value or descriptor failed.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Creates a store error.
    pub fn store(collection: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Store {
            collection: collection.into(),
            message: message.into(),
        }
    }

    /// Creates a duplicate key error.
    pub fn duplicate_key(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Error::DuplicateKey {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Creates an invalid descriptor error.
    pub fn invalid_descriptor(message: impl Into<String>) -> Self {
        Error::InvalidDescriptor {
            message: message.into(),
        }
    }

    /// Creates an initial query error.
    pub fn initial_query(collection: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InitialQuery {
            collection: collection.into(),
            message: message.into(),
        }
    }

    /// Creates a queue closed error.
    pub fn queue_closed(name: impl Into<String>) -> Self {
        Error::QueueClosed { name: name.into() }
    }

    /// Returns true for failures that the live query layer retries on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store { .. })
    }

    /// Returns true for errors that indicate a caller bug.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::ReentrantTask { .. }
                | Error::DuplicateHandle { .. }
                | Error::HandleStopped { .. }
                | Error::ResultSetStopped { .. }
                | Error::FenceFired
                | Error::FenceRetired
                | Error::TailerStopped
        )
    }
}
