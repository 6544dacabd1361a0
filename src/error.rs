//! Error types for the accounting structures.

use std::io;

use crate::Address;

/// Accounting operation result type
pub type AccountingResult<T> = Result<T, AccountingError>;

/// Failures reported by accounting structures.
///
/// Capacity exhaustion (a full mark stack, for example) is not an error: it is reported through
/// the return value of the operation and handled by the collector.
#[derive(Debug, thiserror::Error)]
pub enum AccountingError {
    /// Backing memory could not be reserved.
    #[error("failed to map {size} bytes for {name}: {source}")]
    MapFailed {
        name: String,
        size: usize,
        #[source]
        source: io::Error,
    },

    /// Requested stack capacity does not fit the 32-bit stack indices.
    #[error("capacity {capacity} of {name} exceeds the maximum stack capacity")]
    CapacityTooLarge { name: String, capacity: usize },

    /// Two bitmaps expected to cover the same range do not.
    #[error("{name}: expected bitmap of {expected} bytes, found {actual}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// A reference cached by a mod-union table points to an object that is not live.
    #[error("card {card} caches reference to dead object {referent}")]
    UnmarkedReference { card: Address, referent: Address },

    /// A clean card holds a reference the mod-union table did not cache.
    #[error("object {holder} on clean card {card} references {referent} without being in the mod-union table")]
    MissingReference {
        card: Address,
        holder: Address,
        referent: Address,
    },
}

impl AccountingError {
    pub fn map_failed(name: impl Into<String>, size: usize, source: io::Error) -> Self {
        Self::MapFailed {
            name: name.into(),
            size,
            source,
        }
    }
}
