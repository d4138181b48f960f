//! Error kinds reported by every public broker operation.

use thiserror::Error;

/// Outcome classes of a broker operation or of a finished request.
///
/// Server-side codes are converted into this enumeration exactly once, at the
/// boundary (see [`crate::broker::translate`]); nothing downstream re-translates.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input or properties.
    #[error("Invalid argument")]
    Invalid,
    #[error("Out of memory")]
    OutOfMemory,
    /// The server has no cached sample under that name. Retryable inside `play`.
    #[error("File or data not found")]
    NotFound,
    #[error("Access forbidden")]
    Access,
    #[error("Resource not available")]
    NotAvailable,
    /// API misuse, e.g. operating on a closed session.
    #[error("Invalid state")]
    State,
    #[error("No such driver")]
    NoDriver,
    #[error("Not supported")]
    NotSupported,
    #[error("File or data too large")]
    TooBig,
    /// The session was torn down while the request was in flight.
    #[error("Destroyed")]
    Destroyed,
    /// The request was cancelled explicitly.
    #[error("Canceled")]
    Canceled,
    /// Catch-all transport or protocol fault.
    #[error("I/O error")]
    IO,
}

impl ErrorKind {
    /// Maps a filesystem error onto the closest kind.
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::Access,
            std::io::ErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => ErrorKind::Invalid,
            _ => ErrorKind::IO,
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, ErrorKind>;
