use std::fmt::Display;

/// A specialized error type for all kplr operations.
///
/// The variants map onto the surfaces a caller can react to: invalid
/// user input (queries, packets, positions), missing entities, journals
/// that cannot be opened, transient write failures and unrecoverable
/// corruption. The REST collaborator translates these into status codes;
/// nothing in this crate knows about HTTP.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The query failed to parse or compile.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// A malformed packet, tag line or cursor position.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// No such journal or cursor.
    #[error("not found: {0}")]
    NotFound(String),
    /// Journal selection exceeded the configured source limit.
    #[error("query selects {selected} sources, the limit is {limit}")]
    TooManySources { selected: usize, limit: usize },
    /// The journal could not be opened or is in a persistent error state.
    #[error("journal unavailable: {0}")]
    Conflict(String),
    /// A single operation failed and may be retried.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Data corruption beyond recovery.
    #[error("data corruption: {0}")]
    Corruption(String),
    /// The cursor or reader was closed while an operation was in flight.
    #[error("already closed")]
    Closed,
    /// End of data. Internal sentinel used by iterators and readers.
    #[error("end of data")]
    Eof,
}

impl Error {
    pub fn invalid_query<T: Display>(msg: T) -> Self {
        Self::InvalidQuery(msg.to_string())
    }

    pub fn invalid_input<T: Display>(msg: T) -> Self {
        Self::InvalidInput(msg.to_string())
    }

    pub fn not_found<T: Display>(what: T) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn conflict<T: Display>(msg: T) -> Self {
        Self::Conflict(msg.to_string())
    }

    pub fn transient<T: Display>(msg: T) -> Self {
        Self::Transient(msg.to_string())
    }

    pub fn corruption<T: Display>(msg: T) -> Self {
        Self::Corruption(msg.to_string())
    }

    /// Returns whether the error is the end-of-data sentinel.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }
}

/// A Result type alias for kplr operations.
pub type Result<T> = std::result::Result<T, Error>;
