use std::fmt;

/// Errors produced by the MVCC store and its supporting components.
#[derive(Debug)]
pub enum Error {
    /// The requested revision is at or below the store's compacted revision.
    Compacted,

    /// The requested revision is greater than the store's current revision.
    FutureRev,

    /// A watcher or scheduled job observed cancellation.
    Canceled,

    /// An operation was attempted on a store that has already been closed.
    Closed,

    /// The key does not exist in the key index at the requested revision.
    NotFound,

    /// A durable-state invariant was violated: an unparseable record, a
    /// malformed revision key, or a backend read that should never fail.
    /// Fatal -- recovery cannot proceed past it.
    Corruption(String),

    /// Propagated I/O failure from the backend (file open, read, write, lock).
    Io(String),

    /// Catch-all for internal logic errors that don't fit the taxonomy above.
    Internal(String),

    /// A value failed to (de)serialize.
    Parse(String),

    /// Problems constructing or writing a value.
    Value(String),
}

pub type CResult<T> = Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Compacted => write!(f, "requested revision has been compacted"),
            Error::FutureRev => write!(f, "requested revision is not yet committed"),
            Error::Canceled => write!(f, "operation was canceled"),
            Error::Closed => write!(f, "store is closed"),
            Error::NotFound => write!(f, "key not found"),
            Error::Corruption(msg) => write!(f, "corrupted durable state: {}", msg),
            Error::Io(msg) => write!(f, "i/o error: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Value(msg) => write!(f, "value error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Parse(err.to_string())
    }
}
