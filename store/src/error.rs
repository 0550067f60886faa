use std::sync::PoisonError;

/// Crate-wide result alias.
pub type CResult<T> = std::result::Result<T, Error>;

/// All errors surfaced by the engine. Absence (`NotFound`, `AlreadyExists`)
/// and integrity (`Corrupt`) are ordinary outcomes callers branch on; the
/// rest are failures.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    /// The record does not exist.
    #[error("not found")]
    NotFound,

    /// The record already exists and overwrite was not requested.
    #[error("already exists")]
    AlreadyExists,

    /// A stored record or key failed to decode.
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// The store has been closed.
    #[error("closed")]
    Closed,

    /// The surrounding context was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The caller asked for something the engine cannot do.
    #[error("invalid: {0}")]
    Invalid(String),

    /// A violated internal invariant.
    #[error("internal: {0}")]
    Internal(String),

    /// An underlying I/O failure, propagated verbatim.
    #[error("io: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(err: PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn io_conversion() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(err, Error::Io("boom".to_string()));
    }
}
