use std::time::Duration;
use thiserror::Error;

/// Errors returned by etude-pool operations, generic over the backend's own
/// error type.
#[derive(Debug, Error)]
pub enum PoolError<E> {
    /// No connection became available before the deadline.
    #[error("timed out after {0:?} waiting for a connection")]
    Timeout(Duration),
    /// The backend failed to open a connection.
    #[error("backend error: {0}")]
    Backend(E),
    /// The pool is closed.
    #[error("pool is shutting down")]
    ShuttingDown,
    /// Bounds that cannot describe a working pool.
    #[error("invalid pool config: {0}")]
    InvalidConfig(&'static str),
    /// The supervisor thread could not be started.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl<E> PoolError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::Timeout(_))
    }
}

pub type PoolResult<T, E> = Result<T, PoolError<E>>;
