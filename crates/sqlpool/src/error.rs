//! Pool error types.

use thiserror::Error;

/// Errors surfaced by pool acquisition.
///
/// Pool bookkeeping never fails: returning or removing a connection the pool
/// does not know about is a silent no-op, and connection teardown is
/// best-effort. The only failures a caller sees are the backend's own
/// creation errors and the pool being closed.
#[derive(Debug, Error)]
pub enum PoolError<E>
where
    E: std::error::Error + 'static,
{
    /// The backend could not establish a new connection.
    ///
    /// Propagated directly from [`ConnectionManager::create`]; the pool does
    /// not retry creation on its own.
    ///
    /// [`ConnectionManager::create`]: crate::ConnectionManager::create
    #[error("connection creation failed: {0}")]
    Create(#[source] E),

    /// The pool has been closed and no longer hands out connections.
    #[error("pool is closed")]
    Closed,
}

impl<E> PoolError<E>
where
    E: std::error::Error + 'static,
{
    /// Returns the underlying creation error, if this is a creation failure.
    pub fn as_create_error(&self) -> Option<&E> {
        match self {
            Self::Create(e) => Some(e),
            Self::Closed => None,
        }
    }
}
