//! Backend strategy for connection lifecycle management.
//!
//! The pool knows nothing about transports, credentials, or wire protocols.
//! Everything backend-specific is injected through [`ConnectionManager`], a
//! strategy trait standing where a backend-specific subclass would in an
//! inheritance-based design.

use std::time::Duration;

use async_trait::async_trait;

/// Backend hooks the pool uses to create, probe, and tear down connections.
///
/// Implementations hold the backend parameters (address, credentials,
/// transport configuration) and translate the hooks into whatever the wire
/// protocol requires. The pool calls `create` and `destroy` while holding
/// its internal lock, so a slow hook serializes other pool operations; a
/// hung `create` should be bounded by a transport-level connect timeout,
/// not by the pool.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    /// The live session type handed out by the pool.
    type Connection: Send + Sync + 'static;

    /// Error produced when a connection cannot be established.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Establish a new, fully authenticated connection.
    async fn create(&self) -> Result<Self::Connection, Self::Error>;

    /// Release all resources owned by a connection.
    ///
    /// Best-effort: failures are not modeled and do not prevent the entry's
    /// removal. The pool calls this exactly once per pooled entry, and never
    /// on a checked-out entry except during [`Pool::clear`] with `all` or
    /// [`Pool::close`].
    ///
    /// [`Pool::clear`]: crate::Pool::clear
    /// [`Pool::close`]: crate::Pool::close
    async fn destroy(&self, conn: &Self::Connection);

    /// Probe whether a connection is still usable (e.g. a protocol ping).
    ///
    /// Used by [`Pool::safe_grab`] to weed out connections the server has
    /// dropped while they sat idle. Expected to be cheap.
    ///
    /// [`Pool::safe_grab`]: crate::Pool::safe_grab
    async fn ping(&self, conn: &Self::Connection) -> bool;

    /// Maximum duration a connection may sit idle before eviction.
    ///
    /// May be a fixed value or computed per call.
    fn max_idle_time(&self) -> Duration;
}
