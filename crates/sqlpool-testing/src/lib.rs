//! # sqlpool-testing
//!
//! Test infrastructure for sqlpool development: an in-memory mock backend
//! with scripted failure modes and lifecycle counters.
//!
//! Pool scenario tests live in this crate's `tests/` directory rather than
//! in `sqlpool` itself, keeping the dependency between the two crates
//! one-directional.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlpool::Pool;
//! use sqlpool_testing::MockManager;
//!
//! let manager = MockManager::new(Duration::from_secs(60));
//! let pool = Pool::new(manager);
//!
//! let conn = pool.grab().await?;
//! conn.kill(); // subsequent liveness probes fail
//! pool.release(&conn).await;
//!
//! let live = pool.safe_grab().await?; // discards the dead one
//! assert!(live.is_alive());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlpool::ConnectionManager;
use thiserror::Error;

/// Error produced by [`MockManager`] when creation is scripted to fail.
#[derive(Debug, Error)]
#[error("mock backend refused the connection")]
pub struct MockError;

/// An in-memory stand-in for a live backend session.
///
/// Carries a unique id and a liveness switch so tests can simulate the
/// server dropping a connection while it sits in the pool.
#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    alive: AtomicBool,
}

impl MockConnection {
    fn new(id: u64) -> Self {
        Self {
            id,
            alive: AtomicBool::new(true),
        }
    }

    /// Unique id assigned at creation, for telling connections apart.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Simulate the server side dropping this connection: every subsequent
    /// liveness probe fails.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::Release);
        tracing::debug!(id = self.id, "mock connection killed");
    }

    /// Whether the connection still answers liveness probes.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Mock backend implementing [`ConnectionManager`] without any I/O.
///
/// Creation can be scripted to fail, the idle limit can be changed mid-test,
/// and creation/destruction counters let tests assert on lifecycle behavior
/// (in particular that destruction happens exactly once per connection).
#[derive(Debug)]
pub struct MockManager {
    next_id: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    fail_creates: AtomicBool,
    max_idle: parking_lot::Mutex<Duration>,
}

impl MockManager {
    /// Create a mock backend with the given maximum idle time.
    #[must_use]
    pub fn new(max_idle: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            fail_creates: AtomicBool::new(false),
            max_idle: parking_lot::Mutex::new(max_idle),
        }
    }

    /// Make every subsequent `create` call fail (or succeed again).
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::Relaxed);
    }

    /// Change the maximum idle time mid-test.
    pub fn set_max_idle_time(&self, max_idle: Duration) {
        *self.max_idle.lock() = max_idle;
    }

    /// Number of connections created so far.
    #[must_use]
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Number of connections destroyed so far.
    #[must_use]
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }
}

impl Default for MockManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl ConnectionManager for MockManager {
    type Connection = MockConnection;
    type Error = MockError;

    async fn create(&self) -> Result<MockConnection, MockError> {
        if self.fail_creates.load(Ordering::Relaxed) {
            return Err(MockError);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id, "mock connection created");
        Ok(MockConnection::new(id))
    }

    async fn destroy(&self, conn: &MockConnection) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id = conn.id, "mock connection destroyed");
    }

    async fn ping(&self, conn: &MockConnection) -> bool {
        conn.is_alive()
    }

    fn max_idle_time(&self) -> Duration {
        *self.max_idle.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_lifecycle_counters() {
        let manager = MockManager::default();
        let a = manager.create().await.unwrap();
        let b = manager.create().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.created(), 2);

        manager.destroy(&a).await;
        assert_eq!(manager.destroyed(), 1);
    }

    #[tokio::test]
    async fn test_mock_kill_fails_ping() {
        let manager = MockManager::default();
        let conn = manager.create().await.unwrap();
        assert!(manager.ping(&conn).await);

        conn.kill();
        assert!(!manager.ping(&conn).await);
    }

    #[tokio::test]
    async fn test_mock_scripted_create_failure() {
        let manager = MockManager::default();
        manager.fail_creates(true);
        assert!(manager.create().await.is_err());

        manager.fail_creates(false);
        assert!(manager.create().await.is_ok());
    }
}
