//! Connection pool implementation.
//!
//! The pool owns a set of entries, each pairing one connection with a busy
//! flag and a last-release timestamp. A single async mutex guards all
//! structural mutation of the entry set; it is held across the backend
//! hooks, so connection churn serializes other pool operations. That
//! tradeoff keeps the selection and eviction logic straightforward and is
//! appropriate while churn stays low relative to request rate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hashbrown::HashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::PoolError;
use crate::manager::ConnectionManager;

/// One pooled connection plus pool-private metadata.
struct Entry<C> {
    /// The pool's strong reference; the caller's handle is another.
    conn: Arc<C>,
    /// True while checked out to a caller.
    busy: bool,
    /// Meaningful only while idle; refreshed on every release.
    released_at: Instant,
}

/// Whether an idle entry has outlived the configured maximum idle age.
///
/// An age exactly equal to the maximum counts as expired, so a maximum of
/// zero evicts every idle entry on the next acquisition.
fn is_expired(now: Instant, released_at: Instant, max_idle: Duration) -> bool {
    now.saturating_duration_since(released_at) >= max_idle
}

/// A connection pool generic over a [`ConnectionManager`] backend.
///
/// The pool grows on demand: acquisition never waits for another caller to
/// finish with a connection, it opens a new one instead. Shrinking happens
/// through the idle-age eviction pass that runs at the start of every
/// acquisition, bounded by `manager.max_idle_time()`.
///
/// Handles are `Arc`s; the same `Arc` must be presented back to
/// [`release`](Pool::release), [`remove`](Pool::remove), or
/// [`exchange`](Pool::exchange). Connections needing mutation during use
/// should carry their own interior mutability, as async client sessions
/// generally do.
///
/// `Pool` itself is a cheap handle and can be cloned across tasks.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::new(manager);
///
/// let conn = pool.safe_grab().await?;
/// // ... use the connection ...
/// pool.release(&conn).await;
/// ```
pub struct Pool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<M: ConnectionManager> {
    /// Backend hooks for connection lifecycle.
    manager: M,

    /// Entry set keyed by connection identity (the `Arc` allocation
    /// address, stable while any handle to the connection is alive).
    entries: Mutex<HashMap<usize, Entry<M::Connection>>>,

    /// Whether the pool is closed.
    closed: AtomicBool,

    /// When the pool was created.
    created_at: Instant,

    /// Pool metrics.
    metrics: parking_lot::Mutex<PoolMetricsInner>,
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    /// Total connections created.
    connections_created: u64,
    /// Total connections destroyed.
    connections_closed: u64,
    /// Total successful checkouts.
    checkouts_successful: u64,
    /// Total failed checkouts (creation errors, pool closed).
    checkouts_failed: u64,
    /// Total liveness probes performed.
    health_checks_performed: u64,
    /// Total liveness probe failures.
    health_checks_failed: u64,
    /// Idle entries removed by the age-based eviction pass.
    idle_evictions: u64,
    /// Defective connections replaced via exchange.
    exchanges: u64,
}

/// Identity key for a pooled connection.
///
/// The allocation address is unambiguous while any `Arc` to the connection
/// is alive; the pool holds one per entry, so a key can never refer to two
/// different live connections at once.
fn identity<C>(conn: &Arc<C>) -> usize {
    Arc::as_ptr(conn) as usize
}

impl<M: ConnectionManager> Pool<M> {
    /// Create a new, empty pool around the given backend.
    pub fn new(manager: M) -> Self {
        tracing::debug!(
            max_idle = ?manager.max_idle_time(),
            "connection pool created"
        );
        Self {
            inner: Arc::new(PoolInner {
                manager,
                entries: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                created_at: Instant::now(),
                metrics: parking_lot::Mutex::new(PoolMetricsInner::default()),
            }),
        }
    }

    /// Acquire a connection.
    ///
    /// Runs the idle eviction pass, then hands out the most recently used
    /// idle connection, or opens a new one if none is idle. Never returns a
    /// connection currently checked out to another caller, and never waits
    /// for one to come back.
    ///
    /// # Errors
    ///
    /// [`PoolError::Create`] if the backend cannot open a connection (the
    /// pool is left unchanged), [`PoolError::Closed`] after [`close`].
    ///
    /// [`close`]: Pool::close
    pub async fn grab(&self) -> Result<Arc<M::Connection>, PoolError<M::Error>> {
        if self.inner.closed.load(Ordering::Acquire) {
            self.inner.metrics.lock().checkouts_failed += 1;
            return Err(PoolError::Closed);
        }

        let mut entries = self.inner.entries.lock().await;
        self.evict_expired(&mut entries).await;

        // MRU: the connection released last is the one most likely to still
        // be held open and authenticated on the server side. Ties broken by
        // identity key to keep selection deterministic.
        let picked = entries
            .iter()
            .filter(|(_, entry)| !entry.busy)
            .max_by_key(|(key, entry)| (entry.released_at, **key))
            .map(|(key, _)| *key);

        if let Some(key) = picked {
            if let Some(entry) = entries.get_mut(&key) {
                entry.busy = true;
                self.inner.metrics.lock().checkouts_successful += 1;
                tracing::trace!("reusing idle connection");
                return Ok(Arc::clone(&entry.conn));
            }
        }

        // Nothing idle: grow by one. The entry lock stays held across the
        // backend call, so concurrent grabs cannot double-insert.
        match self.inner.manager.create().await {
            Ok(conn) => {
                let conn = Arc::new(conn);
                entries.insert(
                    identity(&conn),
                    Entry {
                        conn: Arc::clone(&conn),
                        busy: true,
                        released_at: Instant::now(),
                    },
                );
                let mut metrics = self.inner.metrics.lock();
                metrics.connections_created += 1;
                metrics.checkouts_successful += 1;
                tracing::debug!(total = entries.len(), "opened new pooled connection");
                Ok(conn)
            }
            Err(e) => {
                self.inner.metrics.lock().checkouts_failed += 1;
                tracing::warn!(error = %e, "connection creation failed");
                Err(PoolError::Create(e))
            }
        }
    }

    /// Acquire a connection that passes the backend's liveness probe.
    ///
    /// Like [`grab`](Pool::grab), but the returned connection has been
    /// probed via [`ConnectionManager::ping`] immediately before being
    /// handed back. A connection failing its probe is destroyed and the
    /// acquisition retried, without bound: under sustained backend outage
    /// where connections open but immediately die, this loops until the
    /// caller's own timeout intervenes.
    ///
    /// # Errors
    ///
    /// Same as [`grab`](Pool::grab); probe failures are handled internally
    /// and never surface.
    pub async fn safe_grab(&self) -> Result<Arc<M::Connection>, PoolError<M::Error>> {
        loop {
            let conn = self.grab().await?;
            self.inner.metrics.lock().health_checks_performed += 1;
            if self.inner.manager.ping(&conn).await {
                return Ok(conn);
            }
            self.inner.metrics.lock().health_checks_failed += 1;
            tracing::warn!("pooled connection failed liveness probe, discarding");
            self.remove(&conn).await;
        }
    }

    /// Return a connection to the idle set.
    ///
    /// A connection the pool does not recognize — already evicted,
    /// exchanged, or cleared — is silently ignored, so double-release is
    /// harmless.
    pub async fn release(&self, conn: &Arc<M::Connection>) {
        let mut entries = self.inner.entries.lock().await;
        if let Some(entry) = entries.get_mut(&identity(conn)) {
            entry.busy = false;
            entry.released_at = Instant::now();
            tracing::trace!("connection returned to pool");
        } else {
            tracing::trace!("released connection unknown to pool, ignoring");
        }
    }

    /// Remove a connection from the pool and tear it down.
    ///
    /// No-op if the pool does not recognize the connection.
    pub async fn remove(&self, conn: &Arc<M::Connection>) {
        let mut entries = self.inner.entries.lock().await;
        if let Some(entry) = entries.remove(&identity(conn)) {
            self.inner.manager.destroy(&entry.conn).await;
            self.inner.metrics.lock().connections_closed += 1;
            tracing::debug!(total = entries.len(), "removed connection from pool");
        }
    }

    /// Swap a defective connection for a fresh acquisition.
    ///
    /// For connections the caller has determined to be broken at the
    /// protocol level (not just a failed probe): the bad connection is
    /// removed and destroyed, then a normal [`grab`](Pool::grab) runs. The
    /// two steps take the entry lock separately; another caller slipping in
    /// between them cannot corrupt pool state, only influence which idle
    /// entry the grab selects.
    ///
    /// # Errors
    ///
    /// Same as [`grab`](Pool::grab). The defective connection is gone from
    /// the pool even when the replacement acquisition fails.
    pub async fn exchange(
        &self,
        conn: &Arc<M::Connection>,
    ) -> Result<Arc<M::Connection>, PoolError<M::Error>> {
        self.remove(conn).await;
        let replacement = self.grab().await?;
        self.inner.metrics.lock().exchanges += 1;
        tracing::debug!("exchanged defective connection");
        Ok(replacement)
    }

    /// Destroy pooled connections in bulk.
    ///
    /// With `all` set, every entry is destroyed regardless of busy state —
    /// a forced reset. Otherwise only idle entries go: an explicit shrink,
    /// equivalent to an eviction pass that ignores age.
    pub async fn clear(&self, all: bool) {
        let mut entries = self.inner.entries.lock().await;
        let victims: Vec<usize> = entries
            .iter()
            .filter(|(_, entry)| all || !entry.busy)
            .map(|(key, _)| *key)
            .collect();
        for key in victims {
            if let Some(entry) = entries.remove(&key) {
                self.inner.manager.destroy(&entry.conn).await;
                self.inner.metrics.lock().connections_closed += 1;
            }
        }
        tracing::debug!(all, remaining = entries.len(), "cleared pool");
    }

    /// Close the pool, destroying every remaining connection.
    ///
    /// Subsequent acquisitions fail with [`PoolError::Closed`]. Dropping a
    /// pool without closing it skips the `destroy` hooks; each connection
    /// is then torn down by its own `Drop` once the last handle goes away.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.clear(true).await;
        tracing::debug!("connection pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Get the current pool status.
    pub async fn status(&self) -> PoolStatus {
        let entries = self.inner.entries.lock().await;
        let total = entries.len();
        let in_use = entries.values().filter(|entry| entry.busy).count();
        PoolStatus {
            available: total - in_use,
            in_use,
            total,
        }
    }

    /// Get a snapshot of pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            health_checks_performed: inner.health_checks_performed,
            health_checks_failed: inner.health_checks_failed,
            idle_evictions: inner.idle_evictions,
            exchanges: inner.exchanges,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Get the backend manager.
    #[must_use]
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Destroy and remove every idle entry older than the maximum idle age.
    ///
    /// Runs at the start of every acquisition, so staleness is bounded by
    /// call frequency rather than wall-clock ticks.
    async fn evict_expired(&self, entries: &mut HashMap<usize, Entry<M::Connection>>) {
        let max_idle = self.inner.manager.max_idle_time();
        let now = Instant::now();
        let expired: Vec<usize> = entries
            .iter()
            .filter(|(_, entry)| !entry.busy && is_expired(now, entry.released_at, max_idle))
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            if let Some(entry) = entries.remove(&key) {
                self.inner.manager.destroy(&entry.conn).await;
                let mut metrics = self.inner.metrics.lock();
                metrics.idle_evictions += 1;
                metrics.connections_closed += 1;
                tracing::debug!(total = entries.len(), "evicted idle connection");
            }
        }
    }
}

impl<M: ConnectionManager> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of idle connections available for reuse.
    pub available: usize,
    /// Number of connections currently checked out.
    pub in_use: usize,
    /// Total number of pooled connections.
    pub total: usize,
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections destroyed since pool start.
    pub connections_closed: u64,
    /// Successful connection checkouts.
    pub checkouts_successful: u64,
    /// Failed connection checkouts (creation errors, pool closed).
    pub checkouts_failed: u64,
    /// Liveness probes performed.
    pub health_checks_performed: u64,
    /// Liveness probes that failed.
    pub health_checks_failed: u64,
    /// Idle entries removed by the age-based eviction pass.
    pub idle_evictions: u64,
    /// Defective connections replaced via exchange.
    pub exchanges: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }

    /// Calculate health check success rate (0.0 to 1.0).
    #[must_use]
    pub fn health_check_success_rate(&self) -> f64 {
        if self.health_checks_performed == 0 {
            return 1.0;
        }
        let successful = self.health_checks_performed - self.health_checks_failed;
        successful as f64 / self.health_checks_performed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use async_trait::async_trait;

    /// Minimal in-memory backend for unit tests. Scenario coverage with a
    /// fuller mock lives in the sqlpool-testing crate.
    struct FakeManager {
        next_id: AtomicU64,
        destroyed: AtomicU64,
        fail_creates: AtomicBool,
        max_idle: parking_lot::Mutex<Duration>,
    }

    struct FakeConn {
        id: u64,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("backend unreachable")]
    struct Unreachable;

    impl FakeManager {
        fn new(max_idle: Duration) -> Self {
            Self {
                next_id: AtomicU64::new(1),
                destroyed: AtomicU64::new(0),
                fail_creates: AtomicBool::new(false),
                max_idle: parking_lot::Mutex::new(max_idle),
            }
        }
    }

    #[async_trait]
    impl ConnectionManager for FakeManager {
        type Connection = FakeConn;
        type Error = Unreachable;

        async fn create(&self) -> Result<FakeConn, Unreachable> {
            if self.fail_creates.load(Ordering::Relaxed) {
                return Err(Unreachable);
            }
            Ok(FakeConn {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
            })
        }

        async fn destroy(&self, _conn: &FakeConn) {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
        }

        async fn ping(&self, _conn: &FakeConn) -> bool {
            true
        }

        fn max_idle_time(&self) -> Duration {
            *self.max_idle.lock()
        }
    }

    const IDLE: Duration = Duration::from_secs(60);

    #[test]
    fn test_expiry_predicate() {
        let now = Instant::now();
        assert!(is_expired(now, now, Duration::ZERO));
        assert!(!is_expired(now, now, Duration::from_secs(1)));
        // Release timestamps in the future (clock injection in tests) never
        // count as expired unless the maximum is zero.
        assert!(!is_expired(now, now + Duration::from_secs(5), Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_grab_grows_pool() {
        let pool = Pool::new(FakeManager::new(IDLE));
        let a = pool.grab().await.unwrap();
        let b = pool.grab().await.unwrap();
        assert_ne!(a.id, b.id);

        let status = pool.status().await;
        assert_eq!(status.total, 2);
        assert_eq!(status.in_use, 2);
        assert_eq!(status.available, 0);
    }

    #[tokio::test]
    async fn test_reuse_after_release() {
        let pool = Pool::new(FakeManager::new(IDLE));
        let conn = pool.grab().await.unwrap();
        pool.release(&conn).await;

        let again = pool.grab().await.unwrap();
        assert!(Arc::ptr_eq(&conn, &again));
        assert_eq!(pool.status().await.total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mru_selection() {
        let pool = Pool::new(FakeManager::new(IDLE));
        let first = pool.grab().await.unwrap();
        let second = pool.grab().await.unwrap();

        pool.release(&first).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        pool.release(&second).await;

        // Released last, grabbed first.
        let picked = pool.grab().await.unwrap();
        assert!(Arc::ptr_eq(&picked, &second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction() {
        let manager = FakeManager::new(IDLE);
        let pool = Pool::new(manager);
        let conn = pool.grab().await.unwrap();
        pool.release(&conn).await;

        tokio::time::advance(IDLE + Duration::from_secs(1)).await;

        let fresh = pool.grab().await.unwrap();
        assert!(!Arc::ptr_eq(&conn, &fresh));
        assert_eq!(pool.status().await.total, 1);
        assert_eq!(pool.manager().destroyed.load(Ordering::Relaxed), 1);
        assert_eq!(pool.metrics().idle_evictions, 1);
    }

    #[tokio::test]
    async fn test_busy_entries_survive_eviction() {
        // Zero idle age: every idle entry expires on the next grab, but a
        // checked-out one must not.
        let pool = Pool::new(FakeManager::new(Duration::ZERO));
        let held = pool.grab().await.unwrap();
        let other = pool.grab().await.unwrap();
        assert_eq!(pool.status().await.total, 2);

        pool.release(&other).await;
        let fresh = pool.grab().await.unwrap();
        assert!(!Arc::ptr_eq(&fresh, &other));
        assert_eq!(pool.status().await.total, 2);

        // The held connection was never touched.
        pool.release(&held).await;
        assert_eq!(pool.status().await.total, 2);
    }

    #[tokio::test]
    async fn test_create_failure_propagates() {
        let pool = Pool::new(FakeManager::new(IDLE));
        pool.manager().fail_creates.store(true, Ordering::Relaxed);

        assert!(matches!(pool.grab().await, Err(PoolError::Create(_))));
        assert_eq!(pool.status().await.total, 0);
        assert_eq!(pool.metrics().checkouts_failed, 1);
    }

    #[tokio::test]
    async fn test_release_unknown_is_noop() {
        let pool = Pool::new(FakeManager::new(IDLE));
        let conn = pool.grab().await.unwrap();
        pool.remove(&conn).await;

        // Both release and a second remove of a gone connection are benign.
        pool.release(&conn).await;
        pool.remove(&conn).await;
        assert_eq!(pool.status().await.total, 0);
        assert_eq!(pool.manager().destroyed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_grab() {
        let pool = Pool::new(FakeManager::new(IDLE));
        let conn = pool.grab().await.unwrap();
        pool.release(&conn).await;
        pool.close().await;

        assert!(pool.is_closed());
        assert!(matches!(pool.grab().await, Err(PoolError::Closed)));
        assert_eq!(pool.status().await.total, 0);
    }

    #[tokio::test]
    async fn test_metrics_success_rates() {
        let metrics = PoolMetrics {
            connections_created: 10,
            connections_closed: 2,
            checkouts_successful: 90,
            checkouts_failed: 10,
            health_checks_performed: 100,
            health_checks_failed: 5,
            idle_evictions: 3,
            exchanges: 1,
            uptime: Duration::from_secs(3600),
        };

        assert!((metrics.checkout_success_rate() - 0.9).abs() < f64::EPSILON);
        assert!((metrics.health_check_success_rate() - 0.95).abs() < f64::EPSILON);
    }
}
