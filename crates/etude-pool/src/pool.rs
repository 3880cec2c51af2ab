//! Shared connection pool with a supervisor thread.
//!
//! All bookkeeping sits behind one mutex. Backend calls (`connect`,
//! `is_valid`) run with the lock released; a connection being opened or
//! probed by the supervisor is counted as `pending` so the bound holds
//! while it is out of sight.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{PoolError, PoolResult};

/// Opens and probes backend connections.
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Opens a new connection.
    fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Cheap liveness probe, run on release and by the supervisor.
    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections kept open even when idle.
    pub min: usize,
    /// Hard cap on open connections, idle and handed out together.
    pub max: usize,
    /// Supervisor period.
    pub check_interval: Duration,
    /// Idle connections unused for longer than this are closed.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 5,
            max: 50,
            check_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl PoolConfig {
    fn validate<E>(&self) -> PoolResult<(), E> {
        if self.max == 0 {
            return Err(PoolError::InvalidConfig("max must be at least 1"));
        }
        if self.min > self.max {
            return Err(PoolError::InvalidConfig("min exceeds max"));
        }
        if self.check_interval.is_zero() {
            return Err(PoolError::InvalidConfig("check_interval must be non-zero"));
        }
        Ok(())
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    /// Connections on the free list.
    pub idle: usize,
    /// Connections currently handed out.
    pub active: usize,
}

struct Idle<C> {
    conn: C,
    last_used: Instant,
}

struct State<C> {
    idle: VecDeque<Idle<C>>,
    active: usize,
    pending: usize,
    running: bool,
}

impl<C> State<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.active + self.pending
    }
}

struct Shared<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    state: Mutex<State<M::Connection>>,
    available: Condvar,
    tick: Condvar,
}

impl<M: ManageConnection> Shared<M> {
    fn lock(&self) -> MutexGuard<'_, State<M::Connection>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn put_back(&self, mut conn: M::Connection) {
        let valid = match self.manager.is_valid(&mut conn) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "discarding connection that failed its liveness probe");
                false
            }
        };

        let mut state = self.lock();
        state.active -= 1;
        let rejected = if valid && state.running && state.idle.len() < self.config.max {
            state.idle.push_back(Idle {
                conn,
                last_used: Instant::now(),
            });
            None
        } else {
            Some(conn)
        };
        drop(state);
        self.available.notify_one();
        drop(rejected);
    }

    /// One supervisor tick: evict stale, probe the rest, refill to `min`.
    fn maintain(&self) {
        let idle_timeout = self.config.idle_timeout;
        let (stale, to_check) = {
            let mut state = self.lock();
            if !state.running {
                return;
            }
            let (stale, fresh): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|c| c.last_used.elapsed() > idle_timeout);
            state.pending += fresh.len();
            (stale, fresh)
        };
        if !stale.is_empty() {
            debug!(evicted = stale.len(), "closing idle connections past their timeout");
        }
        drop(stale);

        let checked = to_check.len();
        let mut healthy = Vec::with_capacity(checked);
        for mut c in to_check {
            match self.manager.is_valid(&mut c.conn) {
                Ok(()) => healthy.push(c),
                Err(e) => debug!(error = %e, "evicting connection that failed its health check"),
            }
        }
        {
            let mut state = self.lock();
            state.pending -= checked;
            if state.running {
                state.idle.extend(healthy);
            }
        }
        self.available.notify_all();

        loop {
            {
                let mut state = self.lock();
                if !state.running
                    || state.idle.len() >= self.config.min
                    || state.total() >= self.config.max
                {
                    return;
                }
                state.pending += 1;
            }
            let opened = self.manager.connect();
            let mut state = self.lock();
            state.pending -= 1;
            match opened {
                Ok(conn) if state.running => {
                    state.idle.push_back(Idle {
                        conn,
                        last_used: Instant::now(),
                    });
                    drop(state);
                    self.available.notify_one();
                }
                Ok(_) => return,
                Err(e) => {
                    drop(state);
                    warn!(error = %e, "failed to open connection while refilling pool");
                    return;
                }
            }
        }
    }

    fn supervise(&self) {
        let interval = self.config.check_interval;
        loop {
            let deadline = Instant::now() + interval;
            let mut state = self.lock();
            while state.running {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                state = self
                    .tick
                    .wait_timeout(state, deadline - now)
                    .map(|(g, _)| g)
                    .unwrap_or_else(|p| p.into_inner().0);
            }
            if !state.running {
                return;
            }
            drop(state);
            self.maintain();
        }
    }
}

/// A bounded pool of backend connections.
///
/// Handles borrow the pool, so a handle never outlives it. Share the pool
/// across threads behind an `Arc`.
pub struct Pool<M: ManageConnection> {
    shared: Arc<Shared<M>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<M: ManageConnection> Pool<M> {
    /// Opens `config.min` connections up front and starts the supervisor.
    pub fn new(manager: M, config: PoolConfig) -> PoolResult<Self, M::Error> {
        config.validate::<M::Error>()?;

        let mut idle = VecDeque::with_capacity(config.max);
        for _ in 0..config.min {
            let conn = manager.connect().map_err(PoolError::Backend)?;
            idle.push_back(Idle {
                conn,
                last_used: Instant::now(),
            });
        }

        let shared = Arc::new(Shared {
            manager,
            config,
            state: Mutex::new(State {
                idle,
                active: 0,
                pending: 0,
                running: true,
            }),
            available: Condvar::new(),
            tick: Condvar::new(),
        });

        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name("etude-pool-supervisor".to_string())
            .spawn(move || worker.supervise())?;

        info!(
            min = shared.config.min,
            max = shared.config.max,
            check_interval = ?shared.config.check_interval,
            "connection pool ready"
        );

        Ok(Self {
            shared,
            supervisor: Mutex::new(Some(handle)),
        })
    }

    /// Waits up to `timeout` for a connection. Reuses an idle one when
    /// available, otherwise opens a new one if under `max`.
    pub fn acquire(&self, timeout: Duration) -> PoolResult<PooledConnection<'_, M>, M::Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if !state.running {
                return Err(PoolError::ShuttingDown);
            }
            if let Some(idle) = state.idle.pop_back() {
                state.active += 1;
                return Ok(PooledConnection {
                    pool: self,
                    conn: Some(idle.conn),
                });
            }
            if state.total() < self.shared.config.max {
                state.active += 1;
                drop(state);
                return match self.shared.manager.connect() {
                    Ok(conn) => Ok(PooledConnection {
                        pool: self,
                        conn: Some(conn),
                    }),
                    Err(e) => {
                        self.shared.lock().active -= 1;
                        self.shared.available.notify_one();
                        Err(PoolError::Backend(e))
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Timeout(timeout));
            }
            state = self
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .map(|(g, _)| g)
                .unwrap_or_else(|p| p.into_inner().0);
        }
    }

    pub fn state(&self) -> PoolState {
        let state = self.shared.lock();
        PoolState {
            idle: state.idle.len() + state.pending,
            active: state.active,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Stops the supervisor and closes idle connections. Handed-out
    /// connections close when their handles drop. Idempotent.
    pub fn shutdown(&self) {
        let idle = {
            let mut state = self.shared.lock();
            if !state.running {
                return;
            }
            state.running = false;
            std::mem::take(&mut state.idle)
        };
        self.shared.tick.notify_all();
        self.shared.available.notify_all();

        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        debug!(closed = idle.len(), "connection pool stopped");
    }
}

impl<M: ManageConnection> Drop for Pool<M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<M: ManageConnection> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("state", &self.state())
            .finish()
    }
}

/// A connection checked out of a [`Pool`]; returned on drop.
pub struct PooledConnection<'a, M: ManageConnection> {
    pool: &'a Pool<M>,
    conn: Option<M::Connection>,
}

impl<M: ManageConnection> fmt::Debug for PooledConnection<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl<M: ManageConnection> Deref for PooledConnection<'_, M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(c) => c,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<'_, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(c) => c,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl<M: ManageConnection> Drop for PooledConnection<'_, M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.shared.put_back(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("test backend: {0}")]
    struct TestError(&'static str);

    #[derive(Default)]
    struct Counter {
        opened: AtomicUsize,
        refuse: AtomicBool,
        broken: AtomicBool,
    }

    struct TestManager(Arc<Counter>);

    impl ManageConnection for TestManager {
        type Connection = usize;
        type Error = TestError;

        fn connect(&self) -> Result<usize, TestError> {
            if self.0.refuse.load(Ordering::SeqCst) {
                return Err(TestError("refused"));
            }
            Ok(self.0.opened.fetch_add(1, Ordering::SeqCst))
        }

        fn is_valid(&self, _: &mut usize) -> Result<(), TestError> {
            if self.0.broken.load(Ordering::SeqCst) {
                Err(TestError("broken"))
            } else {
                Ok(())
            }
        }
    }

    fn pool(min: usize, max: usize) -> (Pool<TestManager>, Arc<Counter>) {
        let counter = Arc::new(Counter::default());
        let config = PoolConfig {
            min,
            max,
            check_interval: Duration::from_secs(60),
            ..PoolConfig::default()
        };
        (Pool::new(TestManager(counter.clone()), config).unwrap(), counter)
    }

    #[test]
    fn test_prefills_min() {
        let (pool, counter) = pool(3, 5);
        assert_eq!(counter.opened.load(Ordering::SeqCst), 3);
        assert_eq!(pool.state(), PoolState { idle: 3, active: 0 });
    }

    #[test]
    fn test_invalid_config() {
        let counter = Arc::new(Counter::default());
        let bad = PoolConfig {
            min: 4,
            max: 2,
            ..PoolConfig::default()
        };
        assert!(matches!(
            Pool::new(TestManager(counter.clone()), bad),
            Err(PoolError::InvalidConfig(_))
        ));
        let bad = PoolConfig {
            min: 0,
            max: 0,
            ..PoolConfig::default()
        };
        assert!(Pool::new(TestManager(counter), bad).is_err());
    }

    #[test]
    fn test_acquire_reuses_idle() {
        let (pool, counter) = pool(1, 2);
        {
            let conn = pool.acquire(Duration::from_millis(10)).unwrap();
            assert_eq!(*conn, 0);
            assert_eq!(pool.state(), PoolState { idle: 0, active: 1 });
        }
        assert_eq!(pool.state(), PoolState { idle: 1, active: 0 });
        let conn = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(*conn, 0);
        assert_eq!(counter.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_grows_to_max_then_times_out() {
        let (pool, _) = pool(0, 2);
        let a = pool.acquire(Duration::from_millis(10)).unwrap();
        let b = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_ne!(*a, *b);

        let start = Instant::now();
        let err = pool.acquire(Duration::from_millis(50)).unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(pool.state(), PoolState { idle: 0, active: 2 });
    }

    #[test]
    fn test_release_wakes_waiter() {
        let (pool, _) = pool(0, 1);
        let pool = Arc::new(pool);
        let held = pool.acquire(Duration::from_millis(10)).unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire(Duration::from_secs(5)).map(|c| *c).is_ok())
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_connect_failure_frees_slot() {
        let (pool, counter) = pool(0, 1);
        counter.refuse.store(true, Ordering::SeqCst);
        assert!(matches!(
            pool.acquire(Duration::from_millis(10)),
            Err(PoolError::Backend(_))
        ));
        assert_eq!(pool.state(), PoolState { idle: 0, active: 0 });

        counter.refuse.store(false, Ordering::SeqCst);
        assert!(pool.acquire(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_invalid_connection_discarded_on_release() {
        let (pool, counter) = pool(0, 2);
        let conn = pool.acquire(Duration::from_millis(10)).unwrap();
        counter.broken.store(true, Ordering::SeqCst);
        drop(conn);
        assert_eq!(pool.state(), PoolState { idle: 0, active: 0 });
    }

    #[test]
    fn test_shutdown_rejects_acquire() {
        let (pool, _) = pool(2, 4);
        let held = pool.acquire(Duration::from_millis(10)).unwrap();
        pool.shutdown();
        pool.shutdown();
        assert!(matches!(
            pool.acquire(Duration::from_millis(10)),
            Err(PoolError::ShuttingDown)
        ));
        assert_eq!(pool.state().idle, 0);
        drop(held);
        assert_eq!(pool.state(), PoolState { idle: 0, active: 0 });
    }

    #[test]
    fn test_maintain_refills_and_evicts() {
        let counter = Arc::new(Counter::default());
        let config = PoolConfig {
            min: 2,
            max: 4,
            check_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_millis(20),
        };
        let pool = Pool::new(TestManager(counter.clone()), config).unwrap();

        thread::sleep(Duration::from_millis(40));
        // both prefilled connections are stale; they are replaced
        pool.shared.maintain();
        assert_eq!(pool.state(), PoolState { idle: 2, active: 0 });
        assert_eq!(counter.opened.load(Ordering::SeqCst), 4);

        counter.broken.store(true, Ordering::SeqCst);
        counter.refuse.store(true, Ordering::SeqCst);
        pool.shared.maintain();
        assert_eq!(pool.state(), PoolState { idle: 0, active: 0 });
    }
}
