//! Connection cache and fork-safety guard.
//!
//! Grounded in the teacher's `deadpool_postgres::Manager` (create / recycle /
//! detach over a statement-cache-carrying `ClientWrapper`), but reshaped
//! around this layer's specific cache contract: a bounded idle deque that is
//! FIFO for eviction and LIFO for reuse, plus a process-identity check the
//! teacher's `Manager` doesn't need (it never assumed `fork()`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::driver::{Connect, Driver};
use crate::error::Error;
use crate::reactor::Reactor;
use crate::session::Session;

/// A callback invoked each time the manager opens a new backend connection.
pub type ConnectionHook = Arc<dyn Fn() + Send + Sync>;

struct Inner<C: Connect> {
    config: Config,
    connect: C,
    /// Idle connections, oldest at the front (evicted first), most recently
    /// returned at the back (reused first).
    idle: Mutex<VecDeque<C::Driver>>,
    owning_pid: u32,
    on_connection: Mutex<Vec<ConnectionHook>>,
    max_connections: AtomicUsize,
}

/// Owns configuration, an idle-connection cache, and the process identity
/// captured at construction.
///
/// Cloning a `Manager` is cheap and shares the same cache (it is a thin
/// `Arc` handle), matching the teacher's expectation that a `Manager` is
/// long-lived and shared by every session drawn from it.
pub struct Manager<C: Connect, R: Reactor> {
    inner: Arc<Inner<C>>,
    reactor: Arc<R>,
}

impl<C: Connect, R: Reactor> Clone for Manager<C, R> {
    fn clone(&self) -> Self {
        Manager {
            inner: self.inner.clone(),
            reactor: self.reactor.clone(),
        }
    }
}

impl<C: Connect + 'static, R: Reactor> Manager<C, R> {
    pub fn new(config: Config, connect: C, reactor: R) -> Self {
        let max_connections = AtomicUsize::new(config.max_connections);
        Manager {
            inner: Arc::new(Inner {
                config,
                connect,
                idle: Mutex::new(VecDeque::new()),
                owning_pid: std::process::id(),
                on_connection: Mutex::new(Vec::new()),
                max_connections,
            }),
            reactor: Arc::new(reactor),
        }
    }

    /// Subscribes to the `connection` event, fired once per newly opened
    /// backend (not for connections served from the idle cache).
    pub fn on_connection(&self, hook: ConnectionHook) {
        self.inner.on_connection.lock().push(hook);
    }

    /// Resizes the idle cache. Excess idle entries are evicted (and closed)
    /// immediately.
    pub async fn max_connections(&self, n: usize) {
        let evicted: Vec<C::Driver> = {
            let mut idle = self.inner.idle.lock();
            let mut evicted = Vec::new();
            while idle.len() > n {
                if let Some(conn) = idle.pop_front() {
                    evicted.push(conn);
                }
            }
            evicted
        };
        for mut conn in evicted {
            conn.close().await;
        }
        self.inner.max_connections.store(n, Ordering::Relaxed);
    }

    fn current_pid_matches(&self) -> bool {
        std::process::id() == self.inner.owning_pid
    }

    /// Discards the entire idle cache without attempting a protocol-level
    /// goodbye: after `fork()`, these sockets belong to the parent process
    /// and writing to them from the child would corrupt the parent's
    /// connections.
    fn discard_cache_after_fork(&self) {
        let mut idle = self.inner.idle.lock();
        if !idle.is_empty() {
            log::warn!(
                "pg-session: process identity changed ({} idle connections discarded without close)",
                idle.len()
            );
        }
        idle.clear();
    }

    async fn open_new(&self) -> Result<C::Driver, Error> {
        let mut driver = self.inner.connect.connect(&self.inner.config).await?;
        if let Some(stmt) = self.inner.config.search_path_statement() {
            driver.query_sync(&driver.prepare(&stmt).await?, &[], false).await?;
        }
        for hook in &self.inner.config.on_connect {
            hook(&mut driver)?;
        }
        for hook in self.inner.on_connection.lock().iter() {
            hook();
        }
        log::debug!("pg-session: opened new backend connection (pid={})", driver.backend_pid());
        Ok(driver)
    }

    /// Returns a [`Session`] bound to a backend connection: reused from the
    /// idle cache when possible, freshly opened otherwise.
    pub async fn session(&self) -> Result<Session<C::Driver, R>, Error> {
        if !self.current_pid_matches() {
            self.discard_cache_after_fork();
        }

        let cached = if self.current_pid_matches() {
            self.inner.idle.lock().pop_back()
        } else {
            None
        };

        let driver = match cached {
            Some(mut conn) => {
                if conn.is_closed() || !conn.ping().await {
                    log::debug!("pg-session: cached connection failed ping, reconnecting");
                    self.open_new().await?
                } else {
                    conn
                }
            }
            None => self.open_new().await?,
        };

        Ok(Session::new(driver, self.inner.clone(), self.reactor.clone()))
    }
}

/// A narrow sink a [`Session`] offers its connection back to on drop,
/// without needing the full `Manager<C, R>` (and, in particular, without
/// needing to know `R`).
pub(crate) trait EnqueueSink<D: Driver>: Send + Sync {
    /// Admits `conn` to the idle cache, or reports why it can't be, per
    /// §4.1's `enqueue` contract. Eviction of the oldest idle entry happens
    /// here too if admitting `conn` would exceed capacity. Returns the
    /// connection back if it was *not* admitted, so the caller can close it.
    fn enqueue(&self, conn: D, busy: bool, has_subscriptions: bool) -> Option<D>;
}

impl<C: Connect> EnqueueSink<C::Driver> for Inner<C> {
    fn enqueue(&self, conn: C::Driver, busy: bool, has_subscriptions: bool) -> Option<C::Driver> {
        if std::process::id() != self.owning_pid {
            return Some(conn);
        }
        if conn.is_no_reuse() || conn.is_closed() || busy || has_subscriptions {
            return Some(conn);
        }
        let max = self.max_connections.load(Ordering::Relaxed);
        if max == 0 {
            return Some(conn);
        }
        let mut idle = self.idle.lock();
        if idle.len() >= max {
            idle.pop_front();
        }
        idle.push_back(conn);
        None
    }
}
