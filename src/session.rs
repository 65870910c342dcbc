//! Per-connection state machine: blocking queries, asynchronous queries, and
//! LISTEN/NOTIFY dispatch, all interleaved on one backend connection.
//!
//! This is the "hard part" the spec calls out: the socket is watched by the
//! reactor iff an async query is in flight or the listen set is non-empty,
//! and notifications are always drained (and emitted) before an async
//! completion is delivered on the same wake-up.

use std::collections::HashSet;
use std::sync::Arc;

use crate::driver::{Driver, Param, RawResult};
use crate::error::{messages, Error};
use crate::manager::EnqueueSink;
use crate::reactor::Reactor;
use crate::results::Results;
use crate::transaction::{IsolationLevel, Transaction};

/// Callback invoked once an async query completes (or is abandoned), in the
/// `(session, error-or-null, results)` shape described by §4.3.
pub type AsyncCallback<D, R> =
    Box<dyn FnOnce(&mut Session<D, R>, Option<Error>, Option<Results<<D as Driver>::Statement>>) + Send>;

struct Waiting<D: Driver, R: Reactor> {
    stmt: D::Statement,
    callback: AsyncCallback<D, R>,
}

/// One backend connection plus the bookkeeping needed to interleave blocking
/// queries, asynchronous queries, and LISTEN/NOTIFY delivery on it.
pub struct Session<D: Driver, R: Reactor> {
    driver: Option<D>,
    enqueue: Arc<dyn EnqueueSink<D>>,
    reactor: Arc<R>,
    listens: HashSet<String>,
    waiting: Option<Waiting<D, R>>,
    dollar_only: bool,
    watched: bool,
    poisoned: bool,
    pending_rollback: bool,
    on_notification: Option<Box<dyn FnMut(&str, i32, &str) + Send>>,
    on_close: Option<Box<dyn FnMut() + Send>>,
}

impl<D: Driver, R: Reactor> Session<D, R> {
    pub(crate) fn new(driver: D, enqueue: Arc<dyn EnqueueSink<D>>, reactor: Arc<R>) -> Self {
        Session {
            driver: Some(driver),
            enqueue,
            reactor,
            listens: HashSet::new(),
            waiting: None,
            dollar_only: false,
            watched: false,
            poisoned: false,
            pending_rollback: false,
            on_notification: None,
            on_close: None,
        }
    }

    fn driver_mut(&mut self) -> &mut D {
        self.driver.as_mut().expect("driver is only taken in Drop")
    }

    fn driver_ref(&self) -> &D {
        self.driver.as_ref().expect("driver is only taken in Drop")
    }

    /// Registers the handler invoked for every `notification(channel,
    /// backend_pid, payload)` event.
    pub fn on_notification(&mut self, handler: impl FnMut(&str, i32, &str) + Send + 'static) {
        self.on_notification = Some(Box::new(handler));
    }

    /// Registers the handler invoked when the backend disappears while this
    /// session was still subscribed to at least one channel.
    pub fn on_close(&mut self, handler: impl FnMut() + Send + 'static) {
        self.on_close = Some(Box::new(handler));
    }

    /// The server-side backend PID, used by tests to `pg_terminate_backend()`
    /// a connection.
    pub fn pid(&self) -> i32 {
        self.driver_ref().backend_pid()
    }

    pub async fn ping(&mut self) -> bool {
        self.driver_mut().ping().await
    }

    /// Sets the one-shot "dollar-only" flag: the *next* `query` call binds
    /// placeholders restricted to `$N` syntax, so a `?` in the SQL is a
    /// literal operator (used for JSONB containment queries) rather than a
    /// placeholder.
    pub fn dollar_only(&mut self) {
        self.dollar_only = true;
    }

    pub fn is_listening(&self, channel: &str) -> bool {
        self.listens.contains(channel)
    }

    fn has_async_in_flight(&self) -> bool {
        self.waiting.is_some()
    }

    fn should_be_watched(&self) -> bool {
        self.has_async_in_flight() || !self.listens.is_empty()
    }

    fn sync_watch_state(&mut self) {
        let should = self.should_be_watched();
        if should && !self.watched {
            self.reactor.watch_read(self.driver_ref().raw_fd());
            self.watched = true;
        } else if !should && self.watched {
            self.reactor.unwatch(self.driver_ref().raw_fd());
            self.watched = false;
        }
    }

    fn drain_and_emit_notifications(&mut self) {
        let notifications = self.driver_mut().drain_notifications();
        for n in notifications {
            if let Some(handler) = self.on_notification.as_mut() {
                handler(&n.channel, n.backend_pid, &n.payload);
            }
        }
    }

    /// Marks an open transaction on this session as needing a `ROLLBACK`
    /// before the next statement runs. Set by [`crate::transaction::Transaction`]'s
    /// `Drop` impl, since issuing the `ROLLBACK` itself would require `async`
    /// I/O a synchronous destructor can't perform.
    pub(crate) fn mark_pending_rollback(&mut self) {
        self.pending_rollback = true;
    }

    pub(crate) fn has_pending_rollback(&self) -> bool {
        self.pending_rollback
    }

    async fn flush_pending_rollback(&mut self) -> Result<(), Error> {
        if !self.pending_rollback {
            return Ok(());
        }
        self.pending_rollback = false;
        self.query_inner("ROLLBACK", &[]).await?;
        Ok(())
    }

    /// Contract of §4.2: blocking query execution.
    pub async fn query(&mut self, sql: &str, params: &[Param]) -> Result<Results<D::Statement>, Error> {
        self.flush_pending_rollback().await?;
        self.query_inner(sql, params).await
    }

    async fn query_inner(&mut self, sql: &str, params: &[Param]) -> Result<Results<D::Statement>, Error> {
        if self.has_async_in_flight() {
            return Err(Error::busy());
        }
        let dollar_only = std::mem::take(&mut self.dollar_only);
        let stmt = self.driver_mut().prepare(sql).await?;
        let raw = self
            .driver_mut()
            .query_sync(&stmt, params, dollar_only)
            .await
            .map_err(|e| self.poison_on_connection_error(e));
        self.drain_and_emit_notifications();
        let raw = raw?;
        Ok(Results::new(stmt, raw))
    }

    fn poison_on_connection_error(&mut self, e: Error) -> Error {
        if matches!(e, Error::Connection(_)) {
            self.poisoned = true;
            self.driver_mut().mark_no_reuse();
        }
        e
    }

    /// Contract of §4.3: submits `sql` for asynchronous execution. `cb` is
    /// invoked once the completion is observed through [`Session::on_readable`],
    /// or with [`messages::PREMATURE_CLOSE`] if the session is dropped first.
    pub fn query_async(
        &mut self,
        sql_stmt: D::Statement,
        params: &[Param],
        cb: impl FnOnce(&mut Session<D, R>, Option<Error>, Option<Results<D::Statement>>) + Send + 'static,
    ) -> Result<(), Error> {
        if self.has_async_in_flight() {
            return Err(Error::busy());
        }
        let dollar_only = std::mem::take(&mut self.dollar_only);
        self.driver_mut()
            .submit_async(&sql_stmt, params.to_vec(), dollar_only)?;
        self.waiting = Some(Waiting {
            stmt: sql_stmt,
            callback: Box::new(cb),
        });
        self.sync_watch_state();
        Ok(())
    }

    /// Prepares `sql` then submits it asynchronously; the common-case entry
    /// point mirroring `query`'s synchronous prepare-then-execute.
    pub async fn query_async_prepared(
        &mut self,
        sql: &str,
        params: &[Param],
        cb: impl FnOnce(&mut Session<D, R>, Option<Error>, Option<Results<D::Statement>>) + Send + 'static,
    ) -> Result<(), Error> {
        self.flush_pending_rollback().await?;
        if self.has_async_in_flight() {
            return Err(Error::busy());
        }
        let stmt = self.driver_mut().prepare(sql).await?;
        self.query_async(stmt, params, cb)
    }

    /// Issues `LISTEN <channel>` (idempotent per channel) and ensures the
    /// socket is watched.
    pub async fn listen(&mut self, channel: &str) -> Result<(), Error> {
        if self.listens.contains(channel) {
            return Ok(());
        }
        let sql = format!("LISTEN {}", crate::config::quote_identifier(channel));
        self.query(&sql, &[]).await?;
        self.listens.insert(channel.to_string());
        self.sync_watch_state();
        Ok(())
    }

    /// Issues `UNLISTEN <channel>` (or `UNLISTEN *` for `"*"`). If no
    /// subscriptions remain and no async query is in flight, the socket is
    /// unwatched.
    pub async fn unlisten(&mut self, channel: &str) -> Result<(), Error> {
        let sql = if channel == "*" {
            "UNLISTEN *".to_string()
        } else {
            format!("UNLISTEN {}", crate::config::quote_identifier(channel))
        };
        self.query(&sql, &[]).await?;
        if channel == "*" {
            self.listens.clear();
        } else {
            self.listens.remove(channel);
        }
        self.sync_watch_state();
        Ok(())
    }

    /// Issues `NOTIFY channel[, payload]`. Because this session may itself be
    /// listening on `channel`, its own inbox is drained after the `NOTIFY`
    /// completes, before returning.
    pub async fn notify(&mut self, channel: &str, payload: Option<&str>) -> Result<(), Error> {
        let sql = match payload {
            Some(p) => format!(
                "NOTIFY {}, '{}'",
                crate::config::quote_identifier(channel),
                p.replace('\'', "''")
            ),
            None => format!("NOTIFY {}", crate::config::quote_identifier(channel)),
        };
        self.query(&sql, &[]).await?;
        Ok(())
    }

    /// Opens a transaction on this session, issuing `BEGIN` (optionally with
    /// an isolation level). The returned [`Transaction`] borrows this session
    /// exclusively until it is committed, rolled back, or dropped.
    pub async fn begin(&mut self, isolation: Option<IsolationLevel>) -> Result<Transaction<'_, D, R>, Error> {
        Transaction::begin(self, isolation).await
    }

    /// Names of user-visible tables and views, excluding `pg_catalog` and
    /// `information_schema`.
    pub async fn tables(&mut self) -> Result<Vec<String>, Error> {
        let results = self
            .query(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema NOT IN ('pg_catalog', 'information_schema')",
                &[],
            )
            .await?;
        Ok(results
            .into_rows()
            .into_iter()
            .filter_map(|row| row.values.first().and_then(|v| v.as_str().map(str::to_string)))
            .collect())
    }

    /// Drives the state machine forward when the embedding event loop
    /// observes the backend socket has become readable. See §4.3.
    ///
    /// Ordering: notifications are drained and emitted *before* an async
    /// completion observed on the same wake-up is delivered.
    pub fn on_readable(&mut self) {
        let notifications = self.driver_mut().drain_notifications();
        for n in &notifications {
            if self.on_notification.is_some() {
                // Re-borrow split to satisfy the borrow checker: the handler
                // needs `&mut self` logically unrelated fields only.
                if let Some(handler) = self.on_notification.as_mut() {
                    handler(&n.channel, n.backend_pid, &n.payload);
                }
            }
        }

        if self.waiting.is_some() {
            if let Some(outcome) = self.driver_mut().poll_async() {
                let waiting = self.waiting.take().expect("checked is_some above");
                let (err, results) = match outcome {
                    Ok(raw) => (None, Some(build_results(waiting.stmt, raw))),
                    Err(e) => {
                        let results = Some(Results::<D::Statement>::empty(waiting.stmt));
                        (Some(e), results)
                    }
                };
                (waiting.callback)(self, err, results);
            }
        }

        self.sync_watch_state();
    }

    /// Called by the embedding event loop when it detects the peer closed
    /// the socket while it was being watched.
    pub fn on_peer_closed(&mut self) {
        let was_listening = !self.listens.is_empty();
        self.watched = false;
        self.poisoned = true;
        if was_listening {
            if let Some(handler) = self.on_close.as_mut() {
                handler();
            }
        }
    }
}

fn build_results<S>(stmt: S, raw: RawResult) -> Results<S> {
    Results::new(stmt, raw)
}

impl<D: Driver, R: Reactor> Drop for Session<D, R> {
    fn drop(&mut self) {
        let was_waiting = self.waiting.is_some();
        if let Some(waiting) = self.waiting.take() {
            let err = Error::Connection(messages::PREMATURE_CLOSE.to_string());
            (waiting.callback)(self, Some(err), None);
        }
        if self.watched {
            if let Some(driver) = self.driver.as_ref() {
                self.reactor.unwatch(driver.raw_fd());
            }
        }
        if let Some(mut conn) = self.driver.take() {
            // A transaction left open by the dropping caller can't be rolled
            // back here (no `async` in `Drop`); refuse to pool a connection
            // that might still have one in progress.
            if self.pending_rollback {
                conn.mark_no_reuse();
            }
            // An async query still in flight (its completion handler fired
            // above with a premature-close error, but the driver's own
            // background task may still be running against this connection)
            // must never be handed back for reuse.
            if was_waiting {
                conn.mark_no_reuse();
            }
            let has_subscriptions = !self.listens.is_empty();
            if self.poisoned {
                return;
            }
            let _rejected = self.enqueue.enqueue(conn, was_waiting, has_subscriptions);
            // A rejected connection is simply dropped; its own `Drop` (or the
            // driver's background task) is responsible for closing the
            // socket. We don't block a `Drop` impl on an async `close()`.
        }
    }
}
