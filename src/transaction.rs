//! Scoped BEGIN/COMMIT/ROLLBACK guard.
//!
//! Grounded in §9's note on the cyclic Transaction→Session back-reference: in
//! a garbage-collected source this is a weak reference so dropping the
//! transaction only rolls back if the session still exists. Here it's
//! expressed as a borrow: a `Transaction<'a, D, R>` holds `&'a mut
//! Session<D, R>`, so it can't outlive its session and the borrow checker
//! enforces single-owner access for free.
//!
//! A `Transaction`'s `Drop` can't issue `ROLLBACK` itself (that needs `async`
//! I/O, and destructors are synchronous); instead it flags the session via
//! [`crate::session::Session::mark_pending_rollback`], which is flushed
//! before the next statement runs, or causes the connection to be dropped
//! instead of pooled if the session itself ends first. See `DESIGN.md` for
//! why this trade-off was chosen over spawning a background rollback task.

use crate::driver::Driver;
use crate::error::Error;
use crate::reactor::Reactor;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Committed,
    RolledBack,
}

/// A scoped transaction handle. Automatically rolls back if dropped while
/// still [`State::Open`] — any path out of the enclosing scope that doesn't
/// call [`Transaction::commit`] rolls back.
pub struct Transaction<'a, D: Driver, R: Reactor> {
    session: &'a mut Session<D, R>,
    state: State,
    isolation: Option<IsolationLevel>,
}

impl<'a, D: Driver, R: Reactor> Transaction<'a, D, R> {
    pub(crate) async fn begin(
        session: &'a mut Session<D, R>,
        isolation: Option<IsolationLevel>,
    ) -> Result<Transaction<'a, D, R>, Error> {
        let sql = match isolation {
            Some(level) => format!("BEGIN ISOLATION LEVEL {}", level.as_sql()),
            None => "BEGIN".to_string(),
        };
        session.query(&sql, &[]).await?;
        Ok(Transaction {
            session,
            state: State::Open,
            isolation,
        })
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub async fn commit(mut self) -> Result<(), Error> {
        self.session.query("COMMIT", &[]).await?;
        self.state = State::Committed;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), Error> {
        self.session.query("ROLLBACK", &[]).await?;
        self.state = State::RolledBack;
        Ok(())
    }

    pub async fn savepoint(&mut self, name: &str) -> Result<(), Error> {
        self.session
            .query(&format!("SAVEPOINT {}", crate::config::quote_identifier(name)), &[])
            .await?;
        Ok(())
    }

    pub async fn release(&mut self, name: &str) -> Result<(), Error> {
        self.session
            .query(
                &format!("RELEASE SAVEPOINT {}", crate::config::quote_identifier(name)),
                &[],
            )
            .await?;
        Ok(())
    }

    pub async fn rollback_to(&mut self, name: &str) -> Result<(), Error> {
        self.session
            .query(
                &format!("ROLLBACK TO SAVEPOINT {}", crate::config::quote_identifier(name)),
                &[],
            )
            .await?;
        Ok(())
    }

    /// Runs a query within this transaction, on the same session connection.
    /// A transaction does not serialize queries on the session; it relies on
    /// the session's single-owner connection for that.
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[crate::driver::Param],
    ) -> Result<crate::results::Results<D::Statement>, Error> {
        self.session.query(sql, params).await
    }
}

impl<D: Driver, R: Reactor> Drop for Transaction<'_, D, R> {
    fn drop(&mut self) {
        if self.state == State::Open {
            self.session.mark_pending_rollback();
        }
    }
}
