//! Test doubles standing in for §4.7/§4.8's driver/reactor collaborators, so
//! the cache, state-machine, and transaction properties in §8 can be
//! exercised without a live PostgreSQL server.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pg_session::config::Config;
use pg_session::driver::{Connect, Driver, Param, RawNotification, RawResult, RawRow};
use pg_session::error::Error;

static NEXT_ID: AtomicI32 = AtomicI32::new(1);

#[derive(Clone, Debug, PartialEq)]
pub struct FakeStatement {
    id: u64,
    sql: String,
}

pub type Inbox = Arc<Mutex<HashMap<i32, VecDeque<RawNotification>>>>;

/// A backend connection double. `id` stands in for the backend pid and is
/// also used as the (fake) raw fd, since tests never actually poll it.
pub struct FakeDriver {
    pub id: i32,
    closed: bool,
    no_reuse: bool,
    inbox: Inbox,
    pending: Option<Result<RawResult, Error>>,
    statements: HashMap<String, FakeStatement>,
    next_stmt_id: u64,
    pub queries: Arc<Mutex<Vec<String>>>,
}

impl FakeDriver {
    pub fn new(id: i32, inbox: Inbox) -> Self {
        FakeDriver {
            id,
            closed: false,
            no_reuse: false,
            inbox,
            pending: None,
            statements: HashMap::new(),
            next_stmt_id: 0,
            queries: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Queues a notification for delivery the next time the session owning
/// `backend_pid` drains its inbox (synchronous `query`, or `on_readable`).
pub fn deliver_notification(inbox: &Inbox, backend_pid: i32, channel: &str, payload: &str) {
    inbox.lock().unwrap().entry(backend_pid).or_default().push_back(RawNotification {
        channel: channel.to_string(),
        backend_pid,
        payload: payload.to_string(),
    });
}

fn canned_result(sql: &str) -> RawResult {
    if sql.trim_start().to_uppercase().starts_with("SELECT") {
        RawResult {
            columns: vec!["one".to_string()],
            column_is_json: vec![false],
            rows: vec![RawRow {
                values: vec![serde_json::Value::from(1)],
            }],
            rows_affected: 0,
        }
    } else {
        RawResult {
            columns: vec![],
            column_is_json: vec![],
            rows: vec![],
            rows_affected: 1,
        }
    }
}

#[async_trait]
impl Driver for FakeDriver {
    type Statement = FakeStatement;

    async fn prepare(&mut self, sql: &str) -> Result<Self::Statement, Error> {
        if let Some(stmt) = self.statements.get(sql) {
            return Ok(stmt.clone());
        }
        let stmt = FakeStatement {
            id: self.next_stmt_id,
            sql: sql.to_string(),
        };
        self.next_stmt_id += 1;
        self.statements.insert(sql.to_string(), stmt.clone());
        Ok(stmt)
    }

    async fn query_sync(&mut self, stmt: &Self::Statement, _params: &[Param], _dollar_only: bool) -> Result<RawResult, Error> {
        self.queries.lock().unwrap().push(stmt.sql.clone());
        Ok(canned_result(&stmt.sql))
    }

    fn submit_async(&mut self, stmt: &Self::Statement, _params: Vec<Param>, _dollar_only: bool) -> Result<(), Error> {
        self.queries.lock().unwrap().push(stmt.sql.clone());
        self.pending = Some(Ok(canned_result(&stmt.sql)));
        Ok(())
    }

    fn poll_async(&mut self) -> Option<Result<RawResult, Error>> {
        self.pending.take()
    }

    fn drain_notifications(&mut self) -> Vec<RawNotification> {
        self.inbox.lock().unwrap().get_mut(&self.id).map(|q| q.drain(..).collect()).unwrap_or_default()
    }

    fn raw_fd(&self) -> RawFd {
        self.id
    }

    fn backend_pid(&self) -> i32 {
        self.id
    }

    async fn ping(&mut self) -> bool {
        !self.closed
    }

    async fn close(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn mark_no_reuse(&mut self) {
        self.no_reuse = true;
    }

    fn is_no_reuse(&self) -> bool {
        self.no_reuse
    }
}

/// Hands out [`FakeDriver`]s with increasing ids and records every id it
/// ever opens, so tests can assert on cache reuse vs. fresh connections.
#[derive(Clone, Default)]
pub struct FakeConnect {
    pub opened: Arc<Mutex<Vec<i32>>>,
    pub inbox: Inbox,
}

#[async_trait]
impl Connect for FakeConnect {
    type Driver = FakeDriver;

    async fn connect(&self, _config: &Config) -> Result<Self::Driver, Error> {
        let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
        self.opened.lock().unwrap().push(id);
        Ok(FakeDriver::new(id, self.inbox.clone()))
    }
}

pub fn test_config() -> Config {
    Config::parse("postgres://user@localhost/db").unwrap()
}
