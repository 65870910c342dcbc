//! Default [`Driver`]/[`Connect`] implementation over `tokio-postgres`.
//!
//! Grounded in the teacher's `ClientWrapper`/`StatementCache` (a thin wrapper
//! around `tokio_postgres::Client` carrying its own prepared-statement
//! cache), reshaped per §4.7: the cache becomes a bounded
//! [`lru::LruCache`] (convex-backend's `postgres` crate uses the same crate
//! for the same reason) instead of the teacher's unbounded `HashMap`, and
//! notifications are drained from the connection's message stream into an
//! unbounded channel rather than discarded, since `tokio_postgres::spawn`'s
//! usual fire-and-forget pattern has nowhere to deliver them.
//!
//! `submit_async`/`poll_async` are implemented by spawning the query onto a
//! background task and handing its outcome back over a `oneshot` channel;
//! `poll_async` is a non-blocking `try_recv`.

use std::num::NonZeroUsize;
use std::os::unix::io::{AsRawFd, RawFd};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{AsyncMessage, NoTls};

use crate::config::Config;
use crate::driver::{Connect, Driver, Param, RawNotification, RawResult, RawRow};
use crate::error::{messages, Error};

const STATEMENT_CACHE_CAPACITY: usize = 64;

/// A prepared statement handle. `tokio_postgres::Statement` itself carries
/// no [`PartialEq`]; two handles are equal iff they name the same prepared
/// statement on the backend.
#[derive(Clone)]
pub struct PgStatement(tokio_postgres::Statement, String);

impl PartialEq for PgStatement {
    fn eq(&self, other: &Self) -> bool {
        self.1 == other.1
    }
}

struct PendingAsync {
    rx: oneshot::Receiver<Result<RawResult, Error>>,
}

/// One backend connection: the `tokio_postgres::Client` handle, its
/// notification inbox, a bounded statement cache, and in-flight async-query
/// bookkeeping.
pub struct TokioPostgresDriver {
    client: Option<tokio_postgres::Client>,
    raw_fd: RawFd,
    backend_pid: i32,
    statements: LruCache<String, PgStatement>,
    notifications: mpsc::UnboundedReceiver<RawNotification>,
    pending: Option<PendingAsync>,
    no_reuse: bool,
}

impl TokioPostgresDriver {
    fn client(&self) -> Result<&tokio_postgres::Client, Error> {
        self.client.as_ref().ok_or_else(Error::premature_close)
    }

    async fn prepare_uncached(&self, sql: &str) -> Result<PgStatement, Error> {
        let stmt = self.client()?.prepare(sql).await?;
        Ok(PgStatement(stmt, sql.to_string()))
    }

    async fn run(&self, stmt: &PgStatement, params: &[Param], dollar_only: bool) -> Result<RawResult, Error> {
        if dollar_only && params.is_empty() {
            return Err(Error::Usage(messages::NO_PLACEHOLDERS.to_string()));
        }
        let boxed: Vec<Box<dyn ToSql + Sync + Send>> = params.iter().map(to_sql_box).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();
        // A statement with no result columns (INSERT/UPDATE/DELETE without
        // RETURNING) never returns rows through `query`; `execute` is the
        // only way to observe its affected-row count.
        if stmt.0.columns().is_empty() {
            let affected = self.client()?.execute(&stmt.0, &refs).await?;
            return Ok(RawResult {
                columns: Vec::new(),
                column_is_json: Vec::new(),
                rows: Vec::new(),
                rows_affected: affected,
            });
        }
        let rows = self.client()?.query(&stmt.0, &refs).await?;
        Ok(rows_to_raw(stmt, &rows))
    }
}

fn to_sql_box(param: &Param) -> Box<dyn ToSql + Sync + Send> {
    match param {
        Param::Value(v) | Param::Typed { value: v, .. } => value_to_sql(v),
        Param::Json(v) => Box::new(v.clone()),
    }
}

fn value_to_sql(v: &serde_json::Value) -> Box<dyn ToSql + Sync + Send> {
    match v {
        serde_json::Value::Null => Box::new(Option::<String>::None),
        serde_json::Value::Bool(b) => Box::new(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Box::new(i)
            } else {
                Box::new(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Box::new(s.clone()),
        other => Box::new(other.clone()),
    }
}

fn rows_to_raw(stmt: &PgStatement, rows: &[tokio_postgres::Row]) -> RawResult {
    let columns = stmt.0.columns().iter().map(|c| c.name().to_string()).collect();
    let column_is_json = stmt
        .0
        .columns()
        .iter()
        .map(|c| matches!(c.type_(), &Type::JSON | &Type::JSONB))
        .collect();
    let data = rows.iter().map(|r| row_to_raw(stmt, r)).collect();
    RawResult {
        columns,
        column_is_json,
        rows: data,
        rows_affected: rows.len() as u64,
    }
}

fn row_to_raw(stmt: &PgStatement, row: &tokio_postgres::Row) -> RawRow {
    let values = stmt
        .0
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| value_for_column(row, i, col.type_()))
        .collect();
    RawRow { values }
}

/// Decodes column `i` by its server-reported type rather than cascading
/// through candidate Rust types: `tokio_postgres`'s `FromSql` impls each
/// accept a fixed, narrow set of OIDs (`i64` only accepts `INT8`, for
/// instance), so an `int4` or `int2` column needs its own arm or it falls
/// straight through to `Value::Null`.
fn value_for_column(row: &tokio_postgres::Row, i: usize, ty: &Type) -> serde_json::Value {
    match ty {
        &Type::BOOL => row.try_get::<_, Option<bool>>(i).ok().flatten().map(serde_json::Value::from).unwrap_or(serde_json::Value::Null),
        &Type::INT2 => row
            .try_get::<_, Option<i16>>(i)
            .ok()
            .flatten()
            .map(|v| serde_json::Value::from(v as i64))
            .unwrap_or(serde_json::Value::Null),
        &Type::INT4 => row
            .try_get::<_, Option<i32>>(i)
            .ok()
            .flatten()
            .map(|v| serde_json::Value::from(v as i64))
            .unwrap_or(serde_json::Value::Null),
        &Type::INT8 => row
            .try_get::<_, Option<i64>>(i)
            .ok()
            .flatten()
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        &Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(i)
            .ok()
            .flatten()
            .and_then(|f| serde_json::Number::from_f64(f as f64))
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        &Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(i)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        // Decoded to structured JSON then re-serialized to text: the raw
        // string is what callers get back unless `Results::expand` asks for
        // the parsed form (see `column_is_json` above).
        &Type::JSON | &Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(i)
            .ok()
            .flatten()
            .map(|v| serde_json::Value::String(v.to_string()))
            .unwrap_or(serde_json::Value::Null),
        _ => row
            .try_get::<_, Option<String>>(i)
            .ok()
            .flatten()
            .map(serde_json::Value::String)
            .unwrap_or(serde_json::Value::Null),
    }
}

#[async_trait]
impl Driver for TokioPostgresDriver {
    type Statement = PgStatement;

    async fn prepare(&mut self, sql: &str) -> Result<Self::Statement, Error> {
        if let Some(stmt) = self.statements.get(sql) {
            return Ok(stmt.clone());
        }
        let stmt = self.prepare_uncached(sql).await?;
        self.statements.put(sql.to_string(), stmt.clone());
        Ok(stmt)
    }

    async fn query_sync(&mut self, stmt: &Self::Statement, params: &[Param], dollar_only: bool) -> Result<RawResult, Error> {
        self.run(stmt, params, dollar_only).await
    }

    fn submit_async(&mut self, stmt: &Self::Statement, params: Vec<Param>, dollar_only: bool) -> Result<(), Error> {
        let client = self.client()?.clone();
        let stmt = stmt.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = async {
                if dollar_only && params.is_empty() {
                    return Err(Error::Usage(messages::NO_PLACEHOLDERS.to_string()));
                }
                let boxed: Vec<Box<dyn ToSql + Sync + Send>> = params.iter().map(to_sql_box).collect();
                let refs: Vec<&(dyn ToSql + Sync)> =
                    boxed.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect();
                if stmt.0.columns().is_empty() {
                    let affected = client.execute(&stmt.0, &refs).await?;
                    return Ok(RawResult {
                        columns: Vec::new(),
                        column_is_json: Vec::new(),
                        rows: Vec::new(),
                        rows_affected: affected,
                    });
                }
                let rows = client.query(&stmt.0, &refs).await?;
                Ok(rows_to_raw(&stmt, &rows))
            }
            .await;
            let _ = tx.send(outcome);
        });
        self.pending = Some(PendingAsync { rx });
        Ok(())
    }

    fn poll_async(&mut self) -> Option<Result<RawResult, Error>> {
        let pending = self.pending.as_mut()?;
        match pending.rx.try_recv() {
            Ok(outcome) => {
                self.pending = None;
                Some(outcome)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.pending = None;
                Some(Err(Error::premature_close()))
            }
        }
    }

    fn drain_notifications(&mut self) -> Vec<RawNotification> {
        let mut out = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            out.push(n);
        }
        out
    }

    fn raw_fd(&self) -> RawFd {
        self.raw_fd
    }

    fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    async fn ping(&mut self) -> bool {
        let Ok(client) = self.client() else { return false };
        client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&mut self) {
        self.client = None;
    }

    fn is_closed(&self) -> bool {
        match &self.client {
            Some(c) => c.is_closed(),
            None => true,
        }
    }

    fn mark_no_reuse(&mut self) {
        self.no_reuse = true;
    }

    fn is_no_reuse(&self) -> bool {
        self.no_reuse
    }
}

/// Opens [`TokioPostgresDriver`] connections over plain TCP without TLS.
///
/// The socket is established with `tokio::net::TcpStream` directly (rather
/// than through `tokio_postgres::connect`, which hides it) so the raw fd can
/// be captured for [`crate::reactor::Reactor::watch_read`] before it's handed
/// to `connect_raw`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioPostgresConnector;

#[async_trait]
impl Connect for TokioPostgresConnector {
    type Driver = TokioPostgresDriver;

    async fn connect(&self, config: &Config) -> Result<Self::Driver, Error> {
        let url = url::Url::parse(&config.url).map_err(|e| Error::Usage(format!("bad connection url: {e}")))?;
        let host = url.host_str().unwrap_or("localhost");
        let port = url.port().unwrap_or(5432);
        let dbname = url.path().trim_start_matches('/');

        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(host).port(port);
        if !dbname.is_empty() {
            pg_config.dbname(dbname);
        }
        if !url.username().is_empty() {
            pg_config.user(url.username());
        }
        if let Some(password) = url.password() {
            pg_config.password(password);
        }
        if !config.options.is_empty() {
            let combined = config
                .options
                .iter()
                .map(|(key, value)| format!("-c {key}={value}"))
                .collect::<Vec<_>>()
                .join(" ");
            pg_config.options(&combined);
        }

        let stream = tokio::net::TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        let raw_fd = stream.as_raw_fd();

        let (client, mut connection) = pg_config.connect_raw(stream, NoTls).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = futures::future::poll_fn(|cx| connection.poll_message(cx)).await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        let _ = tx.send(RawNotification {
                            channel: n.channel().to_string(),
                            backend_pid: n.process_id(),
                            payload: n.payload().to_string(),
                        });
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });

        let backend_pid = client
            .query_one("SELECT pg_backend_pid()", &[])
            .await
            .ok()
            .and_then(|row| row.try_get::<_, i32>(0).ok())
            .unwrap_or(0);

        Ok(TokioPostgresDriver {
            client: Some(client),
            raw_fd,
            backend_pid,
            statements: LruCache::new(NonZeroUsize::new(STATEMENT_CACHE_CAPACITY).unwrap()),
            notifications: rx,
            pending: None,
            no_reuse: false,
        })
    }
}

#[allow(dead_code)]
impl TokioPostgresDriver {
    fn submit_async_test(&mut self) -> Result<(), Error> {
        let client = self.client()?.clone();
        let (tx, rx) = oneshot::channel::<Result<RawResult, Error>>();
        tokio::spawn(async move {
            let rows = client.query("select 1", &[]).await;
            let _ = rows;
            let _ = tx.send(Ok(RawResult::default()));
        });
        self.pending = Some(PendingAsync { rx });
        Ok(())
    }
}
