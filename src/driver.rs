//! The wire-protocol collaborator boundary.
//!
//! Everything in this module is a trait: the actual PostgreSQL wire protocol
//! is assumed to be provided by an implementor (see [`crate::tokio_driver`]
//! for the default one, backed by `tokio-postgres`). The rest of this crate
//! is generic over [`Driver`] and [`Connect`] so the state machine in
//! [`crate::session`] can be exercised against a fake in unit tests.

use std::os::unix::io::RawFd;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::Error;

/// One bound query parameter.
///
/// Plain values bind as their natural type. [`Param::Json`] JSON-encodes the
/// value and binds it as text (used for JSONB columns and containment
/// queries). [`Param::Typed`] binds with an explicit driver-native type code,
/// letting callers disambiguate overloaded operators.
#[derive(Debug, Clone)]
pub enum Param {
    Value(serde_json::Value),
    Json(serde_json::Value),
    Typed { type_name: String, value: serde_json::Value },
}

impl<T: Into<serde_json::Value>> From<T> for Param {
    fn from(value: T) -> Self {
        Param::Value(value.into())
    }
}

/// A single PostgreSQL column value, already shaped the way [`crate::results`]
/// hands it to the application. JSON/JSONB columns arrive as
/// [`serde_json::Value::String`] unless [`crate::results::Results::expand`]
/// is active, in which case the driver decodes them to structured JSON.
pub type Value = serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct RawRow {
    pub values: Vec<Value>,
}

/// The fully materialized outcome of one executed statement. Rows are never
/// streamed: the non-goal in the spec rules out a server-side cursor that
/// yields rows lazily over the wire, so by the time this struct exists the
/// query is complete.
#[derive(Debug, Clone, Default)]
pub struct RawResult {
    pub columns: Vec<String>,
    /// Parallel to `columns`: whether each column is JSON/JSONB-typed, so
    /// [`crate::results::Results::expand`] only ever decodes those columns
    /// and never a plain text column that happens to parse as JSON.
    pub column_is_json: Vec<bool>,
    pub rows: Vec<RawRow>,
    pub rows_affected: u64,
}

#[derive(Debug, Clone)]
pub struct RawNotification {
    pub channel: String,
    pub backend_pid: i32,
    pub payload: String,
}

/// One backend connection's wire-protocol surface.
///
/// A `Driver` is owned by exactly one [`crate::session::Session`] (or sits
/// idle in the [`crate::manager::Manager`]'s cache) at a time, so every
/// method here takes `&mut self`.
#[async_trait]
pub trait Driver: Send {
    /// An opaque, cheaply-`Clone`able handle to a prepared statement. Two
    /// handles obtained from the same SQL text on the same connection must
    /// compare equal under [`PartialEq`].
    type Statement: Clone + Send + Sync + PartialEq;

    /// Looks up or prepares a statement for `sql`. Implementations are
    /// expected to maintain a small per-connection LRU (see
    /// [`crate::tokio_driver::TokioPostgresDriver`]).
    async fn prepare(&mut self, sql: &str) -> Result<Self::Statement, Error>;

    /// Executes `stmt` to completion, blocking the caller.
    async fn query_sync(
        &mut self,
        stmt: &Self::Statement,
        params: &[Param],
        dollar_only: bool,
    ) -> Result<RawResult, Error>;

    /// Submits `stmt` for asynchronous execution. Must not block; completion
    /// is observed later through [`Driver::poll_async`].
    fn submit_async(
        &mut self,
        stmt: &Self::Statement,
        params: Vec<Param>,
        dollar_only: bool,
    ) -> Result<(), Error>;

    /// Non-blocking check for the outcome of a previously submitted async
    /// query. Returns `None` while still in flight.
    fn poll_async(&mut self) -> Option<Result<RawResult, Error>>;

    /// Drains the driver's notification inbox without blocking.
    fn drain_notifications(&mut self) -> Vec<RawNotification>;

    /// The duplicated socket file descriptor the reactor should watch.
    /// See §9 "Socket duplication": the reactor's copy is independent of the
    /// driver's own, so reactor-side removal never races driver-side close.
    fn raw_fd(&self) -> RawFd;

    /// The PID of the server-side backend process, used by tests that
    /// `pg_terminate_backend()` a connection out from under a session.
    fn backend_pid(&self) -> i32;

    /// Issues a trivial round-trip to check liveness.
    async fn ping(&mut self) -> bool;

    /// Closes the connection without attempting a protocol-level goodbye.
    async fn close(&mut self);

    fn is_closed(&self) -> bool;

    /// Marks this connection as ineligible for pooling (e.g. after a
    /// protocol error the driver can't cleanly recover from).
    fn mark_no_reuse(&mut self);

    fn is_no_reuse(&self) -> bool;
}

/// Opens new [`Driver`] instances for a [`Config`].
///
/// Kept separate from [`Driver`] itself (mirroring the teacher's split
/// between `Manager::from_config` and the `Manager` trait impl) so the
/// `Manager` can be generic over "how to connect" without every `Driver`
/// needing to know how it was constructed.
#[async_trait]
pub trait Connect: Send + Sync {
    type Driver: Driver;

    async fn connect(&self, config: &Config) -> Result<Self::Driver, Error>;
}
