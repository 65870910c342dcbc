//! Error taxonomy for the session layer.
//!
//! Four kinds are distinguished, matching the layer's propagation policy:
//! usage errors never retry, query errors carry the statement's error state
//! along with a [`Results`](crate::results::Results), connection errors abort
//! any in-flight continuation, and builder errors are raised synchronously at
//! SQL-generation time.

use std::fmt;

/// The stable error strings of record, surfaced unchanged to callers.
pub mod messages {
    pub const BUSY: &str = "Non-blocking query already in progress";
    pub const PREMATURE_CLOSE: &str = "Premature connection close";
    pub const NO_PLACEHOLDERS: &str = "Statement has no placeholders to bind";
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Preconditions violated by the caller: a second async query while one is
    /// already in flight, double-commit, operating on a dropped session, etc.
    #[error("{0}")]
    Usage(String),

    /// A SQL or server-reported error. Synchronous queries raise it directly;
    /// asynchronous queries deliver it as the continuation's error argument.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// The backend socket was lost, a ping failed, or the session was dropped
    /// mid-flight.
    #[error("connection error: {0}")]
    Connection(String),

    /// A bad option shape was passed to the SQL builder.
    #[error("builder error: {0}")]
    Builder(String),
}

impl Error {
    pub fn busy() -> Self {
        Error::Usage(messages::BUSY.to_string())
    }

    pub fn premature_close() -> Self {
        Error::Connection(messages::PREMATURE_CLOSE.to_string())
    }
}

/// A server or driver-reported query failure, call-site attributed.
#[derive(Debug)]
pub struct QueryError {
    pub message: String,
    pub site: Option<&'static str>,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.site {
            Some(site) => write!(f, "{} (at {})", self.message, site),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for QueryError {}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        QueryError {
            message: message.into(),
            site: None,
        }
    }

    pub fn at(mut self, site: &'static str) -> Self {
        self.site = Some(site);
        self
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(e: tokio_postgres::Error) -> Self {
        if e.is_closed() {
            Error::Connection(e.to_string())
        } else {
            Error::Query(QueryError::new(e.to_string()))
        }
    }
}
