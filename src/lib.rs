//! An asynchronous PostgreSQL client layer sitting between an application
//! and a PostgreSQL driver: a fork-safe connection cache, a per-connection
//! state machine interleaving blocking queries, non-blocking queries, and
//! LISTEN/NOTIFY delivery through an external I/O reactor, a materialized
//! results view with lazy JSON expansion, scoped transactions, and a small
//! PostgreSQL-specific SQL builder extension.
//!
//! The wire protocol and the I/O reactor are collaborators, not parts of
//! this crate: [`driver::Driver`]/[`driver::Connect`] and [`reactor::Reactor`]
//! are the seams. [`tokio_driver`] and [`tokio_reactor`] provide default
//! implementations over `tokio-postgres` and `tokio`, but every other module
//! is generic over those traits and can be exercised with fakes.

pub mod builder;
pub mod config;
pub mod driver;
pub mod error;
pub mod manager;
pub mod reactor;
pub mod results;
pub mod session;
pub mod tokio_driver;
pub mod tokio_reactor;
pub mod transaction;

pub use config::Config;
pub use driver::{Connect, Driver, Param};
pub use error::Error;
pub use manager::Manager;
pub use reactor::Reactor;
pub use results::Results;
pub use session::Session;
pub use tokio_driver::{TokioPostgresConnector, TokioPostgresDriver};
pub use tokio_reactor::TokioReactor;
pub use transaction::{IsolationLevel, Transaction};
