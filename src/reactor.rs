//! The I/O-reactor collaborator boundary.
//!
//! A [`Reactor`] only does bookkeeping: "watch this fd for readability" and
//! "stop watching it". Delivering the actual wake-up is the embedding event
//! loop's job — it calls [`crate::session::Session::on_readable`] whenever
//! its own mechanism (epoll, kqueue, tokio, ...) reports the fd ready. This
//! keeps the state machine in [`crate::session`] testable without spinning up
//! a real event loop.

use std::os::unix::io::RawFd;

/// Registers and unregisters interest in a file descriptor's readability.
///
/// Implementations must be idempotent: watching an already-watched fd, or
/// unwatching one that isn't watched, is a no-op rather than an error (the
/// session's own watched/unwatched bookkeeping is the source of truth for
/// *whether* to call these, but a defensive implementation should not panic
/// if called out of step).
pub trait Reactor: Send + Sync {
    fn watch_read(&self, fd: RawFd);
    fn unwatch(&self, fd: RawFd);
}

/// A [`Reactor`] that does nothing. Useful for drivers that are only ever
/// driven synchronously (no LISTEN, no async queries).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReactor;

impl Reactor for NullReactor {
    fn watch_read(&self, _fd: RawFd) {}
    fn unwatch(&self, _fd: RawFd) {}
}
