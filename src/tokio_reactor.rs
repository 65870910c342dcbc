//! Default [`Reactor`] implementation, backed by `tokio::io::unix::AsyncFd`.
//!
//! Unix-only, matching the socket-fd-oriented shape of the `Reactor` trait
//! itself. Each watched fd is `dup`'d first: the reactor's registration is
//! independent of the driver's own ownership of the original descriptor, so
//! closing or replacing the driver's connection never races the reactor's
//! bookkeeping (see the "Socket duplication" note in §5 this trait exists
//! to satisfy).
//!
//! [`Reactor`] itself only does "watch"/"unwatch" bookkeeping — it has no way
//! to call back into a particular [`crate::session::Session`], since the
//! trait is deliberately ignorant of `Session`. `TokioReactor` fills that gap
//! by reporting readiness as a stream of raw fds; the embedding event loop
//! (left to the application, per §4.8) reads that stream and dispatches each
//! fd to whichever `Session` owns it.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::reactor::Reactor;

struct DupFd(OwnedFd);

impl AsRawFd for DupFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Watches backend sockets for readability and reports the original
/// (non-duplicated) fd back on [`TokioReactor::ready`] each time one of them
/// becomes readable.
pub struct TokioReactor {
    watches: Mutex<HashMap<RawFd, JoinHandle<()>>>,
    ready_tx: mpsc::UnboundedSender<RawFd>,
}

impl TokioReactor {
    /// Builds a reactor and the stream the embedding event loop should drain,
    /// calling `Session::on_readable` for whichever session owns the fd.
    pub fn new() -> (Self, UnboundedReceiverStream<RawFd>) {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        (
            TokioReactor {
                watches: Mutex::new(HashMap::new()),
                ready_tx,
            },
            UnboundedReceiverStream::new(ready_rx),
        )
    }
}

impl Reactor for TokioReactor {
    fn watch_read(&self, fd: RawFd) {
        let mut watches = self.watches.lock();
        if watches.contains_key(&fd) {
            return;
        }
        let dup = match unsafe { dup_fd(fd) } {
            Ok(dup) => dup,
            Err(e) => {
                log::warn!("pg-session: failed to dup fd {fd} for watching: {e}");
                return;
            }
        };
        let ready_tx = self.ready_tx.clone();
        let handle = tokio::spawn(async move {
            let Ok(async_fd) = AsyncFd::new(dup) else { return };
            loop {
                let Ok(mut guard) = async_fd.readable().await else { break };
                if ready_tx.send(fd).is_err() {
                    break;
                }
                guard.clear_ready();
            }
        });
        watches.insert(fd, handle);
    }

    fn unwatch(&self, fd: RawFd) {
        if let Some(handle) = self.watches.lock().remove(&fd) {
            handle.abort();
        }
    }
}

unsafe fn dup_fd(fd: RawFd) -> std::io::Result<DupFd> {
    let dup = libc::dup(fd);
    if dup < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(DupFd(OwnedFd::from_raw_fd(dup)))
}
