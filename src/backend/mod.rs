//! The abstract backend contract (§4.7).
//!
//! A `Backend` is the pluggable readiness engine behind a [`crate::Loop`].
//! The loop core never assumes anything about *how* readiness is detected
//! — only that a backend can watch fds and signals, block until something
//! is ready (or a deadline, or an interrupt), and call back into
//! [`crate::queue::EventQueue::emit`] for whatever became ready. The one
//! concrete backend this crate ships, [`mio_backend::MioBackend`], is
//! implemented strictly against this trait and gets no special access.

pub mod mio_backend;

#[cfg(test)]
pub(crate) mod mem_backend;

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::error::Result;
use crate::queue::EventQueue;
use crate::source::{EventMask, Inner};

/// Capability flags a backend may report (§4.7).
#[derive(Copy, Clone, Debug, Default)]
pub struct Capabilities {
    /// If true, the dispatcher re-arms a fd's registration (`mod_fd`)
    /// after every callback, because this backend only reports readiness
    /// once per edge rather than level-continuously.
    pub edge_triggered: bool,
}

/// The contract a readiness engine must satisfy to back a [`crate::Loop`].
///
/// All methods run on the loop's dispatch thread except where noted.
/// `Sync` is required, not just `Send`: a [`crate::Loop`] is an
/// `Arc<LoopCore>` handle that is cloned across threads (a worker calling
/// `interrupt` while the dispatch thread blocks in `poll`, for
/// instance), so the backend behind it must tolerate concurrent `&self`
/// calls from different threads, not merely be movable between them.
pub trait Backend: Send + Sync {
    /// Capability flags this backend reports (§4.7).
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// A descriptor suitable for composing this backend's readiness
    /// aggregation into a foreign loop, if supported.
    fn get_fd(&self) -> Option<RawFd> {
        None
    }

    /// Start watching `fd` for the requested `mask`. `source` is kept
    /// alive by the loop's started list; the backend may stash a clone in
    /// its own fd table but must not be the *only* owner.
    fn add_fd(&self, fd: RawFd, mask: EventMask, source: &Arc<Inner>) -> Result<()>;

    /// Change the requested mask for an already-watched `fd`. The default
    /// emulates this with `del_fd` + `add_fd`, matching §4.7's fallback
    /// for backends with no native "modify" call.
    fn mod_fd(&self, fd: RawFd, mask: EventMask, source: &Arc<Inner>) -> Result<()> {
        self.del_fd(fd)?;
        self.add_fd(fd, mask, source)
    }

    /// Stop watching `fd`.
    fn del_fd(&self, fd: RawFd) -> Result<()>;

    /// Start watching for `signo`, associated with `source`.
    fn add_signal(&self, signo: i32, source: &Arc<Inner>) -> Result<()>;

    /// Stop watching for `signo`.
    fn del_signal(&self, signo: i32) -> Result<()>;

    /// Arm the single earliest-deadline timer; its expiry must cause the
    /// in-flight or next `poll` to return. `None` disarms it (no timers
    /// currently live).
    fn set_deadline(&self, absolute_us: Option<u64>);

    /// Block until readiness, the armed deadline, or an interrupt; call
    /// `queue.emit(..)` for everything that became ready. Returns the
    /// number of readiness events surfaced, or an error.
    ///
    /// `timeout_us < 0` means "block indefinitely"; this is still bounded
    /// by whatever deadline is currently armed via `set_deadline`.
    fn poll(&self, timeout_us: i64, queue: &EventQueue) -> Result<usize>;

    /// Whether `interrupt` actually does something. When `false`, the
    /// loop constructs its own self-pipe fallback and registers it as an
    /// internal `FdHandler` instead of relying on this backend (§4.3).
    fn supports_interrupt(&self) -> bool {
        false
    }

    /// Unblock a poll currently in progress (or about to start) from
    /// another thread. The default is a no-op; backends without a native
    /// mechanism rely on the loop's self-pipe fallback instead (§4.3).
    fn interrupt(&self) {}

    /// Called once from `Loop::exit` so a blocked `poll` unblocks even if
    /// `interrupt` alone would not cause that (distinct hook per §4.4).
    fn exit(&self) {}

    /// Called once per dispatch pass, after the backend's deadline has
    /// been re-armed, so backends with internal producer threads can
    /// resume waiting (§4.4, §4.7).
    fn post_dispatch(&self) {}
}
