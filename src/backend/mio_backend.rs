//! The `mio`-based concrete backend (§4.8).
//!
//! This is the one readiness engine this crate ships. It satisfies
//! [`super::Backend`] with no special privileges; a second backend could
//! be dropped in without touching [`crate::loop_`]'s dispatcher.
//!
//! Two things don't map onto `mio::Poll` directly and are resolved here,
//! recorded in `DESIGN.md`:
//!
//! - `mio::Poll` has no standing timer object, so `set_deadline` just
//!   records the deadline and `poll` derives its timeout from it fresh
//!   every call instead of arming anything ahead of time.
//! - Signal delivery needs an actual `sigaction` handler, not an
//!   `mio::Interest`. The handler body touches only atomics and an
//!   async-signal-safe `write(2)`, then the self-pipe it wakes `poll`
//!   through is itself a regular registered fd.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::sys::signal::{SigAction, SigHandler, SigSet, Signal as NixSignal};
use nix::unistd;
use spin::Mutex as SpinMutex;

use super::{Backend, Capabilities};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::queue::{with_all_signals_blocked, EventQueue};
use crate::source::{EventMask, Inner};

const SELF_PIPE_TOKEN: Token = Token(usize::MAX);
/// Standard (non-realtime) signal numbers only; §4.8 scopes realtime
/// signals out rather than sizing this array dynamically against
/// `SIGRTMAX`.
const MAX_SIGNUM: usize = 64;

fn event_mask_to_interest(mask: EventMask) -> Option<Interest> {
    let mut interest = None;
    if mask.contains(EventMask::READ) {
        interest = Some(Interest::READABLE);
    }
    if mask.contains(EventMask::WRITE) {
        interest = Some(interest.map_or(Interest::WRITABLE, |i| i.add(Interest::WRITABLE)));
    }
    interest
}

struct FdEntry {
    source: Arc<Inner>,
}

/// Global table routing a delivered signal number back to the backend
/// instance that owns it. Written only from `add_signal`/`del_signal` (on
/// the dispatch thread); read from the signal trampoline, which only ever
/// performs a relaxed atomic load — no lock, no allocation.
static SIGNAL_OWNERS: [AtomicPtr<MioBackend>; MAX_SIGNUM] =
    [const { AtomicPtr::new(std::ptr::null_mut()) }; MAX_SIGNUM];

extern "C" fn signal_trampoline(signo: libc::c_int) {
    let idx = signo as usize;
    if idx >= MAX_SIGNUM {
        return;
    }
    let ptr = SIGNAL_OWNERS[idx].load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: `ptr` is only ever set to point at a `MioBackend` that is
    // still alive (cleared in `del_signal`/`Drop` before the backend is
    // freed, under the same registry spinlock used here), and this
    // handler body performs only lock-free atomic operations and a
    // single non-blocking `write(2)`, all async-signal-safe.
    let backend = unsafe { &*ptr };
    backend.on_signal_delivered(signo);
}

/// A `mio::Poll`-driven concrete [`Backend`] (§4.8).
pub struct MioBackend {
    poll: SpinMutex<Poll>,
    fds: SpinMutex<HashMap<RawFd, FdEntry>>,
    signals: SpinMutex<HashMap<i32, Arc<Inner>>>,
    deadline_us: AtomicI64,
    self_pipe_read: RawFd,
    self_pipe_write: RawFd,
    queue: Arc<EventQueue>,
    events_capacity: SpinMutex<usize>,
}

const NO_DEADLINE: i64 = -1;

impl MioBackend {
    /// Build a new backend sharing `queue` with the loop it belongs to —
    /// the signal trampoline needs a stable path to `emit` that does not
    /// depend on being inside a `poll()` call frame.
    pub fn new(queue: Arc<EventQueue>) -> Result<Self> {
        let poll = Poll::new().map_err(Error::Io)?;
        let (read, write) = unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK | nix::fcntl::OFlag::O_CLOEXEC)
            .map_err(|e| Error::Io(std::io::Error::from(e)))?;
        let read_fd = read.as_raw_fd();
        let write_fd = write.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&read_fd), SELF_PIPE_TOKEN, Interest::READABLE)
            .map_err(Error::Io)?;
        // Leak the owned fds: `RawFd` bookkeeping below (`del_fd`/`Drop`)
        // closes them explicitly exactly once at backend teardown.
        std::mem::forget(read);
        std::mem::forget(write);
        Ok(MioBackend {
            poll: SpinMutex::new(poll),
            fds: SpinMutex::new(HashMap::new()),
            signals: SpinMutex::new(HashMap::new()),
            deadline_us: AtomicI64::new(NO_DEADLINE),
            self_pipe_read: read_fd,
            self_pipe_write: write_fd,
            queue,
            events_capacity: SpinMutex::new(64),
        })
    }

    fn wake_self_pipe(&self) {
        let byte = [1u8];
        loop {
            match unistd::write(self.self_pipe_write, &byte) {
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::EAGAIN) => break, // already has a pending wake byte
                Err(_) => break,
            }
        }
    }

    fn drain_self_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            match unistd::read(self.self_pipe_read, &mut buf) {
                Ok(0) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    /// Invoked from the signal trampoline (§4.8): look up the registered
    /// source for `signo` and emit it, then nudge the self-pipe so a
    /// blocked `poll` wakes up and observes it.
    ///
    /// Takes `self.signals` here too, but safely: `install_sigaction` sets
    /// the handler's `sa_mask` to block every signal for the duration of
    /// its own execution, so no second signal can land on this thread and
    /// reenter this lock while we hold it. The other side of this lock
    /// (`add_signal`/`del_signal`/`Drop`, on the dispatch thread) blocks
    /// signals itself around its own critical section, so neither side can
    /// ever be interrupted mid-critical-section by the other.
    fn on_signal_delivered(&self, signo: i32) {
        if let Some(source) = self.signals.lock().get(&signo).cloned() {
            self.queue.emit(&source, EventMask::NONE);
        }
        self.wake_self_pipe();
    }

    fn install_sigaction(&self, signo: i32) -> Result<()> {
        let idx = signo as usize;
        if idx >= MAX_SIGNUM {
            return Err(Error::Unsupported("realtime signal numbers"));
        }
        SIGNAL_OWNERS[idx].store(self as *const MioBackend as *mut MioBackend, Ordering::Release);
        let sig = NixSignal::try_from(signo)
            .map_err(|e| Error::backend_rejected(Id::NONE, format!("invalid signal number: {e}")))?;
        let action = SigAction::new(
            SigHandler::Handler(signal_trampoline),
            nix::sys::signal::SaFlags::SA_RESTART,
            SigSet::all(),
        );
        // SAFETY: `signal_trampoline` only touches atomics and performs a
        // single non-blocking `write(2)`.
        unsafe { nix::sys::signal::sigaction(sig, &action) }
            .map_err(|e| Error::backend_rejected(Id::NONE, format!("sigaction failed: {e}")))?;
        Ok(())
    }

    fn uninstall_sigaction(&self, signo: i32) {
        let idx = signo as usize;
        if idx >= MAX_SIGNUM {
            return;
        }
        SIGNAL_OWNERS[idx].store(std::ptr::null_mut(), Ordering::Release);
        if let Ok(sig) = NixSignal::try_from(signo) {
            unsafe {
                let _ = nix::sys::signal::sigaction(
                    sig,
                    &SigAction::new(
                        SigHandler::SigDfl,
                        nix::sys::signal::SaFlags::empty(),
                        SigSet::empty(),
                    ),
                );
            }
        }
    }
}

impl Drop for MioBackend {
    fn drop(&mut self) {
        let signos = with_all_signals_blocked(|| self.signals.lock().keys().copied().collect::<Vec<_>>());
        for signo in signos {
            self.uninstall_sigaction(signo);
        }
        let _ = unistd::close(self.self_pipe_read);
        let _ = unistd::close(self.self_pipe_write);
    }
}

impl Backend for MioBackend {
    fn capabilities(&self) -> Capabilities {
        // mio registers fds in level-triggered mode by default on every
        // platform it supports, so the dispatcher's edge-triggered re-arm
        // path never fires for this backend (§4.8).
        Capabilities {
            edge_triggered: false,
        }
    }

    fn get_fd(&self) -> Option<RawFd> {
        None // mio::Poll exposes no pollable aggregation descriptor itself.
    }

    fn supports_interrupt(&self) -> bool {
        true
    }

    fn add_fd(&self, fd: RawFd, mask: EventMask, source: &Arc<Inner>) -> Result<()> {
        let Some(interest) = event_mask_to_interest(mask) else {
            return Err(Error::backend_rejected(source.id, "empty event mask"));
        };
        if mask.contains(EventMask::OOB) {
            debug!("fd {fd}: mio backend cannot signal out-of-band readiness, ignoring that bit");
        }
        self.poll
            .lock()
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)
            .map_err(|e| Error::backend_rejected(source.id, e))?;
        self.fds.lock().insert(
            fd,
            FdEntry {
                source: Arc::clone(source),
            },
        );
        Ok(())
    }

    fn mod_fd(&self, fd: RawFd, mask: EventMask, source: &Arc<Inner>) -> Result<()> {
        let Some(interest) = event_mask_to_interest(mask) else {
            return Err(Error::backend_rejected(source.id, "empty event mask"));
        };
        self.poll
            .lock()
            .registry()
            .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
            .map_err(|e| Error::backend_rejected(source.id, e))
    }

    fn del_fd(&self, fd: RawFd) -> Result<()> {
        if let Some(entry) = self.fds.lock().remove(&fd) {
            let _ = self.poll.lock().registry().deregister(&mut SourceFd(&fd));
            let _ = entry; // drops the held `Arc<Inner>` clone
        }
        Ok(())
    }

    fn add_signal(&self, signo: i32, source: &Arc<Inner>) -> Result<()> {
        // Block signals around the critical section: without this, a
        // signal landing on this thread while it holds `self.signals`
        // would reenter `on_signal_delivered`'s own lock attempt on the
        // same thread and spin forever against itself.
        with_all_signals_blocked(|| self.signals.lock().insert(signo, Arc::clone(source)));
        self.install_sigaction(signo)
    }

    fn del_signal(&self, signo: i32) -> Result<()> {
        with_all_signals_blocked(|| self.signals.lock().remove(&signo));
        self.uninstall_sigaction(signo);
        Ok(())
    }

    fn set_deadline(&self, absolute_us: Option<u64>) {
        self.deadline_us
            .store(absolute_us.map(|v| v as i64).unwrap_or(NO_DEADLINE), Ordering::Relaxed);
    }

    fn poll(&self, timeout_us: i64, queue: &EventQueue) -> Result<usize> {
        let deadline_us = self.deadline_us.load(Ordering::Relaxed);
        let effective_timeout = combine_timeout(timeout_us, deadline_us);

        let capacity = *self.events_capacity.lock();
        let mut events = Events::with_capacity(capacity);
        let mut poll = self.poll.lock();
        match poll.poll(&mut events, effective_timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(Error::Io(e)),
        }

        let mut count = 0;
        let mut saw_self_pipe = false;
        for event in events.iter() {
            if event.token() == SELF_PIPE_TOKEN {
                saw_self_pipe = true;
                continue;
            }
            let fd = event.token().0 as RawFd;
            let Some(entry) = self.fds.lock().get(&fd).map(|e| Arc::clone(&e.source)) else {
                continue;
            };
            let mut bits = EventMask::NONE;
            if event.is_readable() {
                bits = bits.union(EventMask::READ);
            }
            if event.is_writable() {
                bits = bits.union(EventMask::WRITE);
            }
            queue.emit(&entry, bits);
            count += 1;
        }
        if saw_self_pipe {
            self.drain_self_pipe();
        }

        if events.iter().count() == capacity {
            *self.events_capacity.lock() = capacity.saturating_mul(2);
        }

        Ok(count)
    }

    fn interrupt(&self) {
        self.wake_self_pipe();
    }

    fn exit(&self) {
        self.wake_self_pipe();
    }

    fn post_dispatch(&self) {}
}

/// Resolve the caller's requested timeout against the currently armed
/// deadline, both in microseconds; `None` means block indefinitely.
fn combine_timeout(timeout_us: i64, deadline_us: i64) -> Option<Duration> {
    let requested = if timeout_us < 0 {
        None
    } else {
        Some(Duration::from_micros(timeout_us as u64))
    };

    let until_deadline = if deadline_us < 0 {
        None
    } else {
        let now_us = crate::loop_::monotonic_now_us();
        if deadline_us as u64 <= now_us {
            Some(Duration::ZERO)
        } else {
            Some(Duration::from_micros(deadline_us as u64 - now_us))
        }
    };

    match (requested, until_deadline) {
        (None, d) => d,
        (t, None) => t,
        (Some(t), Some(d)) => Some(t.min(d)),
    }
}

