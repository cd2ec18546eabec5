//! An in-memory, test-only [`Backend`] exercising the edge-triggered
//! re-arm path (§4.4/§4.7) that the shipped [`super::mio_backend::MioBackend`]
//! never takes, since `mio` registers every fd level-triggered. There is no
//! real I/O here: tests inject readiness directly with [`MemBackend::make_ready`]
//! instead of writing to an actual fd.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::{Backend, Capabilities};
use crate::error::Result;
use crate::queue::EventQueue;
use crate::source::{EventMask, Inner};

struct FdEntry {
    source: Arc<Inner>,
    mod_calls: AtomicUsize,
}

#[derive(Default)]
struct Pending {
    ready: Vec<(RawFd, EventMask)>,
    interrupted: bool,
}

/// A `Backend` with no real multiplexing, used only by this crate's own
/// test suite to exercise the `edge_triggered` capability flag.
pub(crate) struct MemBackend {
    fds: Mutex<HashMap<RawFd, FdEntry>>,
    pending: Mutex<Pending>,
    condvar: Condvar,
}

impl MemBackend {
    pub fn new() -> Self {
        MemBackend {
            fds: Mutex::new(HashMap::new()),
            pending: Mutex::new(Pending::default()),
            condvar: Condvar::new(),
        }
    }

    /// Mark `fd` ready with `mask`, waking a blocked `poll`.
    pub fn make_ready(&self, fd: RawFd, mask: EventMask) {
        let mut pending = self.pending.lock().unwrap();
        pending.ready.push((fd, mask));
        self.condvar.notify_all();
    }

    /// How many times `mod_fd` has been called for `fd` since it was added
    /// — the re-arm count the edge-triggered dispatch path is expected to
    /// drive up by exactly one per dispatched readiness event.
    pub fn mod_fd_calls(&self, fd: RawFd) -> usize {
        self.fds
            .lock()
            .unwrap()
            .get(&fd)
            .map(|e| e.mod_calls.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

// Implemented for `Arc<MemBackend>` rather than `MemBackend` directly so a
// test can keep its own handle (for `make_ready`/`mod_fd_calls`) alongside
// the `Box<dyn Backend>` a `Loop` takes ownership of.
impl Backend for Arc<MemBackend> {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            edge_triggered: true,
        }
    }

    fn add_fd(&self, fd: RawFd, _mask: EventMask, source: &Arc<Inner>) -> Result<()> {
        self.fds.lock().unwrap().insert(
            fd,
            FdEntry {
                source: Arc::clone(source),
                mod_calls: AtomicUsize::new(0),
            },
        );
        Ok(())
    }

    fn mod_fd(&self, fd: RawFd, _mask: EventMask, _source: &Arc<Inner>) -> Result<()> {
        if let Some(entry) = self.fds.lock().unwrap().get(&fd) {
            entry.mod_calls.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn del_fd(&self, fd: RawFd) -> Result<()> {
        self.fds.lock().unwrap().remove(&fd);
        Ok(())
    }

    fn add_signal(&self, _signo: i32, _source: &Arc<Inner>) -> Result<()> {
        Ok(())
    }

    fn del_signal(&self, _signo: i32) -> Result<()> {
        Ok(())
    }

    fn set_deadline(&self, _absolute_us: Option<u64>) {}

    fn poll(&self, timeout_us: i64, queue: &EventQueue) -> Result<usize> {
        let mut pending = self.pending.lock().unwrap();
        if pending.ready.is_empty() && !pending.interrupted {
            pending = if timeout_us < 0 {
                self.condvar.wait(pending).unwrap()
            } else {
                let timeout = Duration::from_micros(timeout_us as u64);
                self.condvar.wait_timeout(pending, timeout).unwrap().0
            };
        }
        pending.interrupted = false;
        let ready = std::mem::take(&mut pending.ready);
        drop(pending);

        let fds = self.fds.lock().unwrap();
        let mut count = 0;
        for (fd, mask) in ready {
            if let Some(entry) = fds.get(&fd) {
                queue.emit(&entry.source, mask);
                count += 1;
            }
        }
        Ok(count)
    }

    fn supports_interrupt(&self) -> bool {
        true
    }

    fn interrupt(&self) {
        let mut pending = self.pending.lock().unwrap();
        pending.interrupted = true;
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_::{Config, Loop};
    use crate::source::FdHandler;
    use std::sync::atomic::AtomicUsize;

    /// The dispatcher must re-arm (`mod_fd`) an edge-triggered fd exactly
    /// once per dispatched readiness event (§4.4, §9 "Edge-triggered
    /// re-arm") — a path the shipped `mio` backend never exercises because
    /// it reports level-triggered semantics.
    #[test]
    fn edge_triggered_backend_is_rearmed_after_each_dispatch() {
        let mem = Arc::new(MemBackend::new());
        let boxed: Box<dyn Backend> = Box::new(Arc::clone(&mem));
        let lp = Loop::with_backend(Config::new(), boxed).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = Arc::clone(&count);
        let handler = FdHandler::new(99, EventMask::READ, move || {
            count_cb.fetch_add(1, Ordering::SeqCst);
        });
        handler.start(&lp).unwrap();

        mem.make_ready(99, EventMask::READ);
        lp.poll(0).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(mem.mod_fd_calls(99), 1);

        mem.make_ready(99, EventMask::READ);
        lp.poll(0).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(mem.mod_fd_calls(99), 2);

        handler.stop(&lp).unwrap();
    }
}
