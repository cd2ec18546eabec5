//! The signal-safe event queue.
//!
//! `emit` is callable from three contexts: the dispatch thread, worker
//! threads, and asynchronous signal handlers. The queue lock is a spinlock
//! (not an OS mutex — a signal handler must never risk blocking on a lock
//! the interrupted thread itself holds) and every enqueue brackets itself
//! with a full signal mask so a *second* signal delivered mid-enqueue can't
//! reenter this code on the same thread and deadlock against itself.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};
use spin::Mutex;

use crate::source::{EventMask, FdData, Inner, KindData};

/// Initial/minimum spare capacity kept in the queue's backing `VecDeque`.
/// Chosen generously relative to typical source counts so that ordinary
/// workloads never make `emit`'s `push_back` reallocate.
const MIN_SPARE_CAPACITY: usize = 256;

pub(crate) struct EventQueue {
    inner: Mutex<VecDeque<Arc<Inner>>>,
}

impl Default for EventQueue {
    fn default() -> Self {
        EventQueue::new()
    }
}

/// Block every blockable signal on the calling thread for the duration of
/// `f`, restoring the previous mask afterwards. Used to bracket the
/// enqueue/dequeue critical sections, both here and in
/// [`crate::backend::mio_backend`]'s signal table.
pub(crate) fn with_all_signals_blocked<R>(f: impl FnOnce() -> R) -> R {
    let full = SigSet::all();
    let mut prior = SigSet::empty();
    let masked = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&full), Some(&mut prior)).is_ok();
    let result = f();
    if masked {
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&prior), None);
    }
    result
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            inner: Mutex::new(VecDeque::with_capacity(MIN_SPARE_CAPACITY)),
        }
    }

    /// Mark `source` as having a pending invocation, enqueuing it if it
    /// isn't already queued.
    ///
    /// Safe to call from a signal handler: the only operations on that
    /// path are an atomic fetch-or (for `FdHandler`s) or an atomic
    /// compare-exchange (for everything else), followed by a bounded
    /// spinlock critical section. `push_back` itself performs no
    /// allocation as long as the queue has spare capacity, which is
    /// reserved up front and topped up only from [`EventQueue::pop`] (the
    /// dispatch thread) — never from this path — so growth never happens
    /// while a signal handler might be the one calling `emit`.
    pub fn emit(&self, source: &Arc<Inner>, revents: EventMask) {
        if let KindData::FdHandler(FdData { pending, .. }) = &source.kind_data {
            let prior = pending.fetch_or(revents.bits(), Ordering::AcqRel);
            if prior != 0 {
                // Already queued: the dispatcher will observe the OR'd
                // bits when it clears the mask. Nothing else to do.
                return;
            }
        } else {
            let already_queued = source
                .queued
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err();
            if already_queued {
                return;
            }
        }

        with_all_signals_blocked(|| {
            self.inner.lock().push_back(Arc::clone(source));
        });
    }

    /// Pop the head of the queue, if any. The returned `Arc` carries the
    /// reference `emit` added; the dispatcher is responsible for dropping
    /// it once the callback returns (emitting a source adds one reference,
    /// released by the dispatcher once it has run the callback).
    ///
    /// Also the only place the backing `VecDeque`'s capacity grows: this
    /// always runs on the dispatch thread, so topping up spare capacity
    /// here keeps `emit`'s `push_back` alloc-free.
    pub fn pop(&self) -> Option<Arc<Inner>> {
        with_all_signals_blocked(|| {
            let mut guard = self.inner.lock();
            let popped = guard.pop_front();
            if guard.capacity() - guard.len() < MIN_SPARE_CAPACITY / 2 {
                guard.reserve(MIN_SPARE_CAPACITY);
            }
            popped
        })
    }
}

/// Reset the coalescing flag a source was enqueued under, called once its
/// callback has run (or it is being dropped unprocessed at teardown).
pub(crate) fn clear_queued_flag(source: &Arc<Inner>) {
    match &source.kind_data {
        KindData::FdHandler(FdData { pending, .. }) => {
            pending.store(0, Ordering::Release);
        }
        _ => {
            source.queued.store(false, Ordering::Release);
        }
    }
}
