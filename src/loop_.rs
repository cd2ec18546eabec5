//! The loop façade and dispatcher (§4.2, §4.3, §4.4, §6).
//!
//! [`LoopCore`] owns everything a running loop needs — the backend, the
//! timer set, the idle list, the event queue, the started-sources table
//! that keeps every armed source's `Inner` alive — and is itself wrapped
//! in a [`crate::source::Inner`] tagged [`crate::source::SourceKind::Loop`],
//! so a loop can be looked up by [`Id`] exactly like any other source
//! (`Loop::from_id`, used by worker threads in [`crate::pool`] to find
//! their way back to the loop a `Work` source belongs to without holding
//! a raw reference across the thread boundary).
//!
//! [`Loop`] is the thin public handle: an `Arc<Inner>` (for id/lookup) plus
//! an `Arc<LoopCore>` (for everything else). Dispatch is the three-phase
//! pass described in §4.4: timers, then the event queue, then idles.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use nix::fcntl::OFlag;
use nix::unistd;
use spin::Mutex as SpinMutex;

use crate::backend::mio_backend::MioBackend;
use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::id::Id;
use crate::idle::IdleList;
use crate::pool::ThreadPool;
use crate::queue::{self, EventQueue};
use crate::source::{EventMask, FdHandler, Inner, KindData, Source};
use crate::timerset::TimerSet;

/// Ambient configuration for a [`Loop`] (§6): no file or environment
/// parsing, just the two knobs the worker pool needs before it exists.
#[derive(Clone, Debug)]
pub struct Config {
    worker_threads: i64,
    eager_workers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            // -1 mirrors `ThreadPool::require`'s own "one per CPU" default.
            worker_threads: -1,
            eager_workers: false,
        }
    }
}

impl Config {
    /// Start from the default policy (one worker per CPU, spawned lazily
    /// on the first `Work` source started).
    pub fn new() -> Self {
        Config::default()
    }

    /// Fix the worker pool at exactly `n` threads (`-1` for one per CPU).
    pub fn set_worker_threads(mut self, n: i64) -> Self {
        self.worker_threads = n;
        self
    }

    /// Spawn the worker pool eagerly in [`Loop::new`] instead of waiting
    /// for the first `Work` source to start.
    pub fn set_eager_workers(mut self, eager: bool) -> Self {
        self.eager_workers = eager;
        self
    }
}

/// The self-pipe a loop builds for itself when its backend reports
/// `supports_interrupt() == false` (§4.3). The shipped [`MioBackend`]
/// always supports interrupt natively, so this path exists for whatever
/// backend gets plugged in next, not for anything in this crate today.
struct SelfPipeFallback {
    write_fd: RawFd,
    // Keeps the dummy `FdHandler`'s `Inner` (and thus its backend
    // registration) alive for the loop's lifetime.
    _handler: FdHandler,
}

impl Drop for SelfPipeFallback {
    fn drop(&mut self) {
        // `pipe2`'s fds were `mem::forget`-ed past their `OwnedFd` wrappers
        // in `Loop::with_backend` so the backend's own `del_fd` wouldn't
        // race an early close; closing both ends here is this fallback's
        // half of §4.3's "closes the self-pipe as a side effect of the
        // internal handler's payload release".
        let read_fd = self._handler.get_fd();
        let _ = unistd::close(read_fd);
        let _ = unistd::close(self.write_fd);
    }
}

fn nudge_pipe(fd: RawFd) {
    loop {
        match unistd::write(fd, &[1u8]) {
            Ok(_) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            _ => break,
        }
    }
}

/// Shared state behind every [`Loop`] handle (§4.2).
pub(crate) struct LoopCore {
    backend: Box<dyn Backend>,
    queue: Arc<EventQueue>,
    timers: SpinMutex<TimerSet>,
    idles: SpinMutex<IdleList>,
    /// Sources currently started on this loop, keyed by id. Holding the
    /// `Arc<Inner>` here is the loop's half of §3's "create, start, drop
    /// the creation reference" idiom — once a caller drops their own
    /// reference, this is what keeps a started source alive.
    started: SpinMutex<HashMap<Id, Arc<Inner>>>,
    running: AtomicBool,
    pool: SpinMutex<Option<Arc<ThreadPool>>>,
    config: Config,
    self_pipe: Option<SelfPipeFallback>,
}

impl Drop for LoopCore {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.lock().take() {
            pool.release();
        }
    }
}

impl LoopCore {
    fn recompute_deadline(&self) {
        let deadline = self.timers.lock().earliest_deadline();
        self.backend.set_deadline(deadline);
    }

    fn ensure_pool(&self) -> Arc<ThreadPool> {
        let mut slot = self.pool.lock();
        if let Some(existing) = slot.as_ref() {
            return Arc::clone(existing);
        }
        let pool = ThreadPool::require(self.config.worker_threads);
        *slot = Some(Arc::clone(&pool));
        pool
    }

    fn finalize_one_shot(&self, inner: &Arc<Inner>) {
        inner.registration.lock().unwrap().loop_weak = None;
        self.started.lock().remove(&inner.id);
    }

    fn dispatch_timers(&self) {
        let now = monotonic_now_us();
        let fired = self.timers.lock().pop_expired(now);
        for inner in fired {
            crate::source::invoke_callback(&inner);
            match &inner.kind_data {
                KindData::Ticker(data) => {
                    // §4.4: re-arm as `deadline += duration`, not
                    // `now + duration` — a ticker that falls behind (a
                    // slow dispatch pass, a long-running callback) catches
                    // up on the next pass instead of silently losing the
                    // time debt.
                    let duration = *data.duration_us.lock().unwrap();
                    let prior_deadline = data.deadline_us.load(Ordering::Relaxed);
                    self.timers.lock().arm(&inner, prior_deadline + duration);
                }
                KindData::Timer(_) => self.finalize_one_shot(&inner),
                _ => {}
            }
        }
    }

    fn dispatch_queue(&self) {
        while let Some(inner) = self.queue.pop() {
            // §4.4 phase 2 order: run the callback first so `get_revents`
            // still reports the bits that woke it, then clear the pending
            // mask once it returns.
            crate::source::invoke_callback(&inner);
            queue::clear_queued_flag(&inner);
            match &inner.kind_data {
                KindData::FdHandler(fd_data) => {
                    // Edge-triggered backends only report a fd once per
                    // edge; re-arm it so the next readiness transition is
                    // observed (§4.4, §4.7 `Capabilities::edge_triggered`).
                    if self.backend.capabilities().edge_triggered {
                        let mask = *fd_data.requested.lock().unwrap();
                        let _ = self.backend.mod_fd(fd_data.fd, mask, &inner);
                    }
                }
                KindData::Work(_) => self.finalize_one_shot(&inner),
                _ => {}
            }
        }
    }

    fn dispatch_idles(&self) {
        for inner in self.idles.lock().snapshot() {
            crate::source::invoke_callback(&inner);
        }
    }
}

/// The loop's monotonic clock (§4.7's "a clock identifier, monotonic
/// preferred"), shared by timer arming and the backend's deadline math.
pub(crate) fn monotonic_now_us() -> u64 {
    static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(std::time::Instant::now);
    std::time::Instant::now().saturating_duration_since(epoch).as_micros() as u64
}

/// A handle to a running (or not-yet-started) event loop (§3, §6).
///
/// Cheap to clone: both fields are `Arc`s. A loop is itself a source (see
/// [`crate::source::SourceKind::Loop`]) so it can be found again by id
/// from a worker thread via [`Loop::from_id`].
#[derive(Clone)]
pub struct Loop {
    pub(crate) inner: Arc<Inner>,
    pub(crate) core: Arc<LoopCore>,
}

impl Loop {
    /// Build a new loop on the default [`MioBackend`], per `config`.
    pub fn new(config: Config) -> Result<Loop> {
        let queue = Arc::new(EventQueue::new());
        let backend: Box<dyn Backend> = Box::new(MioBackend::new(Arc::clone(&queue))?);
        Loop::with_backend(config, backend)
    }

    /// Build a new loop on an arbitrary [`Backend`] implementation,
    /// matching §4.7's promise that the dispatcher never special-cases
    /// [`MioBackend`].
    pub fn with_backend(config: Config, backend: Box<dyn Backend>) -> Result<Loop> {
        let queue = Arc::new(EventQueue::new());

        let self_pipe = if !backend.supports_interrupt() {
            let (read, write) =
                unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(|e| Error::Io(e.into()))?;
            let read_fd = read.as_raw_fd();
            let write_fd = write.as_raw_fd();
            std::mem::forget(read);
            std::mem::forget(write);
            let handler = FdHandler::new(read_fd, EventMask::READ, move || {
                let mut buf = [0u8; 64];
                loop {
                    match unistd::read(read_fd, &mut buf) {
                        Ok(0) => break,
                        Ok(n) if n < buf.len() => break,
                        Ok(_) => continue,
                        Err(_) => break,
                    }
                }
            });
            backend.add_fd(read_fd, EventMask::READ, handler.inner())?;
            Some(SelfPipeFallback {
                write_fd,
                _handler: handler,
            })
        } else {
            None
        };

        let core = Arc::new(LoopCore {
            backend,
            queue,
            timers: SpinMutex::new(TimerSet::new()),
            idles: SpinMutex::new(IdleList::new()),
            started: SpinMutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            pool: SpinMutex::new(None),
            config: config.clone(),
            self_pipe,
        });

        let inner = crate::source::new_loop_source(Arc::clone(&core));

        if config.eager_workers {
            core.ensure_pool();
        }

        Ok(Loop { inner, core })
    }

    /// This loop's stable id, the same id [`Loop::from_id`] resolves.
    pub fn id(&self) -> Id {
        self.inner.id
    }

    /// Look a loop back up by id — used by worker threads completing
    /// `Work` sources (§4.6), which hold only an [`Id`], never a
    /// reference, across the thread boundary.
    pub fn from_id(id: Id) -> Option<Loop> {
        let inner = crate::id::try_upgrade(id)?;
        match &inner.kind_data {
            KindData::Loop(core) => Some(Loop {
                inner,
                core: Arc::clone(core),
            }),
            _ => None,
        }
    }

    /// Publish this loop as the process default, retrievable with
    /// [`Loop::get_default`] (§6). Only an id is stashed, not a strong
    /// reference: a default loop that is otherwise unreferenced still
    /// finalizes normally.
    pub fn set_default(&self) {
        *default_slot().lock() = Some(self.inner.id);
    }

    /// Retrieve the loop published by [`Loop::set_default`], if it is
    /// still alive.
    pub fn get_default() -> Option<Loop> {
        let id = (*default_slot().lock())?;
        Loop::from_id(id)
    }

    /// A descriptor suitable for embedding this loop's readiness
    /// aggregation into a foreign loop, if the backend supports one
    /// (§4.7).
    pub fn get_fd(&self) -> Option<RawFd> {
        self.core.backend.get_fd()
    }

    /// Eagerly spawn the worker pool if it is not already running
    /// (§6). A no-op once a pool already exists.
    pub fn require_workers(&self) {
        self.core.ensure_pool();
    }

    /// Run one blocking pass: wait up to `timeout_us` microseconds (or
    /// indefinitely if negative, bounded by whatever timer is armed) for
    /// readiness, then dispatch everything that is ready. Returns the
    /// number of backend-level readiness events observed (not the number
    /// of callbacks run — a coalesced `FdHandler` counts once either
    /// way).
    pub fn poll(&self, timeout_us: i64) -> Result<usize> {
        let observed = self.core.backend.poll(timeout_us, &self.core.queue)?;
        self.dispatch();
        Ok(observed)
    }

    /// Run the three dispatch phases — timers, queue, idles — against
    /// whatever is already ready or queued, without blocking in the
    /// backend (§4.4). Useful for pumping work enqueued from elsewhere
    /// (e.g. [`complete_work`]) without waiting for the next `poll`.
    pub fn dispatch(&self) {
        self.core.dispatch_timers();
        self.core.dispatch_queue();
        self.core.dispatch_idles();
        self.core.recompute_deadline();
        self.core.backend.post_dispatch();
    }

    /// Run until [`Loop::exit`] is called from a callback or another
    /// thread.
    pub fn run(&self) {
        self.core.running.store(true, Ordering::Release);
        while self.core.running.load(Ordering::Acquire) {
            if let Err(err) = self.poll(-1) {
                log::error!("loop {:?}: poll failed: {err}", self.inner.id);
                break;
            }
        }
    }

    /// Ask a running [`Loop::run`] to stop after its current pass, and
    /// unblock a poll in progress so that happens promptly.
    pub fn exit(&self) {
        self.core.running.store(false, Ordering::Release);
        self.core.backend.exit();
        if !self.core.backend.supports_interrupt() {
            if let Some(fallback) = &self.core.self_pipe {
                nudge_pipe(fallback.write_fd);
            }
        }
    }

    /// Unblock a poll currently in progress (or about to start) from
    /// another thread, without asking the loop to stop (§4.3).
    pub fn interrupt(&self) {
        self.core.backend.interrupt();
        if !self.core.backend.supports_interrupt() {
            if let Some(fallback) = &self.core.self_pipe {
                nudge_pipe(fallback.write_fd);
            }
        }
    }
}

fn default_slot() -> &'static SpinMutex<Option<Id>> {
    static DEFAULT_LOOP: OnceLock<SpinMutex<Option<Id>>> = OnceLock::new();
    DEFAULT_LOOP.get_or_init(|| SpinMutex::new(None))
}

/// Start `source` on `loop_` (§4.2). Fails with [`Error::AlreadyStarted`]
/// if it is already started on some loop.
pub(crate) fn start_source(loop_: &Loop, source: &Source) -> Result<()> {
    let inner = source.inner();
    let mut reg = inner.registration.lock().unwrap();
    let already = reg
        .loop_weak
        .as_ref()
        .and_then(Weak::upgrade)
        .is_some();
    if already {
        return Err(Error::AlreadyStarted { id: inner.id });
    }

    match &inner.kind_data {
        KindData::FdHandler(fd_data) => {
            let mask = *fd_data.requested.lock().unwrap();
            loop_.core.backend.add_fd(fd_data.fd, mask, inner)?;
        }
        KindData::Timer(data) | KindData::Ticker(data) => {
            let duration = *data.duration_us.lock().unwrap();
            let now = monotonic_now_us();
            loop_.core.timers.lock().arm(inner, now + duration);
            loop_.core.recompute_deadline();
        }
        KindData::Signal(data) => {
            loop_.core.backend.add_signal(data.signo, inner)?;
        }
        KindData::Work(_) => {
            let pool = loop_.core.ensure_pool();
            pool.enqueue(loop_.id(), inner.id);
        }
        KindData::Idle => {
            loop_.core.idles.lock().insert(Arc::clone(inner));
        }
        KindData::Loop(_) => unreachable!("a loop's own source is never started"),
    }

    reg.loop_weak = Some(Arc::downgrade(&loop_.core));
    drop(reg);
    loop_.core.started.lock().insert(inner.id, Arc::clone(inner));
    Ok(())
}

/// Stop `source`, idempotently (§4.2): stopping an already-stopped source
/// is not an error.
pub(crate) fn stop_source(loop_: &Loop, source: &Source) -> Result<()> {
    let inner = source.inner();
    let mut reg = inner.registration.lock().unwrap();
    if reg.loop_weak.as_ref().and_then(Weak::upgrade).is_none() {
        return Ok(());
    }

    match &inner.kind_data {
        KindData::FdHandler(fd_data) => {
            let _ = loop_.core.backend.del_fd(fd_data.fd);
        }
        KindData::Timer(data) | KindData::Ticker(data) => {
            // Lazy deletion (§4.4, see `crate::timerset`): bumping the
            // live deadline past anything a heap entry could hold marks
            // every entry for this source stale without walking the heap.
            data.deadline_us.store(u64::MAX, std::sync::atomic::Ordering::Relaxed);
        }
        KindData::Signal(data) => {
            let _ = loop_.core.backend.del_signal(data.signo);
        }
        KindData::Work(_) => {
            // §9's resolved Open Question: `stop` only prevents a *future*
            // emit. Work already handed to a pool worker keeps running and
            // its `done` callback still fires — there is no cooperative
            // cancellation of in-flight work in this crate.
        }
        KindData::Idle => {
            loop_.core.idles.lock().remove(inner.id);
        }
        KindData::Loop(_) => unreachable!("a loop's own source is never started"),
    }

    reg.loop_weak = None;
    drop(reg);
    loop_.core.started.lock().remove(&inner.id);
    loop_.core.recompute_deadline();
    Ok(())
}

/// Re-apply an `FdHandler`'s requested mask to the backend immediately,
/// if it is currently started (§6's `set_event_mask`). A no-op if it
/// isn't started yet — the new mask simply takes effect on the next
/// `start`.
pub(crate) fn reregister_fd(inner: &Arc<Inner>) -> Result<()> {
    let core = {
        let reg = inner.registration.lock().unwrap();
        reg.loop_weak.as_ref().and_then(Weak::upgrade)
    };
    let Some(core) = core else {
        return Ok(());
    };
    if let KindData::FdHandler(fd_data) = &inner.kind_data {
        let mask = *fd_data.requested.lock().unwrap();
        core.backend.mod_fd(fd_data.fd, mask, inner)?;
    }
    Ok(())
}

/// Called by a pool worker (§4.6) once a `Work` source's off-thread
/// function has returned: queue its `done` callback for the next dispatch
/// pass and nudge the loop in case it is currently blocked in `poll`.
pub(crate) fn complete_work(lp: &Loop, work_source: &Source) {
    lp.core.queue.emit(work_source.inner(), EventMask::NONE);
    lp.core.backend.interrupt();
}
