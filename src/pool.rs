//! The default worker thread pool.
//!
//! A process-global pool of `N` workers sharing one FIFO queue behind a
//! mutex and condvar — the same shape this codebase already uses for its
//! own `mio` event-loop threads (`std::thread::Builder`, explicit
//! join-on-shutdown), just without the coroutine-scheduling machinery:
//! here a worker runs exactly one `Work` callback per queue entry and goes
//! back to waiting.
//!
//! Process-global per §4.6: every [`crate::loop_::Loop`] that calls
//! [`ThreadPool::require`] shares the same `Arc<ThreadPool>` and the same
//! user count, so a `Work` queued by loop A can be picked up by a worker
//! that last ran a task for loop B. The worker count is fixed by whichever
//! caller first brings the pool up; later `require` calls just bump the
//! user count and hand back the existing pool.

use std::panic;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;

use log::{debug, error, trace, warn};
use nix::sys::signal::{SigSet, Signal};

use crate::id::Id;
use crate::loop_::Loop;
use crate::source::KindData;

/// One unit of queued work: the id of the loop a `Work` source belongs to,
/// and the id of the `Work` source itself. Ids, not references — workers
/// must not hold a raw pointer to an object the dispatch thread might be
/// tearing down.
enum QueueEntry {
    Work { loop_id: Id, work_id: Id },
    Shutdown,
}

struct Shared {
    queue: Mutex<std::collections::VecDeque<QueueEntry>>,
    condvar: Condvar,
}

/// The default off-thread work pool.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    user_count: Mutex<usize>,
}

impl ThreadPool {
    fn new_empty() -> Self {
        ThreadPool {
            shared: Arc::new(Shared {
                queue: Mutex::new(std::collections::VecDeque::new()),
                condvar: Condvar::new(),
            }),
            workers: Mutex::new(Vec::new()),
            user_count: Mutex::new(0),
        }
    }

    /// Acquire a reference to the process-global pool (§4.6), spawning it
    /// on the first call. `n == -1` asks for one worker per available CPU,
    /// mirroring this crate's own default thread-count policy, which
    /// already leans on `num_cpus`. Subsequent calls (from any loop) just
    /// bump the user count and return the pool already running — the
    /// worker count is whatever the first caller asked for.
    pub fn require(n: i64) -> Arc<ThreadPool> {
        let mut slot = global_slot().lock().unwrap();
        let pool = match slot.as_ref() {
            Some(existing) => Arc::clone(existing),
            None => {
                let fresh = ThreadPool::spawn(n);
                *slot = Some(Arc::clone(&fresh));
                fresh
            }
        };
        drop(slot);
        *pool.user_count.lock().unwrap() += 1;
        pool
    }

    fn spawn(n: i64) -> Arc<ThreadPool> {
        let pool = Arc::new(ThreadPool::new_empty());
        let worker_count = if n < 0 { num_cpus::get().max(1) } else { n as usize };
        {
            let mut workers = pool.workers.lock().unwrap();
            for i in 0..worker_count {
                let shared = Arc::clone(&pool.shared);
                let name = format!("reactora-worker-{i}");
                match std::thread::Builder::new().name(name).spawn(move || {
                    worker_main(shared);
                }) {
                    Ok(handle) => workers.push(handle),
                    Err(err) => error!("failed to spawn worker thread {i}: {err}"),
                }
            }
        }
        debug!("thread pool started with {worker_count} workers");
        pool
    }

    /// Enqueue a `Work` source belonging to `loop_id` for execution.
    pub fn enqueue(&self, loop_id: Id, work_id: Id) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(QueueEntry::Work { loop_id, work_id });
        self.shared.condvar.notify_one();
    }

    /// Release one user reference; when the count reaches zero, signal
    /// every worker to exit, join them, and vacate the global slot so a
    /// later `require` respawns a fresh pool instead of reusing a joined
    /// one.
    pub fn release(self: &Arc<Self>) {
        let mut count = self.user_count.lock().unwrap();
        *count -= 1;
        if *count > 0 {
            return;
        }
        drop(count);

        {
            let mut slot = global_slot().lock().unwrap();
            if let Some(current) = slot.as_ref() {
                if Arc::ptr_eq(current, self) {
                    *slot = None;
                }
            }
        }

        let worker_count = self.workers.lock().unwrap().len();
        {
            let mut queue = self.shared.queue.lock().unwrap();
            for _ in 0..worker_count {
                queue.push_back(QueueEntry::Shutdown);
            }
            self.shared.condvar.notify_all();
        }
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        debug!("thread pool shut down");
    }
}

/// The process-wide pool slot every [`ThreadPool::require`] call shares.
fn global_slot() -> &'static Mutex<Option<Arc<ThreadPool>>> {
    static GLOBAL: OnceLock<Mutex<Option<Arc<ThreadPool>>>> = OnceLock::new();
    GLOBAL.get_or_init(|| Mutex::new(None))
}

fn worker_main(shared: Arc<Shared>) {
    // Mask every signal except SIGCHLD for the lifetime of this worker
    // workers run arbitrary user work and must not accidentally
    // become the thread a deliverable signal lands on and races the
    // dispatch thread's `Signal` sources.
    let mut to_block = SigSet::all();
    to_block.remove(Signal::SIGCHLD);
    let _ = nix::sys::signal::pthread_sigmask(
        nix::sys::signal::SigmaskHow::SIG_BLOCK,
        Some(&to_block),
        None,
    );

    loop {
        let entry = {
            let mut queue = shared.queue.lock().unwrap();
            while queue.is_empty() {
                queue = shared.condvar.wait(queue).unwrap();
            }
            queue.pop_front().unwrap()
        };

        let (loop_id, work_id) = match entry {
            QueueEntry::Shutdown => break,
            QueueEntry::Work { loop_id, work_id } => (loop_id, work_id),
        };

        let Some(work_source) = crate::source::upgrade(work_id) else {
            // Finalized before a worker could even start it; nothing to run.
            continue;
        };

        let work_fn = match &work_source.inner().kind_data {
            KindData::Work(data) => data.work_fn.lock().unwrap().take(),
            _ => None,
        };

        if let Some(work_fn) = work_fn {
            trace!("worker running Work({work_id:?})");
            if let Err(panic) = panic::catch_unwind(panic::AssertUnwindSafe(work_fn)) {
                error!("Work({work_id:?}) panicked: {panic:?}");
            }
        }

        match Loop::from_id(loop_id) {
            Some(lp) => crate::loop_::complete_work(&lp, &work_source),
            None => warn!("loop {loop_id:?} vanished before Work({work_id:?}) could complete"),
        }
    }
}
