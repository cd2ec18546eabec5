//! The global object registry.
//!
//! Every [`crate::source::Inner`] is assigned a stable, process-lifetime id
//! on construction. Worker threads and signal handlers cannot safely hold a
//! raw `Arc` to a source the dispatch thread might be dropping concurrently,
//! so they hold the id instead and call [`try_upgrade`] to get a strong
//! reference on demand.
//!
//! The registry lock is a spinlock rather than an OS mutex: the critical
//! sections here are a handful of instructions (map insert/remove/lookup
//! plus a refcount bump) and some callers are worker threads racing loop
//! teardown, where a fair, potentially-sleeping mutex buys nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use spin::Mutex;

use crate::source::Inner;

/// Stable 64-bit handle to a live (or once-live) source.
///
/// Ids are assigned monotonically and never reused for the life of the
/// process. `0` is reserved to mean "no id" and is never handed out by
/// [`Registry::assign`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Id(u64);

impl Id {
    /// The reserved "no id" sentinel.
    pub const NONE: Id = Id(0);
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({})", self.0)
    }
}

struct Registry {
    next_id: AtomicU64,
    table: Mutex<HashMap<Id, std::sync::Weak<Inner>>>,
}

impl Registry {
    fn new() -> Self {
        Registry {
            // Start at 1: 0 is the reserved "no id" sentinel.
            next_id: AtomicU64::new(1),
            table: Mutex::new(HashMap::new()),
        }
    }
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

/// Reserve a fresh, never-reused id. The caller constructs its `Arc<Inner>`
/// using this id and then calls [`register`] to publish it.
pub(crate) fn next_id() -> Id {
    Id(registry().next_id.fetch_add(1, Ordering::Relaxed))
}

/// Publish `src` under `id` in the global table.
///
/// Called exactly once, from the typed `new` constructors in
/// [`crate::source`], right after the `Arc<Inner>` carrying `id` is built.
pub(crate) fn register(id: Id, src: &Arc<Inner>) {
    registry().table.lock().insert(id, Arc::downgrade(src));
}

/// Remove `id`'s entry from the global table.
///
/// Called from `Inner`'s `Drop` impl, which only runs once the last `Arc`
/// strong reference is gone — otherwise a concurrent [`try_upgrade`] could
/// resurrect an id whose source is being finalized.
pub(crate) fn drop_id(id: Id) {
    registry().table.lock().remove(&id);
}

/// Attempt to upgrade a weak `id` to a strong reference.
///
/// Returns `None` if the source has already been finalized. Never returns a
/// dangling reference: the lookup, the liveness check, and the refcount
/// bump all happen while holding the registry lock.
pub fn try_upgrade(id: Id) -> Option<Arc<Inner>> {
    let table = registry().table.lock();
    table.get(&id).and_then(std::sync::Weak::upgrade)
}
