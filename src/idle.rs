//! The per-loop idle list.
//!
//! Idles differ from every other kind in one respect: they are never
//! removed from this list by dispatch. They stay armed across passes until
//! `stop()` takes them back out, unlike timers (which disarm themselves)
//! or queued sources (which are consumed on dequeue).

use std::sync::Arc;

use crate::id::Id;
use crate::source::Inner;

#[derive(Default)]
pub(crate) struct IdleList {
    idles: Vec<Arc<Inner>>,
}

impl IdleList {
    pub fn new() -> Self {
        IdleList { idles: Vec::new() }
    }

    pub fn insert(&mut self, source: Arc<Inner>) {
        self.idles.push(source);
    }

    pub fn remove(&mut self, id: Id) {
        self.idles.retain(|s| s.id != id);
    }

    /// Every currently-armed idle, snapshotted so a callback that stops
    /// another idle (or itself) doesn't invalidate this walk — this phase
    /// is a plain iteration, not queue-style draining.
    pub fn snapshot(&self) -> Vec<Arc<Inner>> {
        self.idles.clone()
    }
}
