//! The per-loop timer set.
//!
//! Backed by a binary heap ordered by absolute deadline, with lazy
//! deletion: a `Ticker` rearm or a `stop()` does not walk the heap to
//! remove the stale entry, it just republishes a fresh deadline on the
//! source itself. When the stale entry eventually reaches the front of the
//! heap, [`TimerSet::pop_expired`] notices the deadline recorded on it no
//! longer matches the source's live deadline (or the source is gone) and
//! discards it without firing. This keeps every `start`/rearm O(log n)
//! instead of needing an indexed, removable priority queue.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crate::source::{Inner, KindData};

struct Entry {
    deadline_us: u64,
    source: Weak<Inner>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_us == other.deadline_us
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the `BinaryHeap` (a max-heap) surfaces the smallest
        // deadline first.
        other.deadline_us.cmp(&self.deadline_us)
    }
}

#[derive(Default)]
pub(crate) struct TimerSet {
    heap: BinaryHeap<Entry>,
}

fn timer_data(inner: &Inner) -> Option<&crate::source::TimerData> {
    match &inner.kind_data {
        KindData::Timer(d) | KindData::Ticker(d) => Some(d),
        _ => None,
    }
}

impl TimerSet {
    pub fn new() -> Self {
        TimerSet {
            heap: BinaryHeap::new(),
        }
    }

    /// Arm (or rearm) `source` for `deadline_us`, the loop's monotonic
    /// clock units. Updates the source's own deadline and pushes a fresh
    /// heap entry; any older entry for this source becomes stale and will
    /// be discarded lazily.
    pub fn arm(&mut self, source: &Arc<Inner>, deadline_us: u64) {
        if let Some(data) = timer_data(source) {
            data.deadline_us.store(deadline_us, Ordering::Relaxed);
        }
        self.heap.push(Entry {
            deadline_us,
            source: Arc::downgrade(source),
        });
    }

    /// The smallest deadline still (possibly) armed, without popping it.
    /// Used by the dispatcher to re-arm the backend after a pass.
    pub fn earliest_deadline(&mut self) -> Option<u64> {
        self.discard_stale();
        self.heap.peek().map(|e| e.deadline_us)
    }

    /// Pop every timer whose deadline is `<= now_us`, returning the live
    /// sources that actually fired (stale/dead entries are silently
    /// dropped). Pops are yielded in strictly non-decreasing deadline
    /// order, which is what timer monotonicity requires of this set.
    pub fn pop_expired(&mut self, now_us: u64) -> Vec<Arc<Inner>> {
        let mut fired = Vec::new();
        loop {
            match self.heap.peek() {
                Some(top) if top.deadline_us <= now_us => {
                    let entry = self.heap.pop().unwrap();
                    let Some(source) = entry.source.upgrade() else {
                        continue; // source finalized since arming; discard
                    };
                    let Some(data) = timer_data(&source) else {
                        continue;
                    };
                    if data.deadline_us.load(Ordering::Relaxed) != entry.deadline_us {
                        continue; // superseded by a later rearm; discard
                    }
                    fired.push(source);
                }
                _ => break,
            }
        }
        fired
    }

    fn discard_stale(&mut self) {
        while let Some(top) = self.heap.peek() {
            let stale = match top.source.upgrade() {
                None => true,
                Some(source) => timer_data(&source)
                    .map(|d| d.deadline_us.load(Ordering::Relaxed) != top.deadline_us)
                    .unwrap_or(true),
            };
            if stale {
                self.heap.pop();
            } else {
                break;
            }
        }
    }
}
