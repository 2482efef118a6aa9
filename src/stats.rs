//! Per-worker event counters, reduced at the end of a launch.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// One worker's slot. Increments are relaxed: the counters feed a report,
/// not the scheduling protocol.
pub(crate) struct WorkerStats {
    pub(crate) nb_fibers: AtomicU64,
    pub(crate) nb_steals: AtomicU64,
    pub(crate) nb_sleeps: AtomicU64,
}

impl WorkerStats {
    fn new() -> WorkerStats {
        WorkerStats {
            nb_fibers: AtomicU64::new(0),
            nb_steals: AtomicU64::new(0),
            nb_sleeps: AtomicU64::new(0),
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

pub(crate) struct Stats {
    slots: Box<[CachePadded<WorkerStats>]>,
}

impl Stats {
    pub(crate) fn new(nb_workers: usize) -> Stats {
        Stats {
            slots: (0..nb_workers)
                .map(|_| CachePadded::new(WorkerStats::new()))
                .collect(),
        }
    }

    pub(crate) fn worker(&self, index: usize) -> &WorkerStats {
        &self.slots[index]
    }

    pub(crate) fn reduce(&self) -> Counters {
        let mut total = Counters::default();
        for slot in self.slots.iter() {
            total.nb_fibers += slot.nb_fibers.load(Ordering::Relaxed);
            total.nb_steals += slot.nb_steals.load(Ordering::Relaxed);
            total.nb_sleeps += slot.nb_sleeps.load(Ordering::Relaxed);
        }
        total
    }
}

/// Totals over all workers for one launch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    /// Fibers created by `fork2` (two per call).
    pub nb_fibers: u64,
    /// Successful steals from a victim's deque.
    pub nb_steals: u64,
    /// Descents into the parker wait.
    pub nb_sleeps: u64,
}
