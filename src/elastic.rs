//! Elastic sleeping: parking idle workers and waking them on new work.
//!
//! Each worker owns a binary-semaphore parker and an asleep flag; a global
//! approximate sleeper count lets the push path skip the wake scan entirely
//! while everyone is busy. The wake signal must never be lost, which pins
//! down the ordering on both sides:
//!
//! - a pusher publishes its fiber, fences, then reads the sleeper count;
//! - a sleeper publishes its flag and count, fences, then re-verifies every
//!   work source before it actually descends into the wait.
//!
//! So either the pusher observes the sleeper (and wakes somebody), or the
//! sleeper's verify sweep observes the push. A worker may still be woken to
//! find its prize already taken; it just goes around again.

use std::hint;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crossbeam_utils::CachePadded;

/// How long `park` spins on its permit before the blocking wait.
#[cfg(feature = "elastic-spinsleep")]
const SPIN_ROUNDS: usize = 1 << 14;
#[cfg(not(feature = "elastic-spinsleep"))]
const SPIN_ROUNDS: usize = 0;

/// A binary semaphore: `unpark` stores a permit, `park` consumes one,
/// waiting if none is available yet.
pub(crate) struct Parker {
    permit: AtomicBool,
    m: Mutex<()>,
    v: Condvar,
}

impl Parker {
    fn new() -> Parker {
        Parker {
            permit: AtomicBool::new(false),
            m: Mutex::new(()),
            v: Condvar::new(),
        }
    }

    fn park(&self) {
        for _ in 0..SPIN_ROUNDS {
            if self.permit.swap(false, Ordering::Acquire) {
                return;
            }
            hint::spin_loop();
        }
        let mut guard = self.m.lock().unwrap();
        loop {
            if self.permit.swap(false, Ordering::Acquire) {
                return;
            }
            guard = self.v.wait(guard).unwrap();
        }
    }

    fn unpark(&self) {
        // The store happens under the lock so a parker checking its permit
        // before waiting cannot miss it.
        {
            let _guard = self.m.lock().unwrap();
            self.permit.store(true, Ordering::Release);
        }
        self.v.notify_one();
    }
}

struct SleepSlot {
    asleep: AtomicBool,
    parker: Parker,
}

pub(crate) struct Elastic {
    nb_sleeping: AtomicUsize,
    slots: Box<[CachePadded<SleepSlot>]>,
}

impl Elastic {
    pub(crate) fn new(nb_workers: usize) -> Elastic {
        Elastic {
            nb_sleeping: AtomicUsize::new(0),
            slots: (0..nb_workers)
                .map(|_| {
                    CachePadded::new(SleepSlot {
                        asleep: AtomicBool::new(false),
                        parker: Parker::new(),
                    })
                })
                .collect(),
        }
    }

    /// Called after a fiber has been made visible to thieves. Wakes at most
    /// one sleeper, scanning from a hash of the pusher's identity.
    pub(crate) fn wake_after_push(&self, pusher: usize) {
        fence(Ordering::SeqCst);
        if self.nb_sleeping.load(Ordering::SeqCst) == 0 {
            return;
        }
        let n = self.slots.len();
        let start = hash_index(pusher, n);
        for i in 0..n {
            let slot = &self.slots[(start + i) % n];
            if slot
                .asleep
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                slot.parker.unpark();
                return;
            }
        }
    }

    /// Publish the intent of `worker` to sleep. Must be followed by a
    /// re-verification of every work source and then exactly one of
    /// `cancel` or `park`.
    pub(crate) fn announce(&self, worker: usize) {
        self.slots[worker].asleep.store(true, Ordering::SeqCst);
        self.nb_sleeping.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// The re-verification found work; retract the announcement.
    pub(crate) fn cancel(&self, worker: usize) {
        self.nb_sleeping.fetch_sub(1, Ordering::SeqCst);
        self.slots[worker].asleep.store(false, Ordering::SeqCst);
    }

    /// Block until somebody wakes `worker`.
    pub(crate) fn park(&self, worker: usize) {
        self.slots[worker].parker.park();
        self.nb_sleeping.fetch_sub(1, Ordering::SeqCst);
        self.slots[worker].asleep.store(false, Ordering::SeqCst);
    }

    /// Hand a permit to every worker; used at teardown so nobody stays
    /// parked behind the terminator.
    pub(crate) fn wake_all(&self) {
        for slot in self.slots.iter() {
            slot.asleep.store(false, Ordering::SeqCst);
            slot.parker.unpark();
        }
    }
}

fn hash_index(value: usize, n: usize) -> usize {
    ((value as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) % n as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn permit_survives_early_unpark() {
        let parker = Parker::new();
        parker.unpark();
        // The permit was stored before anyone parked; park must not block.
        parker.park();
    }

    #[test]
    fn park_wakes_across_threads() {
        let elastic = Arc::new(Elastic::new(2));
        let remote = elastic.clone();
        let sleeper = thread::spawn(move || {
            remote.announce(1);
            remote.park(1);
        });
        // Keep poking until the sleeper is visible, then wake it.
        while elastic.nb_sleeping.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        elastic.wake_after_push(0);
        sleeper.join().unwrap();
        assert_eq!(elastic.nb_sleeping.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_retracts_announcement() {
        let elastic = Elastic::new(1);
        elastic.announce(0);
        assert_eq!(elastic.nb_sleeping.load(Ordering::SeqCst), 1);
        elastic.cancel(0);
        assert_eq!(elastic.nb_sleeping.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hash_stays_in_range() {
        for w in 0..64 {
            assert!(hash_index(w, 7) < 7);
        }
    }
}
