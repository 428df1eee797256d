//! Parties parked in the queue waiting for a direct handoff.

use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

const WAITING: u8 = 0;
const MATCHED: u8 = 1;
const CANCELLED: u8 = 2;

/// Longest single park. Bounds how late a waiter notices queue closure.
const PARK_SLICE: Duration = Duration::from_millis(10);

/// Why a parked waiter returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Matched,
    /// Deadline passed and the waiter withdrew.
    TimedOut,
    /// Queue closed and the waiter withdrew.
    Closed,
}

/// A parked producer (carrying its item) or consumer.
///
/// State moves `WAITING -> MATCHED` by the counterpart or
/// `WAITING -> CANCELLED` by the owner, exactly once. A cancelled waiter left
/// in the ring is a tombstone that the next party to reach it discards.
pub(crate) struct Waiter<T> {
    state: AtomicU8,
    item: Mutex<Option<T>>,
    thread: Thread,
}

impl<T> Waiter<T> {
    /// Waiter for the calling thread with nothing to hand over.
    pub(crate) fn consumer() -> Self {
        Self {
            state: AtomicU8::new(WAITING),
            item: Mutex::new(None),
            thread: thread::current(),
        }
    }

    /// Waiter for the calling thread offering `item`.
    pub(crate) fn producer(item: T) -> Self {
        Self {
            state: AtomicU8::new(WAITING),
            item: Mutex::new(Some(item)),
            thread: thread::current(),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Hand `item` to a waiting consumer. Gives it back if the consumer
    /// already withdrew.
    pub(crate) fn fulfil(&self, item: T) -> Result<(), T> {
        let mut slot = self.item.lock();
        if self
            .state
            .compare_exchange(WAITING, MATCHED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(item);
        }
        *slot = Some(item);
        drop(slot);
        self.thread.unpark();
        Ok(())
    }

    /// Take the item from a waiting producer. `None` if it withdrew.
    pub(crate) fn claim(&self) -> Option<T> {
        self.state
            .compare_exchange(WAITING, MATCHED, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let item = self.item.lock().take();
        self.thread.unpark();
        item
    }

    pub(crate) fn take_item(&self) -> Option<T> {
        self.item.lock().take()
    }

    fn withdraw(&self) -> bool {
        self.state
            .compare_exchange(WAITING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Block the owning thread until matched.
    ///
    /// Spins briefly, then parks in slices so that the deadline and queue
    /// closure are observed. A match that wins the race against withdrawal
    /// is reported as `Matched` even if the deadline has passed.
    pub(crate) fn park(&self, deadline: Option<Instant>, closed: &AtomicBool) -> Wake {
        let backoff = Backoff::new();
        loop {
            if self.state.load(Ordering::Acquire) == MATCHED {
                return Wake::Matched;
            }

            let reason = if closed.load(Ordering::Acquire) {
                Some(Wake::Closed)
            } else if deadline.map_or(false, |d| Instant::now() >= d) {
                Some(Wake::TimedOut)
            } else {
                None
            };

            if let Some(reason) = reason {
                return if self.withdraw() { reason } else { Wake::Matched };
            }

            if !backoff.is_completed() {
                backoff.snooze();
                continue;
            }

            let slice = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()).min(PARK_SLICE),
                None => PARK_SLICE,
            };
            thread::park_timeout(slice);
        }
    }
}
