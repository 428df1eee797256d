//! Bounded dual-mode MPMC transfer queue.
//!
//! A fixed ring of slots, each guarded by a sequence number (Vyukov's
//! bounded MPMC scheme): a producer may fill slot `i` only when its sequence
//! equals the producer index `i`, a consumer may drain it only when the
//! sequence equals `i + 1`, and draining advances the sequence by the
//! capacity for the next lap.
//!
//! The ring holds either producer-side entries (buffered items and parked
//! producers) or parked consumers, never both. An operation that finds the
//! complementary side at the head pops that entry and completes a direct
//! handoff; otherwise it appends its own entry. Every push is validated by
//! the CAS on the producer index and every pop by the CAS on the consumer
//! index, so a decision made on a stale view never takes effect.
//!
//! Closing sets a mark bit in the producer index. Every later tail claim
//! fails its CAS, so once a consumer sees an empty ring with the mark set
//! nothing can be appended behind it.

use arc_swap::ArcSwapOption;
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{self, AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::waiter::{Waiter, Wake};
use super::{PutError, TakeError};
use crate::error::{BusError, Result};

/// Largest accepted capacity.
pub const MAX_CAPACITY: usize = 1 << 30;

/// Longest single wait for free space. Draining a slot wakes waiters
/// directly; this only bounds how long a missed wake-up can stall.
const SPACE_SLICE: Duration = Duration::from_millis(10);

/// Mark bit in the producer index, set by `close`.
const CLOSED: u64 = 1 << 63;

const KIND_DATA: u8 = 0;
const KIND_PRODUCER: u8 = 1;
const KIND_CONSUMER: u8 = 2;

struct Slot<T> {
    sequence: AtomicU64,
    kind: AtomicU8,
    /// Valid while the slot is filled with a `KIND_DATA` entry.
    item: UnsafeCell<MaybeUninit<T>>,
    /// Set while the slot holds a parked party. Readable by anyone, so the
    /// head can be inspected without owning the slot.
    waiter: ArcSwapOption<Waiter<T>>,
}

/// What sits at the consumer index.
enum Head<T> {
    Empty,
    Data,
    Producer(Arc<Waiter<T>>),
    Consumer(Arc<Waiter<T>>),
}

struct Snapshot<T> {
    producer: u64,
    consumer: u64,
    /// Close mark read together with `producer`.
    closed: bool,
    head: Head<T>,
}

/// Producers blocked on a full ring.
#[derive(Default)]
struct SpaceWait {
    waiting: AtomicUsize,
    lock: Mutex<()>,
    available: Condvar,
}

/// Why an operation gave up.
enum Failure {
    Full,
    Empty,
    Closed,
    Timeout,
}

/// Bounded lock-free queue supporting buffered and synchronous handoff.
///
/// `offer`/`poll` never block. `put` blocks for space, `take` blocks for an
/// item, and `transfer` blocks until a consumer has actually received the
/// item. Blocking calls hand over directly to a parked counterpart when one
/// is at the head of the queue.
pub struct TransferQueue<T> {
    /// Next tail position, with `CLOSED` in the top bit.
    producer_index: CachePadded<AtomicU64>,
    consumer_index: CachePadded<AtomicU64>,
    slots: Box<[Slot<T>]>,
    mask: u64,
    /// Mirrors the close mark for parked waiters.
    closed: AtomicBool,
    /// Withdrawn waiters still sitting in the ring. May dip below zero
    /// briefly when a tombstone is discarded before its owner counts it.
    withdrawn: AtomicI64,
    space: SpaceWait,
}

// SAFETY: slot contents are only accessed by the thread that won the index
// CAS for that position; all other shared state is atomic.
unsafe impl<T: Send> Send for TransferQueue<T> {}
unsafe impl<T: Send> Sync for TransferQueue<T> {}

impl<T> TransferQueue<T> {
    /// Create a queue holding up to `capacity` entries, rounded up to the
    /// next power of two.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BusError::InvalidConfig(
                "queue capacity must be greater than zero".into(),
            ));
        }
        if capacity > MAX_CAPACITY {
            return Err(BusError::InvalidConfig(format!(
                "queue capacity {} exceeds maximum {}",
                capacity, MAX_CAPACITY
            )));
        }

        let capacity = capacity.next_power_of_two();
        let slots = (0..capacity as u64)
            .map(|i| Slot {
                sequence: AtomicU64::new(i),
                kind: AtomicU8::new(KIND_DATA),
                item: UnsafeCell::new(MaybeUninit::uninit()),
                waiter: ArcSwapOption::empty(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            producer_index: CachePadded::new(AtomicU64::new(0)),
            consumer_index: CachePadded::new(AtomicU64::new(0)),
            slots,
            mask: capacity as u64 - 1,
            closed: AtomicBool::new(false),
            withdrawn: AtomicI64::new(0),
            space: SpaceWait::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live entries: buffered items plus parked parties.
    /// Withdrawn waiters awaiting removal are not counted.
    pub fn len(&self) -> usize {
        let occupied = self.occupied() as i64;
        let withdrawn = self.withdrawn.load(Ordering::Acquire).max(0);
        (occupied - withdrawn).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the head holds a buffered item or a parked producer.
    /// Withdrawn waiters found at the head are discarded on the way.
    pub fn has_pending_messages(&self) -> bool {
        loop {
            let snapshot = self.snapshot();
            match snapshot.head {
                Head::Producer(ref waiter) if waiter.is_cancelled() => {
                    self.discard_withdrawn(snapshot.consumer, KIND_PRODUCER)
                }
                Head::Consumer(ref waiter) if waiter.is_cancelled() => {
                    self.discard_withdrawn(snapshot.consumer, KIND_CONSUMER)
                }
                Head::Data | Head::Producer(_) => return true,
                Head::Empty | Head::Consumer(_) => return false,
            }
        }
    }

    /// Stop accepting items. Buffered items can still be taken; parked
    /// parties withdraw and report closure. An insert racing with `close`
    /// either lands before it, and is drained, or fails with `Closed`.
    pub fn close(&self) {
        self.producer_index.fetch_or(CLOSED, Ordering::AcqRel);
        self.closed.store(true, Ordering::Release);
        let _guard = self.space.lock.lock();
        self.space.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.producer_index.load(Ordering::Acquire) & CLOSED != 0
    }

    // --- Producer side ---

    /// Insert without blocking. Fails, returning the item, only if the queue
    /// is full or closed.
    pub fn offer(&self, item: T) -> std::result::Result<(), T> {
        self.produce(item, false, None, false)
            .map_err(|(_, item)| item)
    }

    /// Insert, waiting for space if the queue is full.
    pub fn put(&self, item: T) -> std::result::Result<(), PutError<T>> {
        self.produce(item, false, None, true).map_err(put_error)
    }

    pub fn put_timeout(&self, item: T, timeout: Duration) -> std::result::Result<(), PutError<T>> {
        self.produce(item, false, deadline_after(timeout), true)
            .map_err(put_error)
    }

    /// Hand the item to a consumer, waiting until one has received it.
    pub fn transfer(&self, item: T) -> std::result::Result<(), PutError<T>> {
        self.produce(item, true, None, true).map_err(put_error)
    }

    /// Like [`transfer`](Self::transfer), giving the item back if no
    /// consumer received it in time.
    pub fn transfer_timeout(
        &self,
        item: T,
        timeout: Duration,
    ) -> std::result::Result<(), PutError<T>> {
        self.produce(item, true, deadline_after(timeout), true)
            .map_err(put_error)
    }

    // --- Consumer side ---

    /// Remove the head item without blocking. `None` only if no item is
    /// available.
    pub fn poll(&self) -> Option<T> {
        self.consume(None, false).ok()
    }

    /// Remove the head item, waiting for one to arrive. After `close`,
    /// buffered items are still returned before `Closed` is reported.
    pub fn take(&self) -> std::result::Result<T, TakeError> {
        self.consume(None, true).map_err(take_error)
    }

    pub fn take_timeout(&self, timeout: Duration) -> std::result::Result<T, TakeError> {
        self.consume(deadline_after(timeout), true)
            .map_err(take_error)
    }

    fn produce(
        &self,
        mut item: T,
        transfer: bool,
        deadline: Option<Instant>,
        block: bool,
    ) -> std::result::Result<(), (Failure, T)> {
        let backoff = Backoff::new();
        loop {
            if self.is_closed() {
                return Err((Failure::Closed, item));
            }

            let snapshot = self.snapshot();
            match snapshot.head {
                Head::Consumer(_) => {
                    // A consumer is parked at the head: hand over directly.
                    if !self.claim_head(snapshot.consumer, KIND_CONSUMER) {
                        backoff.spin();
                        continue;
                    }
                    if let Some(waiter) = self.drain_waiter(snapshot.consumer) {
                        match waiter.fulfil(item) {
                            Ok(()) => return Ok(()),
                            // Tombstone of a withdrawn consumer.
                            Err(back) => {
                                item = back;
                                self.forget_withdrawn();
                            }
                        }
                    }
                    continue;
                }
                Head::Producer(ref waiter) if waiter.is_cancelled() => {
                    self.discard_withdrawn(snapshot.consumer, KIND_PRODUCER);
                    continue;
                }
                _ => {}
            }

            if snapshot.producer - snapshot.consumer >= self.capacity() as u64 {
                if !block {
                    return Err((Failure::Full, item));
                }
                if expired(deadline) {
                    return Err((Failure::Timeout, item));
                }
                self.wait_for_space(&backoff, deadline);
                continue;
            }

            if !self.claim_tail(snapshot.producer) {
                backoff.spin();
                continue;
            }

            if !transfer {
                self.fill_data(snapshot.producer, item);
                return Ok(());
            }

            let waiter = Arc::new(Waiter::producer(item));
            self.fill_waiter(snapshot.producer, KIND_PRODUCER, Arc::clone(&waiter));
            return match waiter.park(deadline, &self.closed) {
                Wake::Matched => Ok(()),
                Wake::TimedOut => self.withdrawn(&waiter, Failure::Timeout),
                Wake::Closed => self.withdrawn(&waiter, Failure::Closed),
            };
        }
    }

    fn consume(
        &self,
        deadline: Option<Instant>,
        block: bool,
    ) -> std::result::Result<T, Failure> {
        let backoff = Backoff::new();
        loop {
            let snapshot = self.snapshot();
            match snapshot.head {
                Head::Data => {
                    if self.claim_head(snapshot.consumer, KIND_DATA) {
                        return Ok(self.drain_data(snapshot.consumer));
                    }
                    backoff.spin();
                    continue;
                }
                Head::Producer(_) => {
                    if !self.claim_head(snapshot.consumer, KIND_PRODUCER) {
                        backoff.spin();
                        continue;
                    }
                    if let Some(waiter) = self.drain_waiter(snapshot.consumer) {
                        match waiter.claim() {
                            Some(item) => return Ok(item),
                            // Withdrawn producer; its item went back to it.
                            None => self.forget_withdrawn(),
                        }
                    }
                    continue;
                }
                Head::Consumer(ref waiter) if waiter.is_cancelled() => {
                    self.discard_withdrawn(snapshot.consumer, KIND_CONSUMER);
                    continue;
                }
                Head::Empty | Head::Consumer(_) => {}
            }

            // The mark was read with the producer index, so no insert can
            // still land in this ring.
            if snapshot.closed {
                return Err(Failure::Closed);
            }
            if !block {
                return Err(Failure::Empty);
            }
            if expired(deadline) {
                return Err(Failure::Timeout);
            }

            if snapshot.producer - snapshot.consumer >= self.capacity() as u64 {
                self.wait_for_space(&backoff, deadline);
                continue;
            }

            if !self.claim_tail(snapshot.producer) {
                backoff.spin();
                continue;
            }

            let waiter = Arc::new(Waiter::consumer());
            self.fill_waiter(snapshot.producer, KIND_CONSUMER, Arc::clone(&waiter));
            match waiter.park(deadline, &self.closed) {
                Wake::Matched => {
                    if let Some(item) = waiter.take_item() {
                        return Ok(item);
                    }
                }
                Wake::TimedOut => {
                    self.count_withdrawn();
                    return Err(Failure::Timeout);
                }
                Wake::Closed => {
                    self.count_withdrawn();
                    return Err(Failure::Closed);
                }
            }
        }
    }

    // --- Withdrawn waiters ---

    fn withdrawn(
        &self,
        waiter: &Waiter<T>,
        failure: Failure,
    ) -> std::result::Result<(), (Failure, T)> {
        self.count_withdrawn();
        match waiter.take_item() {
            Some(item) => Err((failure, item)),
            // Only a matching consumer empties a producer waiter.
            None => Ok(()),
        }
    }

    /// Record a tombstone left by a waiter that withdrew. A producer blocked
    /// behind it is woken so it can clear the head.
    fn count_withdrawn(&self) {
        self.withdrawn.fetch_add(1, Ordering::AcqRel);
        self.notify_space();
    }

    fn forget_withdrawn(&self) {
        self.withdrawn.fetch_sub(1, Ordering::AcqRel);
    }

    /// Pop the withdrawn waiter at `index`. Losing the claim means another
    /// thread popped it.
    fn discard_withdrawn(&self, index: u64, kind: u8) {
        if self.claim_head(index, kind) {
            self.drain_waiter(index);
            self.forget_withdrawn();
        }
    }

    // --- Space waiting ---

    /// Slots in use, live or withdrawn.
    fn occupied(&self) -> u64 {
        loop {
            let before = self.consumer_index.load(Ordering::Acquire);
            let producer = self.producer_index.load(Ordering::Acquire) & !CLOSED;
            let after = self.consumer_index.load(Ordering::Acquire);
            if before == after {
                return producer.saturating_sub(before);
            }
        }
    }

    /// Spin, then sleep until a slot is drained, the queue closes, or the
    /// deadline passes.
    fn wait_for_space(&self, backoff: &Backoff, deadline: Option<Instant>) {
        if !backoff.is_completed() {
            backoff.snooze();
            return;
        }

        let mut guard = self.space.lock.lock();
        self.space.waiting.fetch_add(1, Ordering::SeqCst);
        // Registered before re-checking, so a drain from here on notifies.
        if self.occupied() >= self.capacity() as u64 && !self.is_closed() {
            let slice = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()).min(SPACE_SLICE),
                None => SPACE_SLICE,
            };
            self.space.available.wait_for(&mut guard, slice);
        }
        self.space.waiting.fetch_sub(1, Ordering::SeqCst);
    }

    fn notify_space(&self) {
        atomic::fence(Ordering::SeqCst);
        if self.space.waiting.load(Ordering::SeqCst) > 0 {
            let _guard = self.space.lock.lock();
            self.space.available.notify_all();
        }
    }

    // --- Slot protocol ---

    fn slot(&self, index: u64) -> &Slot<T> {
        &self.slots[(index & self.mask) as usize]
    }

    /// Consistent view of both indices and the head entry.
    fn snapshot(&self) -> Snapshot<T> {
        let backoff = Backoff::new();
        loop {
            let raw = self.producer_index.load(Ordering::Acquire);
            let producer = raw & !CLOSED;
            let closed = raw & CLOSED != 0;
            let consumer = self.consumer_index.load(Ordering::Acquire);

            if consumer == producer {
                // Double check: empty, with this close mark, at the instant
                // the consumer index was read.
                if self.producer_index.load(Ordering::Acquire) == raw {
                    return Snapshot {
                        producer,
                        consumer,
                        closed,
                        head: Head::Empty,
                    };
                }
            } else if consumer < producer {
                let slot = self.slot(consumer);
                if slot.sequence.load(Ordering::Acquire) == consumer + 1 {
                    let head = match slot.kind.load(Ordering::Acquire) {
                        KIND_DATA => Some(Head::Data),
                        KIND_PRODUCER => slot.waiter.load_full().map(Head::Producer),
                        _ => slot.waiter.load_full().map(Head::Consumer),
                    };
                    // Re-check that the slot was not drained while reading it.
                    if let Some(head) = head {
                        if slot.sequence.load(Ordering::Acquire) == consumer + 1 {
                            return Snapshot {
                                producer,
                                consumer,
                                closed,
                                head,
                            };
                        }
                    }
                }
            }

            // Head is claimed but not yet written, or the view went stale.
            backoff.snooze();
        }
    }

    /// Claim the tail position `index`. On success the caller must fill it.
    /// Fails once the queue is closed, since the mark bit breaks the CAS.
    fn claim_tail(&self, index: u64) -> bool {
        self.slot(index).sequence.load(Ordering::Acquire) == index
            && self
                .producer_index
                .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    /// Claim the head position `index` if it holds an entry of `kind`. On
    /// success the caller must drain it.
    fn claim_head(&self, index: u64, kind: u8) -> bool {
        let slot = self.slot(index);
        slot.sequence.load(Ordering::Acquire) == index + 1
            && slot.kind.load(Ordering::Acquire) == kind
            && self
                .consumer_index
                .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    fn fill_data(&self, index: u64, item: T) {
        let slot = self.slot(index);
        // SAFETY: we won the producer CAS for `index`, so no other thread
        // touches this slot until its sequence is published below.
        unsafe {
            (*slot.item.get()).write(item);
        }
        slot.kind.store(KIND_DATA, Ordering::Relaxed);
        slot.sequence.store(index + 1, Ordering::Release);
    }

    fn fill_waiter(&self, index: u64, kind: u8, waiter: Arc<Waiter<T>>) {
        let slot = self.slot(index);
        slot.waiter.store(Some(waiter));
        slot.kind.store(kind, Ordering::Relaxed);
        slot.sequence.store(index + 1, Ordering::Release);
    }

    fn drain_data(&self, index: u64) -> T {
        let slot = self.slot(index);
        // SAFETY: we won the consumer CAS for `index` and `claim_head`
        // verified the slot holds a written data entry.
        let item = unsafe { (*slot.item.get()).assume_init_read() };
        slot.sequence
            .store(index + self.capacity() as u64, Ordering::Release);
        self.notify_space();
        item
    }

    fn drain_waiter(&self, index: u64) -> Option<Arc<Waiter<T>>> {
        let slot = self.slot(index);
        let waiter = slot.waiter.swap(None);
        slot.sequence
            .store(index + self.capacity() as u64, Ordering::Release);
        self.notify_space();
        waiter
    }
}

impl<T> Drop for TransferQueue<T> {
    fn drop(&mut self) {
        let consumer = *self.consumer_index.get_mut();
        let producer = *self.producer_index.get_mut() & !CLOSED;
        for index in consumer..producer {
            let slot = &mut self.slots[(index & self.mask) as usize];
            if *slot.sequence.get_mut() == index + 1 && *slot.kind.get_mut() == KIND_DATA {
                // SAFETY: filled data entry that was never drained.
                unsafe { slot.item.get_mut().assume_init_drop() };
            }
        }
    }
}

impl<T> fmt::Debug for TransferQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn deadline_after(timeout: Duration) -> Option<Instant> {
    Some(Instant::now() + timeout)
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.map_or(false, |d| Instant::now() >= d)
}

fn put_error<T>((failure, item): (Failure, T)) -> PutError<T> {
    match failure {
        Failure::Closed => PutError::Closed(item),
        Failure::Full | Failure::Empty | Failure::Timeout => PutError::Timeout(item),
    }
}

fn take_error(failure: Failure) -> TakeError {
    match failure {
        Failure::Closed => TakeError::Closed,
        Failure::Full | Failure::Empty | Failure::Timeout => TakeError::Timeout,
    }
}
