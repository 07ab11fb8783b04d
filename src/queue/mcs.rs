//! MCS queue policy.
//!
//! An explicit linked list: each arriving thread exchanges itself into the
//! shared tail, links itself behind the node it displaced, and spins on its
//! *own* `locked` flag. The flag is cleared by the predecessor when the
//! predecessor hands the queue over (on its final release, or when it
//! cancels), so each waiter's spin traffic stays on its own cache line,
//! which is what makes the policy attractive on NUMA machines.
//!
//! The lock's release path performs the explicit handoff: it clears the head
//! successor's flag and unparks it. An owner that claimed a free lock
//! without queueing has no queue position to hand over; for that case the
//! release path falls back to unparking whatever node is at the tail, purely
//! as a wakeup aid.

use core::cell::RefCell;
use core::ptr::null_mut;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::cfg::atomic::{AtomicBool, AtomicPtr};
use crate::cfg::hint;
use crate::cfg::sync;
use crate::cfg::thread::{current, Thread};
use crate::error::LockError;
use crate::wait::{check_interrupt, WaitStrategy};

use super::{next_instance_id, QueuePolicy};

/// One thread's wait record, reused across acquisitions of the same queue.
struct McsNode {
    /// Forward link, published by the successor after the tail exchange.
    next: AtomicPtr<McsNode>,
    /// The local spin target. Cleared by the predecessor's handoff.
    locked: AtomicBool,
    /// Unpark handle of the thread this node belongs to.
    thread: Thread,
    /// Whether the current ownership epoch went through the queue. Read and
    /// written only by the node's own thread.
    enqueued: AtomicBool,
}

impl McsNode {
    fn new() -> Self {
        Self {
            next: AtomicPtr::new(null_mut()),
            locked: AtomicBool::new(true),
            thread: current(),
            enqueued: AtomicBool::new(false),
        }
    }
}

#[cfg(not(all(loom, test)))]
std::thread_local! {
    static NODES: RefCell<HashMap<u64, *const McsNode>> = RefCell::new(HashMap::new());
}

#[cfg(all(loom, test))]
loom::thread_local! {
    static NODES: RefCell<HashMap<u64, *const McsNode>> = RefCell::new(HashMap::new());
}

/// FIFO admission through an explicit linked list (Mellor-Crummey and
/// Scott).
///
/// See the [module docs](self) and [`QueuePolicy`] for the contract.
pub struct McsQueue {
    id: u64,
    tail: AtomicPtr<McsNode>,
    /// Pins every node handed out for this queue until the queue drops.
    nodes: sync::Mutex<Vec<Box<McsNode>>>,
}

impl McsQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            id: next_instance_id(),
            tail: AtomicPtr::new(null_mut()),
            nodes: sync::Mutex::new(Vec::new()),
        }
    }

    /// Returns the calling thread's node for this queue, creating and
    /// registering it on first use.
    fn local_node(&self) -> &McsNode {
        let ptr = NODES.with(|cache| {
            let mut cache = cache.borrow_mut();
            if let Some(&ptr) = cache.get(&self.id) {
                return ptr;
            }
            let node = Box::new(McsNode::new());
            let ptr: *const McsNode = &*node;
            sync::lock(&self.nodes).push(node);
            cache.insert(self.id, ptr);
            ptr
        });
        // SAFETY: The pointer was taken from a boxed node owned by this
        // queue's registry, which is append-only and lives as long as
        // `self`. Queue ids are never reused, so the cache cannot return a
        // pointer registered to some other (possibly dropped) queue.
        unsafe { &*ptr }
    }

    fn acquire<F, W>(
        &self,
        mut try_acquire: F,
        wait: &W,
        deadline: Option<Instant>,
    ) -> Result<bool, LockError>
    where
        F: FnMut() -> bool,
        W: WaitStrategy,
    {
        let node = self.local_node();
        let node_ptr = node as *const McsNode as *mut McsNode;
        node.locked.store(true, Relaxed);
        node.next.store(null_mut(), Relaxed);

        let pred = self.tail.swap(node_ptr, AcqRel);
        node.enqueued.store(true, Relaxed);
        if !pred.is_null() {
            // SAFETY: Every non-null pointer ever stored in `tail` refers to
            // a registry-pinned node of this queue; see `local_node`.
            unsafe { (*pred).next.store(node_ptr, Release) };
            while node.locked.load(Acquire) {
                if deadline.is_some_and(|deadline| Instant::now() > deadline) {
                    self.cancel(node);
                    return Ok(false);
                }
                if let Err(err) = wait.wait() {
                    self.cancel(node);
                    return Err(err);
                }
            }
        }

        while !try_acquire() {
            if deadline.is_some_and(|deadline| Instant::now() > deadline) {
                self.cancel(node);
                return Ok(false);
            }
            if let Err(err) = check_interrupt() {
                self.cancel(node);
                return Err(err);
            }
            hint::spin_loop();
        }

        // Hygiene before reuse; no other thread reads the flag again this
        // epoch.
        node.locked.store(false, Release);
        Ok(true)
    }

    /// Unlinks a timed-out or interrupted waiter.
    ///
    /// With no successor, backing the tail off to empty suffices. With a
    /// successor present or mid-link, the gate is passed on: the successor's
    /// flag is cleared so it cannot be stranded waiting for a handoff this
    /// node will never perform. An early-admitted successor only reaches the
    /// `try_acquire` retry loop, which remains the sole authority on
    /// ownership.
    fn cancel(&self, node: &McsNode) {
        let node_ptr = node as *const McsNode as *mut McsNode;
        node.enqueued.store(false, Relaxed);
        if self.tail.compare_exchange(node_ptr, null_mut(), AcqRel, Acquire).is_ok() {
            node.next.store(null_mut(), Release);
            return;
        }
        let mut succ = node.next.load(Acquire);
        while succ.is_null() {
            // The successor has swapped the tail but not yet published its
            // link; it is one store away.
            hint::spin_loop();
            succ = node.next.load(Acquire);
        }
        // SAFETY: Registry-pinned node, see `local_node`.
        unsafe {
            (*succ).locked.store(false, Release);
            (*succ).thread.unpark();
        }
        node.next.store(null_mut(), Release);
    }

    #[cfg(all(not(loom), test))]
    pub(crate) fn is_quiescent(&self) -> bool {
        self.tail.load(Acquire).is_null()
    }
}

impl Default for McsQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for McsQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("McsQueue")
            .field("id", &self.id)
            .field("idle", &self.tail.load(Relaxed).is_null())
            .finish()
    }
}

impl QueuePolicy for McsQueue {
    fn enqueue_and_acquire<F, W>(&self, try_acquire: F, wait: &W) -> Result<(), LockError>
    where
        F: FnMut() -> bool,
        W: WaitStrategy,
    {
        self.acquire(try_acquire, wait, None).map(|_| ())
    }

    fn enqueue_and_acquire_timed<F, W>(
        &self,
        try_acquire: F,
        timeout: Duration,
        wait: &W,
    ) -> Result<bool, LockError>
    where
        F: FnMut() -> bool,
        W: WaitStrategy,
    {
        // A timeout too large to resolve against the clock cannot expire.
        let deadline = Instant::now().checked_add(timeout);
        self.acquire(try_acquire, wait, deadline)
    }

    /// Performs the queue handoff for an owner whose acquisition went
    /// through the queue: clear the head successor's flag and unpark it, or
    /// swing the tail back to empty when no successor arrived. A fast-path
    /// owner never held a queue position, so its release merely unparks the
    /// tail as a wakeup aid.
    fn unpark_successor(&self) {
        let node = self.local_node();
        let node_ptr = node as *const McsNode as *mut McsNode;
        if !node.enqueued.load(Relaxed) {
            let tail = self.tail.load(Acquire);
            if !tail.is_null() {
                // SAFETY: Registry-pinned node, see `local_node`.
                unsafe { (*tail).thread.unpark() };
            }
            return;
        }
        node.enqueued.store(false, Relaxed);
        let mut succ = node.next.load(Acquire);
        if succ.is_null() {
            if self.tail.compare_exchange(node_ptr, null_mut(), AcqRel, Acquire).is_ok() {
                return;
            }
            // A successor has swapped the tail but not yet published its
            // link; it is one store away.
            while succ.is_null() {
                hint::spin_loop();
                succ = node.next.load(Acquire);
            }
        }
        // SAFETY: Registry-pinned node, see `local_node`.
        unsafe {
            (*succ).locked.store(false, Release);
            (*succ).thread.unpark();
        }
        node.next.store(null_mut(), Release);
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::test::ORDERING_GAP;
    use crate::{mcs, McsQueue};

    // Eight threads hammering the lock: the counter must come out exact and
    // the queue must return to its empty state.
    #[test]
    fn contention_storm_settles() {
        const THREADS: u64 = 8;
        const ITERS: u64 = 1000;

        let lock = Arc::new(mcs::parks::ReentrantLock::new(true));
        let counter = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..ITERS {
                    lock.lock();
                    let value = counter.load(Relaxed);
                    counter.store(value + 1, Relaxed);
                    lock.unlock().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Relaxed), THREADS * ITERS);
        assert!(!lock.is_locked());
        assert!(lock.queue_ref().is_quiescent());
    }

    #[test]
    fn fair_admission_is_fifo() {
        let lock = Arc::new(mcs::parks::ReentrantLock::new(true));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        lock.lock();
        let mut handles = Vec::new();
        for waiter in 0..4 {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                lock.lock();
                order.lock().unwrap().push(waiter);
                lock.unlock().unwrap();
            }));
            thread::sleep(ORDERING_GAP);
        }
        lock.unlock().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn timed_out_tail_resets_queue() {
        let lock = Arc::new(mcs::parks::ReentrantLock::new(true));

        lock.lock();
        let contender = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.try_lock_for(Duration::from_millis(10)).unwrap())
        };
        assert!(!contender.join().unwrap());
        lock.unlock().unwrap();
        assert!(lock.queue_ref().is_quiescent());

        lock.lock();
        lock.unlock().unwrap();
    }

    #[test]
    fn queue_starts_quiescent() {
        let queue = McsQueue::new();
        assert!(queue.is_quiescent());
    }
}
