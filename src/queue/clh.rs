//! CLH queue policy.
//!
//! An implicit linked list: each arriving thread exchanges itself into the
//! shared tail and spins on the `locked` flag of the node it displaced. The
//! flag is cleared by the predecessor as soon as the predecessor is admitted,
//! so at most one queued thread at a time is bidding against the caller's
//! `try_acquire` closure and queued threads are admitted in arrival order.
//!
//! Back links double as spin targets and as the path for the release-time
//! successor walk; forward links exist so cancellation can splice a timed-out
//! or interrupted waiter back out without breaking either traversal.
//!
//! Node records migrate between threads instead of belonging to one thread
//! forever: an admitted thread leaves its record in the queue as its
//! successor's gate and takes over its predecessor's record, which nothing
//! references once the admission happened. The thread's next acquisition
//! reuses the taken-over record, so a record is never reset while a waiter
//! can still reach it through a link.

use core::cell::RefCell;
use core::ptr::null_mut;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::cfg::atomic::{AtomicBool, AtomicPtr, AtomicUsize};
use crate::cfg::hint;
use crate::cfg::sync;
use crate::cfg::thread::{current, Thread};
use crate::error::LockError;
use crate::wait::{check_interrupt, WaitStrategy};

use super::{next_instance_id, QueuePolicy};

/// One wait record. Handed from thread to thread by [`ClhQueue::recycle`].
struct ClhNode {
    /// The spin target. Redirected by a cancelling predecessor, so the gate
    /// loop re-reads it on every iteration.
    prev: AtomicPtr<ClhNode>,
    /// Forward link for the successor walk on release.
    next: AtomicPtr<ClhNode>,
    /// True from enqueue until the using thread has been admitted.
    locked: AtomicBool,
    /// Unpark handle of the thread currently using this record; refreshed at
    /// every enqueue because records change hands.
    thread: sync::Mutex<Thread>,
}

impl ClhNode {
    fn new() -> Self {
        Self {
            prev: AtomicPtr::new(null_mut()),
            next: AtomicPtr::new(null_mut()),
            locked: AtomicBool::new(true),
            thread: sync::Mutex::new(current()),
        }
    }
}

#[cfg(not(all(loom, test)))]
std::thread_local! {
    static NODES: RefCell<HashMap<u64, *const ClhNode>> = RefCell::new(HashMap::new());
}

#[cfg(all(loom, test))]
loom::thread_local! {
    static NODES: RefCell<HashMap<u64, *const ClhNode>> = RefCell::new(HashMap::new());
}

/// FIFO admission through an implicit linked list (Craig / Magnussen, Landin
/// and Hagersten).
///
/// See the [module docs](self) and [`QueuePolicy`] for the contract.
pub struct ClhQueue {
    id: u64,
    tail: AtomicPtr<ClhNode>,
    /// Pins every node handed out for this queue until the queue drops.
    nodes: sync::Mutex<Vec<Box<ClhNode>>>,
    /// Upper bound for the successor walk.
    registered: AtomicUsize,
    /// Serializes cancellations, so concurrent splices cannot observe each
    /// other's half-updated links. Never held while parked.
    unlink: sync::Mutex<()>,
}

impl ClhQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            id: next_instance_id(),
            tail: AtomicPtr::new(null_mut()),
            nodes: sync::Mutex::new(Vec::new()),
            registered: AtomicUsize::new(0),
            unlink: sync::Mutex::new(()),
        }
    }

    /// Allocates a node pinned to this queue's registry.
    fn register_node(&self) -> *const ClhNode {
        let node = Box::new(ClhNode::new());
        let ptr: *const ClhNode = &*node;
        sync::lock(&self.nodes).push(node);
        self.registered.fetch_add(1, Relaxed);
        ptr
    }

    /// Returns the calling thread's node for this queue, creating and
    /// registering it on first use.
    fn local_node(&self) -> &ClhNode {
        let ptr = NODES.with(|cache| {
            let mut cache = cache.borrow_mut();
            if let Some(&ptr) = cache.get(&self.id) {
                return ptr;
            }
            let ptr = self.register_node();
            cache.insert(self.id, ptr);
            ptr
        });
        // SAFETY: The pointer was taken from a boxed node owned by this
        // queue's registry, which is append-only and lives as long as
        // `self`. Queue ids are never reused, so the cache cannot return a
        // pointer registered to some other (possibly dropped) queue.
        unsafe { &*ptr }
    }

    /// Takes over the predecessor's record after an admission.
    ///
    /// The calling thread's own record stays in the queue as the successor's
    /// gate; the predecessor's record has no remaining referent once its
    /// successor is admitted (the gate loop saw it finish, and any
    /// cancellation that could redirect a link to it completed before the
    /// gate opened), so it becomes the thread's record for the next
    /// acquisition. An admission with no predecessor takes a fresh record
    /// instead.
    fn recycle(&self, node: &ClhNode) {
        let pred = node.prev.swap(null_mut(), AcqRel);
        let slot = if pred.is_null() { self.register_node() } else { pred as *const ClhNode };
        NODES.with(|cache| {
            cache.borrow_mut().insert(self.id, slot);
        });
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
        let node_ptr = node as *const ClhNode as *mut ClhNode;
        node.locked.store(true, Relaxed);
        node.prev.store(null_mut(), Relaxed);
        node.next.store(null_mut(), Relaxed);
        *sync::lock(&node.thread) = current();

        let pred = self.tail.swap(node_ptr, AcqRel);
        if !pred.is_null() {
            node.prev.store(pred, Release);
            // SAFETY: Every non-null pointer ever stored in `tail` refers to
            // a registry-pinned node of this queue; see `register_node`.
            unsafe { (*pred).next.store(node_ptr, Release) };
            loop {
                let gate = node.prev.load(Acquire);
                if gate.is_null() {
                    break;
                }
                // SAFETY: `prev` only ever holds registry-pinned nodes;
                // cancellation redirects it but never to foreign memory.
                if !unsafe { (*gate).locked.load(Acquire) } {
                    break;
                }
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

        self.recycle(node);
        node.locked.store(false, Release);
        Ok(true)
    }

    /// Unlinks a timed-out or interrupted waiter: back the tail off or
    /// splice the node out of both link directions, then open its gate.
    ///
    /// Cancellations run one at a time under `unlink`, so each one sees the
    /// chain with no other splice in flight; the spliced-to neighbors are
    /// then stable, because the predecessor's record is only taken over by
    /// an admission of this node's position and the successor is still
    /// gate-waiting on this node. When the tail has moved past the node, a
    /// successor exists and its link lands within a few instructions; the
    /// loop waits that out so the successor is never left pointing at a
    /// record this thread will reuse. The node's own flag is cleared last so
    /// that a successor which still targets it falls through its gate; such
    /// a successor only reaches the `try_acquire` retry loop, which remains
    /// the sole authority on ownership.
    fn cancel(&self, node: &ClhNode) {
        let _unlink = sync::lock(&self.unlink);
        let node_ptr = node as *const ClhNode as *mut ClhNode;
        let prev = node.prev.load(Acquire);
        loop {
            if self.tail.compare_exchange(node_ptr, prev, AcqRel, Acquire).is_ok() {
                // The node was still the tail: no successor exists.
                if !prev.is_null() {
                    // SAFETY: Registry-pinned node, see `register_node`.
                    unsafe { (*prev).next.store(null_mut(), Release) };
                }
                break;
            }
            let next = node.next.load(Acquire);
            if !next.is_null() {
                // SAFETY: Registry-pinned nodes, see `register_node`.
                unsafe {
                    (*next).prev.store(prev, Release);
                    if !prev.is_null() {
                        (*prev).next.store(next, Release);
                    }
                }
                break;
            }
            hint::spin_loop();
        }
        node.prev.store(null_mut(), Release);
        node.next.store(null_mut(), Release);
        node.locked.store(false, Release);
    }
}

impl Default for ClhQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ClhQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClhQueue")
            .field("id", &self.id)
            .field("idle", &self.tail.load(Relaxed).is_null())
            .finish()
    }
}

impl QueuePolicy for ClhQueue {
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

    /// Walks back from the tail to the head-most linked node and unparks
    /// that node's successor.
    ///
    /// Enqueues, cancellations and admissions all run concurrently with
    /// the walk, so the walk is bounded by the number of records ever
    /// registered and gives up rather than chase a chain that keeps
    /// changing underneath it. Waiters never depend on this wakeup.
    fn unpark_successor(&self) {
        let tail = self.tail.load(Acquire);
        if tail.is_null() {
            return;
        }
        let mut head = tail;
        let mut hops = self.registered.load(Relaxed);
        loop {
            // SAFETY: Back links only ever hold registry-pinned nodes.
            let prev = unsafe { (*head).prev.load(Acquire) };
            if prev.is_null() {
                break;
            }
            if hops == 0 {
                return;
            }
            hops -= 1;
            head = prev;
        }
        // SAFETY: Registry-pinned node, see `register_node`.
        let succ = unsafe { (*head).next.load(Acquire) };
        if !succ.is_null() {
            // SAFETY: Registry-pinned node; the handle mutex is only ever
            // held for the read or the enqueue-time refresh.
            unsafe { sync::lock(&(*succ).thread).unpark() };
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::test::ORDERING_GAP;
    use crate::{clh, LockError};

    // Four threads arrive in a known order while the lock is held; under a
    // fair lock they must be admitted in exactly that order.
    #[test]
    fn fair_admission_is_fifo() {
        let lock = Arc::new(clh::parks::ReentrantLock::new(true));
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
            // Give the thread time to reach the tail exchange before the
            // next one starts.
            thread::sleep(ORDERING_GAP);
        }
        lock.unlock().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert!(!lock.is_locked());
    }

    // Two threads re-acquiring a fair lock in a tight loop force constant
    // record recycling; admission must never wedge on a reused record.
    #[test]
    fn fair_reacquire_alternation_makes_progress() {
        let lock = Arc::new(clh::parks::ReentrantLock::new(true));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..2000 {
                    lock.lock();
                    lock.unlock().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn timed_out_waiter_leaves_queue_usable() {
        let lock = Arc::new(clh::parks::ReentrantLock::new(true));

        lock.lock();
        let contender = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.try_lock_for(Duration::from_millis(10)).unwrap())
        };
        assert!(!contender.join().unwrap());
        lock.unlock().unwrap();

        // The cancelled node must not wedge later acquisitions.
        let late = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.lock();
                lock.unlock().unwrap();
            })
        };
        late.join().unwrap();
        assert!(!lock.is_locked());
    }

    // A burst of expiring timed waiters splices records in and out while the
    // lock is held; afterwards every thread must still get through.
    #[test]
    fn cancellation_storm_keeps_queue_live() {
        let lock = Arc::new(clh::parks::ReentrantLock::new(true));
        let (held_tx, held_rx) = channel();

        let holder = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.lock();
                held_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(40));
                lock.unlock().unwrap();
            })
        };
        held_rx.recv().unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..8 {
                    let _ = lock.try_lock_for(Duration::from_millis(1)).unwrap();
                    if lock.is_held_by_current_thread() {
                        lock.unlock().unwrap();
                    }
                }
                lock.lock();
                lock.unlock().unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        holder.join().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn interrupted_waiter_leaves_queue_consistent() {
        let lock = Arc::new(clh::parks::ReentrantLock::new(true));
        let (tx, rx) = channel();

        lock.lock();
        let queued = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                tx.send(crate::interrupt::handle()).unwrap();
                lock.lock_interruptibly()
            })
        };
        let handle = rx.recv().unwrap();
        thread::sleep(ORDERING_GAP);
        handle.interrupt();
        assert_eq!(queued.join().unwrap(), Err(LockError::Interrupted));

        // The holder can release and the queue admits a new thread.
        lock.unlock().unwrap();
        let late = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.lock();
                lock.unlock().unwrap();
            })
        };
        late.join().unwrap();
    }

    #[test]
    fn contended_counter_is_exact() {
        const THREADS: u64 = 4;
        const ITERS: u64 = 500;

        let lock = Arc::new(clh::spins::ReentrantLock::new(false));
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
    }
}
