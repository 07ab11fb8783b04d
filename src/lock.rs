use core::fmt;
use core::sync::atomic::Ordering::{AcqRel, Relaxed, Release};
use std::time::Duration;

use crate::cfg::atomic::{AtomicU32, AtomicU64};
use crate::condition::Condition;
use crate::error::LockError;
use crate::interrupt;
use crate::queue::{next_instance_id, ClhQueue, QueuePolicy};
use crate::thread_id;
use crate::wait::{SpinThenPark, WaitStrategy};

/// A reentrant mutual-exclusion lock over a pluggable queue policy `Q` and
/// wait strategy `W`.
///
/// The lock word is a pair: an atomic `owner` holding the owning thread's
/// identity (or nothing) and a hold counter that tracks reentrant
/// acquisitions by that owner. Contended acquisitions go through `Q`, which
/// admits threads in arrival order; `W` paces them while they wait. See the
/// [crate docs](crate) for the available policies and the preset modules.
///
/// Unlike `std::sync::Mutex` this lock protects no data and returns no
/// guard: callers bracket their critical sections with explicit
/// [`lock`]/[`unlock`] pairs, which is what makes reentrancy and the
/// condition-variable protocol (release N holds, reacquire N holds)
/// expressible.
///
/// # Fairness
///
/// A lock created with `fair == true` sends every contending thread through
/// the queue, so acquisition order equals arrival order. With
/// `fair == false` an arriving thread first tries to claim a momentarily
/// free owner word, even when the queue is non-empty (*barging*); once a
/// thread is enqueued it can no longer be overtaken by other queued threads.
///
/// # Example
///
/// ```
/// use reqlock::mcs;
///
/// let lock = mcs::parks::ReentrantLock::new(true);
///
/// lock.lock();
/// assert!(lock.is_held_by_current_thread());
/// lock.unlock().unwrap();
/// ```
///
/// [`lock`]: ReentrantLock::lock
/// [`unlock`]: ReentrantLock::unlock
pub struct ReentrantLock<Q = ClhQueue, W = SpinThenPark> {
    /// Identity of the owning thread; 0 means unowned. The sole indicator
    /// of ownership.
    owner: AtomicU64,
    /// Reentrant hold count. Written only by the owning thread, read by
    /// anyone; meaningful only while `owner` is non-zero.
    holds: AtomicU32,
    fair: bool,
    queue: Q,
    wait: W,
    /// Process-unique identity, used to bind conditions to this lock.
    id: u64,
}

impl<Q: QueuePolicy + Default, W: WaitStrategy + Default> ReentrantLock<Q, W> {
    /// Creates an unowned lock with default-configured queue and strategy.
    pub fn new(fair: bool) -> Self {
        Self::with_strategy(fair, W::default())
    }
}

impl<Q: QueuePolicy + Default, W: WaitStrategy> ReentrantLock<Q, W> {
    /// Creates an unowned lock pacing waiters with `wait`.
    pub fn with_strategy(fair: bool, wait: W) -> Self {
        Self {
            owner: AtomicU64::new(0),
            holds: AtomicU32::new(0),
            fair,
            queue: Q::default(),
            wait,
            id: next_instance_id(),
        }
    }
}

impl<Q: QueuePolicy + Default, W: WaitStrategy + Default> Default for ReentrantLock<Q, W> {
    /// A fair lock, matching the preset configurations.
    fn default() -> Self {
        Self::new(true)
    }
}

impl<Q: QueuePolicy, W: WaitStrategy> ReentrantLock<Q, W> {
    /// Acquires the lock, blocking until it is held.
    ///
    /// Reentrant: an owner acquires again immediately, incrementing its hold
    /// count. Not interruptible: an interruption observed while queued is
    /// absorbed and the thread's cancellation flag re-raised before this
    /// returns, so the caller always holds the lock afterwards.
    #[inline]
    pub fn lock(&self) {
        let me = thread_id::current();
        if self.owner.load(Relaxed) == me {
            self.relock();
            return;
        }
        if !self.fair && self.claim(me) {
            return;
        }
        let mut interrupted = false;
        loop {
            match self.queue.enqueue_and_acquire(|| self.try_acquire_once(me), &self.wait) {
                Ok(()) => break,
                Err(_) => interrupted = true,
            }
        }
        if interrupted {
            interrupt::raise();
        }
    }

    /// Acquires the lock unless the calling thread is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Interrupted`] if the cancellation flag is
    /// observed while waiting; the lock is not acquired and the flag is
    /// cleared.
    #[inline]
    pub fn lock_interruptibly(&self) -> Result<(), LockError> {
        let me = thread_id::current();
        if self.owner.load(Relaxed) == me {
            self.relock();
            return Ok(());
        }
        if !self.fair && self.claim(me) {
            return Ok(());
        }
        self.queue.enqueue_and_acquire(|| self.try_acquire_once(me), &self.wait)
    }

    /// Acquires the lock only if that is possible without waiting.
    ///
    /// Reentry always succeeds; otherwise a single claim of a free owner
    /// word is attempted, regardless of fairness. Never consults the queue.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.try_acquire_once(thread_id::current())
    }

    /// Acquires the lock, giving up after `timeout`.
    ///
    /// The fast paths (reentry, single claim) run first; only then does the
    /// thread enqueue with a deadline. Returns `Ok(false)` if the deadline
    /// passed before the lock could be claimed; in that case at least
    /// `timeout` has elapsed since entry.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Interrupted`] if the cancellation flag is
    /// observed while waiting.
    #[inline]
    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool, LockError> {
        let me = thread_id::current();
        if self.try_acquire_once(me) {
            return Ok(true);
        }
        self.queue
            .enqueue_and_acquire_timed(|| self.try_acquire_once(me), timeout, &self.wait)
    }

    /// Releases one hold.
    ///
    /// Dropping the last hold clears the owner word and wakes a queued
    /// successor.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotOwner`] if the calling thread does not hold
    /// the lock; the lock state is unchanged.
    #[inline]
    pub fn unlock(&self) -> Result<(), LockError> {
        let me = thread_id::current();
        if self.owner.load(Relaxed) != me {
            return Err(LockError::NotOwner);
        }
        let holds = self.holds.load(Relaxed);
        if holds > 1 {
            self.holds.store(holds - 1, Relaxed);
            return Ok(());
        }
        // Publish the zeroed count strictly before the owner clear: the
        // release store orders both ahead of any successor's claim.
        self.holds.store(0, Relaxed);
        self.owner.store(0, Release);
        self.queue.unpark_successor();
        Ok(())
    }

    /// Creates a fresh condition variable bound to this lock.
    pub fn new_condition(&self) -> Condition {
        Condition::bind(self.id)
    }

    /// Returns whether any thread holds the lock. Snapshot semantics.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.owner.load(Relaxed) != 0
    }

    /// Returns whether the calling thread holds the lock.
    #[inline]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Relaxed) == thread_id::current()
    }

    /// Returns the calling thread's hold count, or 0 if it does not hold
    /// the lock.
    #[inline]
    pub fn hold_count(&self) -> u32 {
        if self.is_held_by_current_thread() {
            self.holds.load(Relaxed)
        } else {
            0
        }
    }

    /// Returns whether this lock admits strictly in arrival order.
    #[inline]
    pub fn is_fair(&self) -> bool {
        self.fair
    }

    /// The single test-and-claim primitive behind every acquisition path:
    /// reentrant bump if `me` already owns, else one claim of a free owner
    /// word. Idempotent across spurious retries.
    #[inline(always)]
    fn try_acquire_once(&self, me: u64) -> bool {
        if self.owner.load(Relaxed) == me {
            self.relock();
            return true;
        }
        self.claim(me)
    }

    #[inline(always)]
    fn claim(&self, me: u64) -> bool {
        if self.owner.compare_exchange(0, me, AcqRel, Relaxed).is_ok() {
            self.holds.store(1, Relaxed);
            return true;
        }
        false
    }

    #[inline(always)]
    fn relock(&self) {
        let holds = self.holds.load(Relaxed);
        self.holds.store(holds + 1, Relaxed);
    }

    #[inline(always)]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[cfg(all(not(loom), test))]
    pub(crate) fn queue_ref(&self) -> &Q {
        &self.queue
    }
}

impl<Q, W> fmt::Debug for ReentrantLock<Q, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = self.owner.load(Relaxed);
        f.debug_struct("ReentrantLock")
            .field("owner", &owner)
            .field("holds", &self.holds.load(Relaxed))
            .field("fair", &self.fair)
            .finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use proptest::collection::vec;
    use proptest::{prop_assert, prop_assert_eq, proptest};

    use crate::test::ORDERING_GAP;
    use crate::{clh, interrupt, mcs, LockError};

    #[test]
    fn reentry_balances() {
        let lock = clh::parks::ReentrantLock::new(true);
        lock.lock();
        lock.lock();
        assert_eq!(lock.hold_count(), 2);
        lock.unlock().unwrap();
        assert_eq!(lock.hold_count(), 1);
        lock.unlock().unwrap();
        assert!(!lock.is_locked());
        assert_eq!(lock.hold_count(), 0);
    }

    #[test]
    fn unlock_without_hold_is_rejected() {
        let lock = clh::spins::ReentrantLock::new(false);
        assert_eq!(lock.unlock(), Err(LockError::NotOwner));
        lock.lock();
        lock.unlock().unwrap();
        assert_eq!(lock.unlock(), Err(LockError::NotOwner));
    }

    #[test]
    fn unlock_from_stranger_thread_is_rejected() {
        let lock = Arc::new(mcs::parks::ReentrantLock::new(true));
        lock.lock();
        let stranger = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.unlock())
        };
        assert_eq!(stranger.join().unwrap(), Err(LockError::NotOwner));
        assert!(lock.is_locked());
        lock.unlock().unwrap();
    }

    #[test]
    fn try_lock_reflects_ownership() {
        let lock = Arc::new(clh::parks::ReentrantLock::new(true));
        lock.lock();
        // Reentrant try_lock succeeds for the owner.
        assert!(lock.try_lock());
        assert_eq!(lock.hold_count(), 2);

        let contender = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.try_lock())
        };
        assert!(!contender.join().unwrap());

        lock.unlock().unwrap();
        lock.unlock().unwrap();
    }

    #[test]
    fn timed_acquire_times_out_then_succeeds() {
        let lock = Arc::new(clh::parks::ReentrantLock::new(true));
        let (held_tx, held_rx) = channel();

        let holder = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.lock();
                held_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                lock.unlock().unwrap();
            })
        };
        held_rx.recv().unwrap();

        let started = Instant::now();
        assert!(!lock.try_lock_for(Duration::from_millis(10)).unwrap());
        assert!(started.elapsed() >= Duration::from_millis(10));

        assert!(lock.try_lock_for(Duration::from_millis(1000)).unwrap());
        lock.unlock().unwrap();
        holder.join().unwrap();
    }

    #[test]
    fn queued_interruptible_acquire_is_cancellable() {
        let lock = Arc::new(clh::parks::ReentrantLock::new(true));
        let (tx, rx) = channel();

        lock.lock();
        let queued = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                tx.send(interrupt::handle()).unwrap();
                let result = lock.lock_interruptibly();
                (result, lock.is_held_by_current_thread())
            })
        };
        let handle = rx.recv().unwrap();
        thread::sleep(ORDERING_GAP);
        handle.interrupt();

        let (result, held) = queued.join().unwrap();
        assert_eq!(result, Err(LockError::Interrupted));
        assert!(!held);

        // The queue survived the cancellation.
        lock.unlock().unwrap();
        lock.lock();
        lock.unlock().unwrap();
    }

    // The longest representable timeout must neither panic nor expire; the
    // waiter stays cancellable the whole time.
    fn huge_timeout_is_interruptible<Q>()
    where
        Q: crate::QueuePolicy + Default + 'static,
    {
        let lock = Arc::new(crate::ReentrantLock::<Q, crate::SpinThenPark>::new(true));
        let (tx, rx) = channel();

        lock.lock();
        let queued = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                tx.send(interrupt::handle()).unwrap();
                lock.try_lock_for(Duration::MAX)
            })
        };
        let handle = rx.recv().unwrap();
        thread::sleep(ORDERING_GAP);
        handle.interrupt();

        assert_eq!(queued.join().unwrap(), Err(LockError::Interrupted));
        lock.unlock().unwrap();
    }

    #[test]
    fn huge_timeout_is_interruptible_clh() {
        huge_timeout_is_interruptible::<crate::ClhQueue>();
    }

    #[test]
    fn huge_timeout_is_interruptible_mcs() {
        huge_timeout_is_interruptible::<crate::McsQueue>();
    }

    #[test]
    fn plain_lock_defers_interruption() {
        let lock = Arc::new(mcs::parks::ReentrantLock::new(true));
        let (tx, rx) = channel();

        lock.lock();
        let queued = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                tx.send(interrupt::handle()).unwrap();
                lock.lock();
                let pending = interrupt::is_interrupted();
                let cleared = interrupt::interrupted();
                lock.unlock().unwrap();
                (pending, cleared)
            })
        };
        let handle = rx.recv().unwrap();
        thread::sleep(ORDERING_GAP);
        handle.interrupt();
        thread::sleep(ORDERING_GAP);
        lock.unlock().unwrap();

        let (pending, cleared) = queued.join().unwrap();
        assert!(pending, "absorbed interruption must be re-raised");
        assert!(cleared);
    }

    #[test]
    fn barging_claims_free_lock() {
        let lock = clh::spins::ReentrantLock::new(false);
        assert!(!lock.is_fair());
        lock.lock();
        assert_eq!(lock.hold_count(), 1);
        lock.unlock().unwrap();
    }

    proptest! {
        // Balanced nesting always restores the pre-acquire state, whatever
        // the depth sequence.
        #[test]
        fn nesting_balance(depths in vec(1..16u32, 1..8)) {
            let lock = clh::spins::ReentrantLock::new(false);
            for &depth in &depths {
                for _ in 0..depth {
                    lock.lock();
                }
                prop_assert!(lock.is_locked());
                prop_assert!(lock.is_held_by_current_thread());
                prop_assert_eq!(lock.hold_count(), depth);
                for _ in 0..depth {
                    prop_assert!(lock.unlock().is_ok());
                }
                prop_assert!(!lock.is_locked());
                prop_assert_eq!(lock.hold_count(), 0);
            }
        }

        // hold_count > 0 iff some thread owns the lock, at every step of a
        // single-threaded trace.
        #[test]
        fn holds_and_owner_are_coupled(depth in 1..32u32) {
            let lock = mcs::parks::ReentrantLock::new(true);
            prop_assert_eq!(lock.hold_count(), 0);
            prop_assert!(!lock.is_locked());
            for level in 1..=depth {
                lock.lock();
                prop_assert_eq!(lock.hold_count(), level);
                prop_assert!(lock.is_locked());
            }
            for level in (0..depth).rev() {
                prop_assert!(lock.unlock().is_ok());
                prop_assert_eq!(lock.hold_count(), level);
                prop_assert_eq!(lock.is_locked(), level > 0);
            }
        }
    }
}
