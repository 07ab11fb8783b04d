use core::sync::atomic::Ordering::{Acquire, Release};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cfg::atomic::AtomicBool;
use crate::cfg::sync;
use crate::cfg::thread::{current, park, park_timeout, Thread};
use crate::error::LockError;
use crate::interrupt;
use crate::lock::ReentrantLock;
use crate::queue::QueuePolicy;
use crate::wait::WaitStrategy;

/// How long each bounded park lasts while waiting with a deadline or
/// reacquiring the lock.
const REACQUIRE_PARK: Duration = Duration::from_millis(1);

/// One parked caller.
struct Waiter {
    thread: Thread,
    signalled: AtomicBool,
}

impl Waiter {
    fn new() -> Self {
        Self { thread: current(), signalled: AtomicBool::new(false) }
    }
}

/// A condition variable bound to one [`ReentrantLock`].
///
/// Created by [`ReentrantLock::new_condition`]. Waiters form a private FIFO:
/// [`signal`] releases the longest-waiting thread, [`signal_all`] releases
/// every thread present. A wait atomically gives up *all* reentrant holds,
/// parks, and reacquires the same number of holds before returning, on
/// every exit path, including timeout and interruption.
///
/// Each operation takes the lock by reference because the condition does not
/// borrow it; handing it a different lock than the one it was created from
/// is a usage error and panics.
///
/// As with any condition variable, callers wait inside a loop over the
/// predicate they care about:
///
/// ```
/// use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
/// use std::sync::Arc;
/// use std::thread;
///
/// use reqlock::clh;
///
/// let lock = Arc::new(clh::parks::ReentrantLock::new(true));
/// let ready = Arc::new(lock.new_condition());
/// let go = Arc::new(AtomicBool::new(false));
///
/// let waiter = {
///     let (lock, ready, go) = (Arc::clone(&lock), Arc::clone(&ready), Arc::clone(&go));
///     thread::spawn(move || {
///         lock.lock();
///         while !go.load(Relaxed) {
///             ready.wait(&lock).unwrap();
///         }
///         lock.unlock().unwrap();
///     })
/// };
///
/// lock.lock();
/// go.store(true, Relaxed);
/// ready.signal(&lock).unwrap();
/// lock.unlock().unwrap();
/// waiter.join().unwrap();
/// ```
///
/// [`signal`]: Condition::signal
/// [`signal_all`]: Condition::signal_all
pub struct Condition {
    lock_id: u64,
    /// FIFO of parked callers. The mutex is only ever held across list
    /// mutation, never across a park.
    waiters: sync::Mutex<VecDeque<Arc<Waiter>>>,
}

impl Condition {
    pub(crate) fn bind(lock_id: u64) -> Self {
        Self { lock_id, waiters: sync::Mutex::new(VecDeque::new()) }
    }

    /// Blocks until signalled.
    ///
    /// Fully releases the lock (however many holds the caller has), parks
    /// until a signal arrives, then reacquires the same number of holds.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotOwner`] if the caller does not hold the lock,
    /// and [`LockError::Interrupted`] if cancelled while waiting; in the
    /// latter case the lock has been reacquired to its prior hold count
    /// first.
    ///
    /// # Panics
    ///
    /// Panics if `lock` is not the lock this condition was created from.
    pub fn wait<Q, W>(&self, lock: &ReentrantLock<Q, W>) -> Result<(), LockError>
    where
        Q: QueuePolicy,
        W: WaitStrategy,
    {
        let (waiter, saved) = self.begin_wait(lock)?;
        while !waiter.signalled.load(Acquire) {
            park();
            if interrupt::interrupted() {
                self.remove(&waiter);
                self.reacquire(lock, saved);
                return Err(LockError::Interrupted);
            }
        }
        self.reacquire(lock, saved);
        Ok(())
    }

    /// As [`wait`], but never fails with `Interrupted`: a cancellation
    /// observed while parked only causes another predicate check, and the
    /// flag is left raised for the caller to observe after return.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotOwner`] if the caller does not hold the lock.
    ///
    /// # Panics
    ///
    /// Panics if `lock` is not the lock this condition was created from.
    ///
    /// [`wait`]: Condition::wait
    pub fn wait_uninterruptibly<Q, W>(&self, lock: &ReentrantLock<Q, W>) -> Result<(), LockError>
    where
        Q: QueuePolicy,
        W: WaitStrategy,
    {
        let (waiter, saved) = self.begin_wait(lock)?;
        while !waiter.signalled.load(Acquire) {
            park();
        }
        self.reacquire(lock, saved);
        Ok(())
    }

    /// Blocks until signalled or until `nanos` nanoseconds have elapsed,
    /// whichever comes first, and returns the remaining budget.
    ///
    /// Each park is bounded by one millisecond so a missed unpark can only
    /// delay, never strand, the waiter. A result of zero (or less) means the
    /// wait timed out; a positive result means the waiter was signalled with
    /// that much budget to spare. A budget too large to resolve against the
    /// monotonic clock is treated as unbounded. The lock is reacquired to
    /// its prior hold count on every path.
    ///
    /// # Errors
    ///
    /// As [`wait`].
    ///
    /// # Panics
    ///
    /// Panics if `lock` is not the lock this condition was created from.
    ///
    /// [`wait`]: Condition::wait
    pub fn wait_nanos<Q, W>(
        &self,
        lock: &ReentrantLock<Q, W>,
        nanos: u64,
    ) -> Result<i64, LockError>
    where
        Q: QueuePolicy,
        W: WaitStrategy,
    {
        // A budget too large to resolve against the clock cannot expire.
        let deadline = Instant::now().checked_add(Duration::from_nanos(nanos));
        let (waiter, saved) = self.begin_wait(lock)?;
        while !waiter.signalled.load(Acquire) {
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    self.remove(&waiter);
                    self.reacquire(lock, saved);
                    return Ok(0);
                }
                park_timeout(remaining.min(REACQUIRE_PARK));
            } else {
                park_timeout(REACQUIRE_PARK);
            }
            if interrupt::interrupted() {
                self.remove(&waiter);
                self.reacquire(lock, saved);
                return Err(LockError::Interrupted);
            }
        }
        self.reacquire(lock, saved);
        let remaining = deadline.map_or(i64::MAX, |deadline| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            i64::try_from(remaining.as_nanos()).unwrap_or(i64::MAX)
        });
        Ok(remaining)
    }

    /// Blocks until signalled or until `timeout` elapses.
    ///
    /// Returns `Ok(true)` if signalled with budget to spare, `Ok(false)` on
    /// timeout.
    ///
    /// # Errors
    ///
    /// As [`wait`].
    ///
    /// # Panics
    ///
    /// Panics if `lock` is not the lock this condition was created from.
    ///
    /// [`wait`]: Condition::wait
    pub fn wait_timeout<Q, W>(
        &self,
        lock: &ReentrantLock<Q, W>,
        timeout: Duration,
    ) -> Result<bool, LockError>
    where
        Q: QueuePolicy,
        W: WaitStrategy,
    {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        Ok(self.wait_nanos(lock, nanos)? > 0)
    }

    /// Blocks until signalled or until `deadline`.
    ///
    /// Returns `Ok(false)` without waiting (and without releasing any holds)
    /// if the deadline is already past.
    ///
    /// # Errors
    ///
    /// As [`wait`].
    ///
    /// # Panics
    ///
    /// Panics if `lock` is not the lock this condition was created from.
    ///
    /// [`wait`]: Condition::wait
    pub fn wait_until<Q, W>(
        &self,
        lock: &ReentrantLock<Q, W>,
        deadline: Instant,
    ) -> Result<bool, LockError>
    where
        Q: QueuePolicy,
        W: WaitStrategy,
    {
        match deadline.checked_duration_since(Instant::now()) {
            Some(remaining) => self.wait_timeout(lock, remaining),
            None => Ok(false),
        }
    }

    /// Releases the longest-waiting thread, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotOwner`] if the caller does not hold the lock.
    ///
    /// # Panics
    ///
    /// Panics if `lock` is not the lock this condition was created from.
    pub fn signal<Q, W>(&self, lock: &ReentrantLock<Q, W>) -> Result<(), LockError>
    where
        Q: QueuePolicy,
        W: WaitStrategy,
    {
        self.check_owner(lock)?;
        let waiter = sync::lock(&self.waiters).pop_front();
        if let Some(waiter) = waiter {
            waiter.signalled.store(true, Release);
            waiter.thread.unpark();
        }
        Ok(())
    }

    /// Releases every thread currently waiting.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotOwner`] if the caller does not hold the lock.
    ///
    /// # Panics
    ///
    /// Panics if `lock` is not the lock this condition was created from.
    pub fn signal_all<Q, W>(&self, lock: &ReentrantLock<Q, W>) -> Result<(), LockError>
    where
        Q: QueuePolicy,
        W: WaitStrategy,
    {
        self.check_owner(lock)?;
        let mut waiters = sync::lock(&self.waiters);
        for waiter in waiters.iter() {
            waiter.signalled.store(true, Release);
            waiter.thread.unpark();
        }
        waiters.clear();
        Ok(())
    }

    /// Validates ownership, snapshots the hold count, enrolls the caller in
    /// the waiter FIFO and fully releases the lock.
    ///
    /// Enrollment happens strictly before the release: signalling requires
    /// the lock, so no signal can run until the caller is already in the
    /// FIFO, which rules out the lost-wakeup window between releasing and
    /// enrolling.
    fn begin_wait<Q, W>(
        &self,
        lock: &ReentrantLock<Q, W>,
    ) -> Result<(Arc<Waiter>, u32), LockError>
    where
        Q: QueuePolicy,
        W: WaitStrategy,
    {
        self.check_owner(lock)?;
        let saved = lock.hold_count();
        let waiter = Arc::new(Waiter::new());
        sync::lock(&self.waiters).push_back(Arc::clone(&waiter));
        for _ in 0..saved {
            lock.unlock()?;
        }
        Ok((waiter, saved))
    }

    fn check_owner<Q, W>(&self, lock: &ReentrantLock<Q, W>) -> Result<(), LockError>
    where
        Q: QueuePolicy,
        W: WaitStrategy,
    {
        assert_eq!(
            lock.id(),
            self.lock_id,
            "condition used with a lock it is not bound to"
        );
        if !lock.is_held_by_current_thread() {
            return Err(LockError::NotOwner);
        }
        Ok(())
    }

    /// Reacquires the lock to `saved` holds after a wait.
    ///
    /// The bounded park keeps the wake latency finite even when the lock is
    /// heavily contested by other reacquiring waiters.
    fn reacquire<Q, W>(&self, lock: &ReentrantLock<Q, W>, saved: u32)
    where
        Q: QueuePolicy,
        W: WaitStrategy,
    {
        while !lock.try_lock() {
            park_timeout(REACQUIRE_PARK);
        }
        for _ in 1..saved {
            lock.lock();
        }
    }

    /// Withdraws a waiter that gave up (timeout or interruption). A waiter
    /// leaves the FIFO at most once: either here or in a signalling thread,
    /// both under the internal mutex.
    fn remove(&self, waiter: &Arc<Waiter>) {
        let mut waiters = sync::lock(&self.waiters);
        if let Some(at) = waiters.iter().position(|other| Arc::ptr_eq(other, waiter)) {
            waiters.remove(at);
        }
    }
}

impl core::fmt::Debug for Condition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Condition")
            .field("lock_id", &self.lock_id)
            .field("waiters", &sync::lock(&self.waiters).len())
            .finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering::Relaxed};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::test::ORDERING_GAP;
    use crate::{clh, interrupt, mcs, LockError};

    #[test]
    fn wait_requires_ownership() {
        let lock = clh::parks::ReentrantLock::new(true);
        let ready = lock.new_condition();
        assert_eq!(ready.wait(&lock), Err(LockError::NotOwner));
        assert_eq!(ready.signal(&lock), Err(LockError::NotOwner));
        assert_eq!(ready.signal_all(&lock), Err(LockError::NotOwner));
    }

    #[test]
    #[should_panic(expected = "not bound")]
    fn foreign_lock_is_rejected() {
        let lock = clh::parks::ReentrantLock::new(true);
        let other = clh::parks::ReentrantLock::new(true);
        let ready = lock.new_condition();
        other.lock();
        let _ = ready.signal(&other);
    }

    // Two threads alternate on a shared counter: each waits for its turn and
    // signals the other. Both must exit with no residual holds.
    #[test]
    fn ping_pong() {
        const EXCHANGES: u32 = 1000;

        let lock = Arc::new(clh::parks::ReentrantLock::new(true));
        let turn = Arc::new(lock.new_condition());
        let counter = Arc::new(AtomicU32::new(0));

        let pinger = {
            let (lock, turn, counter) =
                (Arc::clone(&lock), Arc::clone(&turn), Arc::clone(&counter));
            thread::spawn(move || {
                lock.lock();
                for _ in 0..EXCHANGES / 2 {
                    while counter.load(Relaxed) % 2 != 0 {
                        turn.wait(&lock).unwrap();
                    }
                    counter.fetch_add(1, Relaxed);
                    turn.signal(&lock).unwrap();
                }
                let holds = lock.hold_count();
                lock.unlock().unwrap();
                holds
            })
        };
        let ponger = {
            let (lock, turn, counter) =
                (Arc::clone(&lock), Arc::clone(&turn), Arc::clone(&counter));
            thread::spawn(move || {
                lock.lock();
                for _ in 0..EXCHANGES / 2 {
                    while counter.load(Relaxed) % 2 != 1 {
                        turn.wait(&lock).unwrap();
                    }
                    counter.fetch_add(1, Relaxed);
                    turn.signal(&lock).unwrap();
                }
                let holds = lock.hold_count();
                lock.unlock().unwrap();
                holds
            })
        };

        assert_eq!(pinger.join().unwrap(), 1);
        assert_eq!(ponger.join().unwrap(), 1);
        assert_eq!(counter.load(Relaxed), EXCHANGES);
        assert!(!lock.is_locked());
    }

    // A waiter that entered with nested holds must come back with the same
    // nesting after a signal from elsewhere.
    #[test]
    fn wait_restores_nested_holds() {
        let lock = Arc::new(mcs::parks::ReentrantLock::new(true));
        let ready = Arc::new(lock.new_condition());
        let (tx, rx) = channel();

        let waiter = {
            let (lock, ready) = (Arc::clone(&lock), Arc::clone(&ready));
            thread::spawn(move || {
                lock.lock();
                lock.lock();
                lock.lock();
                tx.send(()).unwrap();
                ready.wait(&lock).unwrap();
                let holds = lock.hold_count();
                for _ in 0..holds {
                    lock.unlock().unwrap();
                }
                holds
            })
        };

        rx.recv().unwrap();
        // The waiter may not have enrolled yet; signalling an empty FIFO is
        // a no-op, so keep trying until it has come through.
        while !waiter.is_finished() {
            lock.lock();
            ready.signal(&lock).unwrap();
            lock.unlock().unwrap();
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(waiter.join().unwrap(), 3);
        assert!(!lock.is_locked());
    }

    #[test]
    fn wait_timeout_expires() {
        let lock = clh::parks::ReentrantLock::new(true);
        let quiet = lock.new_condition();

        lock.lock();
        let started = Instant::now();
        assert!(!quiet.wait_timeout(&lock, Duration::from_millis(20)).unwrap());
        assert!(started.elapsed() >= Duration::from_millis(20));
        // Timed out, but the lock is held again.
        assert_eq!(lock.hold_count(), 1);
        lock.unlock().unwrap();
    }

    // The largest nanosecond budget must behave as an unbounded wait, not
    // panic or expire early.
    #[test]
    fn huge_wait_budget_waits_for_the_signal() {
        let lock = Arc::new(clh::parks::ReentrantLock::new(true));
        let ready = Arc::new(lock.new_condition());

        let waiter = {
            let (lock, ready) = (Arc::clone(&lock), Arc::clone(&ready));
            thread::spawn(move || {
                lock.lock();
                let remaining = ready.wait_nanos(&lock, u64::MAX).unwrap();
                lock.unlock().unwrap();
                remaining
            })
        };

        while !waiter.is_finished() {
            lock.lock();
            ready.signal(&lock).unwrap();
            lock.unlock().unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        assert!(waiter.join().unwrap() > 0);
    }

    #[test]
    fn wait_until_past_deadline_returns_immediately() {
        let lock = clh::parks::ReentrantLock::new(true);
        let quiet = lock.new_condition();

        lock.lock();
        let past = Instant::now() - Duration::from_millis(5);
        assert!(!quiet.wait_until(&lock, past).unwrap());
        assert_eq!(lock.hold_count(), 1);
        lock.unlock().unwrap();
    }

    #[test]
    fn signal_all_releases_every_waiter() {
        const WAITERS: usize = 3;

        let lock = Arc::new(clh::parks::ReentrantLock::new(true));
        let ready = Arc::new(lock.new_condition());
        let woken = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..WAITERS {
            let (lock, ready, woken) =
                (Arc::clone(&lock), Arc::clone(&ready), Arc::clone(&woken));
            handles.push(thread::spawn(move || {
                lock.lock();
                ready.wait(&lock).unwrap();
                woken.fetch_add(1, Relaxed);
                lock.unlock().unwrap();
            }));
        }

        // Broadcast until every waiter has come through; a waiter that had
        // not yet enrolled when a broadcast ran is caught by the next one.
        thread::sleep(ORDERING_GAP);
        while woken.load(Relaxed) != WAITERS as u32 {
            lock.lock();
            ready.signal_all(&lock).unwrap();
            lock.unlock().unwrap();
            thread::sleep(Duration::from_millis(1));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(woken.load(Relaxed), WAITERS as u32);
    }

    #[test]
    fn interrupted_wait_reacquires_before_failing() {
        let lock = Arc::new(mcs::parks::ReentrantLock::new(true));
        let ready = Arc::new(lock.new_condition());
        let (tx, rx) = channel();

        let waiter = {
            let (lock, ready) = (Arc::clone(&lock), Arc::clone(&ready));
            thread::spawn(move || {
                lock.lock();
                lock.lock();
                tx.send(interrupt::handle()).unwrap();
                let result = ready.wait(&lock);
                let holds = lock.hold_count();
                for _ in 0..holds {
                    lock.unlock().unwrap();
                }
                (result, holds)
            })
        };

        let handle = rx.recv().unwrap();
        thread::sleep(ORDERING_GAP);
        handle.interrupt();

        let (result, holds) = waiter.join().unwrap();
        assert_eq!(result, Err(LockError::Interrupted));
        assert_eq!(holds, 2);
        assert!(!lock.is_locked());
    }

    #[test]
    fn uninterruptible_wait_defers_cancellation() {
        let lock = Arc::new(clh::parks::ReentrantLock::new(true));
        let ready = Arc::new(lock.new_condition());
        let (tx, rx) = channel();

        let waiter = {
            let (lock, ready) = (Arc::clone(&lock), Arc::clone(&ready));
            thread::spawn(move || {
                lock.lock();
                tx.send(interrupt::handle()).unwrap();
                ready.wait_uninterruptibly(&lock).unwrap();
                let deferred = interrupt::interrupted();
                lock.unlock().unwrap();
                deferred
            })
        };

        let handle = rx.recv().unwrap();
        thread::sleep(ORDERING_GAP);
        // The cancellation must not end the wait; only the signal may.
        handle.interrupt();
        thread::sleep(ORDERING_GAP);
        lock.lock();
        ready.signal(&lock).unwrap();
        lock.unlock().unwrap();

        assert!(waiter.join().unwrap(), "cancellation must be left pending");
    }
}
