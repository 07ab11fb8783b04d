//! Waiting-queue policies for admission control.
//!
//! A queue policy is the FIFO half of a lock: it decides the order in which
//! contending threads get to bid for the owner word, while the bid itself is
//! a caller-supplied closure (see [`QueuePolicy::enqueue_and_acquire`]).
//! Both provided policies are List-Based Queuing Locks: threads line up by
//! atomically exchanging a shared tail pointer, which totally orders
//! arrivals. They differ in where a waiter spins:
//!
//! - [`ClhQueue`] waiters spin on their *predecessor's* node;
//! - [`McsQueue`] waiters spin on their *own* node.
//!
//! Queue nodes are allocated once per thread per queue and reused across
//! acquisitions. Each queue pins every node it ever handed out in an
//! append-only registry for its whole lifetime, so link pointers taken from
//! the tail or from neighbor nodes never dangle; a thread-local cache keyed
//! by a process-unique queue id returns each thread its own node.

mod clh;
mod mcs;

pub use clh::ClhQueue;
pub use mcs::McsQueue;

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::Duration;

use crate::error::LockError;
use crate::wait::WaitStrategy;

/// Hands out process-unique ids for queues and locks.
///
/// Ids are never reused, which is what makes the thread-local node caches
/// safe: a stale cache entry for a dropped queue can never alias a live one.
pub(crate) fn next_instance_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Relaxed)
}

/// FIFO admission control for a lock.
///
/// The policy owns the wait queue; the *lock word* stays with the caller,
/// which supplies a `try_acquire` closure that tests-and-claims it. The
/// closure must be idempotent across spurious retries and is the sole
/// authority on ownership; the queue's flags only order admission.
pub trait QueuePolicy: Send + Sync {
    /// Links the calling thread into the queue and blocks until
    /// `try_acquire` succeeds.
    ///
    /// The thread spins on the policy's admission predicate, pacing itself
    /// with `wait` between checks, then retries `try_acquire` with a pause
    /// hint between iterations.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Interrupted`] if the thread's cancellation flag
    /// is observed at any point; the node is unlinked before returning and
    /// the queue stays consistent.
    fn enqueue_and_acquire<F, W>(&self, try_acquire: F, wait: &W) -> Result<(), LockError>
    where
        F: FnMut() -> bool,
        W: WaitStrategy;

    /// As [`enqueue_and_acquire`], bounded by `timeout`.
    ///
    /// Returns `Ok(false)` if the deadline passed before `try_acquire`
    /// succeeded; the node is unlinked and the queue stays consistent.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Interrupted`] as the untimed form does.
    ///
    /// [`enqueue_and_acquire`]: QueuePolicy::enqueue_and_acquire
    fn enqueue_and_acquire_timed<F, W>(
        &self,
        try_acquire: F,
        timeout: Duration,
        wait: &W,
    ) -> Result<bool, LockError>
    where
        F: FnMut() -> bool,
        W: WaitStrategy;

    /// Wakes a parked successor, if one can be identified.
    ///
    /// Called by the lock's release path after the owner word has been
    /// cleared. This is a wakeup aid: admission correctness never depends on
    /// it, since parked waiters re-check their predicates on a bounded
    /// cadence.
    fn unpark_successor(&self);
}
