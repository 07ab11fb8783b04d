//! A reentrant mutual-exclusion lock assembled from two orthogonal,
//! swappable pieces: a *queueing discipline* and a *waiting discipline*.
//!
//! The queueing discipline decides how contending threads line up. Two
//! List-Based Queuing Lock flavors are provided:
//!
//! - [`ClhQueue`], after Craig and, independently, Magnussen, Landin, and
//!   Hagersten: an implicit linked list where each waiter spins on a flag
//!   inside its *predecessor's* node;
//! - [`McsQueue`], after Mellor-Crummey and Scott: an explicit linked list
//!   where each waiter spins on a flag inside its *own* node, which keeps
//!   the spin target in local memory and suits NUMA machines.
//!
//! Both guarantee FIFO admission among queued threads: arrival order is the
//! total order of the atomic tail exchange, and a queued waiter can never be
//! overtaken by another queued waiter.
//!
//! The waiting discipline decides how a waiter burns time between re-checks
//! of its spin predicate:
//!
//! - [`BusySpin`] emits a bounded burst of CPU pause hints and then yields
//!   one time slice: lowest wakeup latency, highest CPU cost;
//! - [`SpinThenPark`] emits a short burst of pause hints and then parks the
//!   thread for one microsecond, a compromise for longer waits.
//!
//! On top of the queue, [`ReentrantLock`] layers an owner/hold-count state
//! machine with the full lock surface: blocking [`lock`], interruptible
//! [`lock_interruptibly`], non-blocking [`try_lock`], time-bounded
//! [`try_lock_for`], reentrant [`unlock`], and [`Condition`] variables bound
//! to the lock. A lock is either *fair* (every contender passes through the
//! queue in arrival order) or *barging*, where an arriving thread may claim
//! a momentarily free lock ahead of the queue.
//!
//! # Interruption
//!
//! Blocking operations cooperate with the [`interrupt`] module's per-thread
//! cancellation flag: a thread blocked in [`lock_interruptibly`],
//! [`try_lock_for`] or [`Condition::wait`] returns
//! [`LockError::Interrupted`] soon after another thread trips its
//! [`InterruptHandle`]. The plain [`lock`] never fails; it absorbs an
//! observed interruption and re-raises the flag before returning.
//!
//! # Presets
//!
//! The [`clh`] and [`mcs`] modules pair each queue policy with a wait
//! strategy under type aliases. The common configurations are the fair
//! spin-then-park locks, `clh::parks` and `mcs::parks`, and the barging
//! busy-spin lock `clh::spins`:
//!
//! ```
//! use reqlock::clh;
//!
//! let lock = clh::parks::ReentrantLock::new(true);
//!
//! lock.lock();
//! lock.lock();
//! assert_eq!(lock.hold_count(), 2);
//! lock.unlock().unwrap();
//! lock.unlock().unwrap();
//! assert!(!lock.is_locked());
//! ```
//!
//! # Spinning caveats
//!
//! Queued spin locks shine when critical sections are short and contention
//! bursts are dense; for general-purpose locking the OS-integrated mutexes
//! (`std::sync::Mutex`, `parking_lot::Mutex`) remain the better default.
//! [`SpinThenPark`] softens the cost of long waits, but a waiter at the head
//! of the queue still runs a hard spin against the owner word, by design.
//!
//! [`lock`]: ReentrantLock::lock
//! [`lock_interruptibly`]: ReentrantLock::lock_interruptibly
//! [`try_lock`]: ReentrantLock::try_lock
//! [`try_lock_for`]: ReentrantLock::try_lock_for
//! [`unlock`]: ReentrantLock::unlock
//! [`InterruptHandle`]: interrupt::InterruptHandle

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(unexpected_cfgs)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::inline_always)]
#![allow(clippy::doc_markdown)]
#![warn(rust_2021_compatibility)]
#![warn(missing_docs)]

pub mod error;
pub mod interrupt;
pub mod queue;
pub mod wait;

pub(crate) mod cfg;
pub(crate) mod thread_id;

mod condition;
mod lock;

pub use condition::Condition;
pub use error::LockError;
pub use lock::ReentrantLock;
pub use queue::{ClhQueue, McsQueue, QueuePolicy};
pub use wait::{BusySpin, SpinThenPark, WaitStrategy};

#[cfg(all(not(loom), test))]
pub(crate) mod test;

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
pub(crate) mod loom;

/// Locks queued by the CLH policy.
///
/// The submodules pair [`ClhQueue`](crate::ClhQueue) with a wait strategy.
/// `parks` is the "CLH with spin-then-park" configuration (pass `true` to
/// [`new`] for the fair preset), `spins` is the "CLH with busy-spin"
/// configuration (pass `false` for the barging preset).
///
/// [`new`]: crate::ReentrantLock::new
pub mod clh {
    /// A CLH lock that parks between spin bursts.
    pub mod parks {
        /// A [`ReentrantLock`] over [`ClhQueue`] and [`SpinThenPark`].
        ///
        /// [`ReentrantLock`]: crate::ReentrantLock
        /// [`ClhQueue`]: crate::ClhQueue
        /// [`SpinThenPark`]: crate::SpinThenPark
        pub type ReentrantLock = crate::ReentrantLock<crate::ClhQueue, crate::SpinThenPark>;
    }

    /// A CLH lock that busy-waits.
    pub mod spins {
        /// A [`ReentrantLock`] over [`ClhQueue`] and [`BusySpin`].
        ///
        /// [`ReentrantLock`]: crate::ReentrantLock
        /// [`ClhQueue`]: crate::ClhQueue
        /// [`BusySpin`]: crate::BusySpin
        pub type ReentrantLock = crate::ReentrantLock<crate::ClhQueue, crate::BusySpin>;
    }
}

/// Locks queued by the MCS policy.
///
/// The submodules pair [`McsQueue`](crate::McsQueue) with a wait strategy.
/// `parks` is the "MCS with spin-then-park" configuration (pass `true` to
/// [`new`] for the fair preset).
///
/// [`new`]: crate::ReentrantLock::new
pub mod mcs {
    /// An MCS lock that parks between spin bursts.
    pub mod parks {
        /// A [`ReentrantLock`] over [`McsQueue`] and [`SpinThenPark`].
        ///
        /// [`ReentrantLock`]: crate::ReentrantLock
        /// [`McsQueue`]: crate::McsQueue
        /// [`SpinThenPark`]: crate::SpinThenPark
        pub type ReentrantLock = crate::ReentrantLock<crate::McsQueue, crate::SpinThenPark>;
    }

    /// An MCS lock that busy-waits.
    pub mod spins {
        /// A [`ReentrantLock`] over [`McsQueue`] and [`BusySpin`].
        ///
        /// [`ReentrantLock`]: crate::ReentrantLock
        /// [`McsQueue`]: crate::McsQueue
        /// [`BusySpin`]: crate::BusySpin
        pub type ReentrantLock = crate::ReentrantLock<crate::McsQueue, crate::BusySpin>;
    }
}
