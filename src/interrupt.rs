//! Cooperative per-thread cancellation.
//!
//! Every thread carries a cancellation flag. Blocking operations in this
//! crate observe the flag of the thread they run on and fail with
//! [`LockError::Interrupted`], clearing the flag as part of raising the
//! error. This is the usual cooperative test-and-clear discipline.
//!
//! A thread that wants to be cancellable hands an [`InterruptHandle`] to its
//! peers before blocking:
//!
//! ```
//! use std::sync::mpsc::channel;
//! use std::thread;
//!
//! use reqlock::interrupt;
//!
//! let (tx, rx) = channel();
//! let worker = thread::spawn(move || {
//!     tx.send(interrupt::handle()).unwrap();
//!     // ... block in an interruptible operation ...
//! });
//!
//! rx.recv().unwrap().interrupt();
//! worker.join().unwrap();
//! ```
//!
//! [`LockError::Interrupted`]: crate::LockError::Interrupted

use std::sync::Arc;

use core::sync::atomic::Ordering::Relaxed;

use crate::cfg::atomic::AtomicBool;
use crate::cfg::thread::{current, Thread};

#[cfg(not(all(loom, test)))]
std::thread_local! {
    static FLAG: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
}

#[cfg(all(loom, test))]
loom::thread_local! {
    static FLAG: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
}

/// A remote control for one thread's cancellation flag.
///
/// Obtained on, and bound to, the thread that called [`handle`]; cloneable
/// and sendable so other threads can cancel that thread.
#[derive(Clone, Debug)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
    thread: Thread,
}

impl InterruptHandle {
    /// Raises the target thread's cancellation flag and unparks it, so a
    /// parked target re-checks its predicates promptly.
    pub fn interrupt(&self) {
        self.flag.store(true, Relaxed);
        self.thread.unpark();
    }

    /// Returns whether the target thread's flag is currently raised.
    ///
    /// Snapshot semantics; the target may clear the flag at any moment.
    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Relaxed)
    }
}

/// Returns a handle to the calling thread's cancellation flag.
pub fn handle() -> InterruptHandle {
    InterruptHandle { flag: FLAG.with(Arc::clone), thread: current() }
}

/// Tests and clears the calling thread's cancellation flag.
///
/// Returns `true` at most once per raise: the observation consumes the flag.
#[inline]
pub fn interrupted() -> bool {
    FLAG.with(|flag| flag.load(Relaxed) && flag.swap(false, Relaxed))
}

/// Returns the calling thread's flag without clearing it.
#[inline]
pub fn is_interrupted() -> bool {
    FLAG.with(|flag| flag.load(Relaxed))
}

/// Re-raises the calling thread's flag, deferring an interruption that an
/// uninterruptible operation absorbed.
#[inline]
pub(crate) fn raise() {
    FLAG.with(|flag| flag.store(true, Relaxed));
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{handle, interrupted, is_interrupted, raise};

    #[test]
    fn self_interrupt_is_observed_once() {
        assert!(!interrupted());
        handle().interrupt();
        assert!(is_interrupted());
        assert!(interrupted());
        assert!(!interrupted());
    }

    #[test]
    fn raise_defers() {
        raise();
        assert!(is_interrupted());
        assert!(interrupted());
    }

    #[test]
    fn cross_thread_interrupt() {
        use std::sync::mpsc::channel;
        use std::thread;
        use std::time::Duration;

        let (tx, rx) = channel();
        let target = thread::spawn(move || {
            tx.send(handle()).unwrap();
            while !interrupted() {
                thread::park_timeout(Duration::from_millis(1));
            }
        });
        rx.recv().unwrap().interrupt();
        target.join().unwrap();
    }
}
