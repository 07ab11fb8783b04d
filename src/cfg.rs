pub mod atomic {
    #[cfg(not(all(loom, test)))]
    pub use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize};

    #[cfg(all(loom, test))]
    pub use loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize};
}

pub mod hint {
    #[cfg(not(all(loom, test)))]
    pub use core::hint::spin_loop;

    #[cfg(all(loom, test))]
    pub use loom::hint::spin_loop;
}

pub mod sync {
    #[cfg(not(all(loom, test)))]
    pub use std::sync::{Mutex, MutexGuard};

    #[cfg(all(loom, test))]
    pub use loom::sync::{Mutex, MutexGuard};

    /// Acquires `mutex`, transparently recovering the guard if a panicking
    /// thread left it poisoned.
    #[inline]
    pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|err| err.into_inner())
    }
}

pub mod thread {
    #[cfg(not(all(loom, test)))]
    pub use std::thread::{current, park, park_timeout, yield_now, Thread};

    #[cfg(all(loom, test))]
    pub use loom::thread::yield_now;

    /// Loom does not model timed or targeted parking. Under Loom every park
    /// degrades to a scheduler yield and every unpark is a no-op, which is
    /// sound here: parking is only ever a pacing aid, never the mechanism
    /// that grants admission.
    #[cfg(all(loom, test))]
    #[derive(Clone, Debug)]
    pub struct Thread;

    #[cfg(all(loom, test))]
    impl Thread {
        pub fn unpark(&self) {}
    }

    #[cfg(all(loom, test))]
    pub fn current() -> Thread {
        Thread
    }

    #[cfg(all(loom, test))]
    pub fn park() {
        loom::thread::yield_now();
    }

    #[cfg(all(loom, test))]
    pub fn park_timeout(_timeout: core::time::Duration) {
        loom::thread::yield_now();
    }
}
