use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Source of per-thread identities for the owner word.
///
/// Identities start at 1 so that 0 can mean "unowned" in an atomic word.
/// `std::thread::ThreadId` has no stable integral representation, so each
/// thread draws a fresh id from a process-wide counter on first use and
/// caches it in thread-local storage.
static NEXT: AtomicU64 = AtomicU64::new(1);

fn next() -> u64 {
    NEXT.fetch_add(1, Relaxed)
}

#[cfg(not(all(loom, test)))]
std::thread_local! {
    static CURRENT: u64 = next();
}

#[cfg(all(loom, test))]
loom::thread_local! {
    static CURRENT: u64 = next();
}

/// Returns the calling thread's identity. Never 0.
#[inline]
pub(crate) fn current() -> u64 {
    CURRENT.with(|id| *id)
}

#[cfg(all(not(loom), test))]
mod test {
    use super::current;

    #[test]
    fn nonzero_and_stable() {
        let id = current();
        assert_ne!(id, 0);
        assert_eq!(id, current());
    }

    #[test]
    fn distinct_across_threads() {
        let id = current();
        let other = std::thread::spawn(current).join().unwrap();
        assert_ne!(id, other);
    }
}
