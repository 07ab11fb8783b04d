//! Loom models for the queued acquisition paths.
//!
//! The models only exercise the untimed, spin-paced paths: Loom has no
//! notion of time, and parking degrades to a yield under the `cfg` shims.
//! That is sufficient to check the properties that matter here: mutual
//! exclusion of the owner word and visibility of writes made inside the
//! critical section across a queue handoff.

pub mod models {
    use loom::cell::UnsafeCell;
    use loom::sync::Arc;
    use loom::{model, thread};

    use crate::queue::QueuePolicy;
    use crate::wait::BusySpin;
    use crate::ReentrantLock;

    const THREADS: usize = 2;

    fn lock_join<Q: QueuePolicy + Default + 'static>(fair: bool) {
        model(move || {
            let lock = Arc::new(ReentrantLock::<Q, BusySpin>::with_strategy(
                fair,
                BusySpin::new(1).unwrap(),
            ));
            let data = Arc::new(UnsafeCell::new(0usize));

            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let lock = Arc::clone(&lock);
                    let data = Arc::clone(&data);
                    thread::spawn(move || {
                        lock.lock();
                        data.with_mut(|ptr| {
                            // SAFETY: The lock serializes all mutations.
                            unsafe { *ptr += 1 };
                        });
                        lock.unlock().unwrap();
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            lock.lock();
            let total = data.with(|ptr| {
                // SAFETY: No concurrent mutators remain.
                unsafe { *ptr }
            });
            lock.unlock().unwrap();
            assert_eq!(total, THREADS);
        });
    }

    #[test]
    fn clh_fair_lock_join() {
        lock_join::<crate::ClhQueue>(true);
    }

    #[test]
    fn clh_barging_lock_join() {
        lock_join::<crate::ClhQueue>(false);
    }

    #[test]
    fn mcs_fair_lock_join() {
        lock_join::<crate::McsQueue>(true);
    }

    #[test]
    fn reentry_in_model() {
        model(|| {
            let lock = ReentrantLock::<crate::McsQueue, BusySpin>::with_strategy(
                true,
                BusySpin::new(1).unwrap(),
            );
            lock.lock();
            lock.lock();
            assert_eq!(lock.hold_count(), 2);
            lock.unlock().unwrap();
            lock.unlock().unwrap();
            assert!(!lock.is_locked());
        });
    }
}
