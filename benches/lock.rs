use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};

use reqlock::{clh, mcs};

fn clh_lock_unlock(c: &mut Criterion) {
    let lock = clh::parks::ReentrantLock::new(true);
    c.bench_function("clh-lock-unlock", |b| {
        b.iter(|| {
            lock.lock();
            lock.unlock().unwrap();
        });
    });
}

fn mcs_lock_unlock(c: &mut Criterion) {
    let lock = mcs::parks::ReentrantLock::new(true);
    c.bench_function("mcs-lock-unlock", |b| {
        b.iter(|| {
            lock.lock();
            lock.unlock().unwrap();
        });
    });
}

fn clh_reentrant_pair(c: &mut Criterion) {
    let lock = clh::spins::ReentrantLock::new(false);
    c.bench_function("clh-reentrant-pair", |b| {
        b.iter(|| {
            lock.lock();
            lock.lock();
            lock.unlock().unwrap();
            lock.unlock().unwrap();
        });
    });
}

fn try_lock_uncontended(c: &mut Criterion) {
    let lock = mcs::spins::ReentrantLock::new(false);
    c.bench_function("try-lock-uncontended", |b| {
        b.iter(|| {
            assert!(lock.try_lock());
            lock.unlock().unwrap();
        });
    });
}

fn timed_lock_uncontended(c: &mut Criterion) {
    let lock = clh::parks::ReentrantLock::new(true);
    c.bench_function("timed-lock-uncontended", |b| {
        b.iter(|| {
            assert!(lock.try_lock_for(Duration::from_millis(1)).unwrap());
            lock.unlock().unwrap();
        });
    });
}

criterion_group!(
    lock,
    clh_lock_unlock,
    mcs_lock_unlock,
    clh_reentrant_pair,
    try_lock_uncontended,
    timed_lock_uncontended
);
criterion_main!(lock);
