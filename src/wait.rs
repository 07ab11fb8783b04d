//! Strategies that determine how waiters burn time between re-checks of a
//! spin predicate.
//!
//! A queue policy calls [`WaitStrategy::wait`] inside a recheck loop whose
//! predicate is the condition the caller is really waiting for; the strategy
//! is not responsible for wakeup, only for pacing. Every call consumes some
//! real time, observes the calling thread's cancellation flag, and returns
//! in bounded time.

use core::time::Duration;

use crate::cfg::hint;
use crate::cfg::thread;
use crate::error::LockError;
use crate::interrupt;

/// A pacing policy for contended waits.
///
/// # Example
///
/// ```
/// use reqlock::wait::WaitStrategy;
/// use reqlock::LockError;
///
/// struct Spin;
///
/// impl WaitStrategy for Spin {
///     fn wait(&self) -> Result<(), LockError> {
///         core::hint::spin_loop();
///         Ok(())
///     }
/// }
/// ```
pub trait WaitStrategy: Send + Sync {
    /// Burns a bounded amount of real time, then reports whether the calling
    /// thread was cancelled while pacing.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Interrupted`] if the thread's cancellation flag
    /// was raised; observing it clears the flag.
    fn wait(&self) -> Result<(), LockError>;
}

/// A strategy that spins hard and never sleeps.
///
/// Each [`wait`] emits a fixed burst of CPU pause hints, yields the current
/// time slice once, and checks for cancellation. Latency is as low as it
/// gets, at the price of keeping a core busy for the whole wait; prefer
/// [`SpinThenPark`] when critical sections can be preempted or long.
///
/// [`wait`]: WaitStrategy::wait
#[derive(Debug, Clone)]
pub struct BusySpin {
    max_spins: u32,
}

impl BusySpin {
    /// The spin burst used by [`Default`].
    pub const DEFAULT_MAX_SPINS: u32 = 10_000;

    /// Creates a strategy that emits `max_spins` pause hints per wait.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidArgument`] if `max_spins` is zero.
    pub fn new(max_spins: u32) -> Result<Self, LockError> {
        if max_spins == 0 {
            return Err(LockError::InvalidArgument);
        }
        Ok(Self { max_spins })
    }
}

impl Default for BusySpin {
    fn default() -> Self {
        Self { max_spins: Self::DEFAULT_MAX_SPINS }
    }
}

impl WaitStrategy for BusySpin {
    #[inline(always)]
    fn wait(&self) -> Result<(), LockError> {
        for _ in 0..self.max_spins {
            hint::spin_loop();
        }
        thread::yield_now();
        if interrupt::interrupted() {
            return Err(LockError::Interrupted);
        }
        Ok(())
    }
}

/// A strategy that spins briefly, then parks for one microsecond.
///
/// The park is a precise, unpark-interruptible sleep rather than a scheduler
/// yield, so a waiter waking from it re-checks its predicate at a steady
/// cadence without monopolizing a core.
#[derive(Debug, Clone)]
pub struct SpinThenPark {
    spins: u32,
}

/// How long each park lasts.
const PARK_INTERVAL: Duration = Duration::from_micros(1);

impl SpinThenPark {
    /// The spin burst used by [`Default`].
    pub const DEFAULT_SPINS: u32 = 100;

    /// Creates a strategy that emits `spins` pause hints before each park.
    ///
    /// Zero is valid and means "park immediately".
    pub fn new(spins: u32) -> Self {
        Self { spins }
    }
}

impl Default for SpinThenPark {
    fn default() -> Self {
        Self { spins: Self::DEFAULT_SPINS }
    }
}

impl WaitStrategy for SpinThenPark {
    #[inline(always)]
    fn wait(&self) -> Result<(), LockError> {
        for _ in 0..self.spins {
            hint::spin_loop();
        }
        thread::park_timeout(PARK_INTERVAL);
        if interrupt::interrupted() {
            return Err(LockError::Interrupted);
        }
        Ok(())
    }
}

/// Tests and clears the calling thread's cancellation flag between retries
/// of an acquisition attempt, where no strategy runs.
#[inline]
pub(crate) fn check_interrupt() -> Result<(), LockError> {
    if interrupt::interrupted() {
        return Err(LockError::Interrupted);
    }
    Ok(())
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{BusySpin, SpinThenPark, WaitStrategy};
    use crate::error::LockError;
    use crate::interrupt;

    fn returns<W: WaitStrategy>(strategy: &W) {
        for _ in 0..10 {
            strategy.wait().unwrap();
        }
    }

    #[test]
    fn busy_spin_waits() {
        returns(&BusySpin::default());
        returns(&BusySpin::new(1).unwrap());
    }

    #[test]
    fn busy_spin_rejects_zero() {
        assert_eq!(BusySpin::new(0).unwrap_err(), LockError::InvalidArgument);
    }

    #[test]
    fn spin_then_park_waits() {
        returns(&SpinThenPark::default());
        returns(&SpinThenPark::new(0));
    }

    #[test]
    fn wait_consumes_interrupt() {
        let strategy = SpinThenPark::default();
        interrupt::handle().interrupt();
        assert_eq!(strategy.wait().unwrap_err(), LockError::Interrupted);
        // The observation cleared the flag.
        strategy.wait().unwrap();
    }
}
