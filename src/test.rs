//! Support shared by the scenario tests in the other modules.

use std::time::Duration;

/// Pause between spawning ordered contenders, long enough that the spawned
/// thread reaches the queue's tail exchange before the next one starts.
pub(crate) const ORDERING_GAP: Duration = Duration::from_millis(50);
