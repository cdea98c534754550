//! GPU timers.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

/// Collects GPU execution times of the commands it is attached to.
///
/// Results arrive asynchronously as commands complete; [`Timer::query`]
/// returns the oldest unread result.
#[derive(Debug, Default)]
pub struct Timer {
    results: Mutex<VecDeque<Duration>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the oldest available measurement.
    pub fn query(&self) -> Option<Duration> {
        self.results.lock().pop_front()
    }

    pub(crate) fn push(&self, elapsed: Duration) {
        self.results.lock().push_back(elapsed);
    }
}

static_assertions::assert_impl_all!(Timer: Send, Sync);
