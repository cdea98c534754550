//! Device configuration.

use std::time::Duration;

use crate::types::QueueType;

/// Largest chunk accepted by a single inline buffer update.
pub const MAX_UPDATE_CHUNK: usize = 64 * 1024;

/// Parameters controlling a [`GpuDevice`](crate::GpuDevice).
///
/// ```ignore
/// let params = DeviceParameters::new()
///     .with_max_signals(256)
///     .with_transfer_queue(QueueType::Graphics);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceParameters {
    /// Upper bound on live signals. `None` grows the pool on demand.
    pub max_signals: Option<usize>,
    /// Bytes per inline buffer update; clamped to [`MAX_UPDATE_CHUNK`].
    pub update_chunk_size: usize,
    /// Queue used for uploads, downloads and buffer copies.
    pub transfer_queue: QueueType,
    /// How long `wait_idle` and device teardown wait for outstanding work.
    pub idle_timeout: Duration,
}

impl Default for DeviceParameters {
    fn default() -> Self {
        Self {
            max_signals: None,
            update_chunk_size: MAX_UPDATE_CHUNK,
            transfer_queue: QueueType::Transfer,
            idle_timeout: Duration::from_secs(5),
        }
    }
}

impl DeviceParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of signals alive at once.
    pub fn with_max_signals(mut self, max: usize) -> Self {
        self.max_signals = Some(max);
        self
    }

    /// Set the inline update chunk size.
    pub fn with_update_chunk_size(mut self, bytes: usize) -> Self {
        self.update_chunk_size = bytes.clamp(4, MAX_UPDATE_CHUNK);
        self
    }

    /// Route transfers to a different queue.
    pub fn with_transfer_queue(mut self, queue: QueueType) -> Self {
        self.transfer_queue = queue;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_is_clamped() {
        let params = DeviceParameters::new().with_update_chunk_size(1 << 20);
        assert_eq!(params.update_chunk_size, MAX_UPDATE_CHUNK);

        let params = DeviceParameters::new().with_update_chunk_size(0);
        assert_eq!(params.update_chunk_size, 4);
    }

    #[test]
    fn test_defaults() {
        let params = DeviceParameters::default();
        assert_eq!(params.max_signals, None);
        assert_eq!(params.transfer_queue, QueueType::Transfer);
    }
}
