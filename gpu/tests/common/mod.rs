//! Common utilities for synchronization integration tests.
//!
//! Every test runs on the dummy driver, which executes transfer operations in
//! host memory and validates binary semaphore usage, so data round trips and
//! wait/signal pairing can both be checked.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use redlilium_gpu::{
    Buffer, BufferDescriptor, BufferUsage, DeviceParameters, DummyDriver, GpuDevice,
    QueueFamilies, RecordedOp, Texture, TextureDescriptor, TextureFormat, TextureUsage,
};
use redlilium_gpu::driver::dummy::SubmittedCommand;
use redlilium_gpu::hazard::PipelineBarrier;

/// How queue types map onto queue families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    /// Graphics, compute and transfer are separate families (0, 1, 2).
    Distinct,
    /// Everything runs on family 0.
    Unified,
}

impl Topology {
    pub fn families(self) -> QueueFamilies {
        match self {
            Topology::Distinct => QueueFamilies {
                graphics: 0,
                compute: 1,
                transfer: 2,
            },
            Topology::Unified => QueueFamilies::unified(0),
        }
    }
}

/// Driver and device pair for one test.
pub struct TestContext {
    pub driver: Arc<DummyDriver>,
    pub device: Arc<GpuDevice>,
}

impl TestContext {
    pub fn new(topology: Topology) -> Self {
        Self::with_parameters(topology, DeviceParameters::new())
    }

    pub fn with_parameters(topology: Topology, params: DeviceParameters) -> Self {
        init_logging();
        let driver = Arc::new(DummyDriver::with_families(topology.families()));
        let device = GpuDevice::new(driver.clone(), Arc::new(driver.allocator()), params);
        Self { driver, device }
    }

    pub fn create_texture(&self, width: u32, height: u32, usage: TextureUsage) -> Arc<Texture> {
        self.device
            .create_texture(&TextureDescriptor::new_2d(
                width,
                height,
                TextureFormat::Rgba8Unorm,
                usage,
            ))
            .expect("Failed to create texture")
    }

    pub fn create_exportable_texture(&self, width: u32, height: u32, usage: TextureUsage) -> Arc<Texture> {
        self.device
            .create_texture(
                &TextureDescriptor::new_2d(width, height, TextureFormat::Rgba8Unorm, usage)
                    .exportable(),
            )
            .expect("Failed to create texture")
    }

    pub fn create_buffer(&self, size: u64, usage: BufferUsage) -> Arc<Buffer> {
        self.device
            .create_buffer(&BufferDescriptor::new(size, usage))
            .expect("Failed to create buffer")
    }

    /// CPU readable buffer that can be copied into.
    pub fn create_readback_buffer(&self, size: u64) -> Arc<Buffer> {
        self.create_buffer(size, BufferUsage::COPY_DST | BufferUsage::MAP_READ)
    }

    /// Submit everything and run poll cycles until no destruction is pending.
    pub fn settle(&self) {
        self.device.flush().expect("Failed to flush");
        for _ in 0..8 {
            self.device
                .poll_commands(Duration::from_millis(10))
                .expect("Failed to poll");
            if self.device.pending_destructions() == 0 && self.driver.pending_submissions() == 0 {
                return;
            }
        }
    }

    /// Submissions whose label matches `label`.
    pub fn submissions_labelled(&self, label: &str) -> Vec<SubmittedCommand> {
        self.driver
            .submissions()
            .into_iter()
            .filter(|s| s.label == label)
            .collect()
    }
}

/// Initialize logging once per test binary.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic byte pattern.
pub fn test_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

/// Barriers recorded in a submission.
pub fn barriers(submission: &SubmittedCommand) -> Vec<PipelineBarrier> {
    submission
        .ops
        .iter()
        .filter_map(RecordedOp::as_barrier)
        .copied()
        .collect()
}

/// Image barriers recorded in a submission for `image`.
pub fn image_barriers(submission: &SubmittedCommand, image: vk::Image) -> Vec<PipelineBarrier> {
    barriers(submission)
        .into_iter()
        .filter(|b| b.image().is_some_and(|i| i.image == image))
        .collect()
}

/// Buffer barriers recorded in a submission for `buffer`.
pub fn buffer_barriers(submission: &SubmittedCommand, buffer: vk::Buffer) -> Vec<PipelineBarrier> {
    barriers(submission)
        .into_iter()
        .filter(|b| b.buffer().is_some_and(|i| i.buffer == buffer))
        .collect()
}
