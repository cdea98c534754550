//! Native driver abstraction.
//!
//! The synchronization layer never talks to a GPU API directly. Everything
//! native goes through two traits:
//!
//! - [`Driver`]: object creation, semaphores and queue submission
//! - [`MemoryAllocator`]: device memory slices and host access to them
//!
//! # Available Drivers
//!
//! - `dummy` (default): in-process simulation used by tests
//! - `vulkan`: native Vulkan driver using ash and gpu-allocator

#[cfg(feature = "dummy")]
pub mod dummy;

#[cfg(feature = "vulkan")]
pub mod vulkan;

use std::time::Duration;

use ash::vk;

use crate::command::{CommandId, RecordedOp, SemaphoreWait};
use crate::error::GpuResult;
use crate::types::{BufferDescriptor, FormatFeatures, QueueFamilies, TextureDescriptor, TextureFormat};

/// Opaque handle for a submitted command, issued by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmissionToken(pub u64);

/// OS handle of an exported semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalHandle {
    /// POSIX file descriptor.
    Fd(i32),
    /// Win32 `HANDLE`.
    Win32(u64),
}

/// Everything the driver needs to execute one command.
#[derive(Debug)]
pub struct Submission<'a> {
    pub id: CommandId,
    pub family: u32,
    pub label: &'a str,
    pub ops: &'a [RecordedOp],
    pub waits: &'a [SemaphoreWait],
    pub signals: &'a [vk::Semaphore],
    /// Measure GPU execution time of this submission.
    pub timed: bool,
}

/// Memory requirements of a native object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

/// Where an allocation should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    GpuOnly,
    CpuToGpu,
    GpuToCpu,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryRequest<'a> {
    pub label: &'a str,
    pub requirements: MemoryRequirements,
    pub location: MemoryLocation,
    /// Buffers and linear images; images with optimal tiling are not linear.
    pub linear: bool,
}

/// A region of device memory handed out by a [`MemoryAllocator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySlice {
    /// Allocator-specific identifier.
    pub id: u64,
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
    pub host_visible: bool,
}

/// Native queue model.
///
/// Implementations must be thread-safe; the layer calls `submit` and `wait`
/// from whichever thread drives it.
pub trait Driver: Send + Sync + 'static {
    /// Human readable driver name.
    fn name(&self) -> &'static str;

    fn queue_families(&self) -> QueueFamilies;

    fn format_features(&self, format: TextureFormat) -> FormatFeatures;

    fn create_image(
        &self,
        descriptor: &TextureDescriptor,
    ) -> GpuResult<(vk::Image, MemoryRequirements)>;

    fn bind_image_memory(&self, image: vk::Image, memory: &MemorySlice) -> GpuResult<()>;

    fn destroy_image(&self, image: vk::Image);

    fn create_buffer(
        &self,
        descriptor: &BufferDescriptor,
    ) -> GpuResult<(vk::Buffer, MemoryRequirements)>;

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: &MemorySlice) -> GpuResult<()>;

    fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Create a binary semaphore, optionally exportable to a foreign API.
    fn create_semaphore(&self, exportable: bool) -> GpuResult<vk::Semaphore>;

    fn export_semaphore(&self, semaphore: vk::Semaphore) -> GpuResult<ExternalHandle>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Hand a recorded command to the queue of `submission.family`.
    fn submit(&self, submission: &Submission<'_>) -> GpuResult<SubmissionToken>;

    /// Wait up to `timeout` for a submission. Returns `true` once complete.
    fn wait(&self, token: SubmissionToken, timeout: Duration) -> GpuResult<bool>;

    /// Release driver state of a completed submission, returning its GPU
    /// execution time if it was timed.
    fn finish(&self, token: SubmissionToken) -> Option<Duration>;
}

/// External device memory allocator.
pub trait MemoryAllocator: Send + Sync + 'static {
    fn allocate(&self, request: &MemoryRequest<'_>) -> GpuResult<MemorySlice>;

    fn free(&self, slice: MemorySlice);

    /// Copy `data` into a host-visible slice.
    fn write(&self, slice: &MemorySlice, offset: u64, data: &[u8]) -> GpuResult<()>;

    /// Copy from a host-visible slice into `out`.
    fn read(&self, slice: &MemorySlice, offset: u64, out: &mut [u8]) -> GpuResult<()>;
}
