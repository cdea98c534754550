//! Self-dispatch seam for emulated operations.
//!
//! When a format cannot be blitted natively, [`GpuDevice::blit`] hands the
//! work to a registered [`SelfDispatch`] engine. The device has already
//! transitioned the source to shader-read and the destination to
//! storage-write layout; the engine only records into the command it is
//! given.
//!
//! [`GpuDevice::blit`]: crate::GpuDevice::blit

use ash::vk;

use crate::command::Command;
use crate::error::GpuResult;
use crate::types::{TextureFormat, TextureRegion};

/// A blit the device could not perform natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitJob {
    pub src: vk::Image,
    pub dst: vk::Image,
    pub src_format: TextureFormat,
    pub dst_format: TextureFormat,
    pub src_region: TextureRegion,
    pub dst_region: TextureRegion,
    pub filter: vk::Filter,
}

impl BlitJob {
    /// Workgroups needed to cover the destination with 8x8 tiles.
    pub fn workgroups(&self) -> [u32; 3] {
        let extent = self.dst_region.extent;
        [
            extent.width.div_ceil(8),
            extent.height.div_ceil(8),
            extent.depth.max(1),
        ]
    }
}

/// Compute engine that records emulated blits.
///
/// Called with the recording slot held: implementations must not call back
/// into the device.
pub trait SelfDispatch: Send + Sync {
    fn supports_blit(&self, src: TextureFormat, dst: TextureFormat) -> bool;

    fn record_blit(&self, command: &mut Command, job: &BlitJob) -> GpuResult<()>;
}
