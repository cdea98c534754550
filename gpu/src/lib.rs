//! # RedLilium GPU
//!
//! Resource and command synchronization layer over an explicit GPU API.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`CommandMultiplexer`] - one recording command at a time, shared by all
//!   callers and submitted when the queue family changes
//! - [`hazard`] - per-resource layout / access / ownership state machines
//!   that emit the minimal barriers and queue transfers
//! - [`SignalPool`] - recyclable semaphores that guard in-flight resources
//! - [`GpuDevice`] - reference-counted textures and buffers with deferred
//!   destruction, transfer operations and export to foreign APIs
//! - Multiple driver support: Vulkan (feature `vulkan`) and Dummy (for testing)
//!
//! ## Example
//!
//! ```ignore
//! use redlilium_gpu::{DeviceParameters, GpuDevice, QueueType};
//!
//! let device = GpuDevice::new(driver, allocator, DeviceParameters::new());
//! let texture = device.create_texture(&descriptor)?;
//! device.upload_texture(&texture, &upload)?;
//! let sync = device.export_texture(&texture)?;
//! // hand sync.wait_handle() / sync.signal_handle() to the importer
//! ```

pub mod command;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod hazard;
pub mod profiling;
pub mod resources;
pub mod sync;
pub mod types;

pub use command::{Command, CommandId, CommandMultiplexer, RecordedOp, Recording, Timer};
pub use config::DeviceParameters;
pub use device::{BlitParams, GpuDevice, TextureDownload, TextureUpload, UploadSource};
pub use dispatch::{BlitJob, SelfDispatch};
pub use driver::{Driver, ExternalHandle, MemoryAllocator};
pub use error::{GpuError, GpuResult};
pub use hazard::{
    BufferOp, BufferRequest, BufferState, QueueOwner, QueueTransfer, TextureAccess,
    TextureRequest, TextureState,
};
pub use resources::{Buffer, Texture};
pub use sync::{SignalPool, SyncObject};
pub use types::{
    BufferDescriptor, BufferUsage, ClearColor, Extent3d, FormatFeatures, Origin3d, QueueFamilies,
    QueueType, TextureDescriptor, TextureFormat, TextureRegion, TextureUsage,
};

#[cfg(feature = "dummy")]
pub use driver::dummy::{DummyAllocator, DummyDriver};
#[cfg(feature = "vulkan")]
pub use driver::vulkan::{VulkanAllocator, VulkanDriver, VulkanDriverDesc};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
