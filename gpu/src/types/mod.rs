//! Common types and descriptors for GPU resources.
//!
//! This module contains format enums, usage flags, queue selection and the
//! descriptor structs used throughout the synchronization layer.

mod buffer;
mod common;
mod queue;
mod texture;

pub use buffer::{BufferDescriptor, BufferUsage};
pub use common::{ClearColor, Extent3d, Origin3d, TextureRegion};
pub use queue::{QueueFamilies, QueueType};
pub use texture::{FormatFeatures, TextureDescriptor, TextureFormat, TextureUsage};
