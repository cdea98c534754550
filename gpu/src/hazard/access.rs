//! Access presets for texture and buffer operations.
//!
//! Each preset names the layout, access mask and pipeline stage an operation
//! needs. The hazard tracker compares these against the recorded state of the
//! resource to decide whether a barrier is required.

use ash::vk;
use bitflags::bitflags;

/// How an operation is going to use a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureAccess {
    /// Source of a copy or native blit.
    TransferRead,
    /// Destination of a copy, clear or native blit.
    TransferWrite,
    /// Sampled from a shader.
    ShaderRead,
    /// Read through a storage binding.
    StorageRead,
    /// Written through a storage binding.
    StorageWrite,
    /// Rendered to as a color attachment.
    ColorAttachment,
    /// Handed to a foreign API.
    Export,
}

impl TextureAccess {
    pub fn layout(self) -> vk::ImageLayout {
        match self {
            Self::TransferRead => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Self::TransferWrite => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Self::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::StorageRead | Self::StorageWrite | Self::Export => vk::ImageLayout::GENERAL,
            Self::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }
    }

    pub fn access(self) -> vk::AccessFlags {
        match self {
            Self::TransferRead => vk::AccessFlags::TRANSFER_READ,
            Self::TransferWrite => vk::AccessFlags::TRANSFER_WRITE,
            Self::ShaderRead | Self::StorageRead => vk::AccessFlags::SHADER_READ,
            Self::StorageWrite => vk::AccessFlags::SHADER_WRITE,
            Self::ColorAttachment => {
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            }
            Self::Export => vk::AccessFlags::empty(),
        }
    }

    pub fn stage(self) -> vk::PipelineStageFlags {
        match self {
            Self::TransferRead | Self::TransferWrite => vk::PipelineStageFlags::TRANSFER,
            Self::ShaderRead | Self::StorageRead | Self::StorageWrite => {
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER
            }
            Self::ColorAttachment => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            Self::Export => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        }
    }

    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::TransferWrite | Self::StorageWrite | Self::ColorAttachment
        )
    }
}

/// Full texture barrier request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureRequest {
    pub stage: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
    pub layout: vk::ImageLayout,
    /// Release the texture to a foreign API after this use.
    pub export: bool,
    /// Previous contents are not needed.
    pub discard: bool,
}

impl TextureRequest {
    pub fn new(access: TextureAccess) -> Self {
        Self {
            stage: access.stage(),
            access: access.access(),
            layout: access.layout(),
            export: access == TextureAccess::Export,
            discard: false,
        }
    }

    /// Mark the previous contents as undefined.
    pub fn discarding(mut self) -> Self {
        self.discard = true;
        self
    }
}

impl From<TextureAccess> for TextureRequest {
    fn from(access: TextureAccess) -> Self {
        Self::new(access)
    }
}

bitflags! {
    /// Kind of buffer use for hazard tracking.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferOp: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Release the buffer to a foreign API after this use.
        const EXPORT = 1 << 2;
    }
}

/// Full buffer barrier request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    pub stage: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
    pub offset: u64,
    pub size: u64,
    pub op: BufferOp,
}

impl BufferRequest {
    /// Read by a transfer command.
    pub fn transfer_read(offset: u64, size: u64) -> Self {
        Self {
            stage: vk::PipelineStageFlags::TRANSFER,
            access: vk::AccessFlags::TRANSFER_READ,
            offset,
            size,
            op: BufferOp::READ,
        }
    }

    /// Written by a transfer command.
    pub fn transfer_write(offset: u64, size: u64) -> Self {
        Self {
            stage: vk::PipelineStageFlags::TRANSFER,
            access: vk::AccessFlags::TRANSFER_WRITE,
            offset,
            size,
            op: BufferOp::WRITE,
        }
    }

    /// Read from a shader.
    pub fn shader_read(offset: u64, size: u64) -> Self {
        Self {
            stage: vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::VERTEX_SHADER,
            access: vk::AccessFlags::SHADER_READ,
            offset,
            size,
            op: BufferOp::READ,
        }
    }

    /// Read by the host after the GPU is done with it.
    pub fn host_read(offset: u64, size: u64) -> Self {
        Self {
            stage: vk::PipelineStageFlags::HOST,
            access: vk::AccessFlags::HOST_READ,
            offset,
            size,
            op: BufferOp::READ,
        }
    }

    /// Whole-buffer release to a foreign API.
    pub fn export() -> Self {
        Self {
            stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            access: vk::AccessFlags::empty(),
            offset: 0,
            size: vk::WHOLE_SIZE,
            op: BufferOp::EXPORT,
        }
    }
}

/// Access bits that imply a memory write.
pub(crate) const WRITE_ACCESS: vk::AccessFlags = vk::AccessFlags::from_raw(
    vk::AccessFlags::SHADER_WRITE.as_raw()
        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags::HOST_WRITE.as_raw()
        | vk::AccessFlags::MEMORY_WRITE.as_raw(),
);
