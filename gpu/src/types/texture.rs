//! Texture types and descriptors.

use ash::vk;
use bitflags::bitflags;

use super::Extent3d;

/// Texture format enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum TextureFormat {
    /// 8-bit red channel, unsigned normalized.
    R8Unorm,
    /// 8-bit RG channels, unsigned normalized.
    Rg8Unorm,
    /// 16-bit red channel, float.
    R16Float,
    /// 32-bit red channel, float.
    R32Float,
    /// 32-bit red channel, unsigned integer.
    R32Uint,
    /// 8-bit RGBA channels, unsigned normalized.
    #[default]
    Rgba8Unorm,
    /// 8-bit RGBA channels, sRGB.
    Rgba8UnormSrgb,
    /// 8-bit BGRA channels, unsigned normalized.
    Bgra8Unorm,
    /// 16-bit RGBA channels, float.
    Rgba16Float,
    /// 32-bit RGBA channels, float.
    Rgba32Float,
    /// 32-bit depth, float.
    Depth32Float,
    /// 24-bit depth with 8-bit stencil.
    Depth24PlusStencil8,
}

impl TextureFormat {
    /// Returns true if this is a depth or stencil format.
    pub fn is_depth_stencil(&self) -> bool {
        matches!(self, Self::Depth32Float | Self::Depth24PlusStencil8)
    }

    /// Returns the size in bytes per texel.
    pub fn block_size(&self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rg8Unorm | Self::R16Float => 2,
            Self::R32Float
            | Self::R32Uint
            | Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::Bgra8Unorm
            | Self::Depth32Float
            | Self::Depth24PlusStencil8 => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }

    pub(crate) fn to_vk(self) -> vk::Format {
        match self {
            Self::R8Unorm => vk::Format::R8_UNORM,
            Self::Rg8Unorm => vk::Format::R8G8_UNORM,
            Self::R16Float => vk::Format::R16_SFLOAT,
            Self::R32Float => vk::Format::R32_SFLOAT,
            Self::R32Uint => vk::Format::R32_UINT,
            Self::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Self::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
            Self::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Self::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            Self::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            Self::Depth32Float => vk::Format::D32_SFLOAT,
            Self::Depth24PlusStencil8 => vk::Format::D24_UNORM_S8_UINT,
        }
    }

    pub(crate) fn aspect_mask(self) -> vk::ImageAspectFlags {
        match self {
            Self::Depth32Float => vk::ImageAspectFlags::DEPTH,
            Self::Depth24PlusStencil8 => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
            _ => vk::ImageAspectFlags::COLOR,
        }
    }
}

bitflags! {
    /// Usage flags for textures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        /// Texture can be copied or blitted from.
        const COPY_SRC = 1 << 0;
        /// Texture can be copied, blitted or cleared into.
        const COPY_DST = 1 << 1;
        /// Texture can be sampled in a shader.
        const TEXTURE_BINDING = 1 << 2;
        /// Texture can be used as a storage texture.
        const STORAGE_BINDING = 1 << 3;
        /// Texture can be used as a render attachment.
        const RENDER_ATTACHMENT = 1 << 4;
    }
}

impl Default for TextureUsage {
    fn default() -> Self {
        Self::empty()
    }
}

impl TextureUsage {
    pub(crate) fn to_vk(self, format: TextureFormat) -> vk::ImageUsageFlags {
        let mut flags = vk::ImageUsageFlags::empty();
        if self.contains(Self::COPY_SRC) {
            flags |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if self.contains(Self::COPY_DST) {
            flags |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        if self.contains(Self::TEXTURE_BINDING) {
            flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if self.contains(Self::STORAGE_BINDING) {
            flags |= vk::ImageUsageFlags::STORAGE;
        }
        if self.contains(Self::RENDER_ATTACHMENT) {
            flags |= if format.is_depth_stencil() {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::ImageUsageFlags::COLOR_ATTACHMENT
            };
        }
        flags
    }
}

bitflags! {
    /// Capabilities a driver reports for a texture format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FormatFeatures: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        /// Native blit source.
        const BLIT_SRC = 1 << 3;
        /// Native blit destination.
        const BLIT_DST = 1 << 4;
        /// Linear filtering during blits.
        const LINEAR_FILTER = 1 << 5;
    }
}

/// Descriptor for creating a texture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    /// Debug label for the texture.
    pub label: Option<String>,
    /// Size of the texture.
    pub size: Extent3d,
    /// Mip level count.
    pub mip_level_count: u32,
    /// Texture format.
    pub format: TextureFormat,
    /// Usage flags.
    pub usage: TextureUsage,
    /// Whether the texture may be shared with a foreign API.
    pub exportable: bool,
}

impl TextureDescriptor {
    /// Create a new 2D texture descriptor.
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            label: None,
            size: Extent3d::new_2d(width, height),
            mip_level_count: 1,
            format,
            usage,
            exportable: false,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the mip level count.
    pub fn with_mip_levels(mut self, count: u32) -> Self {
        self.mip_level_count = count;
        self
    }

    /// Allow the texture to be exported to a foreign API.
    pub fn exportable(mut self) -> Self {
        self.exportable = true;
        self
    }

    /// Size in bytes of the base mip level.
    pub fn byte_size(&self) -> u64 {
        self.size.texel_count() * self.format.block_size() as u64
    }
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            size: Extent3d::default(),
            mip_level_count: 1,
            format: TextureFormat::default(),
            usage: TextureUsage::empty(),
            exportable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_attachment_usage_depends_on_format() {
        let usage = TextureUsage::RENDER_ATTACHMENT;
        assert_eq!(
            usage.to_vk(TextureFormat::Rgba8Unorm),
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        );
        assert_eq!(
            usage.to_vk(TextureFormat::Depth32Float),
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        );
    }

    #[test]
    fn test_descriptor_byte_size() {
        let desc = TextureDescriptor::new_2d(
            16,
            8,
            TextureFormat::Rgba16Float,
            TextureUsage::COPY_DST,
        )
        .with_label("hdr")
        .exportable();
        assert_eq!(desc.byte_size(), 16 * 8 * 8);
        assert!(desc.exportable);
        assert_eq!(desc.label.as_deref(), Some("hdr"));
    }
}
