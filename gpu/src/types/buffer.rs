//! Buffer types and descriptors.

use ash::vk;
use bitflags::bitflags;

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Buffer can be used as a vertex buffer.
        const VERTEX = 1 << 0;
        /// Buffer can be used as an index buffer.
        const INDEX = 1 << 1;
        /// Buffer can be used as a uniform buffer.
        const UNIFORM = 1 << 2;
        /// Buffer can be used as a storage buffer.
        const STORAGE = 1 << 3;
        /// Buffer can be copied from.
        const COPY_SRC = 1 << 5;
        /// Buffer can be copied to.
        const COPY_DST = 1 << 6;
        /// Buffer is mappable for CPU reads.
        const MAP_READ = 1 << 7;
        /// Buffer is mappable for CPU writes.
        const MAP_WRITE = 1 << 8;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}

impl BufferUsage {
    pub(crate) fn to_vk(self) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::empty();
        if self.contains(Self::VERTEX) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(Self::INDEX) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(Self::UNIFORM) {
            flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.contains(Self::STORAGE) {
            flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        // Host-visible buffers double as staging buffers.
        if self.intersects(Self::COPY_SRC | Self::MAP_WRITE) {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if self.intersects(Self::COPY_DST | Self::MAP_READ) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        flags
    }
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferDescriptor {
    /// Debug label for the buffer.
    pub label: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Usage flags.
    pub usage: BufferUsage,
    /// Whether the buffer may be shared with a foreign API.
    pub exportable: bool,
}

impl BufferDescriptor {
    /// Create a new buffer descriptor.
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
            exportable: false,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Allow the buffer to be exported to a foreign API.
    pub fn exportable(mut self) -> Self {
        self.exportable = true;
        self
    }

    /// Memory of this buffer is mapped into the host address space.
    pub fn is_host_visible(&self) -> bool {
        self.usage
            .intersects(BufferUsage::MAP_READ | BufferUsage::MAP_WRITE)
    }

    /// The host reads this buffer, so GPU writes need an explicit flush.
    pub fn is_host_readable(&self) -> bool {
        self.usage.contains(BufferUsage::MAP_READ)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_visibility() {
        let staging = BufferDescriptor::new(256, BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC);
        assert!(staging.is_host_visible());
        assert!(!staging.is_host_readable());

        let readback = BufferDescriptor::new(256, BufferUsage::MAP_READ);
        assert!(readback.is_host_readable());
        assert!(readback.usage.to_vk().contains(vk::BufferUsageFlags::TRANSFER_DST));

        let device_local = BufferDescriptor::new(256, BufferUsage::STORAGE);
        assert!(!device_local.is_host_visible());
    }
}
