//! Recorded barrier descriptions.
//!
//! Barriers are recorded into a command as plain data and translated into
//! `vkCmdPipelineBarrier` calls by the driver at submission time. Queue
//! ownership moves are tagged with [`QueueTransfer`] so that each half of a
//! release/acquire pair can be inspected on its own.

use ash::vk;

/// Queue family ownership movement attached to a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueTransfer {
    /// Release half, recorded on a command of `queue_from`.
    Release { queue_from: u32, queue_to: u32 },
    /// Acquire half, recorded on a command of `queue_to`.
    Acquire { queue_from: u32, queue_to: u32 },
}

impl QueueTransfer {
    /// Source family index.
    pub fn src_family(&self) -> u32 {
        match *self {
            Self::Release { queue_from, .. } | Self::Acquire { queue_from, .. } => queue_from,
        }
    }

    /// Destination family index.
    pub fn dst_family(&self) -> u32 {
        match *self {
            Self::Release { queue_to, .. } | Self::Acquire { queue_to, .. } => queue_to,
        }
    }

    pub fn is_release(&self) -> bool {
        matches!(self, Self::Release { .. })
    }

    /// Returns true if either side is a foreign API.
    pub fn crosses_external(&self) -> bool {
        self.src_family() == vk::QUEUE_FAMILY_EXTERNAL
            || self.dst_family() == vk::QUEUE_FAMILY_EXTERNAL
    }
}

/// Image layout / access transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect_mask: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub transfer: Option<QueueTransfer>,
}

impl ImageBarrier {
    /// Native barrier struct covering every mip level and layer.
    pub fn to_vk(&self) -> vk::ImageMemoryBarrier<'static> {
        let (src_family, dst_family) = family_pair(self.transfer);
        vk::ImageMemoryBarrier::default()
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect_mask,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            })
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
    }
}

/// Buffer range access transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub transfer: Option<QueueTransfer>,
}

impl BufferBarrier {
    pub fn to_vk(&self) -> vk::BufferMemoryBarrier<'static> {
        let (src_family, dst_family) = family_pair(self.transfer);
        vk::BufferMemoryBarrier::default()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family)
            .buffer(self.buffer)
            .offset(self.offset)
            .size(self.size)
    }
}

fn family_pair(transfer: Option<QueueTransfer>) -> (u32, u32) {
    match transfer {
        Some(t) => (t.src_family(), t.dst_family()),
        None => (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED),
    }
}

/// The resource a [`PipelineBarrier`] applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierTarget {
    Image(ImageBarrier),
    Buffer(BufferBarrier),
}

/// A single pipeline barrier as recorded into a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub target: BarrierTarget,
}

impl PipelineBarrier {
    pub fn image(&self) -> Option<&ImageBarrier> {
        match &self.target {
            BarrierTarget::Image(barrier) => Some(barrier),
            _ => None,
        }
    }

    pub fn buffer(&self) -> Option<&BufferBarrier> {
        match &self.target {
            BarrierTarget::Buffer(barrier) => Some(barrier),
            _ => None,
        }
    }

    /// Queue transfer carried by this barrier, if any.
    pub fn transfer(&self) -> Option<QueueTransfer> {
        match &self.target {
            BarrierTarget::Image(barrier) => barrier.transfer,
            BarrierTarget::Buffer(barrier) => barrier.transfer,
        }
    }
}
