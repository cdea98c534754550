//! Resource hazard tracking.
//!
//! Every texture and buffer carries a small state machine: the layout and
//! access of its last recorded use, the queue family that owns it, and the
//! signal guarding that use. Before an operation touches a resource it
//! issues a barrier request through its [`Recording`](crate::Recording); the
//! tracker compares the request with the recorded state and emits exactly the
//! synchronization needed:
//!
//! - nothing, when layout, access and owner already match
//! - a pipeline barrier, when they differ within one queue family
//! - a release/acquire pair guarded by a shared signal, when the owning
//!   family changes
//! - semaphore waits on foreign work, for resources handed back from an
//!   external API
//!
//! State is updated when the operation is recorded, not when it executes.

mod access;
mod barriers;
mod buffer;
mod texture;

pub use access::{BufferOp, BufferRequest, TextureAccess, TextureRequest};
pub(crate) use access::WRITE_ACCESS;
pub use barriers::{BarrierTarget, BufferBarrier, ImageBarrier, PipelineBarrier, QueueTransfer};
pub use buffer::BufferState;
pub use texture::TextureState;

use ash::vk;

/// Queue family currently owning a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueOwner {
    /// Never used; any family may take it without a transfer.
    #[default]
    Unowned,
    Family(u32),
    /// Released to a foreign API.
    External,
}

/// Source stage for a barrier whose execution dependency was not already
/// established by a same-command signal.
fn fallback_src_stage(src_access: vk::AccessFlags) -> vk::PipelineStageFlags {
    if src_access.is_empty() {
        vk::PipelineStageFlags::TOP_OF_PIPE
    } else {
        vk::PipelineStageFlags::ALL_COMMANDS
    }
}
