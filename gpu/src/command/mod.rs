//! Command recording and queue multiplexing.
//!
//! A [`Command`] is an ordered list of [`RecordedOp`]s plus the semaphores it
//! waits on and signals. Commands are created by the
//! [`CommandMultiplexer`], which keeps at most one command recording at a time
//! and submits it when a caller needs a different queue family.

mod journal;
mod multiplexer;
mod timer;

pub(crate) use journal::StateJournal;
pub use multiplexer::{CommandMultiplexer, Recording};
pub use timer::Timer;

use std::fmt;
use std::sync::{Arc, Weak};

use ash::vk;

use crate::hazard::{PipelineBarrier, QueueOwner};
use crate::resources::{Buffer, Texture};
use crate::sync::{GuardSignal, SignalId};
use crate::types::{ClearColor, QueueType};

/// Monotonically increasing command identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(pub(crate) u64);

impl CommandId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

/// A semaphore the command waits on before the given stages execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
}

/// Operation recorded into a command, in submission order.
#[derive(Debug, Clone)]
pub enum RecordedOp {
    Barrier(PipelineBarrier),
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
    /// Inline data update, at most one update chunk in size.
    UpdateBuffer {
        dst: vk::Buffer,
        offset: u64,
        data: Vec<u8>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        region: vk::BufferImageCopy,
    },
    CopyImageToBuffer {
        src: vk::Image,
        dst: vk::Buffer,
        region: vk::BufferImageCopy,
    },
    BlitImage {
        src: vk::Image,
        dst: vk::Image,
        region: vk::ImageBlit,
        filter: vk::Filter,
    },
    ClearColorImage {
        image: vk::Image,
        color: ClearColor,
        aspect_mask: vk::ImageAspectFlags,
    },
    /// Compute dispatch recorded by a self-dispatch engine, which owns the
    /// pipeline and its descriptor sets.
    Dispatch {
        label: String,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        descriptor_sets: Vec<vk::DescriptorSet>,
        push_constants: Vec<u8>,
        groups: [u32; 3],
    },
}

impl RecordedOp {
    pub fn as_barrier(&self) -> Option<&PipelineBarrier> {
        match self {
            Self::Barrier(barrier) => Some(barrier),
            _ => None,
        }
    }
}

/// Resource moved by a [`Handoff`].
pub(crate) enum HandoffTarget {
    Texture(Weak<Texture>),
    Buffer(Weak<Buffer>),
}

impl HandoffTarget {
    pub(crate) fn is_alive(&self) -> bool {
        match self {
            Self::Texture(weak) => weak.strong_count() > 0,
            Self::Buffer(weak) => weak.strong_count() > 0,
        }
    }

    /// Record that `acquire` ran on `family` in `cmd`, guarded by `guard`.
    pub(crate) fn complete(
        &self,
        family: u32,
        cmd: CommandId,
        guard: GuardSignal,
        acquire: &PipelineBarrier,
    ) {
        match self {
            Self::Texture(weak) => {
                if let Some(texture) = weak.upgrade() {
                    let mut state = texture.lock_state();
                    if let Some(image) = acquire.image() {
                        state.layout = image.new_layout;
                        state.access = image.dst_access;
                    }
                    state.owner = QueueOwner::Family(family);
                    state.guard = Some(guard);
                    state.may_invalidate = false;
                    state.last_use = Some(cmd);
                }
            }
            Self::Buffer(weak) => {
                if let Some(buffer) = weak.upgrade() {
                    let mut state = buffer.lock_state();
                    if let Some(barrier) = acquire.buffer() {
                        state.access = barrier.dst_access;
                    }
                    state.owner = QueueOwner::Family(family);
                    state.guard = Some(guard);
                    state.last_use = Some(cmd);
                }
            }
        }
    }
}

/// Release half of a queue family ownership transfer.
///
/// Recorded as a side command on the releasing family and submitted right
/// before the command holding the matching acquire. Until then ownership has
/// not moved, so dropping the acquiring command leaves the resource with its
/// old family.
pub(crate) struct Handoff {
    pub(crate) release: Command,
    /// Fired by `release`, waited on by the acquiring command.
    pub(crate) signal: GuardSignal,
    pub(crate) target: HandoffTarget,
    /// Acquire barrier as recorded in the receiving command.
    pub(crate) acquire: PipelineBarrier,
}

/// Point in a recording command that later work can be undone to.
pub(crate) struct Checkpoint {
    pub(crate) ops: usize,
    pub(crate) waits: Vec<SemaphoreWait>,
    pub(crate) signals: Vec<SignalId>,
    pub(crate) unsignaled: Vec<SignalId>,
    pub(crate) external_signals: usize,
    pub(crate) consumed: usize,
    pub(crate) handoffs: usize,
    pub(crate) journal: usize,
}

/// A command being recorded for one queue family.
pub struct Command {
    pub(crate) id: CommandId,
    pub(crate) queue: QueueType,
    pub(crate) family: u32,
    pub(crate) label: String,
    pub(crate) ops: Vec<RecordedOp>,
    pub(crate) waits: Vec<SemaphoreWait>,
    /// Pool signals fired when the command completes.
    pub(crate) signals: Vec<SignalId>,
    /// Foreign semaphores fired when the command completes.
    pub(crate) external_signals: Vec<vk::Semaphore>,
    /// Signals this command waits on; recycled once it completes.
    pub(crate) consumed: Vec<GuardSignal>,
    /// Signals produced and consumed inside this command.
    pub(crate) unsignaled: Vec<SignalId>,
    /// Ownership transfers this command acquires.
    pub(crate) handoffs: Vec<Handoff>,
    pub(crate) timer: Option<Arc<Timer>>,
    pub(crate) journal: StateJournal,
}

impl Command {
    pub(crate) fn new(id: CommandId, queue: QueueType, family: u32, label: &str) -> Self {
        Self {
            id,
            queue,
            family,
            label: label.to_owned(),
            ops: Vec::new(),
            waits: Vec::new(),
            signals: Vec::new(),
            external_signals: Vec::new(),
            consumed: Vec::new(),
            unsignaled: Vec::new(),
            handoffs: Vec::new(),
            timer: None,
            journal: StateJournal::default(),
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Concrete queue type this command records for.
    pub fn queue(&self) -> QueueType {
        self.queue
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn ops(&self) -> &[RecordedOp] {
        &self.ops
    }

    pub fn waits(&self) -> &[SemaphoreWait] {
        &self.waits
    }

    /// Append an operation.
    ///
    /// Hazard tracking is the caller's job: resources touched by `op` must
    /// have gone through a barrier request on the same command.
    pub fn record(&mut self, op: RecordedOp) {
        self.ops.push(op);
    }

    pub(crate) fn add_wait(&mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) {
        // One wait per semaphore; later requests widen the stage mask.
        if let Some(wait) = self.waits.iter_mut().find(|w| w.semaphore == semaphore) {
            wait.stage |= stage;
            return;
        }
        self.waits.push(SemaphoreWait { semaphore, stage });
    }

    pub(crate) fn checkpoint(&mut self) -> Checkpoint {
        Checkpoint {
            ops: self.ops.len(),
            waits: self.waits.clone(),
            signals: self.signals.clone(),
            unsignaled: self.unsignaled.clone(),
            external_signals: self.external_signals.len(),
            consumed: self.consumed.len(),
            handoffs: self.handoffs.len(),
            journal: self.journal.mark(),
        }
    }

    /// True if submitting the command would have no effect.
    pub(crate) fn is_empty(&self) -> bool {
        self.ops.is_empty()
            && self.waits.is_empty()
            && self.signals.is_empty()
            && self.external_signals.is_empty()
            && self.handoffs.is_empty()
            && self.journal.is_empty()
    }

    pub(crate) fn barriers(&self) -> impl Iterator<Item = &PipelineBarrier> {
        self.ops.iter().filter_map(RecordedOp::as_barrier)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("family", &self.family)
            .field("label", &self.label)
            .field("ops", &self.ops.len())
            .field("waits", &self.waits.len())
            .field("signals", &self.signals.len())
            .field("handoffs", &self.handoffs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_duplicate_waits_merge_stages() {
        let mut cmd = Command::new(CommandId(1), QueueType::Graphics, 0, "test");
        let sem = vk::Semaphore::from_raw(42);
        cmd.add_wait(sem, vk::PipelineStageFlags::TRANSFER);
        cmd.add_wait(sem, vk::PipelineStageFlags::FRAGMENT_SHADER);

        assert_eq!(cmd.waits().len(), 1);
        assert_eq!(
            cmd.waits()[0].stage,
            vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::FRAGMENT_SHADER
        );
    }

    #[test]
    fn test_command_id_display() {
        assert_eq!(CommandId(7).to_string(), "cmd#7");
        assert!(CommandId(3) < CommandId(4));
    }
}
