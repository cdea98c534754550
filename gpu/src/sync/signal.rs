//! Signal pool.
//!
//! A signal is a binary semaphore fired when a particular command completes.
//! Resources keep the signal of their last use as a guard; the next command
//! touching the resource waits on it. Binary semaphores must be waited on
//! before they can be signaled again, so a slot only returns to the free list
//! once the command that waited on it has completed.

use ash::vk;

use crate::command::{Command, CommandId};
use crate::driver::Driver;
use crate::error::{GpuError, GpuResult};

/// Index of a slot in the [`SignalPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId(u32);

/// Non-owning reference to a signal that guards a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardSignal {
    pub(crate) id: SignalId,
    /// Command that fires the signal.
    pub(crate) command: CommandId,
    pub(crate) family: u32,
    /// Stage after which the guarded access is complete.
    pub(crate) stage: vk::PipelineStageFlags,
}

impl GuardSignal {
    pub fn command(&self) -> CommandId {
        self.command
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn stage(&self) -> vk::PipelineStageFlags {
        self.stage
    }
}

/// How a wait on a guard was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// The signal belonged to the same unsubmitted command; it was removed and
    /// a pipeline barrier from `src_stage` orders the accesses instead.
    Barrier { src_stage: vk::PipelineStageFlags },
    /// A semaphore wait was added to the command.
    Semaphore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Attached to a command that has not completed its wait cycle yet.
    Armed(CommandId),
}

#[derive(Debug)]
struct Slot {
    /// Null once the semaphore was destroyed as stale.
    semaphore: vk::Semaphore,
    state: SlotState,
}

/// Recycling allocator for signals.
#[derive(Debug, Default)]
pub struct SignalPool {
    slots: Vec<Slot>,
    free: Vec<SignalId>,
    capacity: Option<usize>,
}

impl SignalPool {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
        }
    }

    /// Attach a fresh signal to `command`, fired at `stage`.
    pub(crate) fn acquire(
        &mut self,
        driver: &dyn Driver,
        command: &mut Command,
        stage: vk::PipelineStageFlags,
    ) -> GpuResult<GuardSignal> {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                if self.capacity.is_some_and(|cap| self.slots.len() >= cap) {
                    return Err(GpuError::OutOfSignals {
                        capacity: self.slots.len(),
                    });
                }
                self.slots.push(Slot {
                    semaphore: vk::Semaphore::null(),
                    state: SlotState::Free,
                });
                SignalId((self.slots.len() - 1) as u32)
            }
        };

        let slot = &mut self.slots[id.0 as usize];
        if slot.semaphore == vk::Semaphore::null() {
            match driver.create_semaphore(false) {
                Ok(semaphore) => slot.semaphore = semaphore,
                Err(err) => {
                    self.free.push(id);
                    return Err(err);
                }
            }
        }
        slot.state = SlotState::Armed(command.id);
        command.signals.push(id);

        Ok(GuardSignal {
            id,
            command: command.id,
            family: command.family,
            stage,
        })
    }

    /// Make `command` wait for `guard` before `stage`.
    ///
    /// Never stalls the CPU. The guard's slot is recycled after `command`
    /// completes.
    pub(crate) fn wait(
        &mut self,
        command: &mut Command,
        guard: GuardSignal,
        stage: vk::PipelineStageFlags,
    ) -> WaitKind {
        if guard.command == command.id {
            if let Some(pos) = command.signals.iter().position(|id| *id == guard.id) {
                command.signals.remove(pos);
                command.unsignaled.push(guard.id);
                return WaitKind::Barrier {
                    src_stage: guard.stage,
                };
            }
        }

        command.add_wait(self.semaphore(guard.id), stage);
        command.consumed.push(guard);
        self.slots[guard.id.0 as usize].state = SlotState::Armed(command.id);
        WaitKind::Semaphore
    }

    pub(crate) fn semaphore(&self, id: SignalId) -> vk::Semaphore {
        self.slots[id.0 as usize].semaphore
    }

    /// Return unsignaled or fully waited slots to the free list.
    pub(crate) fn release(&mut self, ids: impl IntoIterator<Item = SignalId>) {
        for id in ids {
            let slot = &mut self.slots[id.0 as usize];
            if slot.state != SlotState::Free {
                slot.state = SlotState::Free;
                self.free.push(id);
            }
        }
    }

    /// Undo the waits of a command that never reached the GPU. The consumed
    /// signals belong to their original producers again.
    pub(crate) fn rearm(&mut self, consumed: &[GuardSignal]) {
        for guard in consumed {
            self.slots[guard.id.0 as usize].state = SlotState::Armed(guard.command);
        }
    }

    /// Destroy the semaphore of a signal that fired but was never waited on.
    ///
    /// A signaled binary semaphore cannot be reused, so the slot gets a new
    /// semaphore on its next acquisition.
    pub(crate) fn retire_stale(&mut self, driver: &dyn Driver, guard: GuardSignal) {
        let slot = &mut self.slots[guard.id.0 as usize];
        if slot.state != SlotState::Armed(guard.command) {
            // Someone waited on it in the meantime; normal recycling applies.
            return;
        }
        log::trace!("retiring stale signal {:?} of {}", guard.id, guard.command);
        driver.destroy_semaphore(slot.semaphore);
        slot.semaphore = vk::Semaphore::null();
        slot.state = SlotState::Free;
        self.free.push(guard.id);
    }

    /// Destroy every native semaphore.
    pub(crate) fn destroy_all(&mut self, driver: &dyn Driver) {
        for slot in self.slots.drain(..) {
            if slot.semaphore != vk::Semaphore::null() {
                driver.destroy_semaphore(slot.semaphore);
            }
        }
        self.free.clear();
    }

    /// Signals that can still be acquired, `None` when unbounded.
    pub fn available(&self) -> Option<usize> {
        self.capacity
            .map(|cap| cap.saturating_sub(self.slots.len()) + self.free.len())
    }

    /// Slots ready for reuse.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Slots currently attached to a command.
    pub fn armed_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state != SlotState::Free)
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
