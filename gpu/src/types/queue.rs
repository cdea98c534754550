//! Queue selection.

/// Kind of queue a command is recorded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueType {
    /// Graphics queue. Supports every operation.
    #[default]
    Graphics,
    /// Async compute queue.
    Compute,
    /// Dedicated transfer queue.
    Transfer,
    /// Whichever queue is currently recording, or graphics when idle.
    Any,
}

/// Queue family indices reported by the driver.
///
/// Several queue types may share a family; operations that move between
/// queue types of the same family need no ownership transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    /// All queue types backed by a single family.
    pub fn unified(family: u32) -> Self {
        Self {
            graphics: family,
            compute: family,
            transfer: family,
        }
    }

    /// Family index for a concrete queue type.
    ///
    /// `Any` maps to the graphics family; callers that want "current queue"
    /// semantics resolve `Any` before calling this.
    pub fn family_of(&self, queue: QueueType) -> u32 {
        match queue {
            QueueType::Graphics | QueueType::Any => self.graphics,
            QueueType::Compute => self.compute,
            QueueType::Transfer => self.transfer,
        }
    }

    /// Distinct family indices, graphics first.
    pub fn distinct(&self) -> Vec<u32> {
        let mut families = vec![self.graphics];
        for family in [self.compute, self.transfer] {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}
