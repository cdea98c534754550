//! GPU buffer resource.

use std::sync::Arc;

use ash::vk;
use parking_lot::{Mutex, MutexGuard};

use super::{DeferredDestructor, DeferredResource};
use crate::command::CommandId;
use crate::driver::MemorySlice;
use crate::hazard::BufferState;
use crate::types::BufferDescriptor;

/// A GPU buffer.
///
/// Created by [`GpuDevice::create_buffer`](crate::GpuDevice::create_buffer).
/// Host-visible buffers are written directly when idle; otherwise writes go
/// through inline updates on the transfer queue.
pub struct Buffer {
    descriptor: BufferDescriptor,
    buffer: vk::Buffer,
    memory: Option<MemorySlice>,
    state: Mutex<BufferState>,
    deferred: Arc<DeferredDestructor>,
}

impl Buffer {
    pub(crate) fn new(
        descriptor: BufferDescriptor,
        buffer: vk::Buffer,
        memory: Option<MemorySlice>,
        deferred: Arc<DeferredDestructor>,
    ) -> Self {
        Self {
            descriptor,
            buffer,
            memory,
            state: Mutex::new(BufferState::default()),
            deferred,
        }
    }

    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    pub fn raw(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    pub fn label(&self) -> Option<&str> {
        self.descriptor.label.as_deref()
    }

    pub fn state(&self) -> BufferState {
        self.state.lock().clone()
    }

    pub fn last_use(&self) -> Option<CommandId> {
        self.state.lock().last_use
    }

    /// Backing memory when the CPU can map it.
    pub(crate) fn host_memory(&self) -> Option<&MemorySlice> {
        self.memory.as_ref().filter(|memory| memory.host_visible)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock()
    }

    pub(crate) fn restore_state(&self, state: BufferState) {
        *self.state.lock() = state;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let state = std::mem::take(self.state.get_mut());
        if state.exported {
            log::warn!("buffer {:?} dropped while exported", self.label());
        }
        self.deferred.queue(
            DeferredResource::Buffer {
                buffer: self.buffer,
                memory: self.memory.take(),
                guard: state.guard,
                ext_deps: state.ext_deps,
            },
            state.last_use,
        );
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.descriptor.size)
            .field("usage", &self.descriptor.usage)
            .field("label", &self.descriptor.label)
            .finish()
    }
}

static_assertions::assert_impl_all!(Buffer: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BufferUsage;
    use ash::vk::Handle;

    fn buffer(deferred: &Arc<DeferredDestructor>, size: u64) -> Buffer {
        let desc = BufferDescriptor::new(size, BufferUsage::UNIFORM);
        Buffer::new(desc, vk::Buffer::from_raw(9), None, deferred.clone())
    }

    #[test]
    fn test_buffer_debug() {
        let deferred = Arc::new(DeferredDestructor::new());
        let debug = format!("{:?}", buffer(&deferred, 1024));
        assert!(debug.contains("Buffer"));
        assert!(debug.contains("1024"));
    }

    #[test]
    fn test_unused_buffer_is_ready_immediately() {
        let deferred = Arc::new(DeferredDestructor::new());
        drop(buffer(&deferred, 2048));
        assert_eq!(deferred.take_ready(|_| false).len(), 1);
    }
}
