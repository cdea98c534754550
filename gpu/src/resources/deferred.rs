//! Deferred destruction of GPU resources.
//!
//! GPU commands execute asynchronously, so a resource cannot be destroyed the
//! moment its last handle is dropped: the GPU may still be reading it. Drop
//! hands the native objects to the [`DeferredDestructor`] together with the
//! id of the last command that used them. Every poll cycle collects entries
//! whose command has completed and destroys them.
//!
//! ```text
//! Drop(Arc<Texture>)                   poll_commands()
//!   └─ queue(entry, last_use) ──────►    ├─ retire completed commands
//!                                        └─ take_ready(is_complete)
//!                                             └─ destroy native objects
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ash::vk;
use parking_lot::Mutex;

use crate::command::CommandId;
use crate::driver::{Driver, MemoryAllocator, MemorySlice};
use crate::sync::{GuardSignal, SignalPool, SyncObject};

/// Native objects pending destruction.
pub enum DeferredResource {
    /// An image with its memory. `memory` is `None` for wrapped images.
    Texture {
        image: vk::Image,
        memory: Option<MemorySlice>,
        guard: Option<GuardSignal>,
        /// Foreign work the image still has to wait for.
        ext_deps: Vec<Arc<SyncObject>>,
    },
    Buffer {
        buffer: vk::Buffer,
        memory: Option<MemorySlice>,
        guard: Option<GuardSignal>,
        ext_deps: Vec<Arc<SyncObject>>,
    },
    Semaphore(vk::Semaphore),
}

impl DeferredResource {
    /// External dependencies whose foreign work we have not waited on yet.
    pub(crate) fn undrained(&self) -> Vec<Arc<SyncObject>> {
        match self {
            Self::Texture { ext_deps, .. } | Self::Buffer { ext_deps, .. } => ext_deps
                .iter()
                .filter(|sync| sync.state().consumed_by.is_none())
                .cloned()
                .collect(),
            Self::Semaphore(_) => Vec::new(),
        }
    }

    /// Forget external dependencies once a drain command waits on them.
    pub(crate) fn drained(mut self) -> Self {
        if let Self::Texture { ext_deps, .. } | Self::Buffer { ext_deps, .. } = &mut self {
            ext_deps.clear();
        }
        self
    }

    /// Destroy the native objects.
    ///
    /// The GPU must no longer use them.
    pub(crate) fn destroy(
        self,
        driver: &dyn Driver,
        allocator: &dyn MemoryAllocator,
        signals: &mut SignalPool,
    ) {
        match self {
            Self::Texture {
                image,
                memory,
                guard,
                ext_deps,
            } => {
                if let Some(guard) = guard {
                    signals.retire_stale(driver, guard);
                }
                driver.destroy_image(image);
                if let Some(memory) = memory {
                    allocator.free(memory);
                }
                drop(ext_deps);
            }
            Self::Buffer {
                buffer,
                memory,
                guard,
                ext_deps,
            } => {
                if let Some(guard) = guard {
                    signals.retire_stale(driver, guard);
                }
                driver.destroy_buffer(buffer);
                if let Some(memory) = memory {
                    allocator.free(memory);
                }
                drop(ext_deps);
            }
            Self::Semaphore(semaphore) => driver.destroy_semaphore(semaphore),
        }
    }
}

impl std::fmt::Debug for DeferredResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Texture {
                image, ext_deps, ..
            } => f
                .debug_struct("DeferredResource::Texture")
                .field("image", image)
                .field("ext_deps", &ext_deps.len())
                .finish_non_exhaustive(),
            Self::Buffer {
                buffer, ext_deps, ..
            } => f
                .debug_struct("DeferredResource::Buffer")
                .field("buffer", buffer)
                .field("ext_deps", &ext_deps.len())
                .finish_non_exhaustive(),
            Self::Semaphore(semaphore) => f
                .debug_tuple("DeferredResource::Semaphore")
                .field(semaphore)
                .finish(),
        }
    }
}

struct PendingDestroy {
    after: Option<CommandId>,
    resource: DeferredResource,
}

/// Queue of resources waiting for their last GPU use to complete.
pub struct DeferredDestructor {
    pending: Mutex<Vec<PendingDestroy>>,
    destroyed: AtomicUsize,
}

impl DeferredDestructor {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            destroyed: AtomicUsize::new(0),
        }
    }

    /// Queue `resource` for destruction once `after` has completed.
    /// `None` means the resource was never used by the GPU.
    pub fn queue(&self, resource: DeferredResource, after: Option<CommandId>) {
        log::trace!("deferring destruction of {resource:?} until {after:?}");
        self.pending.lock().push(PendingDestroy { after, resource });
    }

    /// Remove and return every entry whose guarding command completed.
    ///
    /// Entries are returned instead of destroyed in place so that dropping
    /// them (which may queue further entries) happens outside the lock.
    pub(crate) fn take_ready(
        &self,
        is_complete: impl Fn(CommandId) -> bool,
    ) -> Vec<DeferredResource> {
        let mut pending = self.pending.lock();
        let mut ready = Vec::new();
        let mut i = 0;
        while i < pending.len() {
            if pending[i].after.is_none_or(&is_complete) {
                ready.push(pending.swap_remove(i).resource);
            } else {
                i += 1;
            }
        }
        self.destroyed.fetch_add(ready.len(), Ordering::Relaxed);
        ready
    }

    /// Remove every entry regardless of GPU progress. Used at teardown.
    pub(crate) fn take_all(&self) -> Vec<DeferredResource> {
        let ready: Vec<_> = self
            .pending
            .lock()
            .drain(..)
            .map(|entry| entry.resource)
            .collect();
        self.destroyed.fetch_add(ready.len(), Ordering::Relaxed);
        ready
    }

    /// Number of resources waiting for destruction.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Total number of resources handed out for destruction so far.
    pub fn destroyed_count(&self) -> usize {
        self.destroyed.load(Ordering::Relaxed)
    }
}

impl Default for DeferredDestructor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeferredDestructor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredDestructor")
            .field("pending", &self.pending_count())
            .field("destroyed", &self.destroyed_count())
            .finish()
    }
}

static_assertions::assert_impl_all!(DeferredDestructor: Send, Sync);
