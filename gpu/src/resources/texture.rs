//! GPU texture resource.

use std::sync::Arc;

use ash::vk;
use parking_lot::{Mutex, MutexGuard};

use super::{DeferredDestructor, DeferredResource};
use crate::command::CommandId;
use crate::driver::MemorySlice;
use crate::hazard::TextureState;
use crate::types::{Extent3d, TextureDescriptor, TextureFormat};

/// A GPU texture.
///
/// Created by [`GpuDevice::create_texture`](crate::GpuDevice::create_texture).
/// The image is destroyed once the handle is dropped and the last command
/// that used it has completed.
///
/// ```ignore
/// let texture = device.create_texture(&TextureDescriptor::new_2d(
///     256, 256, TextureFormat::Rgba8Unorm, TextureUsage::COPY_DST,
/// ))?;
/// device.clear_texture(&texture, ClearColor::TRANSPARENT)?;
/// ```
pub struct Texture {
    descriptor: TextureDescriptor,
    image: vk::Image,
    memory: Option<MemorySlice>,
    state: Mutex<TextureState>,
    deferred: Arc<DeferredDestructor>,
}

impl Texture {
    pub(crate) fn new(
        descriptor: TextureDescriptor,
        image: vk::Image,
        memory: Option<MemorySlice>,
        deferred: Arc<DeferredDestructor>,
    ) -> Self {
        Self {
            descriptor,
            image,
            memory,
            state: Mutex::new(TextureState::default()),
            deferred,
        }
    }

    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.descriptor
    }

    /// Native image handle, for engines recording their own work.
    pub fn raw(&self) -> vk::Image {
        self.image
    }

    pub fn size(&self) -> Extent3d {
        self.descriptor.size
    }

    pub fn format(&self) -> TextureFormat {
        self.descriptor.format
    }

    pub fn label(&self) -> Option<&str> {
        self.descriptor.label.as_deref()
    }

    /// Snapshot of the hazard state.
    pub fn state(&self) -> TextureState {
        self.state.lock().clone()
    }

    /// Last command that recorded a use of this texture.
    pub fn last_use(&self) -> Option<CommandId> {
        self.state.lock().last_use
    }

    pub(crate) fn aspect_mask(&self) -> vk::ImageAspectFlags {
        self.descriptor.format.aspect_mask()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, TextureState> {
        self.state.lock()
    }

    pub(crate) fn restore_state(&self, state: TextureState) {
        *self.state.lock() = state;
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        let state = std::mem::take(self.state.get_mut());
        if state.ext_sync.as_ref().is_some_and(|sync| !sync.is_consumed()) {
            log::warn!(
                "texture {:?} dropped while exported; waiting for the importer before destroying it",
                self.label()
            );
        }
        self.deferred.queue(
            DeferredResource::Texture {
                image: self.image,
                memory: self.memory.take(),
                guard: state.guard,
                ext_deps: state.ext_deps,
            },
            state.last_use,
        );
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("size", &self.descriptor.size)
            .field("format", &self.descriptor.format)
            .field("usage", &self.descriptor.usage)
            .field("label", &self.descriptor.label)
            .finish()
    }
}

static_assertions::assert_impl_all!(Texture: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TextureUsage;
    use ash::vk::Handle;

    fn texture(deferred: &Arc<DeferredDestructor>) -> Texture {
        let desc = TextureDescriptor::new_2d(
            64,
            32,
            TextureFormat::Depth32Float,
            TextureUsage::RENDER_ATTACHMENT,
        )
        .with_label("depth");
        Texture::new(desc, vk::Image::from_raw(3), None, deferred.clone())
    }

    #[test]
    fn test_texture_debug() {
        let deferred = Arc::new(DeferredDestructor::new());
        let debug = format!("{:?}", texture(&deferred));
        assert!(debug.contains("Texture"));
        assert!(debug.contains("depth"));
    }

    #[test]
    fn test_depth_aspect() {
        let deferred = Arc::new(DeferredDestructor::new());
        let tex = texture(&deferred);
        assert_eq!(tex.aspect_mask(), vk::ImageAspectFlags::DEPTH);
        assert_eq!(tex.size().width, 64);
    }

    #[test]
    fn test_drop_defers_destruction() {
        let deferred = Arc::new(DeferredDestructor::new());
        let tex = texture(&deferred);
        tex.lock_state().last_use = Some(CommandId(4));
        drop(tex);

        assert_eq!(deferred.pending_count(), 1);
        assert!(deferred.take_ready(|id| id < CommandId(4)).is_empty());
        assert_eq!(deferred.take_ready(|_| true).len(), 1);
    }
}
