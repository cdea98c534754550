//! Texture hazard tracking.

use std::sync::Arc;

use ash::vk;

use super::{
    BarrierTarget, ImageBarrier, PipelineBarrier, QueueOwner, QueueTransfer, TextureRequest,
    fallback_src_stage,
};
use crate::command::{CommandId, Handoff, HandoffTarget, RecordedOp, Recording};
use crate::error::{GpuError, GpuResult};
use crate::resources::Texture;
use crate::sync::{GuardSignal, SyncObject, WaitKind};

/// Recorded state of a texture.
#[derive(Debug, Clone, Default)]
pub struct TextureState {
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags,
    pub owner: QueueOwner,
    /// Signal of the last recorded use.
    pub guard: Option<GuardSignal>,
    /// Contents may be discarded on next use.
    pub may_invalidate: bool,
    /// Foreign work the next use must wait for.
    pub ext_deps: Vec<Arc<SyncObject>>,
    /// Sync object of the latest export.
    pub ext_sync: Option<Arc<SyncObject>>,
    pub last_use: Option<CommandId>,
}

impl Recording<'_> {
    /// Prepare `texture` for the access described by `request`.
    ///
    /// Must be called before recording any operation that touches the
    /// texture, followed by [`Recording::texture_signal`] afterwards.
    pub fn texture_barrier(
        &mut self,
        texture: &Arc<Texture>,
        request: impl Into<TextureRequest>,
    ) -> GpuResult<()> {
        let request = request.into();
        let mux = self.multiplexer();
        let cmd = self.command_mut()?;
        let family = cmd.family;
        let mut state = texture.lock_state();

        if request.export {
            match state.owner {
                QueueOwner::Family(owner) if owner != family => {
                    return Err(GpuError::UnsupportedTransition(format!(
                        "cannot export from family {family}, texture is owned by family {owner}"
                    )));
                }
                QueueOwner::External => {
                    return Err(GpuError::UnsupportedTransition(
                        "texture is already exported".into(),
                    ));
                }
                _ => {}
            }
        }

        cmd.journal.record_texture(texture, &state);

        let discard = request.discard || state.may_invalidate;
        let old_layout = if discard {
            vk::ImageLayout::UNDEFINED
        } else {
            state.layout
        };
        let mut src_access = if discard {
            vk::AccessFlags::empty()
        } else {
            state.access
        };
        let mut src_stage = None;
        let mut transfer = None;
        let mut handoff = None;

        match state.owner {
            QueueOwner::Family(from) if from != family && !discard => {
                let release = ImageBarrier {
                    image: texture.raw(),
                    aspect_mask: texture.aspect_mask(),
                    old_layout,
                    new_layout: request.layout,
                    src_access,
                    dst_access: vk::AccessFlags::empty(),
                    transfer: Some(QueueTransfer::Release {
                        queue_from: from,
                        queue_to: family,
                    }),
                };
                let guard = state.guard;
                let (side, signal) = mux.prepare_side(from, "queue release", |side, pool| {
                    if let Some(guard) = guard {
                        pool.wait(side, guard, vk::PipelineStageFlags::ALL_COMMANDS);
                    }
                    side.record(RecordedOp::Barrier(PipelineBarrier {
                        src_stage: vk::PipelineStageFlags::ALL_COMMANDS,
                        dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                        target: BarrierTarget::Image(release),
                    }));
                    pool.acquire(mux.driver(), side, vk::PipelineStageFlags::ALL_COMMANDS)
                })?;
                state.guard = None;
                mux.signals().wait(cmd, signal, request.stage);
                log::trace!(
                    "texture {:?}: family {from} -> {family} via {}",
                    texture.label(),
                    side.id()
                );
                handoff = Some((side, signal));
                transfer = Some(QueueTransfer::Acquire {
                    queue_from: from,
                    queue_to: family,
                });
                src_access = vk::AccessFlags::empty();
                src_stage = Some(request.stage);
            }
            QueueOwner::External if !discard => {
                transfer = Some(QueueTransfer::Acquire {
                    queue_from: vk::QUEUE_FAMILY_EXTERNAL,
                    queue_to: family,
                });
                src_access = vk::AccessFlags::empty();
            }
            _ => {}
        }

        // Foreign work must finish before we touch the image, even when its
        // contents are discarded.
        for sync in std::mem::take(&mut state.ext_deps) {
            cmd.journal.record_sync(&sync);
            cmd.add_wait(sync.signal_semaphore(), request.stage);
            sync.consume_signal(cmd.id);
            src_stage = src_stage.or(Some(request.stage));
        }

        if let Some(guard) = state.guard.take() {
            match mux.signals().wait(cmd, guard, request.stage) {
                WaitKind::Barrier { src_stage: stage } => {
                    src_stage = Some(src_stage.map_or(stage, |s| s | stage));
                }
                WaitKind::Semaphore => src_stage = src_stage.or(Some(request.stage)),
            }
        }

        if request.export {
            transfer = Some(QueueTransfer::Release {
                queue_from: family,
                queue_to: vk::QUEUE_FAMILY_EXTERNAL,
            });
        }

        let needs_barrier = (request.layout != vk::ImageLayout::UNDEFINED || handoff.is_some())
            && (old_layout != request.layout || src_access != request.access || transfer.is_some());
        if needs_barrier {
            let barrier = PipelineBarrier {
                src_stage: src_stage.unwrap_or_else(|| fallback_src_stage(src_access)),
                dst_stage: request.stage,
                target: BarrierTarget::Image(ImageBarrier {
                    image: texture.raw(),
                    aspect_mask: texture.aspect_mask(),
                    old_layout,
                    new_layout: request.layout,
                    src_access,
                    dst_access: request.access,
                    transfer,
                }),
            };
            log::trace!(
                "texture {:?}: {:?} -> {:?} in {}",
                texture.label(),
                old_layout,
                request.layout,
                cmd.id
            );
            cmd.record(RecordedOp::Barrier(barrier));
            if let Some((release, signal)) = handoff {
                cmd.handoffs.push(Handoff {
                    release,
                    signal,
                    target: HandoffTarget::Texture(Arc::downgrade(texture)),
                    acquire: barrier,
                });
            }
        }

        state.layout = request.layout;
        state.access = request.access;
        state.may_invalidate = false;
        state.owner = if request.export {
            QueueOwner::External
        } else {
            QueueOwner::Family(family)
        };
        state.last_use = Some(cmd.id);
        Ok(())
    }

    /// Guard the operation just recorded on `texture` with a fresh signal
    /// fired at `stage`.
    pub fn texture_signal(
        &mut self,
        texture: &Arc<Texture>,
        stage: vk::PipelineStageFlags,
    ) -> GpuResult<()> {
        let mux = self.multiplexer();
        let cmd = self.command_mut()?;
        let mut state = texture.lock_state();
        if state.guard.is_some() {
            return Err(GpuError::Misuse(format!(
                "texture {:?} signaled without a preceding barrier",
                texture.label()
            )));
        }
        cmd.journal.record_texture(texture, &state);
        state.guard = Some(mux.signals().acquire(mux.driver(), cmd, stage)?);
        state.last_use = Some(cmd.id);
        Ok(())
    }

    /// Make the recording command signal `sync` and remember it on the
    /// texture. The texture must have just been released with an export
    /// barrier.
    pub(crate) fn attach_texture_export(
        &mut self,
        texture: &Arc<Texture>,
        sync: &Arc<SyncObject>,
    ) -> GpuResult<()> {
        let cmd = self.command_mut()?;
        let mut state = texture.lock_state();
        cmd.journal.record_texture(texture, &state);
        cmd.journal.record_sync(sync);
        cmd.external_signals.push(sync.wait_semaphore());
        sync.arm(cmd.id);
        state.ext_deps.push(Arc::clone(sync));
        state.ext_sync = Some(Arc::clone(sync));
        state.last_use = Some(cmd.id);
        Ok(())
    }
}

#[cfg(all(test, feature = "dummy"))]
mod tests {
    use super::*;
    use crate::command::CommandMultiplexer;
    use crate::driver::dummy::DummyDriver;
    use crate::hazard::TextureAccess;
    use crate::resources::DeferredDestructor;
    use crate::types::{QueueType, TextureDescriptor, TextureFormat, TextureUsage};
    use ash::vk::Handle;

    fn setup() -> (Arc<DummyDriver>, CommandMultiplexer, Arc<Texture>) {
        let driver = Arc::new(DummyDriver::new());
        let mux = CommandMultiplexer::new(driver.clone(), None);
        let desc = TextureDescriptor::new_2d(
            4,
            4,
            TextureFormat::Rgba8Unorm,
            TextureUsage::COPY_SRC | TextureUsage::COPY_DST,
        );
        let texture = Arc::new(Texture::new(
            desc,
            vk::Image::from_raw(7),
            None,
            Arc::new(DeferredDestructor::new()),
        ));
        (driver, mux, texture)
    }

    fn image_barriers(rec: &Recording<'_>) -> Vec<ImageBarrier> {
        rec.command()
            .unwrap()
            .barriers()
            .filter_map(|b| b.image().copied())
            .collect()
    }

    #[test]
    fn test_repeated_request_emits_single_barrier() {
        let (_driver, mux, texture) = setup();
        let mut rec = mux.begin(QueueType::Graphics, "test", None).unwrap();
        rec.texture_barrier(&texture, TextureAccess::TransferWrite)
            .unwrap();
        rec.texture_signal(&texture, vk::PipelineStageFlags::TRANSFER)
            .unwrap();
        rec.texture_barrier(&texture, TextureAccess::TransferWrite)
            .unwrap();

        let barriers = image_barriers(&rec);
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(
            barriers[0].new_layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        // Same-command signal was folded into the barrier.
        assert!(rec.command().unwrap().waits().is_empty());
    }

    #[test]
    fn test_layout_change_uses_signal_stage() {
        let (_driver, mux, texture) = setup();
        let mut rec = mux.begin(QueueType::Graphics, "test", None).unwrap();
        rec.texture_barrier(&texture, TextureAccess::TransferWrite)
            .unwrap();
        rec.texture_signal(&texture, vk::PipelineStageFlags::TRANSFER)
            .unwrap();
        rec.texture_barrier(&texture, TextureAccess::ShaderRead)
            .unwrap();

        let cmd = rec.command().unwrap();
        let last = cmd.barriers().last().unwrap();
        assert_eq!(last.src_stage, vk::PipelineStageFlags::TRANSFER);
        let image = last.image().unwrap();
        assert_eq!(image.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(image.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(image.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn test_cross_family_use_releases_and_acquires() {
        let (driver, mux, texture) = setup();
        let mut rec = mux.begin(QueueType::Transfer, "upload", None).unwrap();
        rec.texture_barrier(&texture, TextureAccess::TransferWrite)
            .unwrap();
        rec.texture_signal(&texture, vk::PipelineStageFlags::TRANSFER)
            .unwrap();
        mux.end(rec, false).unwrap();

        let mut rec = mux.begin(QueueType::Graphics, "sample", None).unwrap();
        rec.texture_barrier(&texture, TextureAccess::ShaderRead)
            .unwrap();

        // The release waits for the sampling command to be submitted.
        assert_eq!(driver.submission_count(), 1);
        assert_eq!(rec.command().unwrap().handoffs.len(), 1);

        let acquire = image_barriers(&rec)[0];
        assert_eq!(
            acquire.transfer,
            Some(QueueTransfer::Acquire { queue_from: 2, queue_to: 0 })
        );
        assert!(acquire.src_access.is_empty());
        assert_eq!(rec.command().unwrap().waits().len(), 1);
        assert_eq!(texture.state().owner, QueueOwner::Family(0));
        mux.end(rec, true).unwrap();

        let submitted = driver.submissions();
        let labels: Vec<&str> = submitted.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, ["upload", "queue release", "sample"]);
        let release = submitted[1]
            .ops
            .iter()
            .filter_map(RecordedOp::as_barrier)
            .find_map(|b| b.transfer())
            .unwrap();
        assert_eq!(release, QueueTransfer::Release { queue_from: 2, queue_to: 0 });
        assert_eq!(driver.semaphore_misuses(), 0);
    }

    #[test]
    fn test_discarded_acquire_keeps_previous_owner() {
        let (driver, mux, texture) = setup();
        let mut rec = mux.begin(QueueType::Transfer, "upload", None).unwrap();
        rec.texture_barrier(&texture, TextureAccess::TransferWrite)
            .unwrap();
        rec.texture_signal(&texture, vk::PipelineStageFlags::TRANSFER)
            .unwrap();
        mux.end(rec, true).unwrap();
        let armed = mux.armed_signals();

        let mut rec = mux.begin(QueueType::Graphics, "sample", None).unwrap();
        rec.texture_barrier(&texture, TextureAccess::ShaderRead)
            .unwrap();
        mux.discard(rec);

        let state = texture.state();
        assert_eq!(state.owner, QueueOwner::Family(2));
        assert_eq!(state.layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(mux.armed_signals(), armed);
        assert_eq!(driver.submission_count(), 1);

        // A later acquire still pairs with exactly one release.
        let mut rec = mux.begin(QueueType::Graphics, "sample", None).unwrap();
        rec.texture_barrier(&texture, TextureAccess::ShaderRead)
            .unwrap();
        mux.end(rec, true).unwrap();
        let releases = driver
            .submissions()
            .iter()
            .filter(|s| s.label == "queue release")
            .count();
        assert_eq!(releases, 1);
        assert_eq!(driver.semaphore_misuses(), 0);
    }

    #[test]
    fn test_discard_skips_transfer() {
        let (driver, mux, texture) = setup();
        let mut rec = mux.begin(QueueType::Transfer, "upload", None).unwrap();
        rec.texture_barrier(&texture, TextureAccess::TransferWrite)
            .unwrap();
        mux.end(rec, true).unwrap();

        let mut rec = mux.begin(QueueType::Graphics, "clear", None).unwrap();
        rec.texture_barrier(
            &texture,
            TextureRequest::new(TextureAccess::TransferWrite).discarding(),
        )
        .unwrap();
        assert_eq!(driver.submission_count(), 1);
        let barrier = image_barriers(&rec)[0];
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.transfer, None);
    }

    #[test]
    fn test_export_conflicting_owner_is_rejected() {
        let (_driver, mux, texture) = setup();
        let mut rec = mux.begin(QueueType::Transfer, "upload", None).unwrap();
        rec.texture_barrier(&texture, TextureAccess::TransferWrite)
            .unwrap();
        mux.end(rec, true).unwrap();

        let mut rec = mux.begin(QueueType::Graphics, "export", None).unwrap();
        let err = rec
            .texture_barrier(&texture, TextureAccess::Export)
            .unwrap_err();
        assert!(matches!(err, GpuError::UnsupportedTransition(_)));
        assert_eq!(texture.state().owner, QueueOwner::Family(2));
    }

    #[test]
    fn test_double_signal_is_misuse() {
        let (_driver, mux, texture) = setup();
        let mut rec = mux.begin(QueueType::Graphics, "test", None).unwrap();
        rec.texture_barrier(&texture, TextureAccess::TransferWrite)
            .unwrap();
        rec.texture_signal(&texture, vk::PipelineStageFlags::TRANSFER)
            .unwrap();
        let err = rec
            .texture_signal(&texture, vk::PipelineStageFlags::TRANSFER)
            .unwrap_err();
        assert!(matches!(err, GpuError::Misuse(_)));
    }

    #[test]
    fn test_discarded_command_restores_state() {
        let (_driver, mux, texture) = setup();
        let mut rec = mux.begin(QueueType::Graphics, "scratch", None).unwrap();
        rec.texture_barrier(&texture, TextureAccess::TransferWrite)
            .unwrap();
        rec.texture_signal(&texture, vk::PipelineStageFlags::TRANSFER)
            .unwrap();
        mux.discard(rec);

        let state = texture.state();
        assert_eq!(state.layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(state.owner, QueueOwner::Unowned);
        assert!(state.guard.is_none());
        assert_eq!(mux.armed_signals(), 0);
    }
}
