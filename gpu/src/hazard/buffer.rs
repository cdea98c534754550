//! Buffer hazard tracking.

use std::sync::Arc;

use ash::vk;

use super::{
    BarrierTarget, BufferBarrier, BufferOp, BufferRequest, PipelineBarrier, QueueOwner,
    QueueTransfer, WRITE_ACCESS, fallback_src_stage,
};
use crate::command::{CommandId, Handoff, HandoffTarget, RecordedOp, Recording};
use crate::error::{GpuError, GpuResult};
use crate::resources::Buffer;
use crate::sync::{GuardSignal, SyncObject, WaitKind};

/// Recorded state of a buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferState {
    pub access: vk::AccessFlags,
    pub owner: QueueOwner,
    pub guard: Option<GuardSignal>,
    /// Writes recorded since the last read barrier.
    pub pending_writes: u32,
    /// GPU writes not yet made visible to host reads.
    pub needs_flush: bool,
    pub exported: bool,
    pub ext_deps: Vec<Arc<SyncObject>>,
    pub ext_sync: Option<Arc<SyncObject>>,
    pub last_use: Option<CommandId>,
}

impl Recording<'_> {
    /// Prepare `buffer` for the use described by `request`.
    pub fn buffer_barrier(&mut self, buffer: &Arc<Buffer>, request: BufferRequest) -> GpuResult<()> {
        let mux = self.multiplexer();
        let cmd = self.command_mut()?;
        let family = cmd.family;
        let mut state = buffer.lock_state();
        let export = request.op.contains(BufferOp::EXPORT);

        if export {
            match state.owner {
                QueueOwner::Family(owner) if owner != family => {
                    return Err(GpuError::UnsupportedTransition(format!(
                        "cannot export from family {family}, buffer is owned by family {owner}"
                    )));
                }
                QueueOwner::External => {
                    return Err(GpuError::UnsupportedTransition(
                        "buffer is already exported".into(),
                    ));
                }
                _ => {}
            }
        }

        cmd.journal.record_buffer(buffer, &state);

        let mut src_access = state.access;
        let mut src_stage = None;
        let mut transfer = None;
        let mut handoff = None;

        match state.owner {
            QueueOwner::Family(from) if from != family => {
                let release = BufferBarrier {
                    buffer: buffer.raw(),
                    offset: 0,
                    size: vk::WHOLE_SIZE,
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
                        target: BarrierTarget::Buffer(release),
                    }));
                    pool.acquire(mux.driver(), side, vk::PipelineStageFlags::ALL_COMMANDS)
                })?;
                state.guard = None;
                mux.signals().wait(cmd, signal, request.stage);
                handoff = Some((side, signal));
                transfer = Some(QueueTransfer::Acquire {
                    queue_from: from,
                    queue_to: family,
                });
                src_access = vk::AccessFlags::empty();
                src_stage = Some(request.stage);
            }
            QueueOwner::External => {
                transfer = Some(QueueTransfer::Acquire {
                    queue_from: vk::QUEUE_FAMILY_EXTERNAL,
                    queue_to: family,
                });
                src_access = vk::AccessFlags::empty();
                state.exported = false;
            }
            _ => {}
        }

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

        if export {
            transfer = Some(QueueTransfer::Release {
                queue_from: family,
                queue_to: vk::QUEUE_FAMILY_EXTERNAL,
            });
        }

        let needs_barrier = src_access != request.access || transfer.is_some();
        if needs_barrier {
            // Ownership moves always cover the whole buffer.
            let (offset, size) = if transfer.is_some() {
                (0, vk::WHOLE_SIZE)
            } else {
                (request.offset, request.size)
            };
            let barrier = PipelineBarrier {
                src_stage: src_stage.unwrap_or_else(|| fallback_src_stage(src_access)),
                dst_stage: request.stage,
                target: BarrierTarget::Buffer(BufferBarrier {
                    buffer: buffer.raw(),
                    offset,
                    size,
                    src_access,
                    dst_access: request.access,
                    transfer,
                }),
            };
            cmd.record(RecordedOp::Barrier(barrier));
            if let Some((release, signal)) = handoff {
                cmd.handoffs.push(Handoff {
                    release,
                    signal,
                    target: HandoffTarget::Buffer(Arc::downgrade(buffer)),
                    acquire: barrier,
                });
            }
        }

        if request.op.contains(BufferOp::WRITE) {
            state.pending_writes += 1;
            if buffer.descriptor().is_host_readable() {
                state.needs_flush = true;
            }
        } else if needs_barrier && !request.access.intersects(WRITE_ACCESS) {
            state.pending_writes = 0;
        }

        state.access = request.access;
        if export {
            state.exported = true;
            state.owner = QueueOwner::External;
        } else {
            state.owner = QueueOwner::Family(family);
        }
        state.last_use = Some(cmd.id);
        Ok(())
    }

    /// Guard the operation just recorded on `buffer` with a fresh signal.
    pub fn buffer_signal(
        &mut self,
        buffer: &Arc<Buffer>,
        stage: vk::PipelineStageFlags,
    ) -> GpuResult<()> {
        let mux = self.multiplexer();
        let cmd = self.command_mut()?;
        let mut state = buffer.lock_state();
        if state.guard.is_some() {
            return Err(GpuError::Misuse(format!(
                "buffer {:?} signaled without a preceding barrier",
                buffer.label()
            )));
        }
        cmd.journal.record_buffer(buffer, &state);
        state.guard = Some(mux.signals().acquire(mux.driver(), cmd, stage)?);
        state.last_use = Some(cmd.id);
        Ok(())
    }

    pub(crate) fn attach_buffer_export(
        &mut self,
        buffer: &Arc<Buffer>,
        sync: &Arc<SyncObject>,
    ) -> GpuResult<()> {
        let cmd = self.command_mut()?;
        let mut state = buffer.lock_state();
        cmd.journal.record_buffer(buffer, &state);
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
    use crate::resources::DeferredDestructor;
    use crate::types::{BufferDescriptor, BufferUsage, QueueType};
    use ash::vk::Handle;

    fn buffer(usage: BufferUsage) -> Arc<Buffer> {
        Arc::new(Buffer::new(
            BufferDescriptor::new(256, usage),
            vk::Buffer::from_raw(11),
            None,
            Arc::new(DeferredDestructor::new()),
        ))
    }

    fn setup() -> (Arc<DummyDriver>, CommandMultiplexer) {
        let driver = Arc::new(DummyDriver::new());
        let mux = CommandMultiplexer::new(driver.clone(), None);
        (driver, mux)
    }

    #[test]
    fn test_write_then_read_resets_pending_writes() {
        let (_driver, mux) = setup();
        let buf = buffer(BufferUsage::COPY_DST | BufferUsage::COPY_SRC);
        let mut rec = mux.begin(QueueType::Graphics, "test", None).unwrap();

        rec.buffer_barrier(&buf, BufferRequest::transfer_write(0, 256))
            .unwrap();
        rec.buffer_barrier(&buf, BufferRequest::transfer_write(0, 256))
            .unwrap();
        assert_eq!(buf.state().pending_writes, 2);

        rec.buffer_barrier(&buf, BufferRequest::transfer_read(0, 256))
            .unwrap();
        assert_eq!(buf.state().pending_writes, 0);
        // First write, then write -> read; write -> write needs nothing.
        assert_eq!(rec.command().unwrap().barriers().count(), 2);
    }

    #[test]
    fn test_host_readable_write_needs_flush() {
        let (_driver, mux) = setup();
        let buf = buffer(BufferUsage::COPY_DST | BufferUsage::MAP_READ);
        let mut rec = mux.begin(QueueType::Transfer, "test", None).unwrap();
        rec.buffer_barrier(&buf, BufferRequest::transfer_write(0, 16))
            .unwrap();
        assert!(buf.state().needs_flush);

        // Only an explicit flush clears it.
        rec.buffer_barrier(&buf, BufferRequest::transfer_read(0, 16))
            .unwrap();
        assert!(buf.state().needs_flush);
    }

    #[test]
    fn test_export_then_reuse_acquires_from_external() {
        let (_driver, mux) = setup();
        let buf = buffer(BufferUsage::STORAGE);
        let mut rec = mux.begin(QueueType::Graphics, "export", None).unwrap();
        rec.buffer_barrier(&buf, BufferRequest::export()).unwrap();
        assert!(buf.state().exported);
        assert_eq!(buf.state().owner, QueueOwner::External);
        mux.end(rec, true).unwrap();

        let mut rec = mux.begin(QueueType::Graphics, "reuse", None).unwrap();
        rec.buffer_barrier(&buf, BufferRequest::shader_read(0, 256))
            .unwrap();
        let barrier = *rec
            .command()
            .unwrap()
            .barriers()
            .last()
            .unwrap()
            .buffer()
            .unwrap();
        assert_eq!(
            barrier.transfer,
            Some(QueueTransfer::Acquire {
                queue_from: vk::QUEUE_FAMILY_EXTERNAL,
                queue_to: 0
            })
        );
        assert!(!buf.state().exported);
    }

    #[test]
    fn test_failed_submission_restores_state() {
        let (driver, mux) = setup();
        let buf = buffer(BufferUsage::COPY_DST);
        driver.fail_next_submit(GpuError::SubmissionFailed("rejected".into()));

        let mut rec = mux.begin(QueueType::Transfer, "doomed", None).unwrap();
        rec.buffer_barrier(&buf, BufferRequest::transfer_write(0, 16))
            .unwrap();
        rec.buffer_signal(&buf, vk::PipelineStageFlags::TRANSFER)
            .unwrap();
        assert!(mux.end(rec, true).is_err());

        let state = buf.state();
        assert_eq!(state.pending_writes, 0);
        assert_eq!(state.owner, QueueOwner::Unowned);
        assert!(state.guard.is_none());
        assert!(!mux.is_lost());
    }
}
