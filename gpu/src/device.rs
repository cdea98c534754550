//! GPU device.
//!
//! [`GpuDevice`] ties the pieces together: it creates resources through the
//! driver and the external allocator, routes every operation through the
//! command multiplexer with hazard tracking, and runs deferred destruction
//! on each poll cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use parking_lot::RwLock;

use crate::command::{CommandId, CommandMultiplexer, RecordedOp, Recording, Timer};
use crate::config::DeviceParameters;
use crate::dispatch::{BlitJob, SelfDispatch};
use crate::driver::{Driver, MemoryAllocator, MemoryLocation, MemoryRequest};
use crate::error::{GpuError, GpuResult};
use crate::hazard::{BufferRequest, QueueOwner, TextureAccess, TextureRequest, TextureState};
use crate::resources::{Buffer, DeferredDestructor, Texture};
use crate::sync::SyncObject;
use crate::types::{
    BufferDescriptor, BufferUsage, ClearColor, FormatFeatures, QueueType, TextureDescriptor,
    TextureRegion, TextureUsage,
};

/// Where texture upload data comes from.
#[derive(Debug, Clone, Copy)]
pub enum UploadSource<'a> {
    /// Tightly packed texels in a GPU buffer, starting at `offset`.
    Buffer { buffer: &'a Arc<Buffer>, offset: u64 },
    /// Tightly packed texels in host memory, staged through a temporary
    /// buffer.
    Host(&'a [u8]),
}

/// Parameters for [`GpuDevice::upload_texture`].
#[derive(Debug, Clone, Copy)]
pub struct TextureUpload<'a> {
    pub region: TextureRegion,
    pub source: UploadSource<'a>,
}

/// Parameters for [`GpuDevice::download_texture`].
#[derive(Debug, Clone, Copy)]
pub struct TextureDownload<'a> {
    pub region: TextureRegion,
    pub buffer: &'a Arc<Buffer>,
    pub offset: u64,
}

/// Parameters for [`GpuDevice::blit`].
#[derive(Debug, Clone, Copy)]
pub struct BlitParams<'a> {
    pub src: &'a Arc<Texture>,
    pub dst: &'a Arc<Texture>,
    pub src_region: TextureRegion,
    pub dst_region: TextureRegion,
    pub filter: vk::Filter,
}

impl<'a> BlitParams<'a> {
    /// Blit the whole of `src` onto the whole of `dst` with linear filtering.
    pub fn full(src: &'a Arc<Texture>, dst: &'a Arc<Texture>) -> Self {
        Self {
            src,
            dst,
            src_region: TextureRegion::full(src.size()),
            dst_region: TextureRegion::full(dst.size()),
            filter: vk::Filter::LINEAR,
        }
    }

    pub fn with_filter(mut self, filter: vk::Filter) -> Self {
        self.filter = filter;
        self
    }
}

/// Entry point of the synchronization layer.
///
/// # Thread Safety
///
/// `GpuDevice` is `Send + Sync`. Operations from several threads serialize
/// on the single recording command.
///
/// # Example
///
/// ```ignore
/// let driver = Arc::new(DummyDriver::new());
/// let device = GpuDevice::new(driver.clone(), Arc::new(driver.allocator()), DeviceParameters::new());
///
/// let texture = device.create_texture(&TextureDescriptor::new_2d(
///     64, 64, TextureFormat::Rgba8Unorm, TextureUsage::COPY_DST,
/// ))?;
/// device.clear_texture(&texture, ClearColor::new(1.0, 0.0, 0.0, 1.0))?;
/// while device.poll_texture(&texture, Duration::from_millis(10))? {}
/// ```
pub struct GpuDevice {
    driver: Arc<dyn Driver>,
    allocator: Arc<dyn MemoryAllocator>,
    params: DeviceParameters,
    mux: CommandMultiplexer,
    deferred: Arc<DeferredDestructor>,
    dispatcher: RwLock<Option<Arc<dyn SelfDispatch>>>,
}

impl GpuDevice {
    pub fn new(
        driver: Arc<dyn Driver>,
        allocator: Arc<dyn MemoryAllocator>,
        params: DeviceParameters,
    ) -> Arc<Self> {
        log::info!(
            "GpuDevice: created on {} driver ({:?})",
            driver.name(),
            driver.queue_families()
        );
        let mux = CommandMultiplexer::new(Arc::clone(&driver), params.max_signals);
        Arc::new(Self {
            driver,
            allocator,
            params,
            mux,
            deferred: Arc::new(DeferredDestructor::new()),
            dispatcher: RwLock::new(None),
        })
    }

    pub fn parameters(&self) -> &DeviceParameters {
        &self.params
    }

    pub fn multiplexer(&self) -> &CommandMultiplexer {
        &self.mux
    }

    pub fn is_lost(&self) -> bool {
        self.mux.is_lost()
    }

    /// Register the engine used for blits the hardware cannot do.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn SelfDispatch>) {
        *self.dispatcher.write() = Some(dispatcher);
    }

    /// Resources waiting for their last GPU use to complete.
    pub fn pending_destructions(&self) -> usize {
        self.deferred.pending_count()
    }

    pub fn create_timer(&self) -> Arc<Timer> {
        Arc::new(Timer::new())
    }

    // ---- resources -------------------------------------------------------

    /// Create a texture with undefined contents.
    pub fn create_texture(&self, descriptor: &TextureDescriptor) -> GpuResult<Arc<Texture>> {
        self.mux.check_alive()?;
        if descriptor.size.is_empty() {
            return Err(GpuError::InvalidParameter(
                "texture dimensions cannot be zero".into(),
            ));
        }
        if descriptor.mip_level_count == 0 {
            return Err(GpuError::InvalidParameter(
                "texture needs at least one mip level".into(),
            ));
        }

        let features = self.driver.format_features(descriptor.format);
        let required = [
            (TextureUsage::TEXTURE_BINDING, FormatFeatures::SAMPLED),
            (TextureUsage::STORAGE_BINDING, FormatFeatures::STORAGE),
        ];
        for (usage, feature) in required {
            if descriptor.usage.contains(usage) && !features.contains(feature) {
                return Err(GpuError::FeatureNotSupported(format!(
                    "{:?} does not support {usage:?}",
                    descriptor.format
                )));
            }
        }
        if descriptor.usage.contains(TextureUsage::RENDER_ATTACHMENT)
            && !descriptor.format.is_depth_stencil()
            && !features.contains(FormatFeatures::COLOR_ATTACHMENT)
        {
            return Err(GpuError::FeatureNotSupported(format!(
                "{:?} cannot be rendered to",
                descriptor.format
            )));
        }

        let (image, requirements) = self.driver.create_image(descriptor)?;
        let label = descriptor.label.as_deref().unwrap_or("texture");
        let memory = match self.allocator.allocate(&MemoryRequest {
            label,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
        }) {
            Ok(memory) => memory,
            Err(err) => {
                self.driver.destroy_image(image);
                return Err(err);
            }
        };
        if let Err(err) = self.driver.bind_image_memory(image, &memory) {
            self.allocator.free(memory);
            self.driver.destroy_image(image);
            return Err(err);
        }

        log::trace!(
            "GpuDevice: created texture {:?}, {}x{}x{} {:?}",
            descriptor.label,
            descriptor.size.width,
            descriptor.size.height,
            descriptor.size.depth,
            descriptor.format
        );
        Ok(Arc::new(Texture::new(
            descriptor.clone(),
            image,
            Some(memory),
            Arc::clone(&self.deferred),
        )))
    }

    pub fn create_buffer(&self, descriptor: &BufferDescriptor) -> GpuResult<Arc<Buffer>> {
        self.mux.check_alive()?;
        if descriptor.size == 0 {
            return Err(GpuError::InvalidParameter(
                "buffer size cannot be zero".into(),
            ));
        }

        let location = if descriptor.usage.contains(BufferUsage::MAP_READ) {
            MemoryLocation::GpuToCpu
        } else if descriptor.usage.contains(BufferUsage::MAP_WRITE) {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };

        let (buffer, requirements) = self.driver.create_buffer(descriptor)?;
        let label = descriptor.label.as_deref().unwrap_or("buffer");
        let memory = match self.allocator.allocate(&MemoryRequest {
            label,
            requirements,
            location,
            linear: true,
        }) {
            Ok(memory) => memory,
            Err(err) => {
                self.driver.destroy_buffer(buffer);
                return Err(err);
            }
        };
        if let Err(err) = self.driver.bind_buffer_memory(buffer, &memory) {
            self.allocator.free(memory);
            self.driver.destroy_buffer(buffer);
            return Err(err);
        }

        log::trace!(
            "GpuDevice: created buffer {:?}, size={} ({location:?})",
            descriptor.label,
            descriptor.size
        );
        Ok(Arc::new(Buffer::new(
            descriptor.clone(),
            buffer,
            Some(memory),
            Arc::clone(&self.deferred),
        )))
    }

    /// Declare the texture contents undefined. Nothing is recorded; the next
    /// use transitions from `UNDEFINED`.
    pub fn invalidate_texture(&self, texture: &Arc<Texture>) -> GpuResult<()> {
        self.amend_texture(texture, |state| state.may_invalidate = true)
    }

    /// Make the next use of `texture` wait for foreign work signaling
    /// `sync`'s signal semaphore.
    pub fn add_texture_dependency(
        &self,
        texture: &Arc<Texture>,
        sync: &Arc<SyncObject>,
    ) -> GpuResult<()> {
        self.amend_texture(texture, |state| state.ext_deps.push(Arc::clone(sync)))
    }

    /// Change texture state outside any operation. The change also lands in
    /// the recording command's journal so a rollback of that command keeps it.
    fn amend_texture(
        &self,
        texture: &Arc<Texture>,
        amend: impl Fn(&mut TextureState),
    ) -> GpuResult<()> {
        self.mux.with_recording(|cmd| {
            let mut state = texture.lock_state();
            amend(&mut *state);
            if let Some(cmd) = cmd {
                cmd.journal.amend_texture(texture, &amend);
            }
        })
    }

    // ---- recording -------------------------------------------------------

    /// Get the recording command for `queue`. See [`CommandMultiplexer::begin`].
    pub fn begin(
        &self,
        queue: QueueType,
        label: &str,
        timer: Option<&Arc<Timer>>,
    ) -> GpuResult<Recording<'_>> {
        self.mux.begin(queue, label, timer)
    }

    pub fn end(&self, recording: Recording<'_>, submit: bool) -> GpuResult<()> {
        self.mux.end(recording, submit)
    }

    pub fn discard(&self, recording: Recording<'_>) {
        self.mux.discard(recording)
    }

    /// Submit the recording command, if any.
    pub fn flush(&self) -> GpuResult<()> {
        self.mux.flush()
    }

    /// Record one operation into the shared command.
    ///
    /// A failure part way through undoes only what this operation recorded.
    /// Work other callers batched into the command stays.
    fn record<T>(
        &self,
        queue: QueueType,
        label: &str,
        resources: usize,
        submit: bool,
        op: impl FnOnce(&mut Recording<'_>) -> GpuResult<T>,
    ) -> GpuResult<T> {
        // Each resource needs a guard signal plus, at most, a handoff signal.
        let needed = resources * 2;
        if let Some(available) = self.mux.signals().available()
            && available < needed
        {
            log::warn!("GpuDevice: '{label}' needs {needed} signals, {available} left");
            return Err(GpuError::OutOfSignals {
                capacity: self.params.max_signals.unwrap_or_default(),
            });
        }

        let mut rec = self.mux.begin(queue, label, None)?;
        let checkpoint = rec.command_mut()?.checkpoint();
        match op(&mut rec) {
            Ok(value) => {
                self.mux.end(rec, submit)?;
                Ok(value)
            }
            Err(err) => {
                log::warn!("GpuDevice: '{label}' failed, undoing its recording: {err}");
                self.mux.rewind(&mut rec, checkpoint);
                Err(err)
            }
        }
    }

    // ---- texture operations ----------------------------------------------

    /// Fill the whole texture with `color`.
    pub fn clear_texture(&self, texture: &Arc<Texture>, color: ClearColor) -> GpuResult<()> {
        crate::profile_scope!("clear_texture");
        require_texture_usage(texture, TextureUsage::COPY_DST, "clear")?;
        if texture.format().is_depth_stencil() {
            return Err(GpuError::InvalidParameter(
                "color clear of a depth/stencil texture".into(),
            ));
        }

        self.record(QueueType::Graphics, "clear texture", 1, false, |rec| {
            rec.texture_barrier(
                texture,
                TextureRequest::new(TextureAccess::TransferWrite).discarding(),
            )?;
            rec.command_mut()?.record(RecordedOp::ClearColorImage {
                image: texture.raw(),
                color,
                aspect_mask: texture.aspect_mask(),
            });
            rec.texture_signal(texture, vk::PipelineStageFlags::TRANSFER)
        })
    }

    /// Copy tightly packed texels into `upload.region` of `texture`.
    pub fn upload_texture(&self, texture: &Arc<Texture>, upload: &TextureUpload<'_>) -> GpuResult<()> {
        crate::profile_scope!("upload_texture");
        require_texture_usage(texture, TextureUsage::COPY_DST, "upload")?;
        require_region(texture, &upload.region)?;
        let bytes = upload.region.extent.texel_count() * texture.format().block_size() as u64;

        let staging;
        let (buffer, offset) = match upload.source {
            UploadSource::Buffer { buffer, offset } => {
                require_buffer_usage(buffer, BufferUsage::COPY_SRC, "upload source")?;
                require_range(buffer, offset, bytes)?;
                (buffer, offset)
            }
            UploadSource::Host(data) => {
                if (data.len() as u64) < bytes {
                    return Err(GpuError::InvalidParameter(format!(
                        "upload needs {bytes} bytes, got {}",
                        data.len()
                    )));
                }
                staging = self.create_buffer(
                    &BufferDescriptor::new(bytes, BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC)
                        .with_label("upload staging"),
                )?;
                let memory = staging
                    .host_memory()
                    .ok_or_else(|| GpuError::Internal("staging buffer is not mapped".into()))?;
                self.allocator.write(memory, 0, &data[..bytes as usize])?;
                (&staging, 0)
            }
        };

        let region = buffer_image_copy(texture, &upload.region, offset);
        self.record(self.params.transfer_queue, "upload texture", 2, false, |rec| {
            rec.buffer_barrier(buffer, BufferRequest::transfer_read(offset, bytes))?;
            rec.texture_barrier(texture, TextureAccess::TransferWrite)?;
            rec.command_mut()?.record(RecordedOp::CopyBufferToImage {
                src: buffer.raw(),
                dst: texture.raw(),
                region,
            });
            rec.buffer_signal(buffer, vk::PipelineStageFlags::TRANSFER)?;
            rec.texture_signal(texture, vk::PipelineStageFlags::TRANSFER)
        })
    }

    /// Copy `download.region` of `texture` into a buffer.
    pub fn download_texture(
        &self,
        texture: &Arc<Texture>,
        download: &TextureDownload<'_>,
    ) -> GpuResult<()> {
        crate::profile_scope!("download_texture");
        require_texture_usage(texture, TextureUsage::COPY_SRC, "download")?;
        require_region(texture, &download.region)?;
        require_buffer_usage(download.buffer, BufferUsage::COPY_DST, "download target")?;
        let bytes = download.region.extent.texel_count() * texture.format().block_size() as u64;
        require_range(download.buffer, download.offset, bytes)?;

        let buffer = download.buffer;
        let region = buffer_image_copy(texture, &download.region, download.offset);
        self.record(self.params.transfer_queue, "download texture", 2, false, |rec| {
            rec.texture_barrier(texture, TextureAccess::TransferRead)?;
            rec.buffer_barrier(buffer, BufferRequest::transfer_write(download.offset, bytes))?;
            rec.command_mut()?.record(RecordedOp::CopyImageToBuffer {
                src: texture.raw(),
                dst: buffer.raw(),
                region,
            });
            rec.texture_signal(texture, vk::PipelineStageFlags::TRANSFER)?;
            rec.buffer_signal(buffer, vk::PipelineStageFlags::TRANSFER)
        })
    }

    /// Scaled copy between textures on the graphics queue.
    ///
    /// Uses the native blit when both formats support it, otherwise the
    /// registered [`SelfDispatch`] engine.
    pub fn blit(&self, params: &BlitParams<'_>) -> GpuResult<()> {
        crate::profile_scope!("blit");
        let (src, dst) = (params.src, params.dst);
        if Arc::ptr_eq(src, dst) {
            return Err(GpuError::InvalidParameter(
                "blit source and destination must differ".into(),
            ));
        }
        require_region(src, &params.src_region)?;
        require_region(dst, &params.dst_region)?;

        let src_features = self.driver.format_features(src.format());
        let dst_features = self.driver.format_features(dst.format());
        let native = src_features.contains(FormatFeatures::BLIT_SRC)
            && dst_features.contains(FormatFeatures::BLIT_DST)
            && (params.filter != vk::Filter::LINEAR
                || src_features.contains(FormatFeatures::LINEAR_FILTER));

        if native {
            require_texture_usage(src, TextureUsage::COPY_SRC, "blit source")?;
            require_texture_usage(dst, TextureUsage::COPY_DST, "blit destination")?;
            let region = vk::ImageBlit {
                src_subresource: subresource_layers(src),
                src_offsets: [params.src_region.origin.to_vk(), params.src_region.end()],
                dst_subresource: subresource_layers(dst),
                dst_offsets: [params.dst_region.origin.to_vk(), params.dst_region.end()],
            };
            return self.record(QueueType::Graphics, "blit", 2, false, |rec| {
                rec.texture_barrier(src, TextureAccess::TransferRead)?;
                rec.texture_barrier(dst, TextureAccess::TransferWrite)?;
                rec.command_mut()?.record(RecordedOp::BlitImage {
                    src: src.raw(),
                    dst: dst.raw(),
                    region,
                    filter: params.filter,
                });
                rec.texture_signal(src, vk::PipelineStageFlags::TRANSFER)?;
                rec.texture_signal(dst, vk::PipelineStageFlags::TRANSFER)
            });
        }

        let dispatcher = self.dispatcher.read().clone().ok_or_else(|| {
            GpuError::FeatureNotSupported(format!(
                "blit {:?} -> {:?} needs a self-dispatch engine",
                src.format(),
                dst.format()
            ))
        })?;
        if !dispatcher.supports_blit(src.format(), dst.format()) {
            return Err(GpuError::FeatureNotSupported(format!(
                "self-dispatch engine cannot blit {:?} -> {:?}",
                src.format(),
                dst.format()
            )));
        }
        require_texture_usage(src, TextureUsage::TEXTURE_BINDING, "emulated blit source")?;
        require_texture_usage(dst, TextureUsage::STORAGE_BINDING, "emulated blit destination")?;

        let job = BlitJob {
            src: src.raw(),
            dst: dst.raw(),
            src_format: src.format(),
            dst_format: dst.format(),
            src_region: params.src_region,
            dst_region: params.dst_region,
            filter: params.filter,
        };
        log::debug!("GpuDevice: emulating blit {:?} -> {:?}", job.src_format, job.dst_format);
        self.record(QueueType::Graphics, "emulated blit", 2, false, |rec| {
            rec.texture_barrier(src, TextureAccess::ShaderRead)?;
            rec.texture_barrier(dst, TextureAccess::StorageWrite)?;
            dispatcher.record_blit(rec.command_mut()?, &job)?;
            rec.texture_signal(src, vk::PipelineStageFlags::COMPUTE_SHADER)?;
            rec.texture_signal(dst, vk::PipelineStageFlags::COMPUTE_SHADER)
        })
    }

    // ---- buffer operations -----------------------------------------------

    pub fn copy_buffer(
        &self,
        src: &Arc<Buffer>,
        src_offset: u64,
        dst: &Arc<Buffer>,
        dst_offset: u64,
        size: u64,
    ) -> GpuResult<()> {
        crate::profile_scope!("copy_buffer");
        if Arc::ptr_eq(src, dst) {
            return Err(GpuError::InvalidParameter(
                "buffer copy source and destination must differ".into(),
            ));
        }
        require_buffer_usage(src, BufferUsage::COPY_SRC, "copy source")?;
        require_buffer_usage(dst, BufferUsage::COPY_DST, "copy destination")?;
        require_range(src, src_offset, size)?;
        require_range(dst, dst_offset, size)?;

        self.record(self.params.transfer_queue, "copy buffer", 2, false, |rec| {
            rec.buffer_barrier(src, BufferRequest::transfer_read(src_offset, size))?;
            rec.buffer_barrier(dst, BufferRequest::transfer_write(dst_offset, size))?;
            rec.command_mut()?.record(RecordedOp::CopyBuffer {
                src: src.raw(),
                dst: dst.raw(),
                region: vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size,
                },
            });
            rec.buffer_signal(src, vk::PipelineStageFlags::TRANSFER)?;
            rec.buffer_signal(dst, vk::PipelineStageFlags::TRANSFER)
        })
    }

    /// Write host data into a buffer.
    ///
    /// Idle host-visible buffers are written directly. Everything else goes
    /// through inline GPU updates, which need 4-byte aligned offset and size.
    pub fn write_buffer(&self, buffer: &Arc<Buffer>, offset: u64, data: &[u8]) -> GpuResult<()> {
        crate::profile_scope!("write_buffer");
        require_range(buffer, offset, data.len() as u64)?;
        if data.is_empty() {
            return Ok(());
        }

        if let Some(memory) = buffer.host_memory()
            && !self.is_busy(buffer.last_use())
        {
            log::trace!("GpuDevice: direct write of {} bytes to {:?}", data.len(), buffer.label());
            return self.allocator.write(memory, offset, data);
        }

        if !buffer.descriptor().usage.contains(BufferUsage::COPY_DST) {
            return Err(GpuError::Misuse(format!(
                "buffer {:?} is busy and cannot be updated by the GPU",
                buffer.label()
            )));
        }
        if offset % 4 != 0 || data.len() % 4 != 0 {
            return Err(GpuError::InvalidParameter(
                "GPU buffer updates must be 4-byte aligned".into(),
            ));
        }

        let chunk = (self.params.update_chunk_size & !3).max(4);
        let size = data.len() as u64;
        self.record(self.params.transfer_queue, "write buffer", 1, false, |rec| {
            rec.buffer_barrier(buffer, BufferRequest::transfer_write(offset, size))?;
            let cmd = rec.command_mut()?;
            for (i, part) in data.chunks(chunk).enumerate() {
                cmd.record(RecordedOp::UpdateBuffer {
                    dst: buffer.raw(),
                    offset: offset + (i * chunk) as u64,
                    data: part.to_vec(),
                });
            }
            rec.buffer_signal(buffer, vk::PipelineStageFlags::TRANSFER)
        })
    }

    /// Read a host-visible buffer. The buffer must be idle and flushed.
    pub fn read_buffer(&self, buffer: &Arc<Buffer>, offset: u64, out: &mut [u8]) -> GpuResult<()> {
        require_range(buffer, offset, out.len() as u64)?;
        let memory = buffer.host_memory().ok_or_else(|| {
            GpuError::Misuse(format!("buffer {:?} is not host visible", buffer.label()))
        })?;
        if self.is_busy(buffer.last_use()) {
            return Err(GpuError::Misuse(format!(
                "buffer {:?} read while the GPU is still using it",
                buffer.label()
            )));
        }
        if buffer.lock_state().needs_flush {
            return Err(GpuError::Misuse(format!(
                "buffer {:?} read before flush_buffer",
                buffer.label()
            )));
        }
        self.allocator.read(memory, offset, out)
    }

    /// Make GPU writes to a host-readable buffer visible to the host.
    pub fn flush_buffer(&self, buffer: &Arc<Buffer>) -> GpuResult<()> {
        if !buffer.lock_state().needs_flush {
            return Ok(());
        }
        self.record(QueueType::Any, "flush buffer", 1, false, |rec| {
            rec.buffer_barrier(buffer, BufferRequest::host_read(0, buffer.size()))?;
            buffer.lock_state().needs_flush = false;
            rec.buffer_signal(buffer, vk::PipelineStageFlags::ALL_COMMANDS)
        })
    }

    // ---- export ----------------------------------------------------------

    /// Release `texture` to a foreign API.
    ///
    /// The returned sync object carries the semaphore the importer waits on
    /// and the one it signals when done; our next use of the texture waits
    /// on the latter.
    pub fn export_texture(&self, texture: &Arc<Texture>) -> GpuResult<Arc<SyncObject>> {
        crate::profile_scope!("export_texture");
        if !texture.descriptor().exportable {
            return Err(GpuError::Misuse(format!(
                "texture {:?} was not created exportable",
                texture.label()
            )));
        }
        let queue = {
            let state = texture.lock_state();
            if state.ext_sync.as_ref().is_some_and(|sync| !sync.is_consumed()) {
                return Err(GpuError::Misuse(format!(
                    "texture {:?} exported again before its previous export was consumed",
                    texture.label()
                )));
            }
            self.owner_queue(state.owner)
        };

        let sync = Arc::new(SyncObject::new(self.driver.as_ref(), Arc::clone(&self.deferred))?);
        self.record(queue, "export texture", 1, true, |rec| {
            rec.texture_barrier(texture, TextureAccess::Export)?;
            rec.attach_texture_export(texture, &sync)
        })?;
        log::debug!("GpuDevice: exported texture {:?}", texture.label());
        Ok(sync)
    }

    /// Release `buffer` to a foreign API.
    pub fn export_buffer(&self, buffer: &Arc<Buffer>) -> GpuResult<Arc<SyncObject>> {
        crate::profile_scope!("export_buffer");
        if !buffer.descriptor().exportable {
            return Err(GpuError::Misuse(format!(
                "buffer {:?} was not created exportable",
                buffer.label()
            )));
        }
        let queue = {
            let state = buffer.lock_state();
            if state.ext_sync.as_ref().is_some_and(|sync| !sync.is_consumed()) {
                return Err(GpuError::Misuse(format!(
                    "buffer {:?} exported again before its previous export was consumed",
                    buffer.label()
                )));
            }
            self.owner_queue(state.owner)
        };

        let sync = Arc::new(SyncObject::new(self.driver.as_ref(), Arc::clone(&self.deferred))?);
        self.record(queue, "export buffer", 1, true, |rec| {
            rec.buffer_barrier(buffer, BufferRequest::export())?;
            rec.attach_buffer_export(buffer, &sync)
        })?;
        log::debug!("GpuDevice: exported buffer {:?}", buffer.label());
        Ok(sync)
    }

    fn owner_queue(&self, owner: QueueOwner) -> QueueType {
        match owner {
            QueueOwner::Family(family) => self.mux.queue_of(family),
            QueueOwner::Unowned | QueueOwner::External => QueueType::Any,
        }
    }

    // ---- polling ---------------------------------------------------------

    fn is_busy(&self, last_use: Option<CommandId>) -> bool {
        last_use.is_some_and(|id| !self.mux.is_complete(id))
    }

    /// Returns `true` while GPU work on `texture` is outstanding.
    ///
    /// Submits the recording command first if it uses the texture. Blocks up
    /// to `timeout`.
    pub fn poll_texture(&self, texture: &Texture, timeout: Duration) -> GpuResult<bool> {
        self.poll_use(texture.last_use(), timeout)
    }

    /// Returns `true` while GPU work on `buffer` is outstanding.
    pub fn poll_buffer(&self, buffer: &Buffer, timeout: Duration) -> GpuResult<bool> {
        self.poll_use(buffer.last_use(), timeout)
    }

    fn poll_use(&self, last_use: Option<CommandId>, timeout: Duration) -> GpuResult<bool> {
        let Some(id) = last_use else {
            return Ok(false);
        };
        if self.mux.is_complete(id) {
            return Ok(false);
        }
        self.mux.flush_command(id)?;

        let deadline = Instant::now() + timeout;
        loop {
            self.poll_commands(deadline.saturating_duration_since(Instant::now()))?;
            if self.mux.is_complete(id) {
                return Ok(false);
            }
            if Instant::now() >= deadline {
                return Ok(true);
            }
        }
    }

    /// Retire completed commands and destroy resources whose last use is
    /// done. Blocks up to `timeout` if nothing has completed yet.
    pub fn poll_commands(&self, timeout: Duration) -> GpuResult<usize> {
        let retired = self.mux.poll(timeout)?;
        self.collect_garbage();
        Ok(retired)
    }

    fn collect_garbage(&self) {
        crate::profile_function!();
        let ready = self.deferred.take_ready(|id| self.mux.is_complete(id));
        if ready.is_empty() {
            return;
        }

        let mut destroy = Vec::with_capacity(ready.len());
        for resource in ready {
            let undrained = resource.undrained();
            if undrained.is_empty() || self.mux.is_lost() {
                destroy.push(resource);
                continue;
            }
            // Foreign work may still use the memory; wait for it on the GPU.
            match self.drain_external(&undrained) {
                Ok(drain) => self.deferred.queue(resource.drained(), Some(drain)),
                Err(err) => {
                    log::warn!("GpuDevice: draining external dependencies failed: {err}");
                    self.deferred.queue(resource, None);
                }
            }
        }

        let mut signals = self.mux.signals();
        for resource in destroy {
            resource.destroy(self.driver.as_ref(), self.allocator.as_ref(), &mut signals);
        }
    }

    fn drain_external(&self, deps: &[Arc<SyncObject>]) -> GpuResult<CommandId> {
        let family = self.mux.families().graphics;
        self.mux
            .submit_side(family, "drain external dependencies", |cmd, _signals| {
                for sync in deps {
                    cmd.journal.record_sync(sync);
                    cmd.add_wait(sync.signal_semaphore(), vk::PipelineStageFlags::ALL_COMMANDS);
                    sync.consume_signal(cmd.id);
                }
                Ok(cmd.id)
            })
    }

    /// Submit pending work and wait until the queues are idle or the
    /// configured timeout expires. Returns whether they went idle.
    pub fn wait_idle(&self) -> GpuResult<bool> {
        self.mux.flush()?;
        let idle = self.mux.wait_idle(self.params.idle_timeout)?;
        self.collect_garbage();
        Ok(idle)
    }
}

impl Drop for GpuDevice {
    fn drop(&mut self) {
        match self.wait_idle() {
            Ok(true) => {}
            Ok(false) => log::warn!("GpuDevice: GPU still busy at teardown"),
            Err(err) => log::error!("GpuDevice: teardown wait failed: {err}"),
        }

        let mut signals = self.mux.signals();
        // Destroying entries can queue the semaphores of their sync objects.
        loop {
            let pending = self.deferred.take_all();
            if pending.is_empty() {
                break;
            }
            for resource in pending {
                resource.destroy(self.driver.as_ref(), self.allocator.as_ref(), &mut signals);
            }
        }
        signals.destroy_all(self.driver.as_ref());
        log::info!("GpuDevice: destroyed");
    }
}

impl std::fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDevice")
            .field("driver", &self.driver.name())
            .field("params", &self.params)
            .field("mux", &self.mux)
            .field("deferred", &self.deferred)
            .finish()
    }
}

static_assertions::assert_impl_all!(GpuDevice: Send, Sync);

fn require_texture_usage(texture: &Texture, usage: TextureUsage, what: &str) -> GpuResult<()> {
    if texture.descriptor().usage.contains(usage) {
        Ok(())
    } else {
        Err(GpuError::InvalidParameter(format!(
            "{what} requires {usage:?} on texture {:?}",
            texture.label()
        )))
    }
}

fn require_buffer_usage(buffer: &Buffer, usage: BufferUsage, what: &str) -> GpuResult<()> {
    if buffer.descriptor().usage.contains(usage) {
        Ok(())
    } else {
        Err(GpuError::InvalidParameter(format!(
            "{what} requires {usage:?} on buffer {:?}",
            buffer.label()
        )))
    }
}

fn require_region(texture: &Texture, region: &TextureRegion) -> GpuResult<()> {
    if region.extent.is_empty() || !region.fits_within(texture.size()) {
        return Err(GpuError::InvalidParameter(format!(
            "region {region:?} outside texture {:?}",
            texture.label()
        )));
    }
    Ok(())
}

fn require_range(buffer: &Buffer, offset: u64, size: u64) -> GpuResult<()> {
    match offset.checked_add(size) {
        Some(end) if end <= buffer.size() => Ok(()),
        _ => Err(GpuError::InvalidParameter(format!(
            "range {offset}+{size} outside buffer {:?} of {} bytes",
            buffer.label(),
            buffer.size()
        ))),
    }
}

fn subresource_layers(texture: &Texture) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: texture.aspect_mask(),
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn buffer_image_copy(texture: &Texture, region: &TextureRegion, offset: u64) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: offset,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: subresource_layers(texture),
        image_offset: region.origin.to_vk(),
        image_extent: region.extent.to_vk(),
    }
}

#[cfg(all(test, feature = "dummy"))]
mod tests {
    use super::*;
    use crate::driver::dummy::DummyDriver;
    use crate::types::TextureFormat;

    fn setup() -> (Arc<DummyDriver>, Arc<GpuDevice>) {
        let driver = Arc::new(DummyDriver::new());
        let device = GpuDevice::new(
            driver.clone(),
            Arc::new(driver.allocator()),
            DeviceParameters::new(),
        );
        (driver, device)
    }

    #[test]
    fn test_zero_sized_resources_are_rejected() {
        let (_driver, device) = setup();
        let err = device
            .create_buffer(&BufferDescriptor::new(0, BufferUsage::UNIFORM))
            .unwrap_err();
        assert!(matches!(err, GpuError::InvalidParameter(_)));

        let err = device
            .create_texture(&TextureDescriptor::new_2d(
                0,
                4,
                TextureFormat::Rgba8Unorm,
                TextureUsage::COPY_DST,
            ))
            .unwrap_err();
        assert!(matches!(err, GpuError::InvalidParameter(_)));
    }

    #[test]
    fn test_allocation_failure_cleans_up() {
        let (driver, device) = setup();
        driver.allocator().fail_next_allocation();
        let err = device
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::UNIFORM))
            .unwrap_err();
        assert_eq!(err, GpuError::OutOfMemory);
        assert_eq!(driver.live_buffers(), 0);
    }

    #[test]
    fn test_storage_usage_requires_format_support() {
        let (driver, device) = setup();
        driver.set_format_features(TextureFormat::Rgba8UnormSrgb, FormatFeatures::SAMPLED);
        let err = device
            .create_texture(&TextureDescriptor::new_2d(
                4,
                4,
                TextureFormat::Rgba8UnormSrgb,
                TextureUsage::STORAGE_BINDING,
            ))
            .unwrap_err();
        assert!(matches!(err, GpuError::FeatureNotSupported(_)));
    }

    #[test]
    fn test_unaligned_gpu_write_is_rejected() {
        let (_driver, device) = setup();
        let buffer = device
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::COPY_DST))
            .unwrap();
        let err = device.write_buffer(&buffer, 2, &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidParameter(_)));
        assert_eq!(buffer.last_use(), None);
    }

    #[test]
    fn test_write_buffer_is_chunked() {
        let driver = Arc::new(DummyDriver::new());
        let device = GpuDevice::new(
            driver.clone(),
            Arc::new(driver.allocator()),
            DeviceParameters::new().with_update_chunk_size(16),
        );
        let buffer = device
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::COPY_DST))
            .unwrap();
        device.write_buffer(&buffer, 0, &[7; 40]).unwrap();
        device.flush().unwrap();

        let updates: Vec<usize> = driver.submissions()[0]
            .ops
            .iter()
            .filter_map(|op| match op {
                RecordedOp::UpdateBuffer { data, .. } => Some(data.len()),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![16, 16, 8]);
    }

    #[test]
    fn test_poll_unused_resource_is_idle() {
        let (_driver, device) = setup();
        let buffer = device
            .create_buffer(&BufferDescriptor::new(16, BufferUsage::UNIFORM))
            .unwrap();
        assert!(!device.poll_buffer(&buffer, Duration::ZERO).unwrap());
    }

    #[test]
    fn test_drop_device_destroys_everything() {
        let (driver, device) = setup();
        let texture = device
            .create_texture(&TextureDescriptor::new_2d(
                8,
                8,
                TextureFormat::Rgba8Unorm,
                TextureUsage::COPY_DST,
            ))
            .unwrap();
        device
            .clear_texture(&texture, ClearColor::TRANSPARENT)
            .unwrap();
        drop(texture);
        drop(device);

        assert_eq!(driver.live_images(), 0);
        assert_eq!(driver.live_semaphores(), 0);
        assert_eq!(driver.allocator().live_allocations(), 0);
    }
}
