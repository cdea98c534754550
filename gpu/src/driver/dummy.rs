//! Dummy driver implementation.
//!
//! Simulates a GPU in process memory. Buffer and image contents live in
//! host vectors and recorded transfer operations are executed at submission
//! time, so data round trips can be verified. Completion is either immediate
//! (the default) or controlled by the test through [`DummyDriver::complete_all`].
//!
//! The driver also validates binary semaphore usage: waiting on a semaphore
//! nobody signaled, or signaling one that is still pending, is counted as a
//! misuse and reported by [`DummyDriver::semaphore_misuses`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ash::vk;
use ash::vk::Handle;
use parking_lot::{Condvar, Mutex};

use super::{
    Driver, ExternalHandle, MemoryAllocator, MemoryRequest, MemoryRequirements, MemorySlice,
    Submission, SubmissionToken,
};
use crate::command::{CommandId, RecordedOp, SemaphoreWait};
use crate::error::{GpuError, GpuResult};
use crate::types::{
    BufferDescriptor, ClearColor, Extent3d, FormatFeatures, QueueFamilies, TextureDescriptor,
    TextureFormat,
};

/// Copy of a submission as seen by the dummy driver.
#[derive(Debug, Clone)]
pub struct SubmittedCommand {
    pub id: CommandId,
    pub token: SubmissionToken,
    pub family: u32,
    pub label: String,
    pub ops: Vec<RecordedOp>,
    pub waits: Vec<SemaphoreWait>,
    pub signals: Vec<vk::Semaphore>,
    pub timed: bool,
}

#[derive(Debug)]
struct DummyImage {
    format: TextureFormat,
    size: Extent3d,
    slice: Option<u64>,
}

#[derive(Debug)]
struct DummyBuffer {
    slice: Option<u64>,
    offset: u64,
}

#[derive(Debug, Default)]
struct DummySemaphore {
    exportable: bool,
    /// Signal operation submitted but not yet consumed by a wait.
    pending: bool,
}

#[derive(Debug, Default)]
struct DummyState {
    format_features: HashMap<TextureFormat, FormatFeatures>,
    images: HashMap<u64, DummyImage>,
    buffers: HashMap<u64, DummyBuffer>,
    semaphores: HashMap<u64, DummySemaphore>,
    submissions: Vec<SubmittedCommand>,
    /// Token -> completed flag.
    in_flight: HashMap<u64, bool>,
    timed: HashMap<u64, usize>,
    next_token: u64,
    manual_completion: bool,
    /// Error for the next submission, optionally only one with this label.
    fail_next_submit: Option<(Option<String>, GpuError)>,
    lost: bool,
    semaphore_misuses: usize,
}

/// Host memory standing in for device memory.
#[derive(Debug, Default)]
pub struct DummyMemory {
    slices: Mutex<HashMap<u64, Vec<u8>>>,
    next_id: AtomicU64,
    fail_next: Mutex<bool>,
}

impl DummyMemory {
    fn with_slice<R>(&self, id: u64, f: impl FnOnce(&mut Vec<u8>) -> R) -> Option<R> {
        self.slices.lock().get_mut(&id).map(f)
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.slices.lock().len()
    }
}

/// Allocator handing out [`DummyMemory`] slices.
#[derive(Debug, Clone)]
pub struct DummyAllocator {
    memory: Arc<DummyMemory>,
}

impl DummyAllocator {
    /// Make the next allocation fail with `OutOfMemory`.
    pub fn fail_next_allocation(&self) {
        *self.memory.fail_next.lock() = true;
    }

    pub fn live_allocations(&self) -> usize {
        self.memory.live_allocations()
    }
}

impl MemoryAllocator for DummyAllocator {
    fn allocate(&self, request: &MemoryRequest<'_>) -> GpuResult<MemorySlice> {
        if std::mem::take(&mut *self.memory.fail_next.lock()) {
            return Err(GpuError::OutOfMemory);
        }
        let id = self.memory.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let size = request.requirements.size;
        self.memory
            .slices
            .lock()
            .insert(id, vec![0; size as usize]);
        log::trace!(
            "DummyAllocator: allocated {} bytes for {:?} (slice {id})",
            size,
            request.label
        );
        Ok(MemorySlice {
            id,
            memory: vk::DeviceMemory::from_raw(id),
            offset: 0,
            size,
            host_visible: request.location != super::MemoryLocation::GpuOnly,
        })
    }

    fn free(&self, slice: MemorySlice) {
        log::trace!("DummyAllocator: freeing slice {}", slice.id);
        self.memory.slices.lock().remove(&slice.id);
    }

    fn write(&self, slice: &MemorySlice, offset: u64, data: &[u8]) -> GpuResult<()> {
        if !slice.host_visible {
            return Err(GpuError::Misuse("slice is not host visible".into()));
        }
        let start = offset as usize;
        self.memory
            .with_slice(slice.id, |bytes| {
                let end = start + data.len();
                if end > bytes.len() {
                    return Err(GpuError::InvalidParameter("write out of bounds".into()));
                }
                bytes[start..end].copy_from_slice(data);
                Ok(())
            })
            .unwrap_or_else(|| Err(GpuError::Internal(format!("unknown slice {}", slice.id))))
    }

    fn read(&self, slice: &MemorySlice, offset: u64, out: &mut [u8]) -> GpuResult<()> {
        if !slice.host_visible {
            return Err(GpuError::Misuse("slice is not host visible".into()));
        }
        let start = offset as usize;
        self.memory
            .with_slice(slice.id, |bytes| {
                let end = start + out.len();
                if end > bytes.len() {
                    return Err(GpuError::InvalidParameter("read out of bounds".into()));
                }
                out.copy_from_slice(&bytes[start..end]);
                Ok(())
            })
            .unwrap_or_else(|| Err(GpuError::Internal(format!("unknown slice {}", slice.id))))
    }
}

/// Dummy driver for testing.
pub struct DummyDriver {
    families: QueueFamilies,
    memory: Arc<DummyMemory>,
    state: Mutex<DummyState>,
    completed: Condvar,
    next_handle: AtomicU64,
}

impl DummyDriver {
    /// Driver with distinct graphics (0), compute (1) and transfer (2) families.
    pub fn new() -> Self {
        Self::with_families(QueueFamilies {
            graphics: 0,
            compute: 1,
            transfer: 2,
        })
    }

    pub fn with_families(families: QueueFamilies) -> Self {
        Self {
            families,
            memory: Arc::new(DummyMemory::default()),
            state: Mutex::new(DummyState::default()),
            completed: Condvar::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Allocator sharing this driver's memory.
    pub fn allocator(&self) -> DummyAllocator {
        DummyAllocator {
            memory: Arc::clone(&self.memory),
        }
    }

    /// Override the capabilities reported for `format`.
    pub fn set_format_features(&self, format: TextureFormat, features: FormatFeatures) {
        self.state.lock().format_features.insert(format, features);
    }

    /// Keep submissions pending until the test completes them.
    pub fn set_manual_completion(&self, manual: bool) {
        self.state.lock().manual_completion = manual;
    }

    /// Complete every pending submission.
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        for done in state.in_flight.values_mut() {
            *done = true;
        }
        self.completed.notify_all();
    }

    /// Complete a single submission.
    pub fn complete(&self, token: SubmissionToken) {
        let mut state = self.state.lock();
        if let Some(done) = state.in_flight.get_mut(&token.0) {
            *done = true;
        }
        self.completed.notify_all();
    }

    /// Make the next submission fail with `error`.
    pub fn fail_next_submit(&self, error: GpuError) {
        self.state.lock().fail_next_submit = Some((None, error));
    }

    /// Make the next submission labelled `label` fail with `error`.
    pub fn fail_next_submit_labelled(&self, label: &str, error: GpuError) {
        self.state.lock().fail_next_submit = Some((Some(label.to_owned()), error));
    }

    /// Simulate device loss.
    pub fn lose_device(&self) {
        self.state.lock().lost = true;
        self.completed.notify_all();
    }

    /// Simulate a foreign API signaling `semaphore`.
    pub fn signal_external(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        if let Some(sem) = state.semaphores.get_mut(&semaphore.as_raw()) {
            sem.pending = true;
        }
    }

    /// Simulate a foreign API waiting on `semaphore`.
    pub fn wait_external(&self, semaphore: vk::Semaphore) -> bool {
        let mut state = self.state.lock();
        state
            .semaphores
            .get_mut(&semaphore.as_raw())
            .is_some_and(|sem| std::mem::take(&mut sem.pending))
    }

    pub fn submissions(&self) -> Vec<SubmittedCommand> {
        self.state.lock().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().in_flight.values().filter(|done| !**done).count()
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    /// Semaphore waits without a pending signal plus double signals.
    pub fn semaphore_misuses(&self) -> usize {
        self.state.lock().semaphore_misuses
    }

    fn allocate_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn execute(&self, state: &DummyState, op: &RecordedOp) {
        match op {
            RecordedOp::Barrier(_) | RecordedOp::Dispatch { .. } => {}
            RecordedOp::CopyBuffer { src, dst, region } => {
                let mut data = vec![0u8; region.size as usize];
                self.read_buffer(state, *src, region.src_offset, &mut data);
                self.write_buffer(state, *dst, region.dst_offset, &data);
            }
            RecordedOp::UpdateBuffer { dst, offset, data } => {
                self.write_buffer(state, *dst, *offset, data);
            }
            RecordedOp::CopyBufferToImage { src, dst, region } => {
                self.copy_rows(state, *src, *dst, region, true);
            }
            RecordedOp::CopyImageToBuffer { src, dst, region } => {
                self.copy_rows(state, *dst, *src, region, false);
            }
            RecordedOp::BlitImage { src, dst, region, .. } => self.blit(state, *src, *dst, region),
            RecordedOp::ClearColorImage { image, color, .. } => {
                let Some(img) = state.images.get(&image.as_raw()) else {
                    return;
                };
                let texel = encode_color(img.format, *color);
                if let Some(slice) = img.slice {
                    self.memory.with_slice(slice, |bytes| {
                        for chunk in bytes.chunks_exact_mut(texel.len()) {
                            chunk.copy_from_slice(&texel);
                        }
                    });
                }
            }
        }
    }

    fn read_buffer(&self, state: &DummyState, buffer: vk::Buffer, offset: u64, out: &mut [u8]) {
        if let Some(DummyBuffer {
            slice: Some(slice),
            offset: base,
        }) = state.buffers.get(&buffer.as_raw())
        {
            let start = (base + offset) as usize;
            self.memory.with_slice(*slice, |bytes| {
                if let Some(src) = bytes.get(start..start + out.len()) {
                    out.copy_from_slice(src);
                }
            });
        }
    }

    fn write_buffer(&self, state: &DummyState, buffer: vk::Buffer, offset: u64, data: &[u8]) {
        if let Some(DummyBuffer {
            slice: Some(slice),
            offset: base,
        }) = state.buffers.get(&buffer.as_raw())
        {
            let start = (base + offset) as usize;
            self.memory.with_slice(*slice, |bytes| {
                if let Some(dst) = bytes.get_mut(start..start + data.len()) {
                    dst.copy_from_slice(data);
                }
            });
        }
    }

    /// Row-by-row copy between a buffer and an image region.
    fn copy_rows(
        &self,
        state: &DummyState,
        buffer: vk::Buffer,
        image: vk::Image,
        region: &vk::BufferImageCopy,
        to_image: bool,
    ) {
        let Some(img) = state.images.get(&image.as_raw()) else {
            return;
        };
        let Some(image_slice) = img.slice else {
            return;
        };
        let bpp = img.format.block_size() as u64;
        let extent = region.image_extent;
        let row_texels = if region.buffer_row_length == 0 {
            extent.width
        } else {
            region.buffer_row_length
        } as u64;
        let image_rows = if region.buffer_image_height == 0 {
            extent.height
        } else {
            region.buffer_image_height
        } as u64;
        let row_bytes = extent.width as u64 * bpp;

        for z in 0..extent.depth as u64 {
            for y in 0..extent.height as u64 {
                let buffer_offset =
                    region.buffer_offset + ((z * image_rows + y) * row_texels) * bpp;
                let ix = region.image_offset.x as u64;
                let iy = region.image_offset.y as u64 + y;
                let iz = region.image_offset.z as u64 + z;
                let image_offset = ((iz * img.size.height as u64 + iy) * img.size.width as u64
                    + ix)
                    * bpp;
                let mut row = vec![0u8; row_bytes as usize];
                if to_image {
                    self.read_buffer(state, buffer, buffer_offset, &mut row);
                    self.memory.with_slice(image_slice, |bytes| {
                        let start = image_offset as usize;
                        if let Some(dst) = bytes.get_mut(start..start + row.len()) {
                            dst.copy_from_slice(&row);
                        }
                    });
                } else {
                    self.memory.with_slice(image_slice, |bytes| {
                        let start = image_offset as usize;
                        if let Some(src) = bytes.get(start..start + row.len()) {
                            row.copy_from_slice(src);
                        }
                    });
                    self.write_buffer(state, buffer, buffer_offset, &row);
                }
            }
        }
    }

    /// Nearest-neighbour blit between images of equal texel size.
    fn blit(&self, state: &DummyState, src: vk::Image, dst: vk::Image, region: &vk::ImageBlit) {
        let (Some(s), Some(d)) = (
            state.images.get(&src.as_raw()),
            state.images.get(&dst.as_raw()),
        ) else {
            return;
        };
        let (Some(src_slice), Some(dst_slice)) = (s.slice, d.slice) else {
            return;
        };
        let bpp = s.format.block_size() as usize;
        if bpp != d.format.block_size() as usize {
            log::trace!("DummyDriver: skipping blit between formats of different size");
            return;
        }
        let Some(source) = self.memory.with_slice(src_slice, |bytes| bytes.clone()) else {
            return;
        };
        let [s0, s1] = region.src_offsets;
        let [d0, d1] = region.dst_offsets;
        let (dw, dh) = ((d1.x - d0.x).max(1), (d1.y - d0.y).max(1));
        let (sw, sh) = (s1.x - s0.x, s1.y - s0.y);
        self.memory.with_slice(dst_slice, |bytes| {
            for y in 0..dh {
                for x in 0..dw {
                    let sx = (s0.x + x * sw / dw) as usize;
                    let sy = (s0.y + y * sh / dh) as usize;
                    let from = (sy * s.size.width as usize + sx) * bpp;
                    let to = ((d0.y + y) as usize * d.size.width as usize + (d0.x + x) as usize)
                        * bpp;
                    if let (Some(texel), true) =
                        (source.get(from..from + bpp), to + bpp <= bytes.len())
                    {
                        bytes[to..to + bpp].copy_from_slice(texel);
                    }
                }
            }
        });
    }
}

impl Default for DummyDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DummyDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyDriver")
            .field("families", &self.families)
            .finish_non_exhaustive()
    }
}

fn encode_color(format: TextureFormat, color: ClearColor) -> Vec<u8> {
    let [r, g, b, a] = color.0;
    let unorm = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    match format {
        TextureFormat::R8Unorm => vec![unorm(r)],
        TextureFormat::Rg8Unorm => vec![unorm(r), unorm(g)],
        TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb => {
            vec![unorm(r), unorm(g), unorm(b), unorm(a)]
        }
        TextureFormat::Bgra8Unorm => vec![unorm(b), unorm(g), unorm(r), unorm(a)],
        TextureFormat::R32Float => r.to_le_bytes().to_vec(),
        TextureFormat::R32Uint => (r as u32).to_le_bytes().to_vec(),
        TextureFormat::Rgba32Float => [r, g, b, a].iter().flat_map(|v| v.to_le_bytes()).collect(),
        other => vec![0; other.block_size() as usize],
    }
}

impl Driver for DummyDriver {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn format_features(&self, format: TextureFormat) -> FormatFeatures {
        self.state
            .lock()
            .format_features
            .get(&format)
            .copied()
            .unwrap_or(FormatFeatures::all())
    }

    fn create_image(
        &self,
        descriptor: &TextureDescriptor,
    ) -> GpuResult<(vk::Image, MemoryRequirements)> {
        let raw = self.allocate_handle();
        log::trace!(
            "DummyDriver: creating image {:?} ({}x{}x{}, {:?})",
            descriptor.label,
            descriptor.size.width,
            descriptor.size.height,
            descriptor.size.depth,
            descriptor.format
        );
        self.state.lock().images.insert(
            raw,
            DummyImage {
                format: descriptor.format,
                size: descriptor.size,
                slice: None,
            },
        );
        Ok((
            vk::Image::from_raw(raw),
            MemoryRequirements {
                size: descriptor.byte_size(),
                alignment: 256,
                memory_type_bits: !0,
            },
        ))
    }

    fn bind_image_memory(&self, image: vk::Image, memory: &MemorySlice) -> GpuResult<()> {
        let mut state = self.state.lock();
        let img = state
            .images
            .get_mut(&image.as_raw())
            .ok_or_else(|| GpuError::Internal("binding memory to unknown image".into()))?;
        img.slice = Some(memory.id);
        Ok(())
    }

    fn destroy_image(&self, image: vk::Image) {
        log::trace!("DummyDriver: destroying image {:#x}", image.as_raw());
        self.state.lock().images.remove(&image.as_raw());
    }

    fn create_buffer(
        &self,
        descriptor: &BufferDescriptor,
    ) -> GpuResult<(vk::Buffer, MemoryRequirements)> {
        let raw = self.allocate_handle();
        log::trace!(
            "DummyDriver: creating buffer {:?} ({} bytes)",
            descriptor.label,
            descriptor.size
        );
        self.state.lock().buffers.insert(
            raw,
            DummyBuffer {
                slice: None,
                offset: 0,
            },
        );
        Ok((
            vk::Buffer::from_raw(raw),
            MemoryRequirements {
                size: descriptor.size,
                alignment: 16,
                memory_type_bits: !0,
            },
        ))
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: &MemorySlice) -> GpuResult<()> {
        let mut state = self.state.lock();
        let buf = state
            .buffers
            .get_mut(&buffer.as_raw())
            .ok_or_else(|| GpuError::Internal("binding memory to unknown buffer".into()))?;
        buf.slice = Some(memory.id);
        buf.offset = memory.offset;
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        log::trace!("DummyDriver: destroying buffer {:#x}", buffer.as_raw());
        self.state.lock().buffers.remove(&buffer.as_raw());
    }

    fn create_semaphore(&self, exportable: bool) -> GpuResult<vk::Semaphore> {
        let raw = self.allocate_handle();
        self.state.lock().semaphores.insert(
            raw,
            DummySemaphore {
                exportable,
                pending: false,
            },
        );
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn export_semaphore(&self, semaphore: vk::Semaphore) -> GpuResult<ExternalHandle> {
        let state = self.state.lock();
        match state.semaphores.get(&semaphore.as_raw()) {
            Some(sem) if sem.exportable => Ok(ExternalHandle::Fd(semaphore.as_raw() as i32)),
            Some(_) => Err(GpuError::Misuse(
                "semaphore was not created exportable".into(),
            )),
            None => Err(GpuError::Internal("exporting unknown semaphore".into())),
        }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore.as_raw());
    }

    fn submit(&self, submission: &Submission<'_>) -> GpuResult<SubmissionToken> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(GpuError::DeviceLost);
        }
        let fails = state
            .fail_next_submit
            .as_ref()
            .is_some_and(|(label, _)| label.as_deref().is_none_or(|l| l == submission.label));
        if let Some((_, error)) = state.fail_next_submit.take_if(|_| fails) {
            log::trace!("DummyDriver: failing submission of {}", submission.id);
            if error == GpuError::DeviceLost {
                state.lost = true;
            }
            return Err(error);
        }

        for wait in submission.waits {
            let ok = state
                .semaphores
                .get_mut(&wait.semaphore.as_raw())
                .is_some_and(|sem| std::mem::take(&mut sem.pending));
            if !ok {
                log::warn!(
                    "DummyDriver: {} waits on semaphore {:#x} with no pending signal",
                    submission.id,
                    wait.semaphore.as_raw()
                );
                state.semaphore_misuses += 1;
            }
        }
        for semaphore in submission.signals {
            let already = state
                .semaphores
                .get_mut(&semaphore.as_raw())
                .map(|sem| std::mem::replace(&mut sem.pending, true));
            if already != Some(false) {
                log::warn!(
                    "DummyDriver: {} signals semaphore {:#x} that is pending or unknown",
                    submission.id,
                    semaphore.as_raw()
                );
                state.semaphore_misuses += 1;
            }
        }

        for op in submission.ops {
            self.execute(&state, op);
        }

        state.next_token += 1;
        let token = SubmissionToken(state.next_token);
        let done = !state.manual_completion;
        state.in_flight.insert(token.0, done);
        if submission.timed {
            state.timed.insert(token.0, submission.ops.len());
        }
        state.submissions.push(SubmittedCommand {
            id: submission.id,
            token,
            family: submission.family,
            label: submission.label.to_owned(),
            ops: submission.ops.to_vec(),
            waits: submission.waits.to_vec(),
            signals: submission.signals.to_vec(),
            timed: submission.timed,
        });
        log::trace!(
            "DummyDriver: submitted {} '{}' on family {} ({} ops)",
            submission.id,
            submission.label,
            submission.family,
            submission.ops.len()
        );
        Ok(token)
    }

    fn wait(&self, token: SubmissionToken, timeout: Duration) -> GpuResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.lost {
                return Err(GpuError::DeviceLost);
            }
            match state.in_flight.get(&token.0) {
                Some(true) | None => return Ok(true),
                Some(false) => {}
            }
            if self.completed.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.in_flight.get(&token.0).copied().unwrap_or(true));
            }
        }
    }

    fn finish(&self, token: SubmissionToken) -> Option<Duration> {
        let mut state = self.state.lock();
        state.in_flight.remove(&token.0);
        state
            .timed
            .remove(&token.0)
            .map(|ops| Duration::from_micros(10 * ops as u64 + 1))
    }
}

static_assertions::assert_impl_all!(DummyDriver: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryLocation;
    use crate::types::BufferUsage;

    fn submission<'a>(
        ops: &'a [RecordedOp],
        waits: &'a [SemaphoreWait],
        signals: &'a [vk::Semaphore],
    ) -> Submission<'a> {
        Submission {
            id: CommandId(1),
            family: 0,
            label: "test",
            ops,
            waits,
            signals,
            timed: false,
        }
    }

    #[test]
    fn test_buffer_copy_executes() {
        let driver = DummyDriver::new();
        let allocator = driver.allocator();
        let desc = BufferDescriptor::new(16, BufferUsage::MAP_READ | BufferUsage::MAP_WRITE);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let (buffer, reqs) = driver.create_buffer(&desc).unwrap();
            let slice = allocator
                .allocate(&MemoryRequest {
                    label: "test",
                    requirements: reqs,
                    location: MemoryLocation::CpuToGpu,
                    linear: true,
                })
                .unwrap();
            driver.bind_buffer_memory(buffer, &slice).unwrap();
            handles.push((buffer, slice));
        }
        allocator.write(&handles[0].1, 0, &[1, 2, 3, 4]).unwrap();

        let ops = [RecordedOp::CopyBuffer {
            src: handles[0].0,
            dst: handles[1].0,
            region: vk::BufferCopy {
                src_offset: 0,
                dst_offset: 4,
                size: 4,
            },
        }];
        driver.submit(&submission(&ops, &[], &[])).unwrap();

        let mut out = [0u8; 8];
        allocator.read(&handles[1].1, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_wait_without_signal_is_flagged() {
        let driver = DummyDriver::new();
        let sem = driver.create_semaphore(false).unwrap();
        let waits = [SemaphoreWait {
            semaphore: sem,
            stage: vk::PipelineStageFlags::ALL_COMMANDS,
        }];
        driver.submit(&submission(&[], &waits, &[])).unwrap();
        assert_eq!(driver.semaphore_misuses(), 1);

        driver.submit(&submission(&[], &[], &[sem])).unwrap();
        driver.submit(&submission(&[], &waits, &[])).unwrap();
        assert_eq!(driver.semaphore_misuses(), 1);
    }

    #[test]
    fn test_manual_completion() {
        let driver = DummyDriver::new();
        driver.set_manual_completion(true);
        let token = driver.submit(&submission(&[], &[], &[])).unwrap();
        assert!(!driver.wait(token, Duration::ZERO).unwrap());
        driver.complete(token);
        assert!(driver.wait(token, Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn test_lost_device_fails_everything() {
        let driver = DummyDriver::new();
        let token = driver.submit(&submission(&[], &[], &[])).unwrap();
        driver.lose_device();
        assert_eq!(driver.wait(token, Duration::ZERO), Err(GpuError::DeviceLost));
        assert_eq!(
            driver.submit(&submission(&[], &[], &[])).unwrap_err(),
            GpuError::DeviceLost
        );
    }
}
