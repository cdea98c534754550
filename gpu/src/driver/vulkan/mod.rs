//! Vulkan driver.
//!
//! Wraps a device created by the application. The driver owns command pools,
//! fences and timestamp queries; instance, device and queues stay owned by the
//! caller and must outlive the driver.

mod allocator;
mod encode;

pub use allocator::VulkanAllocator;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ash::vk;
use parking_lot::Mutex;

use crate::driver::{
    Driver, ExternalHandle, MemoryRequirements, MemorySlice, Submission, SubmissionToken,
};
use crate::error::{GpuError, GpuResult};
use crate::types::{BufferDescriptor, FormatFeatures, QueueFamilies, TextureDescriptor, TextureFormat};

/// Externally created Vulkan objects the driver runs on.
pub struct VulkanDriverDesc {
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub families: QueueFamilies,
    /// One queue per distinct family, keyed by family index.
    pub queues: HashMap<u32, vk::Queue>,
    /// Whether `VK_KHR_external_semaphore_fd` is enabled on the device.
    pub external_semaphore_fd: bool,
}

/// Queue and command buffer pool of one family.
///
/// The queue lives behind the same lock as the pool since `vkQueueSubmit`
/// requires external synchronization.
struct FamilyQueue {
    queue: vk::Queue,
    pool: vk::CommandPool,
    free: Vec<vk::CommandBuffer>,
}

struct InFlight {
    family: u32,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    queries: Option<vk::QueryPool>,
}

/// [`Driver`] implementation on top of ash.
pub struct VulkanDriver {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    families: QueueFamilies,
    queues: HashMap<u32, Mutex<FamilyQueue>>,
    in_flight: Mutex<HashMap<u64, InFlight>>,
    next_token: AtomicU64,
    /// Nanoseconds per timestamp tick.
    timestamp_period: f32,
    semaphore_fd: Option<ash::khr::external_semaphore_fd::Device>,
}

fn map_vk_error(context: &str, result: vk::Result) -> GpuError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            GpuError::OutOfMemory
        }
        other => GpuError::SubmissionFailed(format!("{context}: {other:?}")),
    }
}

impl VulkanDriver {
    pub fn new(desc: VulkanDriverDesc) -> GpuResult<Self> {
        let mut queues = HashMap::new();
        for family in desc.families.distinct() {
            let queue = *desc.queues.get(&family).ok_or_else(|| {
                GpuError::InvalidParameter(format!("no queue provided for family {family}"))
            })?;
            let pool_info = vk::CommandPoolCreateInfo::default()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(family);
            let pool = unsafe { desc.device.create_command_pool(&pool_info, None) }
                .map_err(|e| map_vk_error("failed to create command pool", e))?;
            queues.insert(
                family,
                Mutex::new(FamilyQueue {
                    queue,
                    pool,
                    free: Vec::new(),
                }),
            );
        }

        let properties = unsafe {
            desc.instance
                .get_physical_device_properties(desc.physical_device)
        };
        let semaphore_fd = desc
            .external_semaphore_fd
            .then(|| ash::khr::external_semaphore_fd::Device::new(&desc.instance, &desc.device));

        log::info!(
            "VulkanDriver: created for families {:?} (external semaphores: {})",
            desc.families,
            semaphore_fd.is_some()
        );

        Ok(Self {
            instance: desc.instance,
            physical_device: desc.physical_device,
            device: desc.device,
            families: desc.families,
            queues,
            in_flight: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            timestamp_period: properties.limits.timestamp_period,
            semaphore_fd,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn family_queue(&self, family: u32) -> GpuResult<&Mutex<FamilyQueue>> {
        self.queues
            .get(&family)
            .ok_or_else(|| GpuError::InvalidParameter(format!("unknown queue family {family}")))
    }

    fn command_buffer(&self, family: &mut FamilyQueue) -> GpuResult<vk::CommandBuffer> {
        if let Some(cmd) = family.free.pop() {
            return Ok(cmd);
        }
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(family.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .map_err(|e| map_vk_error("failed to allocate command buffer", e))?;
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::Internal("no command buffer allocated".into()))
    }

    fn create_query_pool(&self) -> GpuResult<vk::QueryPool> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(2);
        unsafe { self.device.create_query_pool(&info, None) }
            .map_err(|e| map_vk_error("failed to create timestamp queries", e))
    }

    /// Record `submission` into `cmd`.
    fn record(
        &self,
        cmd: vk::CommandBuffer,
        submission: &Submission<'_>,
        queries: Option<vk::QueryPool>,
    ) -> GpuResult<()> {
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(cmd, &begin)
                .map_err(|e| map_vk_error("failed to begin command buffer", e))?;
            if let Some(pool) = queries {
                self.device.cmd_reset_query_pool(cmd, pool, 0, 2);
                self.device
                    .cmd_write_timestamp(cmd, vk::PipelineStageFlags::TOP_OF_PIPE, pool, 0);
            }
            encode::encode_ops(&self.device, cmd, submission.ops);
            if let Some(pool) = queries {
                self.device
                    .cmd_write_timestamp(cmd, vk::PipelineStageFlags::BOTTOM_OF_PIPE, pool, 1);
            }
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| map_vk_error("failed to end command buffer", e))
        }
    }

    fn elapsed(&self, pool: vk::QueryPool) -> Option<Duration> {
        let mut ticks = [0u64; 2];
        let result = unsafe {
            self.device
                .get_query_pool_results(pool, 0, &mut ticks, vk::QueryResultFlags::TYPE_64)
        };
        match result {
            Ok(()) => {
                let nanos = ticks[1].saturating_sub(ticks[0]) as f64 * self.timestamp_period as f64;
                Some(Duration::from_nanos(nanos as u64))
            }
            Err(e) => {
                log::warn!("VulkanDriver: timestamp query failed: {e:?}");
                None
            }
        }
    }

    /// Return per-submission objects after the fence has been waited on.
    fn recycle(&self, entry: InFlight) {
        unsafe {
            self.device.destroy_fence(entry.fence, None);
            if let Some(pool) = entry.queries {
                self.device.destroy_query_pool(pool, None);
            }
        }
        if let Some(family) = self.queues.get(&entry.family) {
            let mut family = family.lock();
            let reset = unsafe {
                self.device
                    .reset_command_buffer(entry.cmd, vk::CommandBufferResetFlags::empty())
            };
            match reset {
                Ok(()) => family.free.push(entry.cmd),
                Err(e) => {
                    log::warn!("VulkanDriver: failed to reset command buffer: {e:?}");
                    unsafe { self.device.free_command_buffers(family.pool, &[entry.cmd]) };
                }
            }
        }
    }
}

impl Driver for VulkanDriver {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn format_features(&self, format: TextureFormat) -> FormatFeatures {
        let properties = unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format.to_vk())
        };
        let native = properties.optimal_tiling_features;
        let mut features = FormatFeatures::empty();
        for (flag, feature) in [
            (vk::FormatFeatureFlags::SAMPLED_IMAGE, FormatFeatures::SAMPLED),
            (vk::FormatFeatureFlags::STORAGE_IMAGE, FormatFeatures::STORAGE),
            (vk::FormatFeatureFlags::COLOR_ATTACHMENT, FormatFeatures::COLOR_ATTACHMENT),
            (vk::FormatFeatureFlags::BLIT_SRC, FormatFeatures::BLIT_SRC),
            (vk::FormatFeatureFlags::BLIT_DST, FormatFeatures::BLIT_DST),
            (
                vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
                FormatFeatures::LINEAR_FILTER,
            ),
        ] {
            if native.contains(flag) {
                features |= feature;
            }
        }
        features
    }

    fn create_image(
        &self,
        descriptor: &TextureDescriptor,
    ) -> GpuResult<(vk::Image, MemoryRequirements)> {
        let image_type = if descriptor.size.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };
        let info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(descriptor.format.to_vk())
            .extent(descriptor.size.to_vk())
            .mip_levels(descriptor.mip_level_count)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(descriptor.usage.to_vk(descriptor.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&info, None) }.map_err(|e| {
            GpuError::AllocationFailed(format!("failed to create image: {e:?}"))
        })?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        Ok((
            image,
            MemoryRequirements {
                size: requirements.size,
                alignment: requirements.alignment,
                memory_type_bits: requirements.memory_type_bits,
            },
        ))
    }

    fn bind_image_memory(&self, image: vk::Image, memory: &MemorySlice) -> GpuResult<()> {
        unsafe {
            self.device
                .bind_image_memory(image, memory.memory, memory.offset)
        }
        .map_err(|e| GpuError::AllocationFailed(format!("failed to bind image memory: {e:?}")))
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn create_buffer(
        &self,
        descriptor: &BufferDescriptor,
    ) -> GpuResult<(vk::Buffer, MemoryRequirements)> {
        let info = vk::BufferCreateInfo::default()
            .size(descriptor.size)
            .usage(descriptor.usage.to_vk())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&info, None) }.map_err(|e| {
            GpuError::AllocationFailed(format!("failed to create buffer: {e:?}"))
        })?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        Ok((
            buffer,
            MemoryRequirements {
                size: requirements.size,
                alignment: requirements.alignment,
                memory_type_bits: requirements.memory_type_bits,
            },
        ))
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: &MemorySlice) -> GpuResult<()> {
        unsafe {
            self.device
                .bind_buffer_memory(buffer, memory.memory, memory.offset)
        }
        .map_err(|e| GpuError::AllocationFailed(format!("failed to bind buffer memory: {e:?}")))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn create_semaphore(&self, exportable: bool) -> GpuResult<vk::Semaphore> {
        let mut export = vk::ExportSemaphoreCreateInfo::default()
            .handle_types(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD);
        let mut info = vk::SemaphoreCreateInfo::default();
        if exportable {
            if self.semaphore_fd.is_none() {
                return Err(GpuError::FeatureNotSupported(
                    "exportable semaphores require VK_KHR_external_semaphore_fd".into(),
                ));
            }
            info = info.push_next(&mut export);
        }
        unsafe { self.device.create_semaphore(&info, None) }
            .map_err(|e| map_vk_error("failed to create semaphore", e))
    }

    fn export_semaphore(&self, semaphore: vk::Semaphore) -> GpuResult<ExternalHandle> {
        let loader = self.semaphore_fd.as_ref().ok_or_else(|| {
            GpuError::FeatureNotSupported("VK_KHR_external_semaphore_fd is not enabled".into())
        })?;
        let info = vk::SemaphoreGetFdInfoKHR::default()
            .semaphore(semaphore)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD);
        let fd = unsafe { loader.get_semaphore_fd(&info) }
            .map_err(|e| map_vk_error("failed to export semaphore", e))?;
        Ok(ExternalHandle::Fd(fd))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn submit(&self, submission: &Submission<'_>) -> GpuResult<SubmissionToken> {
        crate::profile_scope!("queue_submit");

        let mut family = self.family_queue(submission.family)?.lock();
        let cmd = self.command_buffer(&mut family)?;
        let queries = if submission.timed {
            Some(self.create_query_pool()?)
        } else {
            None
        };

        let fence = self
            .record(cmd, submission, queries)
            .and_then(|()| {
                unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }
                    .map_err(|e| map_vk_error("failed to create fence", e))
            })
            .and_then(|fence| {
                let wait_semaphores: Vec<_> = submission.waits.iter().map(|w| w.semaphore).collect();
                let wait_stages: Vec<_> = submission.waits.iter().map(|w| w.stage).collect();
                let command_buffers = [cmd];
                let info = vk::SubmitInfo::default()
                    .wait_semaphores(&wait_semaphores)
                    .wait_dst_stage_mask(&wait_stages)
                    .command_buffers(&command_buffers)
                    .signal_semaphores(submission.signals);
                match unsafe { self.device.queue_submit(family.queue, &[info], fence) } {
                    Ok(()) => Ok(fence),
                    Err(e) => {
                        unsafe { self.device.destroy_fence(fence, None) };
                        Err(map_vk_error("queue submit failed", e))
                    }
                }
            });

        let fence = match fence {
            Ok(fence) => fence,
            Err(err) => {
                unsafe {
                    if let Some(pool) = queries {
                        self.device.destroy_query_pool(pool, None);
                    }
                    if self
                        .device
                        .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                        .is_ok()
                    {
                        family.free.push(cmd);
                    }
                }
                return Err(err);
            }
        };

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.in_flight.lock().insert(
            token,
            InFlight {
                family: submission.family,
                cmd,
                fence,
                queries,
            },
        );
        log::trace!(
            "VulkanDriver: submitted {} '{}' ({} ops) to family {}",
            submission.id,
            submission.label,
            submission.ops.len(),
            submission.family
        );
        Ok(SubmissionToken(token))
    }

    fn wait(&self, token: SubmissionToken, timeout: Duration) -> GpuResult<bool> {
        let Some(fence) = self.in_flight.lock().get(&token.0).map(|entry| entry.fence) else {
            return Ok(true);
        };
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(map_vk_error("fence wait failed", e)),
        }
    }

    fn finish(&self, token: SubmissionToken) -> Option<Duration> {
        let entry = self.in_flight.lock().remove(&token.0)?;
        let elapsed = entry.queries.and_then(|pool| self.elapsed(pool));
        self.recycle(entry);
        elapsed
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        let pending: Vec<_> = self.in_flight.get_mut().drain().map(|(_, e)| e).collect();
        if !pending.is_empty() {
            log::warn!(
                "VulkanDriver: dropping with {} submissions in flight, waiting for the device",
                pending.len()
            );
            if let Err(e) = unsafe { self.device.device_wait_idle() } {
                log::error!("VulkanDriver: device_wait_idle failed: {e:?}");
            }
        }
        for entry in pending {
            unsafe {
                self.device.destroy_fence(entry.fence, None);
                if let Some(pool) = entry.queries {
                    self.device.destroy_query_pool(pool, None);
                }
            }
        }
        for family in self.queues.values_mut() {
            // Destroying the pool frees its command buffers.
            unsafe { self.device.destroy_command_pool(family.get_mut().pool, None) };
        }
    }
}

impl std::fmt::Debug for VulkanDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDriver")
            .field("families", &self.families)
            .field("in_flight", &self.in_flight.lock().len())
            .field("external_semaphores", &self.semaphore_fd.is_some())
            .finish()
    }
}
