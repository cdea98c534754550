//! Device memory through gpu-allocator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;

use crate::driver::{MemoryAllocator, MemoryLocation, MemoryRequest, MemorySlice};
use crate::error::{GpuError, GpuResult};

/// [`MemoryAllocator`] backed by a gpu-allocator sub-allocator.
pub struct VulkanAllocator {
    allocator: Mutex<Allocator>,
    allocations: Mutex<HashMap<u64, Allocation>>,
    next_id: AtomicU64,
}

impl VulkanAllocator {
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> GpuResult<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(format!("failed to create memory allocator: {e}")))?;

        Ok(Self {
            allocator: Mutex::new(allocator),
            allocations: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn with_allocation<R>(
        &self,
        slice: &MemorySlice,
        f: impl FnOnce(&mut Allocation) -> GpuResult<R>,
    ) -> GpuResult<R> {
        let mut allocations = self.allocations.lock();
        let allocation = allocations
            .get_mut(&slice.id)
            .ok_or_else(|| GpuError::Internal(format!("unknown memory slice {}", slice.id)))?;
        f(allocation)
    }
}

fn location(location: MemoryLocation) -> gpu_allocator::MemoryLocation {
    match location {
        MemoryLocation::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
        MemoryLocation::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
        MemoryLocation::GpuToCpu => gpu_allocator::MemoryLocation::GpuToCpu,
    }
}

fn host_range(allocation: &Allocation, offset: u64, len: usize) -> GpuResult<std::ops::Range<usize>> {
    let start = offset as usize;
    let end = start
        .checked_add(len)
        .filter(|end| *end as u64 <= allocation.size())
        .ok_or_else(|| {
            GpuError::InvalidParameter(format!(
                "host access {start}+{len} exceeds allocation of {} bytes",
                allocation.size()
            ))
        })?;
    Ok(start..end)
}

impl MemoryAllocator for VulkanAllocator {
    fn allocate(&self, request: &MemoryRequest<'_>) -> GpuResult<MemorySlice> {
        crate::profile_scope!("allocate_memory");

        let requirements = vk::MemoryRequirements {
            size: request.requirements.size,
            alignment: request.requirements.alignment,
            memory_type_bits: request.requirements.memory_type_bits,
        };
        let allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: request.label,
                requirements,
                location: location(request.location),
                linear: request.linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| match e {
                gpu_allocator::AllocationError::OutOfMemory => GpuError::OutOfMemory,
                other => GpuError::AllocationFailed(format!("{}: {other}", request.label)),
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slice = MemorySlice {
            id,
            memory: unsafe { allocation.memory() },
            offset: allocation.offset(),
            size: allocation.size(),
            host_visible: allocation.mapped_ptr().is_some(),
        };
        self.allocations.lock().insert(id, allocation);
        Ok(slice)
    }

    fn free(&self, slice: MemorySlice) {
        let Some(allocation) = self.allocations.lock().remove(&slice.id) else {
            log::warn!("VulkanAllocator: double free of memory slice {}", slice.id);
            return;
        };
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::error!("VulkanAllocator: failed to free memory slice {}: {e}", slice.id);
        }
    }

    fn write(&self, slice: &MemorySlice, offset: u64, data: &[u8]) -> GpuResult<()> {
        self.with_allocation(slice, |allocation| {
            let range = host_range(allocation, offset, data.len())?;
            let mapped = allocation
                .mapped_slice_mut()
                .ok_or_else(|| GpuError::Misuse("memory slice is not host visible".into()))?;
            mapped[range].copy_from_slice(data);
            Ok(())
        })
    }

    fn read(&self, slice: &MemorySlice, offset: u64, out: &mut [u8]) -> GpuResult<()> {
        self.with_allocation(slice, |allocation| {
            let range = host_range(allocation, offset, out.len())?;
            let mapped = allocation
                .mapped_slice()
                .ok_or_else(|| GpuError::Misuse("memory slice is not host visible".into()))?;
            out.copy_from_slice(&mapped[range]);
            Ok(())
        })
    }
}

impl Drop for VulkanAllocator {
    fn drop(&mut self) {
        let leaked = self.allocations.get_mut().len();
        if leaked > 0 {
            log::warn!("VulkanAllocator: dropping with {leaked} live allocations");
        }
        let allocator = self.allocator.get_mut();
        for (_, allocation) in self.allocations.get_mut().drain() {
            if let Err(e) = allocator.free(allocation) {
                log::error!("VulkanAllocator: failed to free leaked allocation: {e}");
            }
        }
    }
}

impl std::fmt::Debug for VulkanAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanAllocator")
            .field("allocations", &self.allocations.lock().len())
            .finish()
    }
}
