//! Translation of recorded operations into Vulkan commands.

use ash::vk;

use crate::command::RecordedOp;
use crate::hazard::{BarrierTarget, PipelineBarrier};

/// Encode `ops` into `cmd`, which must be in the recording state.
pub(super) unsafe fn encode_ops(device: &ash::Device, cmd: vk::CommandBuffer, ops: &[RecordedOp]) {
    for op in ops {
        unsafe { encode_op(device, cmd, op) };
    }
}

unsafe fn encode_op(device: &ash::Device, cmd: vk::CommandBuffer, op: &RecordedOp) {
    unsafe {
        match op {
            RecordedOp::Barrier(barrier) => encode_barrier(device, cmd, barrier),
            RecordedOp::CopyBuffer { src, dst, region } => {
                device.cmd_copy_buffer(cmd, *src, *dst, std::slice::from_ref(region));
            }
            RecordedOp::UpdateBuffer { dst, offset, data } => {
                device.cmd_update_buffer(cmd, *dst, *offset, data);
            }
            RecordedOp::CopyBufferToImage { src, dst, region } => {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    *src,
                    *dst,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(region),
                );
            }
            RecordedOp::CopyImageToBuffer { src, dst, region } => {
                device.cmd_copy_image_to_buffer(
                    cmd,
                    *src,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    *dst,
                    std::slice::from_ref(region),
                );
            }
            RecordedOp::BlitImage {
                src,
                dst,
                region,
                filter,
            } => {
                device.cmd_blit_image(
                    cmd,
                    *src,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    *dst,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(region),
                    *filter,
                );
            }
            RecordedOp::ClearColorImage {
                image,
                color,
                aspect_mask,
            } => {
                let value = vk::ClearColorValue { float32: color.0 };
                let range = vk::ImageSubresourceRange {
                    aspect_mask: *aspect_mask,
                    base_mip_level: 0,
                    level_count: vk::REMAINING_MIP_LEVELS,
                    base_array_layer: 0,
                    layer_count: vk::REMAINING_ARRAY_LAYERS,
                };
                device.cmd_clear_color_image(
                    cmd,
                    *image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &value,
                    &[range],
                );
            }
            RecordedOp::Dispatch {
                label,
                pipeline,
                layout,
                descriptor_sets,
                push_constants,
                groups,
            } => {
                log::trace!("VulkanDriver: dispatch '{label}' {groups:?}");
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, *pipeline);
                if !descriptor_sets.is_empty() {
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::COMPUTE,
                        *layout,
                        0,
                        descriptor_sets,
                        &[],
                    );
                }
                if !push_constants.is_empty() {
                    device.cmd_push_constants(
                        cmd,
                        *layout,
                        vk::ShaderStageFlags::COMPUTE,
                        0,
                        push_constants,
                    );
                }
                device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]);
            }
        }
    }
}

unsafe fn encode_barrier(device: &ash::Device, cmd: vk::CommandBuffer, barrier: &PipelineBarrier) {
    let flags = vk::DependencyFlags::empty();
    unsafe {
        match &barrier.target {
            BarrierTarget::Image(image) => device.cmd_pipeline_barrier(
                cmd,
                barrier.src_stage,
                barrier.dst_stage,
                flags,
                &[],
                &[],
                &[image.to_vk()],
            ),
            BarrierTarget::Buffer(buffer) => device.cmd_pipeline_barrier(
                cmd,
                barrier.src_stage,
                barrier.dst_stage,
                flags,
                &[],
                &[buffer.to_vk()],
                &[],
            ),
        }
    }
}
