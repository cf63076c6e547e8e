//! GPU resources: image and buffer creation, initial-upload sequencing
//! through the staging engine, and the canonical image-barrier builder.

use ash::vk;

use crate::context::{Context, QueueKind};
use crate::memory::{GpuAllocation, GpuAllocationRequest};

/// Handle to an image, its primary view and its backing allocation.
/// Plain data; copying the handle does not duplicate ownership.
#[derive(Clone, Copy, Debug)]
pub struct Texture {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub aspect: vk::ImageAspectFlags,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub mip_count: u32,
    pub layer_count: u32,
    pub allocation: GpuAllocation,
}

/// Handle to a buffer; the device address is always queried.
#[derive(Clone, Copy, Debug)]
pub struct Buffer {
    pub raw: vk::Buffer,
    pub size: vk::DeviceSize,
    pub device_address: vk::DeviceAddress,
    pub allocation: GpuAllocation,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TextureDesc<'a> {
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub aspect: vk::ImageAspectFlags,
    pub usage: vk::ImageUsageFlags,
    /// Zero means one.
    pub mip_count: u32,
    /// Zero means one.
    pub layer_count: u32,
    /// Staged into mip zero after creation; the texture ends up in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    pub initial_data: Option<&'a [u8]>,
    pub name: &'a str,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BufferDesc<'a> {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub required_memory_flags: vk::MemoryPropertyFlags,
    pub preferred_memory_flags: vk::MemoryPropertyFlags,
    pub initial_data: Option<&'a [u8]>,
    pub name: &'a str,
}

#[derive(Clone, Copy, Debug)]
pub struct TextureBarrierDesc<'a> {
    pub texture: &'a Texture,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_access: vk::AccessFlags2,
    /// Queue-family ownership transfer; translated only when source and
    /// destination differ.
    pub src_queue: Option<QueueKind>,
    pub dst_queue: Option<QueueKind>,
}

/// Barrier covering the whole subresource range of `texture`, with
/// ownership left untransferred.
pub(crate) fn whole_texture_barrier(
    texture: &Texture,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_stage: vk::PipelineStageFlags2,
    dst_stage: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
    dst_access: vk::AccessFlags2,
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .image(texture.image)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_stage_mask(src_stage)
        .dst_stage_mask(dst_stage)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(texture.aspect)
                .base_mip_level(0)
                .level_count(vk::REMAINING_MIP_LEVELS)
                .base_array_layer(0)
                .layer_count(vk::REMAINING_ARRAY_LAYERS),
        )
}

/// Texel size in bytes for the formats the staging path uploads; used as
/// the default staging alignment.
pub(crate) fn format_texel_size(format: vk::Format) -> u32 {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT | vk::Format::R8_SINT => 1,
        vk::Format::R8G8_UNORM
        | vk::Format::R8G8_SNORM
        | vk::Format::R16_SFLOAT
        | vk::Format::R16_UINT
        | vk::Format::D16_UNORM => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::R8G8B8A8_SNORM
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => 4,
    }
}

impl Context {
    /// Unique queue families a resource shared across graphics, compute
    /// and transfer must name.
    fn sharing_families(&self) -> ([u32; 3], usize) {
        let graphics = self.queue_family(QueueKind::Graphics);
        let compute = self.queue_family(QueueKind::Compute);
        let transfer = self.queue_family(QueueKind::Transfer);

        let mut families = [graphics, 0, 0];
        let mut count = 1;
        if compute != graphics {
            families[count] = compute;
            count += 1;
        }
        if transfer != graphics && transfer != compute {
            families[count] = transfer;
            count += 1;
        }
        (families, count)
    }

    pub fn create_texture(&self, desc: TextureDesc) -> Texture {
        let is_3d = desc.extent.depth > 1;
        let (families, family_count) = self.sharing_families();
        let families = &families[..family_count];

        let image_info = vk::ImageCreateInfo::default()
            .image_type(if is_3d {
                vk::ImageType::TYPE_3D
            } else {
                vk::ImageType::TYPE_2D
            })
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: if is_3d { desc.extent.depth } else { 1 },
            })
            .mip_levels(desc.mip_count.max(1))
            .array_layers(desc.layer_count.max(1))
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .sharing_mode(if family_count > 1 {
                vk::SharingMode::CONCURRENT
            } else {
                vk::SharingMode::EXCLUSIVE
            })
            .queue_family_indices(families);

        let image = unsafe { self.device().create_image(&image_info, None) }
            .expect("vkCreateImage failed");
        self.set_object_name(image, desc.name);

        let requirements = unsafe { self.device().get_image_memory_requirements(image) };
        let allocation = self
            .memory
            .lock()
            .unwrap()
            .alloc(GpuAllocationRequest {
                size: requirements.size,
                alignment: requirements.alignment,
                type_bits: requirements.memory_type_bits,
                required_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                preferred_flags: vk::MemoryPropertyFlags::empty(),
            })
            .expect("out of texture memory");
        unsafe {
            self.device()
                .bind_image_memory(image, allocation.memory, allocation.offset)
        }
        .expect("vkBindImageMemory failed");

        let view_type = if is_3d {
            debug_assert!(desc.layer_count <= 1);
            vk::ImageViewType::TYPE_3D
        } else if desc.layer_count > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(desc.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(desc.aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(desc.layer_count.max(1)),
            );
        let view = unsafe { self.device().create_image_view(&view_info, None) }
            .expect("vkCreateImageView failed");
        self.set_object_name(view, desc.name);

        let texture = Texture {
            image,
            view,
            aspect: desc.aspect,
            extent: desc.extent,
            format: desc.format,
            mip_count: desc.mip_count,
            layer_count: desc.layer_count,
            allocation,
        };

        if let Some(data) = desc.initial_data {
            assert!(!data.is_empty());
            self.write_to_texture(&texture, data, 0);
        }

        texture
    }

    pub fn destroy_texture(&self, texture: Texture) {
        if texture.image == vk::Image::null() {
            return;
        }
        unsafe {
            self.device().destroy_image(texture.image, None);
            self.device().destroy_image_view(texture.view, None);
        }
        self.memory.lock().unwrap().free(texture.allocation);
    }

    pub fn create_buffer(&self, desc: BufferDesc) -> Buffer {
        let usage = desc.usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        let buffer_info = vk::BufferCreateInfo::default().size(desc.size).usage(usage);
        let raw = unsafe { self.device().create_buffer(&buffer_info, None) }
            .expect("vkCreateBuffer failed");
        self.set_object_name(raw, desc.name);

        let requirements = unsafe { self.device().get_buffer_memory_requirements(raw) };
        let allocation = self
            .memory
            .lock()
            .unwrap()
            .alloc(GpuAllocationRequest {
                size: requirements.size,
                alignment: requirements.alignment,
                type_bits: requirements.memory_type_bits,
                required_flags: desc.required_memory_flags,
                preferred_flags: desc.preferred_memory_flags,
            })
            .expect("out of buffer memory");
        unsafe {
            self.device()
                .bind_buffer_memory(raw, allocation.memory, allocation.offset)
        }
        .expect("vkBindBufferMemory failed");

        let address_info = vk::BufferDeviceAddressInfo::default().buffer(raw);
        let device_address = unsafe { self.device().get_buffer_device_address(&address_info) };

        let buffer = Buffer {
            raw,
            size: desc.size,
            device_address,
            allocation,
        };

        if let Some(data) = desc.initial_data {
            assert!(!data.is_empty());
            self.write_to_buffer(&buffer, 0, data);
        }

        buffer
    }

    pub fn destroy_buffer(&self, buffer: Buffer) {
        if buffer.raw == vk::Buffer::null() {
            return;
        }
        unsafe { self.device().destroy_buffer(buffer.raw, None) };
        self.memory.lock().unwrap().free(buffer.allocation);
    }

    /// Canonical image-barrier descriptor. Queue-family ownership is
    /// translated only when source and destination queues differ.
    pub fn texture_barrier(&self, desc: TextureBarrierDesc) -> vk::ImageMemoryBarrier2<'static> {
        let (src_family, dst_family) = if desc.src_queue != desc.dst_queue {
            (
                desc.src_queue
                    .map_or(vk::QUEUE_FAMILY_IGNORED, |queue| self.queue_family(queue)),
                desc.dst_queue
                    .map_or(vk::QUEUE_FAMILY_IGNORED, |queue| self.queue_family(queue)),
            )
        } else {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        };

        whole_texture_barrier(
            desc.texture,
            desc.old_layout,
            desc.new_layout,
            desc.src_stage,
            desc.dst_stage,
            desc.src_access,
            desc.dst_access,
        )
        .src_queue_family_index(src_family)
        .dst_queue_family_index(dst_family)
    }

    /// Uploads `data` through staging and records the transfer on the
    /// transfer queue: `UNDEFINED -> TRANSFER_DST_OPTIMAL`, the copy, then
    /// `TRANSFER_DST_OPTIMAL -> SHADER_READ_ONLY_OPTIMAL`. Consumers
    /// observe the result by waiting on the staging timeline.
    pub fn write_to_texture(&self, texture: &Texture, data: &[u8], align: u32) {
        let align = if align == 0 {
            format_texel_size(texture.format)
        } else {
            align
        };

        let mut staging = self.staging.lock().unwrap();
        let slice = staging.request(data.len() as u32, align);
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), slice.ptr, data.len()) };

        let cmd = staging.take_command_buffer();
        self.begin_command_buffer(cmd);

        let to_transfer = whole_texture_barrier(
            texture,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::empty(),
            vk::AccessFlags2::TRANSFER_WRITE,
        );
        let barriers = [to_transfer];
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        unsafe { self.device().cmd_pipeline_barrier2(cmd, &dependency) };

        let region = vk::BufferImageCopy::default()
            .buffer_offset(vk::DeviceSize::from(slice.offset))
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(texture.aspect)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(texture.layer_count.max(1)),
            )
            .image_extent(vk::Extent3D {
                width: texture.extent.width,
                height: texture.extent.height,
                depth: 1,
            });
        unsafe {
            self.device().cmd_copy_buffer_to_image(
                cmd,
                slice.buffer,
                texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            )
        };

        let to_shader_read = whole_texture_barrier(
            texture,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::AccessFlags2::empty(),
        );
        let barriers = [to_shader_read];
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        unsafe { self.device().cmd_pipeline_barrier2(cmd, &dependency) };

        unsafe { self.device().end_command_buffer(cmd) }.expect("vkEndCommandBuffer failed");
        self.submit_transfer(cmd, staging.timeline(), slice.signal_value);
    }

    /// Writes `data` into the buffer: straight through the mapped pointer
    /// for host-visible memory, through a staged copy otherwise.
    pub fn write_to_buffer(&self, buffer: &Buffer, offset: vk::DeviceSize, data: &[u8]) {
        if !buffer.allocation.mapped.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    buffer.allocation.mapped.add(offset as usize),
                    data.len(),
                )
            };
            return;
        }

        let mut staging = self.staging.lock().unwrap();
        let slice = staging.request(data.len() as u32, 4);
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), slice.ptr, data.len()) };

        let cmd = staging.take_command_buffer();
        self.begin_command_buffer(cmd);
        let copy = vk::BufferCopy::default()
            .src_offset(vk::DeviceSize::from(slice.offset))
            .dst_offset(offset)
            .size(data.len() as vk::DeviceSize);
        unsafe {
            self.device()
                .cmd_copy_buffer(cmd, slice.buffer, buffer.raw, &[copy])
        };
        unsafe { self.device().end_command_buffer(cmd) }.expect("vkEndCommandBuffer failed");
        self.submit_transfer(cmd, staging.timeline(), slice.signal_value);
    }

    /// Typed convenience over [`Self::write_to_buffer`].
    pub fn write_slice_to_buffer<T: bytemuck::NoUninit>(
        &self,
        buffer: &Buffer,
        offset: vk::DeviceSize,
        data: &[T],
    ) {
        self.write_to_buffer(buffer, offset, bytemuck::cast_slice(data));
    }

    fn submit_transfer(&self, cmd: vk::CommandBuffer, timeline: vk::Semaphore, value: u64) {
        let commands = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(timeline)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)];
        let submit = vk::SubmitInfo2::default()
            .command_buffer_infos(&commands)
            .signal_semaphore_infos(&signals);
        unsafe {
            self.device().queue_submit2(
                self.queue(QueueKind::Transfer),
                &[submit],
                vk::Fence::null(),
            )
        }
        .expect("vkQueueSubmit2 failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_texture() -> Texture {
        Texture {
            image: vk::Image::null(),
            view: vk::ImageView::null(),
            aspect: vk::ImageAspectFlags::COLOR,
            extent: vk::Extent3D {
                width: 64,
                height: 64,
                depth: 1,
            },
            format: vk::Format::R8G8B8A8_UNORM,
            mip_count: 1,
            layer_count: 1,
            allocation: GpuAllocation::null(),
        }
    }

    #[test]
    fn whole_texture_barrier_covers_all_subresources() {
        let texture = dummy_texture();
        let barrier = whole_texture_barrier(
            &texture,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::empty(),
            vk::AccessFlags2::TRANSFER_WRITE,
        );
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(barrier.dst_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(
            barrier.subresource_range.level_count,
            vk::REMAINING_MIP_LEVELS
        );
        assert_eq!(
            barrier.subresource_range.layer_count,
            vk::REMAINING_ARRAY_LAYERS
        );
        assert_eq!(
            barrier.subresource_range.aspect_mask,
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn texel_sizes_for_common_formats() {
        assert_eq!(format_texel_size(vk::Format::R8_UNORM), 1);
        assert_eq!(format_texel_size(vk::Format::R8G8B8A8_SRGB), 4);
        assert_eq!(format_texel_size(vk::Format::R16G16B16A16_SFLOAT), 8);
        assert_eq!(format_texel_size(vk::Format::R32G32B32A32_SFLOAT), 16);
    }
}
