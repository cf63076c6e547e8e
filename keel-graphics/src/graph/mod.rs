//! Per-frame orchestration: a pool of double-buffered frame slots, each
//! owning its transient GPU objects, a CPU scratch arena, GPU timer
//! scopes and the fence/semaphore pair that gates slot reuse.
//!
//! Everything allocated through a slot during a frame is released the
//! next time the slot comes around, after its fence has been observed
//! signalled.

mod pass;

use std::cell::RefCell;

pub use pass::{
    buffer_state, texture_present_state, texture_state, BufferUse, ComputePassDesc,
    GraphicsPassDesc, RenderTargetState, Resource, ResourceState, TextureUse, TransferPassDesc,
    MAX_RENDER_TARGETS,
};

pub(crate) use pass::ProfilingScope;

use ash::vk;

use crate::alloc::{HeapPagePool, StackAllocator};
use crate::context::{Context, QueueKind, QUEUE_COUNT};
use crate::resource::{Buffer, BufferDesc, Texture, TextureDesc};
use crate::surface::{Surface, SurfaceStatus};
use crate::timing::{ScopeTiming, TimerManager};
use crate::FRAME_COUNT;

/// CPU scratch per frame slot, in one-page steps.
const ARENA_PAGE_SIZE: u32 = 1 << 20;

/// Timer pairs available per frame slot.
const MAX_TIMER_COUNT: u32 = 1024;

/// Descriptors of each type a slot's transient pool holds.
const MAX_TRANSIENT_DESCRIPTORS_PER_TYPE: u32 = 128;
const MAX_TRANSIENT_DESCRIPTOR_SETS: u32 = 128;

/// Descriptor writes a single transient set may carry.
pub const MAX_DESCRIPTOR_WRITES: usize = 32;

/// Sentinel extent meaning "match the acquired swapchain image".
pub const SCREEN_EXTENT: vk::Extent3D = vk::Extent3D {
    width: u32::MAX,
    height: u32::MAX,
    depth: 0,
};

/// Bump arena handing out typed scratch slices valid for the current
/// frame. Allocation takes `&self` so several slices can be live at
/// once; `reset` takes `&mut self` and therefore cannot invalidate them.
pub(crate) struct FrameArena {
    stack: RefCell<StackAllocator<HeapPagePool>>,
}

impl FrameArena {
    fn new(page_size: u32) -> Self {
        Self {
            stack: RefCell::new(StackAllocator::new(page_size, HeapPagePool)),
        }
    }

    fn reset(&mut self) {
        self.stack.get_mut().reset();
    }

    /// Default-initialised scratch slice. Slices from separate calls
    /// never overlap, which is what makes the `&self` hand-out sound.
    pub(crate) fn alloc_slice<T: Copy + Default>(&self, len: usize) -> &mut [T] {
        if len == 0 {
            return &mut [];
        }
        let size = std::mem::size_of::<T>() * len;
        let align = std::mem::align_of::<T>();
        let mut stack = self.stack.borrow_mut();
        let allocation = stack
            .alloc(size as u32, align as u32)
            .expect("frame arena request exceeds the arena page size");
        let ptr = unsafe {
            stack
                .page(allocation.page)
                .as_ptr()
                .add(allocation.offset as usize)
        } as *mut T;
        unsafe {
            for index in 0..len {
                ptr.add(index).write(T::default());
            }
            std::slice::from_raw_parts_mut(ptr, len)
        }
    }
}

#[derive(Default)]
pub struct BeginFrameDesc<'a> {
    pub frame_index: usize,
    pub surface: Option<&'a Surface>,
}

/// What a pass resource is backed by: an adopted caller-owned object, or
/// a transient one the frame slot allocates and releases.
pub enum ResourceDesc<'a> {
    Texture(&'a Texture),
    TransientTexture(TextureDesc<'a>),
    Buffer(&'a Buffer),
    TransientBuffer(BufferDesc<'a>),
}

#[derive(Clone, Copy)]
pub struct TransientImageViewDesc<'a> {
    pub texture: &'a Texture,
    pub base_mip: u32,
    pub layer: u32,
}

#[derive(Clone, Copy)]
pub struct DescriptorSetWrite<'a> {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub resource: &'a Resource,
}

#[derive(Clone, Copy)]
pub struct DescriptorSetDesc<'a> {
    pub layout: vk::DescriptorSetLayout,
    pub writes: &'a [DescriptorSetWrite<'a>],
}

pub struct SubmitDesc<'a> {
    pub queue: QueueKind,
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub signal_semaphores: &'a [vk::Semaphore],
    pub fence: vk::Fence,
}

/// One frame slot of the graph pool.
pub struct RenderGraph {
    pub(crate) arena: FrameArena,
    transient_textures: Vec<Texture>,
    transient_buffers: Vec<Buffer>,
    transient_image_views: Vec<vk::ImageView>,
    transient_descriptor_pool: vk::DescriptorPool,
    transient_command_pools: [vk::CommandPool; QUEUE_COUNT],
    transient_command_buffers: [Vec<vk::CommandBuffer>; QUEUE_COUNT],
    fence: vk::Fence,
    frame_semaphore: vk::Semaphore,
    pub(crate) timers: TimerManager,
    pub(crate) active_scopes: Vec<ProfilingScope>,
    pub(crate) completed_scopes: Vec<ProfilingScope>,
    previous_timings: Vec<ScopeTiming>,
    swapchain_texture_index: u32,
    swapchain_texture: Option<Texture>,
    acquire_semaphore: vk::Semaphore,
    screen_extent: vk::Extent2D,
}

pub struct RenderGraphPool {
    graphs: Vec<RenderGraph>,
}

impl Context {
    pub fn create_graph_pool(&self) -> RenderGraphPool {
        let graphs = (0..FRAME_COUNT).map(|_| self.create_graph_slot()).collect();
        RenderGraphPool { graphs }
    }

    fn create_graph_slot(&self) -> RenderGraph {
        let device = self.device();

        let timers = TimerManager::new(device, MAX_TIMER_COUNT, self.timestamp_period());

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: MAX_TRANSIENT_DESCRIPTORS_PER_TYPE,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: MAX_TRANSIENT_DESCRIPTORS_PER_TYPE,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: MAX_TRANSIENT_DESCRIPTORS_PER_TYPE,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: MAX_TRANSIENT_DESCRIPTORS_PER_TYPE,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: MAX_TRANSIENT_DESCRIPTORS_PER_TYPE,
            },
        ];
        let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(MAX_TRANSIENT_DESCRIPTOR_SETS)
            .pool_sizes(&pool_sizes);
        let transient_descriptor_pool =
            unsafe { device.create_descriptor_pool(&descriptor_pool_info, None) }
                .expect("failed to create the transient descriptor pool");

        let transient_command_pools = std::array::from_fn(|index| {
            let info = vk::CommandPoolCreateInfo::default()
                .flags(vk::CommandPoolCreateFlags::TRANSIENT)
                .queue_family_index(self.queue_family(QueueKind::ALL[index]));
            unsafe { device.create_command_pool(&info, None) }
                .expect("failed to create a transient command pool")
        });

        let frame_semaphore =
            unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
                .expect("failed to create the frame semaphore");

        // Signalled so the first visit to the slot does not block.
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = unsafe { device.create_fence(&fence_info, None) }
            .expect("failed to create the frame fence");

        RenderGraph {
            arena: FrameArena::new(ARENA_PAGE_SIZE),
            transient_textures: Vec::new(),
            transient_buffers: Vec::new(),
            transient_image_views: Vec::new(),
            transient_descriptor_pool,
            transient_command_pools,
            transient_command_buffers: std::array::from_fn(|_| Vec::new()),
            fence,
            frame_semaphore,
            timers,
            active_scopes: Vec::new(),
            completed_scopes: Vec::new(),
            previous_timings: Vec::new(),
            swapchain_texture_index: 0,
            swapchain_texture: None,
            acquire_semaphore: vk::Semaphore::null(),
            screen_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
        }
    }

    pub fn destroy_graph_pool(&self, mut pool: RenderGraphPool) {
        let device = self.device();
        for mut graph in pool.graphs.drain(..) {
            unsafe {
                let _ = device.wait_for_fences(&[graph.fence], true, u64::MAX);
            }
            for texture in graph.transient_textures.drain(..) {
                self.destroy_texture(texture);
            }
            for buffer in graph.transient_buffers.drain(..) {
                self.destroy_buffer(buffer);
            }
            unsafe {
                for view in graph.transient_image_views.drain(..) {
                    device.destroy_image_view(view, None);
                }
                device.destroy_descriptor_pool(graph.transient_descriptor_pool, None);
                for pool in graph.transient_command_pools {
                    device.destroy_command_pool(pool, None);
                }
                device.destroy_fence(graph.fence, None);
                device.destroy_semaphore(graph.frame_semaphore, None);
            }
            graph.timers.destroy(device);
        }
    }
}

impl RenderGraphPool {
    /// Prepares the slot for a new frame: waits for the previous use to
    /// retire, releases that use's transient objects, optionally acquires
    /// a swapchain image, and turns the previous use's profiling scopes
    /// into readable timings.
    ///
    /// Returns `None` when the surface could not be acquired; the caller
    /// must skip the frame (and rebuild the surface if it asked for
    /// that).
    pub fn begin_frame<'a>(
        &'a mut self,
        ctx: &Context,
        desc: BeginFrameDesc,
    ) -> Option<&'a mut RenderGraph> {
        let graph = &mut self.graphs[desc.frame_index];
        let device = ctx.device();

        // Fence signalled means every transient below is idle.
        unsafe { device.wait_for_fences(&[graph.fence], true, u64::MAX) }
            .expect("vkWaitForFences failed");

        for texture in graph.transient_textures.drain(..) {
            ctx.destroy_texture(texture);
        }
        for buffer in graph.transient_buffers.drain(..) {
            ctx.destroy_buffer(buffer);
        }
        for view in graph.transient_image_views.drain(..) {
            unsafe { device.destroy_image_view(view, None) };
        }

        unsafe {
            device.reset_descriptor_pool(
                graph.transient_descriptor_pool,
                vk::DescriptorPoolResetFlags::empty(),
            )
        }
        .expect("vkResetDescriptorPool failed");
        for queue in 0..QUEUE_COUNT {
            if !graph.transient_command_buffers[queue].is_empty() {
                unsafe {
                    device.free_command_buffers(
                        graph.transient_command_pools[queue],
                        &graph.transient_command_buffers[queue],
                    )
                };
                graph.transient_command_buffers[queue].clear();
            }
            unsafe {
                device.reset_command_pool(
                    graph.transient_command_pools[queue],
                    vk::CommandPoolResetFlags::empty(),
                )
            }
            .expect("vkResetCommandPool failed");
        }

        if let Some(surface) = desc.surface {
            let (image_index, status) = ctx.acquire_swapchain_texture(surface, desc.frame_index);
            if status != SurfaceStatus::Ok {
                return None;
            }
            graph.swapchain_texture_index = image_index;
            graph.swapchain_texture = Some(*surface.texture(image_index as usize));
            graph.acquire_semaphore = surface.acquire_semaphore(desc.frame_index);
            graph.screen_extent = surface.extent();
        } else {
            graph.swapchain_texture_index = 0;
            graph.swapchain_texture = None;
            graph.acquire_semaphore = vk::Semaphore::null();
            graph.screen_extent = vk::Extent2D {
                width: 1,
                height: 1,
            };
        }

        // Only reset the fence once the frame is certain to signal it.
        unsafe { device.reset_fences(&[graph.fence]) }.expect("vkResetFences failed");
        graph.arena.reset();

        graph.previous_timings.clear();
        for scope in graph.completed_scopes.drain(..) {
            let milliseconds = graph.timers.query(device, scope.timer, false);
            debug_assert!(
                milliseconds.is_some(),
                "timer unreadable after the frame fence signalled"
            );
            graph.previous_timings.push(ScopeTiming {
                name: scope.name,
                milliseconds: milliseconds.unwrap_or(0.0),
            });
        }
        graph.timers.reset(device);

        Some(graph)
    }
}

impl RenderGraph {
    pub fn end_frame(&self) {
        assert!(
            self.active_scopes.is_empty(),
            "frame ended with an open profiling scope"
        );
    }

    /// Typed scratch valid until this slot's next `begin_frame`.
    pub fn alloc_transient_slice<T: Copy + Default>(&self, len: usize) -> &mut [T] {
        self.arena.alloc_slice(len)
    }

    /// Allocates or adopts a pass resource. Transient objects are
    /// remembered on the slot and released on its next visit. A
    /// transient texture created with an initial upload starts in
    /// `SHADER_READ_ONLY_OPTIMAL`, which is where the upload's barrier
    /// chain leaves it; everything else starts in `UNDEFINED`.
    pub fn alloc_pass_resource(&mut self, ctx: &Context, desc: ResourceDesc) -> Resource {
        match desc {
            ResourceDesc::Texture(texture) => {
                Resource::texture(*texture, vk::ImageLayout::UNDEFINED)
            }
            ResourceDesc::TransientTexture(mut texture_desc) => {
                if texture_desc.extent.width == SCREEN_EXTENT.width
                    && texture_desc.extent.height == SCREEN_EXTENT.height
                {
                    texture_desc.extent = vk::Extent3D {
                        width: self.screen_extent.width,
                        height: self.screen_extent.height,
                        depth: 0,
                    };
                }
                let uploaded = texture_desc.initial_data.is_some();
                let texture = ctx.create_texture(texture_desc);
                self.transient_textures.push(texture);
                let layout = if uploaded {
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                } else {
                    vk::ImageLayout::UNDEFINED
                };
                Resource::texture(texture, layout)
            }
            ResourceDesc::Buffer(buffer) => Resource::buffer(*buffer),
            ResourceDesc::TransientBuffer(buffer_desc) => {
                let buffer = ctx.create_buffer(buffer_desc);
                self.transient_buffers.push(buffer);
                Resource::buffer(buffer)
            }
        }
    }

    /// A single-mip, single-layer view onto `texture`, released with the
    /// slot's other transients.
    pub fn alloc_transient_image_view(
        &mut self,
        ctx: &Context,
        desc: TransientImageViewDesc,
    ) -> vk::ImageView {
        let view_type = if desc.texture.extent.depth > 1 {
            vk::ImageViewType::TYPE_3D
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let info = vk::ImageViewCreateInfo::default()
            .image(desc.texture.image)
            .view_type(view_type)
            .format(desc.texture.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(desc.texture.aspect)
                    .base_mip_level(desc.base_mip)
                    .level_count(1)
                    .base_array_layer(desc.layer)
                    .layer_count(1),
            );
        let view = unsafe { ctx.device().create_image_view(&info, None) }
            .expect("vkCreateImageView failed");
        self.transient_image_views.push(view);
        view
    }

    /// A primary command buffer from the slot's per-queue transient
    /// pool, reclaimed at the slot's next visit.
    pub fn alloc_transient_command_buffer(
        &mut self,
        ctx: &Context,
        queue: QueueKind,
    ) -> vk::CommandBuffer {
        let cmd = ctx.allocate_command_buffers(self.transient_command_pools[queue as usize], 1)[0];
        self.transient_command_buffers[queue as usize].push(cmd);
        cmd
    }

    /// A descriptor set from the slot's transient pool, written from the
    /// given graph resources. Textures are bound with their current
    /// layout.
    pub fn alloc_transient_descriptor_set(
        &mut self,
        ctx: &Context,
        desc: DescriptorSetDesc,
    ) -> vk::DescriptorSet {
        assert!(
            desc.writes.len() <= MAX_DESCRIPTOR_WRITES,
            "too many descriptor writes for one transient set"
        );

        let layouts = [desc.layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.transient_descriptor_pool)
            .set_layouts(&layouts);
        let set = unsafe { ctx.device().allocate_descriptor_sets(&alloc_info) }
            .expect("transient descriptor pool exhausted")[0];

        let mut buffer_infos = [vk::DescriptorBufferInfo::default(); MAX_DESCRIPTOR_WRITES];
        let mut image_infos = [vk::DescriptorImageInfo::default(); MAX_DESCRIPTOR_WRITES];
        for (index, write) in desc.writes.iter().enumerate() {
            match write.descriptor_type {
                vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::STORAGE_BUFFER => {
                    let buffer = write
                        .resource
                        .buffer_handle()
                        .expect("buffer descriptor write on a non-buffer resource");
                    buffer_infos[index] = vk::DescriptorBufferInfo::default()
                        .buffer(buffer.raw)
                        .offset(0)
                        .range(vk::WHOLE_SIZE);
                }
                vk::DescriptorType::SAMPLED_IMAGE | vk::DescriptorType::STORAGE_IMAGE => {
                    let texture = write
                        .resource
                        .texture_handle()
                        .expect("image descriptor write on a non-texture resource");
                    image_infos[index] = vk::DescriptorImageInfo::default()
                        .image_view(texture.view)
                        .image_layout(write.resource.layout().unwrap());
                }
                other => panic!("unsupported transient descriptor type {other:?}"),
            }
        }

        let mut writes = [vk::WriteDescriptorSet::default(); MAX_DESCRIPTOR_WRITES];
        for (index, write) in desc.writes.iter().enumerate() {
            let base = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(write.binding)
                .descriptor_type(write.descriptor_type);
            writes[index] = match write.descriptor_type {
                vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::STORAGE_BUFFER => {
                    base.buffer_info(std::slice::from_ref(&buffer_infos[index]))
                }
                _ => base.image_info(std::slice::from_ref(&image_infos[index])),
            };
        }
        unsafe {
            ctx.device()
                .update_descriptor_sets(&writes[..desc.writes.len()], &[])
        };
        set
    }

    /// Builds the submit payload in the slot's arena and issues exactly
    /// one `vkQueueSubmit2`.
    pub fn submit_command_buffers(&self, ctx: &Context, desc: SubmitDesc) {
        let commands = self
            .arena
            .alloc_slice::<vk::CommandBufferSubmitInfo>(desc.command_buffers.len());
        for (info, cmd) in commands.iter_mut().zip(desc.command_buffers) {
            *info = vk::CommandBufferSubmitInfo::default().command_buffer(*cmd);
        }

        let waits = self
            .arena
            .alloc_slice::<vk::SemaphoreSubmitInfo>(desc.wait_semaphores.len());
        for (info, semaphore) in waits.iter_mut().zip(desc.wait_semaphores) {
            *info = vk::SemaphoreSubmitInfo::default()
                .semaphore(*semaphore)
                .stage_mask(vk::PipelineStageFlags2::BOTTOM_OF_PIPE);
        }

        let signals = self
            .arena
            .alloc_slice::<vk::SemaphoreSubmitInfo>(desc.signal_semaphores.len());
        for (info, semaphore) in signals.iter_mut().zip(desc.signal_semaphores) {
            *info = vk::SemaphoreSubmitInfo::default()
                .semaphore(*semaphore)
                .stage_mask(vk::PipelineStageFlags2::BOTTOM_OF_PIPE);
        }

        let submit = vk::SubmitInfo2::default()
            .command_buffer_infos(commands)
            .wait_semaphore_infos(waits)
            .signal_semaphore_infos(signals);
        unsafe {
            ctx.device()
                .queue_submit2(ctx.queue(desc.queue), &[submit], desc.fence)
        }
        .expect("vkQueueSubmit2 failed");
    }

    /// Presents the acquired image, waiting on the frame semaphore;
    /// rebuilds the surface when presentation reports it stale.
    pub fn present(&self, ctx: &Context, surface: &mut Surface) {
        let status =
            ctx.present_surface(surface, self.swapchain_texture_index, self.frame_semaphore);
        if status == SurfaceStatus::ShouldRebuild {
            ctx.rebuild_surface(surface);
        }
    }

    /// Fresh graph resource for the acquired swapchain image; its layout
    /// is undefined at the top of the frame.
    pub fn swapchain_resource(&self) -> Resource {
        let texture = self
            .swapchain_texture
            .expect("no swapchain image was acquired this frame");
        Resource::texture(texture, vk::ImageLayout::UNDEFINED)
    }

    pub fn swapchain_texture(&self) -> Option<&Texture> {
        self.swapchain_texture.as_ref()
    }

    pub fn swapchain_texture_index(&self) -> u32 {
        self.swapchain_texture_index
    }

    /// Semaphore signalled by the swapchain acquire; submissions writing
    /// the swapchain image must wait on it.
    pub fn acquire_semaphore(&self) -> vk::Semaphore {
        self.acquire_semaphore
    }

    /// Semaphore presentation waits on; the frame's last submission
    /// should signal it.
    pub fn frame_semaphore(&self) -> vk::Semaphore {
        self.frame_semaphore
    }

    /// Fence gating reuse of this slot; the frame's last submission must
    /// signal it.
    pub fn frame_fence(&self) -> vk::Fence {
        self.fence
    }

    pub fn screen_extent(&self) -> vk::Extent2D {
        self.screen_extent
    }

    /// Scope timings resolved from the previous use of this slot.
    pub fn previous_frame_timings(&self) -> &[ScopeTiming] {
        &self.previous_timings
    }
}
