//! Declarative passes and the barrier engine.
//!
//! Each pass declares the state every resource it touches must be in;
//! the engine links successive states on the same resource into a
//! barrier chain: the new barrier's source stage/access is whatever the
//! previous state promised to release, its destination is what the new
//! state acquires. The engine records the *release* side as the
//! resource's new `last_release_*`, conflating the acquire and release
//! boundaries of a state; that is the one place it does not track
//! precise synchronisation, and it holds only within a single queue's
//! program order.

use ash::vk;

use crate::context::Context;
use crate::resource::{whole_texture_barrier, Buffer, Texture};
use crate::timing::Timer;

use super::RenderGraph;

/// Colour attachments a single graphics pass may declare.
pub const MAX_RENDER_TARGETS: usize = 32;

pub(crate) struct ProfilingScope {
    pub timer: Timer,
    pub name: String,
}

enum ResourceKind {
    Texture {
        texture: Texture,
        layout: vk::ImageLayout,
    },
    Buffer {
        buffer: Buffer,
    },
}

/// A graph-level resource: a texture (with its tracked layout) or a
/// buffer, plus the write barrier its previous user promised to release
/// against. Mutated only by the barrier engine.
pub struct Resource {
    kind: ResourceKind,
    last_release_stage: vk::PipelineStageFlags2,
    last_release_access: vk::AccessFlags2,
}

impl Resource {
    pub fn texture(texture: Texture, layout: vk::ImageLayout) -> Self {
        Self {
            kind: ResourceKind::Texture { texture, layout },
            last_release_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            last_release_access: vk::AccessFlags2::empty(),
        }
    }

    pub fn buffer(buffer: Buffer) -> Self {
        Self {
            kind: ResourceKind::Buffer { buffer },
            last_release_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            last_release_access: vk::AccessFlags2::empty(),
        }
    }

    pub fn is_texture(&self) -> bool {
        matches!(self.kind, ResourceKind::Texture { .. })
    }

    pub fn texture_handle(&self) -> Option<&Texture> {
        match &self.kind {
            ResourceKind::Texture { texture, .. } => Some(texture),
            ResourceKind::Buffer { .. } => None,
        }
    }

    pub fn buffer_handle(&self) -> Option<&Buffer> {
        match &self.kind {
            ResourceKind::Buffer { buffer } => Some(buffer),
            ResourceKind::Texture { .. } => None,
        }
    }

    /// Tracked layout; `None` for buffers.
    pub fn layout(&self) -> Option<vk::ImageLayout> {
        match &self.kind {
            ResourceKind::Texture { layout, .. } => Some(*layout),
            ResourceKind::Buffer { .. } => None,
        }
    }

    pub fn last_release_stage(&self) -> vk::PipelineStageFlags2 {
        self.last_release_stage
    }

    pub fn last_release_access(&self) -> vk::AccessFlags2 {
        self.last_release_access
    }
}

/// Desired state of one resource for the duration of a pass.
///
/// Either `acquire_and_release_stage` is set, or both `acquire_stage`
/// and `release_stage` are; providing both forms (or neither) is a
/// programming error.
pub struct ResourceState<'a> {
    pub resource: &'a mut Resource,
    /// Target layout; ignored for buffers.
    pub layout: vk::ImageLayout,
    pub acquire_access: vk::AccessFlags2,
    pub release_access: vk::AccessFlags2,
    /// Convenience form: acquire and release at the same stage.
    pub acquire_and_release_stage: vk::PipelineStageFlags2,
    /// When the resource must be available.
    pub acquire_stage: vk::PipelineStageFlags2,
    /// When later passes may use the resource.
    pub release_stage: vk::PipelineStageFlags2,
}

/// Resource state of a colour or depth attachment, with its load/store
/// behaviour. Empty masks fall back to the attachment defaults.
pub struct RenderTargetState<'a> {
    pub resource: &'a mut Resource,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_value: vk::ClearValue,
    pub acquire_access: vk::AccessFlags2,
    pub release_access: vk::AccessFlags2,
    pub acquire_stage: vk::PipelineStageFlags2,
    pub release_stage: vk::PipelineStageFlags2,
}

impl<'a> RenderTargetState<'a> {
    pub fn new(resource: &'a mut Resource) -> Self {
        Self {
            resource,
            load_op: vk::AttachmentLoadOp::LOAD,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_value: vk::ClearValue::default(),
            acquire_access: vk::AccessFlags2::empty(),
            release_access: vk::AccessFlags2::empty(),
            acquire_stage: vk::PipelineStageFlags2::empty(),
            release_stage: vk::PipelineStageFlags2::empty(),
        }
    }

    pub fn cleared(resource: &'a mut Resource, clear_value: vk::ClearValue) -> Self {
        Self {
            load_op: vk::AttachmentLoadOp::CLEAR,
            clear_value,
            ..Self::new(resource)
        }
    }
}

#[derive(Default)]
pub struct GraphicsPassDesc<'a, 'r> {
    /// Transitioned to `COLOR_ATTACHMENT_OPTIMAL` and attached in order.
    pub render_targets: &'a mut [RenderTargetState<'r>],
    pub depth_target: Option<RenderTargetState<'r>>,
    /// Other resources the pass reads or writes.
    pub other_resources: &'a mut [ResourceState<'r>],
    /// Both zero means the full `[0, 1]` range.
    pub min_depth: f32,
    pub max_depth: f32,
    pub name: &'a str,
}

#[derive(Default)]
pub struct ComputePassDesc<'a, 'r> {
    pub resource_states: &'a mut [ResourceState<'r>],
    pub name: &'a str,
}

#[derive(Default)]
pub struct TransferPassDesc<'a, 'r> {
    pub resource_states: &'a mut [ResourceState<'r>],
    pub name: &'a str,
}

/// Common texture uses with their canonical layout and access masks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureUse {
    ShaderWrite,
    ShaderRead,
    DepthRead,
    ShaderReadWrite,
    TransferSrc,
    TransferDst,
}

pub fn texture_state<'a>(
    resource: &'a mut Resource,
    texture_use: TextureUse,
    stage: vk::PipelineStageFlags2,
) -> ResourceState<'a> {
    assert!(resource.is_texture());
    let mut state = ResourceState {
        resource,
        layout: vk::ImageLayout::GENERAL,
        acquire_access: vk::AccessFlags2::empty(),
        release_access: vk::AccessFlags2::empty(),
        acquire_and_release_stage: stage,
        acquire_stage: vk::PipelineStageFlags2::empty(),
        release_stage: vk::PipelineStageFlags2::empty(),
    };
    match texture_use {
        TextureUse::ShaderWrite => {
            state.release_access = vk::AccessFlags2::SHADER_WRITE;
        }
        TextureUse::ShaderRead => {
            state.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
            state.acquire_access = vk::AccessFlags2::SHADER_READ;
        }
        TextureUse::DepthRead => {
            state.layout = vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL;
            state.acquire_access = vk::AccessFlags2::SHADER_READ;
        }
        TextureUse::ShaderReadWrite => {
            state.acquire_access = vk::AccessFlags2::SHADER_READ;
            state.release_access = vk::AccessFlags2::SHADER_WRITE;
        }
        TextureUse::TransferSrc => {
            assert_eq!(stage, vk::PipelineStageFlags2::ALL_TRANSFER);
            state.layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
            state.acquire_access = vk::AccessFlags2::TRANSFER_READ;
        }
        TextureUse::TransferDst => {
            assert_eq!(stage, vk::PipelineStageFlags2::ALL_TRANSFER);
            state.layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
            state.release_access = vk::AccessFlags2::TRANSFER_WRITE;
        }
    }
    state
}

/// State transitioning a swapchain texture for presentation.
pub fn texture_present_state(resource: &mut Resource) -> ResourceState {
    assert!(resource.is_texture());
    ResourceState {
        resource,
        layout: vk::ImageLayout::PRESENT_SRC_KHR,
        acquire_access: vk::AccessFlags2::empty(),
        release_access: vk::AccessFlags2::empty(),
        acquire_and_release_stage: vk::PipelineStageFlags2::empty(),
        acquire_stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
        release_stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUse {
    ShaderWrite,
    ShaderRead,
    ShaderReadWrite,
    TransferSrc,
    TransferDst,
}

pub fn buffer_state<'a>(
    resource: &'a mut Resource,
    buffer_use: BufferUse,
    stage: vk::PipelineStageFlags2,
) -> ResourceState<'a> {
    assert!(!resource.is_texture());
    let mut state = ResourceState {
        resource,
        layout: vk::ImageLayout::UNDEFINED,
        acquire_access: vk::AccessFlags2::empty(),
        release_access: vk::AccessFlags2::empty(),
        acquire_and_release_stage: stage,
        acquire_stage: vk::PipelineStageFlags2::empty(),
        release_stage: vk::PipelineStageFlags2::empty(),
    };
    match buffer_use {
        BufferUse::ShaderWrite => {
            state.release_access = vk::AccessFlags2::SHADER_WRITE;
        }
        BufferUse::ShaderRead => {
            state.acquire_access = vk::AccessFlags2::SHADER_READ;
        }
        BufferUse::ShaderReadWrite => {
            state.acquire_access = vk::AccessFlags2::SHADER_READ;
            state.release_access = vk::AccessFlags2::SHADER_WRITE;
        }
        BufferUse::TransferSrc => {
            assert_eq!(stage, vk::PipelineStageFlags2::ALL_TRANSFER);
            state.acquire_access = vk::AccessFlags2::TRANSFER_READ;
        }
        BufferUse::TransferDst => {
            assert_eq!(stage, vk::PipelineStageFlags2::ALL_TRANSFER);
            state.release_access = vk::AccessFlags2::TRANSFER_WRITE;
        }
    }
    state
}

pub(crate) enum ResourceBarrier {
    Image(vk::ImageMemoryBarrier2<'static>),
    Buffer(vk::BufferMemoryBarrier2<'static>),
}

/// Exactly one of the two stage forms must be provided.
fn resolve_stage_masks(
    state: &ResourceState,
) -> (vk::PipelineStageFlags2, vk::PipelineStageFlags2) {
    let combined_valid = !state.acquire_and_release_stage.is_empty();
    let split_valid = !state.acquire_stage.is_empty() || !state.release_stage.is_empty();
    assert!(
        combined_valid ^ split_valid,
        "provide either the combined stage mask or the split acquire/release masks"
    );

    if split_valid {
        assert!(
            !state.acquire_stage.is_empty() && !state.release_stage.is_empty(),
            "both split stage masks must be provided"
        );
        (state.acquire_stage, state.release_stage)
    } else {
        (
            state.acquire_and_release_stage,
            state.acquire_and_release_stage,
        )
    }
}

/// Emits the single barrier for a declared state and advances the
/// resource: `src` is the previous release, `dst` the new acquire, and
/// the new release becomes the resource's `last_release_*`.
pub(crate) fn record_transition(state: &mut ResourceState) -> ResourceBarrier {
    let (acquire_stage, release_stage) = resolve_stage_masks(state);
    let src_stage = state.resource.last_release_stage;
    let src_access = state.resource.last_release_access;

    let barrier = match &state.resource.kind {
        ResourceKind::Texture { texture, layout } => ResourceBarrier::Image(
            whole_texture_barrier(
                texture,
                *layout,
                state.layout,
                src_stage,
                acquire_stage,
                src_access,
                state.acquire_access,
            ),
        ),
        ResourceKind::Buffer { buffer } => ResourceBarrier::Buffer(
            vk::BufferMemoryBarrier2::default()
                .buffer(buffer.raw)
                .offset(0)
                .size(vk::WHOLE_SIZE)
                .src_stage_mask(src_stage)
                .dst_stage_mask(acquire_stage)
                .src_access_mask(src_access)
                .dst_access_mask(state.acquire_access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED),
        ),
    };

    state.resource.last_release_stage = release_stage;
    state.resource.last_release_access = state.release_access;
    if let ResourceKind::Texture { layout, .. } = &mut state.resource.kind {
        *layout = state.layout;
    }

    barrier
}

/// Attachment transition with the colour/depth default masks filled in
/// where the caller left them empty.
pub(crate) fn record_render_target_transition(
    state: &mut RenderTargetState,
    depth: bool,
) -> vk::ImageMemoryBarrier2<'static> {
    let (new_layout, default_acquire_stage, default_acquire_access, default_release_stage, default_release_access) =
        if depth {
            (
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
                vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
        } else {
            (
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_READ,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            )
        };

    let acquire_stage = if state.acquire_stage.is_empty() {
        default_acquire_stage
    } else {
        state.acquire_stage
    };
    let acquire_access = if state.acquire_access.is_empty() {
        default_acquire_access
    } else {
        state.acquire_access
    };
    let release_stage = if state.release_stage.is_empty() {
        default_release_stage
    } else {
        state.release_stage
    };
    let release_access = if state.release_access.is_empty() {
        default_release_access
    } else {
        state.release_access
    };

    let src_stage = state.resource.last_release_stage;
    let src_access = state.resource.last_release_access;
    let barrier = match &state.resource.kind {
        ResourceKind::Texture { texture, layout } => whole_texture_barrier(
            texture,
            *layout,
            new_layout,
            src_stage,
            acquire_stage,
            src_access,
            acquire_access,
        ),
        ResourceKind::Buffer { .. } => panic!("render target must be a texture"),
    };

    state.resource.last_release_stage = release_stage;
    state.resource.last_release_access = release_access;
    if let ResourceKind::Texture { layout, .. } = &mut state.resource.kind {
        *layout = new_layout;
    }

    barrier
}

/// Translates every declared state into its barrier; returns the image
/// and buffer barrier counts.
pub(crate) fn build_barriers(
    states: &mut [ResourceState],
    image_out: &mut [vk::ImageMemoryBarrier2<'static>],
    buffer_out: &mut [vk::BufferMemoryBarrier2<'static>],
) -> (usize, usize) {
    let mut image_count = 0;
    let mut buffer_count = 0;
    for state in states.iter_mut() {
        match record_transition(state) {
            ResourceBarrier::Image(barrier) => {
                image_out[image_count] = barrier;
                image_count += 1;
            }
            ResourceBarrier::Buffer(barrier) => {
                buffer_out[buffer_count] = barrier;
                buffer_count += 1;
            }
        }
    }
    (image_count, buffer_count)
}

impl RenderGraph {
    fn push_profiling_scope(
        &mut self,
        ctx: &Context,
        cmd: vk::CommandBuffer,
        name: &str,
        fallback: &str,
    ) {
        let timer = self.timers.begin(ctx.device(), cmd);
        let name = if name.is_empty() { fallback } else { name };
        self.active_scopes.push(ProfilingScope {
            timer,
            name: name.to_string(),
        });
        assert_eq!(
            self.active_scopes.len(),
            1,
            "nested profiling scopes are unsupported"
        );
    }

    fn pop_profiling_scope(&mut self, ctx: &Context, cmd: vk::CommandBuffer) {
        let scope = self
            .active_scopes
            .pop()
            .expect("no active profiling scope");
        self.timers.end(ctx.device(), cmd, scope.timer);
        self.completed_scopes.push(scope);
    }

    /// Issues the declared state transitions without opening a rendering
    /// scope.
    pub fn barriers(&self, ctx: &Context, cmd: vk::CommandBuffer, states: &mut [ResourceState]) {
        let image_barriers = self
            .arena
            .alloc_slice::<vk::ImageMemoryBarrier2>(states.len());
        let buffer_barriers = self
            .arena
            .alloc_slice::<vk::BufferMemoryBarrier2>(states.len());
        let (image_count, buffer_count) = build_barriers(states, image_barriers, buffer_barriers);

        let dependency = vk::DependencyInfo::default()
            .image_memory_barriers(&image_barriers[..image_count])
            .buffer_memory_barriers(&buffer_barriers[..buffer_count]);
        unsafe { ctx.device().cmd_pipeline_barrier2(cmd, &dependency) };
    }

    /// Opens a profiling scope, transitions every attachment and
    /// declared resource, and begins a dynamic-rendering scope with the
    /// viewport and scissor taken from the first attachment.
    pub fn begin_graphics_pass(
        &mut self,
        ctx: &Context,
        cmd: vk::CommandBuffer,
        desc: GraphicsPassDesc,
    ) {
        assert!(desc.render_targets.len() <= MAX_RENDER_TARGETS);
        self.push_profiling_scope(ctx, cmd, desc.name, "unnamed graphics pass");
        ctx.cmd_begin_label(
            cmd,
            if desc.name.is_empty() {
                "unnamed graphics pass"
            } else {
                desc.name
            },
        );

        let GraphicsPassDesc {
            render_targets,
            mut depth_target,
            other_resources,
            min_depth,
            max_depth,
            ..
        } = desc;

        // One barrier per declared resource, emitted in a single batch.
        {
            let total =
                render_targets.len() + other_resources.len() + usize::from(depth_target.is_some());
            let image_barriers = self.arena.alloc_slice::<vk::ImageMemoryBarrier2>(total);
            let buffer_barriers = self.arena.alloc_slice::<vk::BufferMemoryBarrier2>(total);
            let (mut image_count, buffer_count) =
                build_barriers(other_resources, image_barriers, buffer_barriers);

            for state in render_targets.iter_mut() {
                image_barriers[image_count] = record_render_target_transition(state, false);
                image_count += 1;
            }
            if let Some(state) = depth_target.as_mut() {
                image_barriers[image_count] = record_render_target_transition(state, true);
                image_count += 1;
            }

            let dependency = vk::DependencyInfo::default()
                .image_memory_barriers(&image_barriers[..image_count])
                .buffer_memory_barriers(&buffer_barriers[..buffer_count]);
            unsafe { ctx.device().cmd_pipeline_barrier2(cmd, &dependency) };
        }

        let extent_of = |state: &RenderTargetState| {
            let texture = state.resource.texture_handle().unwrap();
            vk::Extent2D {
                width: texture.extent.width,
                height: texture.extent.height,
            }
        };
        let extent = render_targets
            .first()
            .map(&extent_of)
            .or_else(|| depth_target.as_ref().map(&extent_of))
            .expect("graphics pass without any attachment");

        let color_attachments = self
            .arena
            .alloc_slice::<vk::RenderingAttachmentInfo>(render_targets.len());
        for (attachment, state) in color_attachments.iter_mut().zip(render_targets.iter()) {
            let texture = state.resource.texture_handle().unwrap();
            *attachment = vk::RenderingAttachmentInfo::default()
                .image_view(texture.view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(state.load_op)
                .store_op(state.store_op)
                .clear_value(state.clear_value);
        }

        let depth_attachment = depth_target.as_ref().map(|state| {
            let texture = state.resource.texture_handle().unwrap();
            vk::RenderingAttachmentInfo::default()
                .image_view(texture.view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(state.load_op)
                .store_op(state.store_op)
                .clear_value(state.clear_value)
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .layer_count(1)
            .color_attachments(color_attachments);
        if let Some(depth_attachment) = &depth_attachment {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }
        unsafe { ctx.device().cmd_begin_rendering(cmd, &rendering_info) };

        let (min_depth, max_depth) = if min_depth == 0.0 && max_depth == 0.0 {
            (0.0, 1.0)
        } else {
            (min_depth, max_depth)
        };
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth,
            max_depth,
        };
        unsafe {
            ctx.device().cmd_set_viewport(cmd, 0, &[viewport]);
            ctx.device().cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent,
                }],
            );
        }
    }

    pub fn end_graphics_pass(&mut self, ctx: &Context, cmd: vk::CommandBuffer) {
        unsafe { ctx.device().cmd_end_rendering(cmd) };
        self.pop_profiling_scope(ctx, cmd);
        ctx.cmd_end_label(cmd);
    }

    pub fn begin_compute_pass(
        &mut self,
        ctx: &Context,
        cmd: vk::CommandBuffer,
        desc: ComputePassDesc,
    ) {
        self.push_profiling_scope(ctx, cmd, desc.name, "unnamed compute pass");
        ctx.cmd_begin_label(
            cmd,
            if desc.name.is_empty() {
                "unnamed compute pass"
            } else {
                desc.name
            },
        );
        self.barriers(ctx, cmd, desc.resource_states);
    }

    pub fn end_compute_pass(&mut self, ctx: &Context, cmd: vk::CommandBuffer) {
        self.pop_profiling_scope(ctx, cmd);
        ctx.cmd_end_label(cmd);
    }

    // Transfer and compute passes are structurally identical.

    pub fn begin_transfer_pass(
        &mut self,
        ctx: &Context,
        cmd: vk::CommandBuffer,
        desc: TransferPassDesc,
    ) {
        self.begin_compute_pass(
            ctx,
            cmd,
            ComputePassDesc {
                resource_states: desc.resource_states,
                name: desc.name,
            },
        );
    }

    pub fn end_transfer_pass(&mut self, ctx: &Context, cmd: vk::CommandBuffer) {
        self.end_compute_pass(ctx, cmd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GpuAllocation;

    fn texture_resource() -> Resource {
        Resource::texture(
            Texture {
                image: vk::Image::null(),
                view: vk::ImageView::null(),
                aspect: vk::ImageAspectFlags::COLOR,
                extent: vk::Extent3D {
                    width: 128,
                    height: 128,
                    depth: 1,
                },
                format: vk::Format::R8G8B8A8_UNORM,
                mip_count: 1,
                layer_count: 1,
                allocation: GpuAllocation::null(),
            },
            vk::ImageLayout::UNDEFINED,
        )
    }

    fn buffer_resource() -> Resource {
        Resource::buffer(Buffer {
            raw: vk::Buffer::null(),
            size: 1024,
            device_address: 0,
            allocation: GpuAllocation::null(),
        })
    }

    fn image_barrier(state: &mut ResourceState) -> vk::ImageMemoryBarrier2<'static> {
        match record_transition(state) {
            ResourceBarrier::Image(barrier) => barrier,
            ResourceBarrier::Buffer(_) => panic!("expected an image barrier"),
        }
    }

    #[test]
    fn fresh_resources_release_from_top_of_pipe() {
        let resource = texture_resource();
        assert_eq!(
            resource.last_release_stage(),
            vk::PipelineStageFlags2::TOP_OF_PIPE
        );
        assert_eq!(resource.last_release_access(), vk::AccessFlags2::empty());
        assert_eq!(resource.layout(), Some(vk::ImageLayout::UNDEFINED));
    }

    #[test]
    fn barrier_chain_links_release_to_acquire() {
        let mut resource = texture_resource();

        let mut upload = texture_state(
            &mut resource,
            TextureUse::TransferDst,
            vk::PipelineStageFlags2::ALL_TRANSFER,
        );
        let first = image_barrier(&mut upload);
        assert_eq!(first.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(first.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(first.src_stage_mask, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert_eq!(first.src_access_mask, vk::AccessFlags2::empty());
        assert_eq!(first.dst_stage_mask, vk::PipelineStageFlags2::ALL_TRANSFER);

        let mut sample = texture_state(
            &mut resource,
            TextureUse::ShaderRead,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
        );
        let second = image_barrier(&mut sample);
        // Chain law: the new source is exactly the previous release.
        assert_eq!(second.src_stage_mask, vk::PipelineStageFlags2::ALL_TRANSFER);
        assert_eq!(second.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(second.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(second.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(
            second.dst_stage_mask,
            vk::PipelineStageFlags2::FRAGMENT_SHADER
        );
        assert_eq!(second.dst_access_mask, vk::AccessFlags2::SHADER_READ);

        assert_eq!(
            resource.layout(),
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        );
        assert_eq!(
            resource.last_release_stage(),
            vk::PipelineStageFlags2::FRAGMENT_SHADER
        );
    }

    #[test]
    fn split_stage_form_is_used_as_is() {
        let mut resource = buffer_resource();
        let mut state = ResourceState {
            resource: &mut resource,
            layout: vk::ImageLayout::UNDEFINED,
            acquire_access: vk::AccessFlags2::SHADER_READ,
            release_access: vk::AccessFlags2::SHADER_WRITE,
            acquire_and_release_stage: vk::PipelineStageFlags2::empty(),
            acquire_stage: vk::PipelineStageFlags2::VERTEX_SHADER,
            release_stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
        };
        let barrier = match record_transition(&mut state) {
            ResourceBarrier::Buffer(barrier) => barrier,
            ResourceBarrier::Image(_) => panic!("expected a buffer barrier"),
        };
        assert_eq!(barrier.dst_stage_mask, vk::PipelineStageFlags2::VERTEX_SHADER);
        assert_eq!(barrier.size, vk::WHOLE_SIZE);
        drop(state);
        assert_eq!(
            resource.last_release_stage(),
            vk::PipelineStageFlags2::FRAGMENT_SHADER
        );
        assert_eq!(
            resource.last_release_access(),
            vk::AccessFlags2::SHADER_WRITE
        );
    }

    #[test]
    #[should_panic(expected = "combined stage mask")]
    fn both_stage_forms_are_rejected() {
        let mut resource = texture_resource();
        let mut state = texture_state(
            &mut resource,
            TextureUse::ShaderRead,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
        );
        state.acquire_stage = vk::PipelineStageFlags2::FRAGMENT_SHADER;
        state.release_stage = vk::PipelineStageFlags2::FRAGMENT_SHADER;
        record_transition(&mut state);
    }

    #[test]
    #[should_panic(expected = "combined stage mask")]
    fn missing_stage_forms_are_rejected() {
        let mut resource = texture_resource();
        let mut state = texture_state(
            &mut resource,
            TextureUse::ShaderRead,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
        );
        state.acquire_and_release_stage = vk::PipelineStageFlags2::empty();
        record_transition(&mut state);
    }

    #[test]
    #[should_panic(expected = "both split stage masks")]
    fn half_split_form_is_rejected() {
        let mut resource = texture_resource();
        let mut state = texture_state(
            &mut resource,
            TextureUse::ShaderRead,
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
        );
        state.acquire_and_release_stage = vk::PipelineStageFlags2::empty();
        state.acquire_stage = vk::PipelineStageFlags2::FRAGMENT_SHADER;
        record_transition(&mut state);
    }

    #[test]
    fn render_target_defaults_and_present_chain() {
        // A present-only frame: clear the swapchain image as a colour
        // attachment, then hand it to presentation. Exactly two image
        // barriers with linked stages.
        let mut resource = texture_resource();

        let mut target = RenderTargetState::cleared(
            &mut resource,
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            },
        );
        let first = record_render_target_transition(&mut target, false);
        assert_eq!(first.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(first.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(first.src_stage_mask, vk::PipelineStageFlags2::TOP_OF_PIPE);
        assert_eq!(
            first.dst_stage_mask,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(
            first.dst_access_mask,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ
        );
        drop(target);

        let mut present = texture_present_state(&mut resource);
        let second = image_barrier(&mut present);
        assert_eq!(second.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(second.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(
            second.src_stage_mask,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(
            second.src_access_mask,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
        );
        assert_eq!(second.dst_stage_mask, vk::PipelineStageFlags2::BOTTOM_OF_PIPE);
        assert_eq!(second.dst_access_mask, vk::AccessFlags2::empty());
    }

    #[test]
    fn depth_target_defaults() {
        let mut resource = texture_resource();
        let mut target = RenderTargetState::new(&mut resource);
        let barrier = record_render_target_transition(&mut target, true);
        assert_eq!(
            barrier.new_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            barrier.dst_stage_mask,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
        );
        assert_eq!(
            barrier.dst_access_mask,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
        );
        drop(target);
        assert_eq!(
            resource.last_release_stage(),
            vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS
        );
        assert_eq!(
            resource.last_release_access(),
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
        );
    }

    #[test]
    fn explicit_render_target_masks_override_defaults() {
        let mut resource = texture_resource();
        let mut target = RenderTargetState::new(&mut resource);
        target.acquire_stage = vk::PipelineStageFlags2::FRAGMENT_SHADER;
        target.acquire_access = vk::AccessFlags2::SHADER_READ;
        let barrier = record_render_target_transition(&mut target, false);
        assert_eq!(barrier.dst_stage_mask, vk::PipelineStageFlags2::FRAGMENT_SHADER);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags2::SHADER_READ);
        drop(target);
        // Unset release masks still fall back to the defaults.
        assert_eq!(
            resource.last_release_stage(),
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
    }

    #[test]
    fn build_barriers_splits_images_and_buffers() {
        let mut texture = texture_resource();
        let mut buffer = buffer_resource();
        let mut states = [
            texture_state(
                &mut texture,
                TextureUse::ShaderRead,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
            ),
            buffer_state(
                &mut buffer,
                BufferUse::ShaderRead,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
            ),
        ];
        let mut image_out = [vk::ImageMemoryBarrier2::default(); 2];
        let mut buffer_out = [vk::BufferMemoryBarrier2::default(); 2];
        let (image_count, buffer_count) =
            build_barriers(&mut states, &mut image_out, &mut buffer_out);
        assert_eq!(image_count, 1);
        assert_eq!(buffer_count, 1);
        assert_eq!(
            image_out[0].new_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            buffer_out[0].dst_stage_mask,
            vk::PipelineStageFlags2::COMPUTE_SHADER
        );
    }
}
