//! Lean Vulkan render graph with a TLSF-backed GPU memory allocator.
//!
//! The crate is built from two halves that depend on each other tightly:
//!
//! - An allocator stack: a two-level segregated-fit byte allocator
//!   ([`Tlsf`]) multiplexing many logical allocations onto a handful of
//!   large driver allocations ([`GpuAllocator`]), plus a page-chained bump
//!   allocator ([`StackAllocator`]) for per-frame scratch.
//! - A render graph: double-buffered frame slots owning transient GPU
//!   objects, a declarative pass API that turns per-resource state
//!   transitions into `vkCmdPipelineBarrier2` calls, GPU timestamp scopes,
//!   and submission/presentation against a swapchain.
//!
//! The host side is single-threaded and cooperative; every blocking point
//! is an explicit wait on a fence, a timeline semaphore, or the swapchain
//! acquire call.

pub use ash;
pub use raw_window_handle;

mod alloc;
mod context;
mod graph;
mod memory;
mod resource;
mod staging;
mod surface;
mod timing;

pub use alloc::{
    HeapPage, HeapPagePool, PagePool, StackAllocation, StackAllocator, Tlsf, TlsfAllocation,
    TlsfBlockId,
};
pub use context::{Context, ContextDesc, InitError, QueueKind, TimelineSemaphore, QUEUE_COUNT};
pub use graph::{
    BeginFrameDesc, ComputePassDesc, DescriptorSetDesc, DescriptorSetWrite, GraphicsPassDesc,
    RenderGraph, RenderGraphPool, ResourceDesc, SubmitDesc, TransferPassDesc,
    TransientImageViewDesc, MAX_DESCRIPTOR_WRITES, MAX_RENDER_TARGETS, SCREEN_EXTENT,
};
pub use graph::{
    buffer_state, texture_present_state, texture_state, BufferUse, RenderTargetState, Resource,
    ResourceState, TextureUse,
};
pub use memory::{
    AllocError, GpuAllocation, GpuAllocationRequest, GpuAllocator, MAX_GPU_ROOTS,
    MAX_MEMORY_POOLS,
};
pub use resource::{Buffer, BufferDesc, Texture, TextureBarrierDesc, TextureDesc};
pub use staging::{StagingSlice, MAX_STAGING_COMMAND_BUFFERS, STAGING_PAGE_SIZE};
pub use surface::{Surface, SurfaceDesc, SurfaceStatus};
pub use timing::{ScopeTiming, Timer, TimerManager};

/// Frames in flight; the render graph pool keeps one slot per frame.
pub const FRAME_COUNT: usize = 2;

/// Size of each driver allocation owned by the general GPU allocator.
pub const ROOT_ALLOCATION_SIZE: u32 = 1 << 30;
