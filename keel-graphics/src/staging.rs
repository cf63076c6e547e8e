//! Transfer staging: a host-visible ring of scratch pages that double as
//! transfer-source buffers, a timeline counter serialising transfers with
//! their consumers, and a pool of transient transfer command buffers.
//!
//! Each request hands back a slice of the current page plus the *next*
//! counter value; whoever records the copy must signal that value on the
//! shared timeline so later code can wait on it.

use ash::vk;

use crate::alloc::{PagePool, StackAllocator};
use crate::memory::{GpuAllocationRequest, GpuAllocator};

/// Byte size of each staging page.
pub const STAGING_PAGE_SIZE: u32 = 1 << 20;

/// Transfer command buffers available between flushes; crossing the cap
/// is a programming error.
pub const MAX_STAGING_COMMAND_BUFFERS: usize = 256;

/// Root size of the staging engine's dedicated host-visible allocator.
const STAGING_ROOT_SIZE: u32 = 64 << 20;

/// A slice of staging memory plus the timeline value the copy out of it
/// must signal.
pub struct StagingSlice {
    pub buffer: vk::Buffer,
    pub ptr: *mut u8,
    pub offset: u32,
    pub signal_value: u64,
}

struct StagingPage {
    buffer: vk::Buffer,
    allocation: crate::memory::GpuAllocation,
}

/// Page source backing the staging stack: every page is a mapped,
/// transfer-source buffer carved from the dedicated allocator.
struct StagingPagePool {
    device: ash::Device,
    memory: GpuAllocator,
}

impl PagePool for StagingPagePool {
    type Page = StagingPage;

    fn alloc_page(&mut self, size: u32) -> StagingPage {
        let info = vk::BufferCreateInfo::default()
            .size(vk::DeviceSize::from(size))
            .usage(vk::BufferUsageFlags::TRANSFER_SRC);
        let buffer = unsafe { self.device.create_buffer(&info, None) }
            .expect("failed to create a staging buffer");

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = self
            .memory
            .alloc(GpuAllocationRequest {
                size: requirements.size,
                alignment: requirements.alignment,
                type_bits: requirements.memory_type_bits,
                required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                preferred_flags: vk::MemoryPropertyFlags::empty(),
            })
            .expect("out of staging memory");
        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory, allocation.offset)
        }
        .expect("vkBindBufferMemory failed");

        StagingPage { buffer, allocation }
    }

    fn free_page(&mut self, page: StagingPage) {
        unsafe { self.device.destroy_buffer(page.buffer, None) };
        self.memory.free(page.allocation);
    }
}

pub(crate) struct Staging {
    device: ash::Device,
    stack: StackAllocator<StagingPagePool>,
    timeline: vk::Semaphore,
    last_signal: u64,
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    active_command_buffers: usize,
}

impl Staging {
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        transfer_family: u32,
    ) -> Self {
        let memory = GpuAllocator::new(
            instance,
            physical_device,
            device.clone(),
            STAGING_ROOT_SIZE,
        );
        let stack = StackAllocator::new(
            STAGING_PAGE_SIZE,
            StagingPagePool {
                device: device.clone(),
                memory,
            },
        );

        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let timeline = unsafe { device.create_semaphore(&semaphore_info, None) }
            .expect("failed to create the staging timeline");

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(transfer_family);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .expect("failed to create the staging command pool");

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(MAX_STAGING_COMMAND_BUFFERS as u32);
        let command_buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
            .expect("failed to allocate staging command buffers");

        Self {
            device,
            stack,
            timeline,
            last_signal: 0,
            command_pool,
            command_buffers,
            active_command_buffers: 0,
        }
    }

    /// Carves `size` bytes off the current staging page and reserves the
    /// next timeline value for the copy that will read them.
    pub fn request(&mut self, size: u32, align: u32) -> StagingSlice {
        let allocation = self
            .stack
            .alloc(size, align)
            .expect("staging request larger than a staging page");
        let page = self.stack.page(allocation.page);

        self.last_signal += 1;
        StagingSlice {
            buffer: page.buffer,
            ptr: unsafe { page.allocation.mapped.add(allocation.offset as usize) },
            offset: allocation.offset,
            signal_value: self.last_signal,
        }
    }

    /// Next transient transfer command buffer.
    pub fn take_command_buffer(&mut self) -> vk::CommandBuffer {
        assert!(
            self.active_command_buffers < MAX_STAGING_COMMAND_BUFFERS,
            "out of transient staging command buffers"
        );
        let cmd = self.command_buffers[self.active_command_buffers];
        self.active_command_buffers += 1;
        cmd
    }

    pub fn timeline(&self) -> vk::Semaphore {
        self.timeline
    }

    pub fn active_command_buffers(&self) -> usize {
        self.active_command_buffers
    }

    /// Waits until every requested copy has signalled, then rewinds the
    /// ring and the command-buffer pool.
    pub fn flush(&mut self) {
        let semaphores = [self.timeline];
        let values = [self.last_signal];
        let wait = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&wait, u64::MAX) }
            .expect("vkWaitSemaphores failed");

        unsafe {
            self.device
                .reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())
        }
        .expect("vkResetCommandPool failed");
        self.active_command_buffers = 0;
        self.stack.reset();
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_semaphore(self.timeline, None);
        }
    }
}
