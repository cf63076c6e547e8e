//! GPU memory allocator: a small set of large driver allocations (*roots*)
//! per memory type, with the TLSF allocator multiplexing logical
//! sub-allocations onto them. Host-visible roots stay persistently mapped.

use std::fmt;
use std::ptr;

use ash::vk;

use crate::alloc::{Tlsf, TlsfAllocation, TlsfBlockId};

/// Driver allocations a single pool may own before allocation fails.
pub const MAX_GPU_ROOTS: usize = 16;

/// Distinct memory-type pools the allocator may populate.
pub const MAX_MEMORY_POOLS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// No free list can satisfy the request.
    OutOfSpace,
    /// The owning pool is saturated, or the driver refused a new root.
    OutOfDeviceMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::OutOfSpace => write!(f, "no free block can satisfy the request"),
            Self::OutOfDeviceMemory => write!(f, "out of device memory"),
        }
    }
}

impl std::error::Error for AllocError {}

#[derive(Clone, Copy, Debug)]
pub struct GpuAllocationRequest {
    pub size: vk::DeviceSize,
    pub alignment: vk::DeviceSize,
    pub type_bits: u32,
    pub required_flags: vk::MemoryPropertyFlags,
    pub preferred_flags: vk::MemoryPropertyFlags,
}

/// A live sub-allocation: the backing driver allocation, the byte offset
/// inside it, and a mapped pointer when the memory type is host-visible.
#[derive(Clone, Copy, Debug)]
pub struct GpuAllocation {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub mapped: *mut u8,
    id: AllocId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct AllocId {
    pool: u32,
    block: TlsfBlockId,
}

impl GpuAllocation {
    pub const fn null() -> Self {
        Self {
            memory: vk::DeviceMemory::null(),
            offset: 0,
            mapped: ptr::null_mut(),
            id: AllocId {
                pool: 0,
                block: TlsfBlockId::INVALID,
            },
        }
    }

    pub fn is_null(&self) -> bool {
        self.memory == vk::DeviceMemory::null()
    }
}

// The mapped pointer aliases driver-owned memory; the handle itself is
// just plain data.
unsafe impl Send for GpuAllocation {}
unsafe impl Sync for GpuAllocation {}

#[derive(Clone, Copy, Debug)]
pub(crate) struct MemoryType {
    pub index: u32,
    pub flags: vk::MemoryPropertyFlags,
}

/// First memory type matching the request: in the type mask, carrying
/// required *and* preferred bits, in a heap of at least `max_alloc_size`.
/// Falls back to a second scan that drops the preferred bits.
pub(crate) fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
    preferred: vk::MemoryPropertyFlags,
    max_alloc_size: vk::DeviceSize,
) -> Option<MemoryType> {
    let types = &props.memory_types[..props.memory_type_count as usize];
    let heaps = &props.memory_heaps[..props.memory_heap_count as usize];

    for wanted in [required | preferred, required] {
        for (index, ty) in types.iter().enumerate() {
            if type_bits & (1 << index) != 0
                && ty.property_flags.contains(wanted)
                && heaps[ty.heap_index as usize].size >= max_alloc_size
            {
                return Some(MemoryType {
                    index: index as u32,
                    flags: ty.property_flags,
                });
            }
        }
    }
    None
}

pub(crate) struct MemoryRoot {
    pub memory: vk::DeviceMemory,
    pub mapped: *mut u8,
}

fn root_tag(pool_index: u32, root_index: u32) -> u64 {
    u64::from(pool_index) | (u64::from(root_index) << 32)
}

fn tag_root_index(tag: u64) -> u32 {
    (tag >> 32) as u32
}

struct MemoryPool {
    tlsf: Tlsf,
    memory_type_index: u32,
    roots: Vec<MemoryRoot>,
}

impl MemoryPool {
    fn new(memory_type_index: u32) -> Self {
        Self {
            tlsf: Tlsf::new(),
            memory_type_index,
            roots: Vec::new(),
        }
    }

    /// TLSF-allocates inside the pool, growing by one root at a time via
    /// `grow` until the pool is saturated at `max_roots`.
    fn alloc_with<F>(
        &mut self,
        pool_index: u32,
        size: u32,
        align: u32,
        root_size: u32,
        max_roots: usize,
        mut grow: F,
    ) -> Result<TlsfAllocation, AllocError>
    where
        F: FnMut() -> Result<MemoryRoot, AllocError>,
    {
        loop {
            if let Some(allocation) = self.tlsf.alloc(size, align) {
                return Ok(allocation);
            }
            if self.roots.len() >= max_roots {
                return Err(AllocError::OutOfDeviceMemory);
            }
            let root = grow()?;
            let root_index = self.roots.len() as u32;
            self.roots.push(root);
            self.tlsf.add_root(root_tag(pool_index, root_index), root_size);
        }
    }
}

pub struct GpuAllocator {
    device: ash::Device,
    memory_props: vk::PhysicalDeviceMemoryProperties,
    root_size: u32,
    pools: Vec<MemoryPool>,
}

impl GpuAllocator {
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        root_size: u32,
    ) -> Self {
        let memory_props =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        Self {
            device,
            memory_props,
            root_size,
            pools: Vec::new(),
        }
    }

    pub fn root_size(&self) -> u32 {
        self.root_size
    }

    pub fn alloc(&mut self, request: GpuAllocationRequest) -> Result<GpuAllocation, AllocError> {
        let align = request.alignment.max(1);
        assert!(
            request.size + align - 1 <= vk::DeviceSize::from(self.root_size),
            "allocation of {} bytes exceeds the root allocation size",
            request.size
        );

        let memory_type = find_memory_type(
            &self.memory_props,
            request.type_bits,
            request.required_flags,
            request.preferred_flags,
            vk::DeviceSize::from(self.root_size),
        )
        .expect("no compatible memory type");

        let pool_index = self.pool_index(memory_type.index);
        let device = &self.device;
        let root_size = self.root_size;
        let host_visible = memory_type
            .flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);

        let pool = &mut self.pools[pool_index as usize];
        let tlsf_alloc = pool.alloc_with(
            pool_index,
            request.size as u32,
            align as u32,
            root_size,
            MAX_GPU_ROOTS,
            || allocate_root(device, memory_type.index, host_visible, root_size),
        )?;

        let root = &pool.roots[tag_root_index(tlsf_alloc.tag) as usize];
        let mapped = if root.mapped.is_null() {
            ptr::null_mut()
        } else {
            unsafe { root.mapped.add(tlsf_alloc.offset as usize) }
        };

        Ok(GpuAllocation {
            memory: root.memory,
            offset: vk::DeviceSize::from(tlsf_alloc.offset),
            mapped,
            id: AllocId {
                pool: pool_index,
                block: tlsf_alloc.block,
            },
        })
    }

    pub fn free(&mut self, allocation: GpuAllocation) {
        if allocation.is_null() {
            return;
        }
        let pool = &mut self.pools[allocation.id.pool as usize];
        pool.tlsf.free(allocation.id.block);
    }

    fn pool_index(&mut self, memory_type_index: u32) -> u32 {
        if let Some(index) = self
            .pools
            .iter()
            .position(|pool| pool.memory_type_index == memory_type_index)
        {
            return index as u32;
        }
        assert!(
            self.pools.len() < MAX_MEMORY_POOLS,
            "too many distinct memory types in use"
        );
        self.pools.push(MemoryPool::new(memory_type_index));
        (self.pools.len() - 1) as u32
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        for pool in &mut self.pools {
            pool.tlsf.clear();
            for root in pool.roots.drain(..) {
                unsafe { self.device.free_memory(root.memory, None) };
            }
        }
    }
}

fn allocate_root(
    device: &ash::Device,
    memory_type_index: u32,
    host_visible: bool,
    size: u32,
) -> Result<MemoryRoot, AllocError> {
    let mut flags_info =
        vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(vk::DeviceSize::from(size))
        .memory_type_index(memory_type_index)
        .push_next(&mut flags_info);

    let memory = unsafe { device.allocate_memory(&alloc_info, None) }.map_err(|err| {
        log::error!("vkAllocateMemory of a {size}-byte root failed: {err}");
        AllocError::OutOfDeviceMemory
    })?;

    let mapped = if host_visible {
        unsafe { device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
            .expect("failed to map a host-visible memory root") as *mut u8
    } else {
        ptr::null_mut()
    };

    log::debug!("new {size}-byte memory root for type index {memory_type_index}");
    Ok(MemoryRoot { memory, mapped })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties() -> vk::PhysicalDeviceMemoryProperties {
        // Heap 0: 1 GiB device-local. Heap 1: 256 MiB host-visible.
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_heap_count = 2;
        props.memory_heaps[0] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        props.memory_heaps[1] = vk::MemoryHeap {
            size: 256 << 20,
            flags: vk::MemoryHeapFlags::empty(),
        };
        props.memory_type_count = 3;
        props.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        props.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };
        props.memory_types[2] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };
        props
    }

    #[test]
    fn selection_honors_required_and_preferred_bits() {
        let props = memory_properties();
        let found = find_memory_type(
            &props,
            !0,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            1 << 20,
        )
        .unwrap();
        assert_eq!(found.index, 2);
    }

    #[test]
    fn selection_rescans_with_required_bits_only() {
        let props = memory_properties();
        // Nothing carries LAZILY_ALLOCATED, so the preferred scan fails and
        // the required-only rescan picks the first device-local type.
        let found = find_memory_type(
            &props,
            !0,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::LAZILY_ALLOCATED,
            1 << 20,
        )
        .unwrap();
        assert_eq!(found.index, 0);
    }

    #[test]
    fn selection_respects_type_mask_and_heap_size() {
        let props = memory_properties();
        // Type 0 masked out; type 2 is the remaining device-local one.
        let found = find_memory_type(
            &props,
            !1,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
            1 << 20,
        )
        .unwrap();
        assert_eq!(found.index, 2);
        // A request larger than every heap finds nothing.
        assert!(find_memory_type(
            &props,
            !0,
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::empty(),
            1 << 40,
        )
        .is_none());
    }

    #[test]
    fn tag_packing_round_trips() {
        let tag = root_tag(3, 11);
        assert_eq!(tag & 0xFFFF_FFFF, 3);
        assert_eq!(tag_root_index(tag), 11);
    }

    fn stub_root() -> Result<MemoryRoot, AllocError> {
        Ok(MemoryRoot {
            memory: vk::DeviceMemory::null(),
            mapped: ptr::null_mut(),
        })
    }

    #[test]
    fn pool_refills_across_roots_until_saturated() {
        let root_size = 64 << 20;
        let mut pool = MemoryPool::new(0);

        let mut first_root = Vec::new();
        for i in 0..128 {
            let allocation = pool
                .alloc_with(0, 1 << 20, 1, root_size, 2, stub_root)
                .unwrap();
            if i < 64 {
                assert_eq!(tag_root_index(allocation.tag), 0);
                first_root.push(allocation);
            } else {
                assert_eq!(tag_root_index(allocation.tag), 1);
            }
        }
        assert_eq!(pool.roots.len(), 2);

        let err = pool
            .alloc_with(0, 1 << 20, 1, root_size, 2, stub_root)
            .unwrap_err();
        assert_eq!(err, AllocError::OutOfDeviceMemory);

        for allocation in first_root {
            pool.tlsf.free(allocation.block);
        }
        let retry = pool
            .alloc_with(0, 1 << 20, 1, root_size, 2, stub_root)
            .unwrap();
        assert_eq!(tag_root_index(retry.tag), 0);
    }

    #[test]
    fn grow_failure_propagates() {
        let mut pool = MemoryPool::new(0);
        let err = pool
            .alloc_with(0, 1024, 1, 1 << 20, 2, || Err(AllocError::OutOfDeviceMemory))
            .unwrap_err();
        assert_eq!(err, AllocError::OutOfDeviceMemory);
    }
}
