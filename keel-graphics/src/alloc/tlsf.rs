//! Two-level segregated-fit (TLSF) byte allocator.
//!
//! O(1) alloc and free over one or more caller-registered *root* ranges.
//! The first level indexes power-of-two size classes, the second level
//! subdivides each class linearly; a bitmap per level makes finding a
//! satisfying free list two bit scans. Adjacent free blocks are always
//! merged, so a fully freed root collapses back to a single block.
//!
//! Reference: Masmano et al., "TLSF: a new dynamic memory allocator for
//! real-time systems".
//!
//! The allocator is not internally synchronised; callers serialise.

use slab::Slab;

const SL_BITS: u32 = 5;
const SL_COUNT: usize = 1 << SL_BITS;
const FL_COUNT: usize = (32 - SL_BITS + 1) as usize;
const MIN_SIZE: u32 = 1 << SL_BITS;

/// Handle to a live allocation's backing block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TlsfBlockId(u32);

impl TlsfBlockId {
    /// Sentinel for handles that never held a block (e.g. adopted
    /// swapchain images).
    pub(crate) const INVALID: Self = Self(u32::MAX);
}

/// A successful allocation: the owning root's tag plus the aligned offset
/// inside that root.
#[derive(Clone, Copy, Debug)]
pub struct TlsfAllocation {
    pub tag: u64,
    pub offset: u32,
    pub block: TlsfBlockId,
}

struct Block {
    tag: u64,
    offset: u32,
    size: u32,
    allocated: bool,

    // Address-order neighbours inside the same root.
    left: Option<usize>,
    right: Option<usize>,

    // Free-list links; only meaningful while the block is free.
    prev_free: Option<usize>,
    next_free: Option<usize>,
}

pub struct Tlsf {
    blocks: Slab<Block>,
    first_level_mask: u32,
    second_level_masks: [u32; FL_COUNT],
    free_lists: [[Option<usize>; SL_COUNT]; FL_COUNT],
}

/// Indices of the free list a block of `size` is stored in.
fn lower_bound_indices(size: u32) -> (usize, usize) {
    debug_assert!(size != 0);
    if size >= MIN_SIZE {
        let high_bit = 31 - size.leading_zeros();
        let fl = (high_bit - SL_BITS + 1) as usize;
        let sl = ((size >> (high_bit - SL_BITS)) as usize) - SL_COUNT;
        (fl, sl)
    } else {
        // "Denormal" first level for sizes below the smallest normal class.
        (0, (size - 1) as usize)
    }
}

/// Indices of the smallest class guaranteed to satisfy a request of `size`.
///
/// Rounds the request up to the next class boundary first: for classes
/// 32, 36, 40, ... a request of 33 has to search from the 36 class, since
/// a block in the 32 class may be exactly 32 bytes. The round-up can cross
/// a first-level boundary, so the mapping is recomputed afterwards.
fn upper_bound_indices(size: u32) -> (usize, usize) {
    debug_assert!(size != 0);
    if size >= MIN_SIZE {
        let high_bit = 31 - size.leading_zeros();
        let padded = u64::from(size) + ((1u64 << (high_bit - SL_BITS)) - 1);
        let high_bit = 63 - padded.leading_zeros();
        let fl = (high_bit - SL_BITS + 1) as usize;
        let sl = ((padded >> (high_bit - SL_BITS)) - SL_COUNT as u64) as usize;
        (fl, sl)
    } else {
        (0, (size - 1) as usize)
    }
}

impl Tlsf {
    pub fn new() -> Self {
        Self {
            blocks: Slab::new(),
            first_level_mask: 0,
            second_level_masks: [0; FL_COUNT],
            free_lists: [[None; SL_COUNT]; FL_COUNT],
        }
    }

    /// Registers a new root range of `size` bytes identified by `tag`.
    pub fn add_root(&mut self, tag: u64, size: u32) {
        assert!(size != 0);
        let index = self.blocks.insert(Block {
            tag,
            offset: 0,
            size,
            allocated: false,
            left: None,
            right: None,
            prev_free: None,
            next_free: None,
        });
        self.insert_free(index);
    }

    /// Allocates `size` bytes aligned to `align` (a power of two; zero
    /// means one). Returns `None` when no free list at or above the
    /// rounded size class holds a block.
    ///
    /// The block is over-allocated by `align - 1` so the returned offset
    /// can be aligned inside it; the physical span of the block is what
    /// `free` returns to the free lists, not the request size.
    pub fn alloc(&mut self, size: u32, align: u32) -> Option<TlsfAllocation> {
        assert!(size != 0);
        let align = if align == 0 { 1 } else { align };
        assert!(align.is_power_of_two());

        let aligned_size = u64::from(size) + u64::from(align) - 1;
        if aligned_size > u64::from(u32::MAX) {
            return None;
        }
        let aligned_size = aligned_size as u32;

        let (mut fl, mut sl) = upper_bound_indices(aligned_size);
        if fl >= FL_COUNT {
            return None;
        }

        // Search the current first level above the candidate sub-class,
        // then fall back to the lowest populated row above it.
        let sl_bits = self.second_level_masks[fl] & (u32::MAX << sl);
        if sl_bits != 0 {
            sl = sl_bits.trailing_zeros() as usize;
        } else {
            let fl_bits = self.first_level_mask & (u32::MAX << (fl + 1));
            if fl_bits == 0 {
                return None;
            }
            fl = fl_bits.trailing_zeros() as usize;
            sl = self.second_level_masks[fl].trailing_zeros() as usize;
        }

        let popped = self.pop_free(fl, sl);
        self.blocks[popped].allocated = true;

        // Carve the suffix off into a new address neighbour.
        if self.blocks[popped].size > aligned_size {
            let split_size = self.blocks[popped].size - aligned_size;
            let tag = self.blocks[popped].tag;
            let split_offset = self.blocks[popped].offset + aligned_size;
            let split = self.blocks.insert(Block {
                tag,
                offset: split_offset,
                size: split_size,
                allocated: false,
                left: None,
                right: None,
                prev_free: None,
                next_free: None,
            });
            self.blocks[popped].size = aligned_size;
            self.link_right_neighbour(popped, split);
            self.insert_free(split);
        }

        let block = &self.blocks[popped];
        let mask = align - 1;
        let offset = (block.offset + mask) & !mask;
        debug_assert!(offset - block.offset <= align - 1);
        debug_assert!(u64::from(offset) + u64::from(size) <= u64::from(block.offset) + u64::from(block.size));

        Some(TlsfAllocation {
            tag: block.tag,
            offset,
            block: TlsfBlockId(popped as u32),
        })
    }

    /// Returns a block to the allocator, merging it with any free address
    /// neighbour before reinsertion.
    pub fn free(&mut self, id: TlsfBlockId) {
        let index = id.0 as usize;
        let block = &mut self.blocks[index];
        assert!(block.allocated, "double free of a TLSF block");
        debug_assert!(block.prev_free.is_none());
        debug_assert!(block.next_free.is_none());
        block.allocated = false;

        let merged = self.merge_with_neighbours(index);
        self.insert_free(merged);
    }

    /// Drops every remaining free block. Anything left at this point must
    /// be an unsplit root; a block with neighbours means a live allocation
    /// leaked.
    pub fn clear(&mut self) {
        while self.first_level_mask != 0 {
            let fl = self.first_level_mask.trailing_zeros() as usize;
            while self.second_level_masks[fl] != 0 {
                let sl = self.second_level_masks[fl].trailing_zeros() as usize;
                let index = self.pop_free(fl, sl);
                let block = self.blocks.remove(index);
                debug_assert!(
                    block.left.is_none() && block.right.is_none(),
                    "TLSF teardown with live allocations"
                );
            }
        }
        debug_assert!(self.blocks.is_empty(), "TLSF teardown with live allocations");
        self.blocks.clear();
    }

    /// The physical span of a live block; the usable range of an
    /// allocation ends at `offset + size` of its block, not at the
    /// requested size.
    pub fn block_span(&self, id: TlsfBlockId) -> (u32, u32) {
        let block = &self.blocks[id.0 as usize];
        (block.offset, block.size)
    }

    fn insert_free(&mut self, index: usize) {
        debug_assert!(self.blocks[index].prev_free.is_none());
        debug_assert!(self.blocks[index].next_free.is_none());
        let (fl, sl) = lower_bound_indices(self.blocks[index].size);
        self.push_free(fl, sl, index);
    }

    fn push_free(&mut self, fl: usize, sl: usize, index: usize) {
        if let Some(head) = self.free_lists[fl][sl] {
            self.blocks[index].next_free = Some(head);
            self.blocks[head].prev_free = Some(index);
        }
        self.free_lists[fl][sl] = Some(index);
        self.first_level_mask |= 1 << fl;
        self.second_level_masks[fl] |= 1 << sl;
    }

    fn pop_free(&mut self, fl: usize, sl: usize) -> usize {
        let head = self.free_lists[fl][sl].expect("pop from an empty TLSF free list");
        debug_assert!(self.blocks[head].prev_free.is_none());
        let next = self.blocks[head].next_free;
        if let Some(next) = next {
            self.blocks[next].prev_free = None;
        }
        self.free_lists[fl][sl] = next;
        if next.is_none() {
            self.second_level_masks[fl] &= !(1 << sl);
            if self.second_level_masks[fl] == 0 {
                self.first_level_mask &= !(1 << fl);
            }
        }
        self.blocks[head].next_free = None;
        self.blocks[head].prev_free = None;
        head
    }

    fn remove_free(&mut self, index: usize) {
        let (fl, sl) = lower_bound_indices(self.blocks[index].size);
        if self.free_lists[fl][sl] == Some(index) {
            self.pop_free(fl, sl);
        } else {
            let prev = self.blocks[index].prev_free.expect("detached free block");
            let next = self.blocks[index].next_free;
            self.blocks[prev].next_free = next;
            if let Some(next) = next {
                self.blocks[next].prev_free = Some(prev);
            }
            self.blocks[index].prev_free = None;
            self.blocks[index].next_free = None;
        }
    }

    fn link_right_neighbour(&mut self, left: usize, right: usize) {
        debug_assert!(self.blocks[right].left.is_none());
        debug_assert!(self.blocks[right].right.is_none());
        let old_right = self.blocks[left].right;
        self.blocks[right].right = old_right;
        if let Some(old_right) = old_right {
            self.blocks[old_right].left = Some(right);
        }
        self.blocks[right].left = Some(left);
        self.blocks[left].right = Some(right);
    }

    fn unlink_neighbour(&mut self, index: usize) {
        let left = self.blocks[index].left;
        let right = self.blocks[index].right;
        if let Some(left) = left {
            self.blocks[left].right = right;
        }
        if let Some(right) = right {
            self.blocks[right].left = left;
        }
    }

    fn merge_with_neighbours(&mut self, index: usize) -> usize {
        let mut index = index;

        if let Some(left) = self.blocks[index].left {
            if !self.blocks[left].allocated {
                debug_assert_eq!(self.blocks[left].tag, self.blocks[index].tag);
                debug_assert!(self.blocks[left].offset < self.blocks[index].offset);
                self.remove_free(left);
                self.blocks[left].size += self.blocks[index].size;
                self.unlink_neighbour(index);
                self.blocks.remove(index);
                index = left;
            }
        }

        if let Some(right) = self.blocks[index].right {
            if !self.blocks[right].allocated {
                debug_assert_eq!(self.blocks[index].tag, self.blocks[right].tag);
                debug_assert!(self.blocks[index].offset < self.blocks[right].offset);
                self.remove_free(right);
                self.blocks[index].size += self.blocks[right].size;
                self.unlink_neighbour(right);
                self.blocks.remove(right);
            }
        }

        debug_assert!(self.blocks[index]
            .left
            .map_or(true, |left| self.blocks[left].allocated));
        debug_assert!(self.blocks[index]
            .right
            .map_or(true, |right| self.blocks[right].allocated));
        index
    }
}

impl Default for Tlsf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Tlsf {
        /// Walks every block and cross-checks the free lists, the bitmaps
        /// and the neighbour rings.
        fn check_invariants(&self) {
            for (index, block) in self.blocks.iter() {
                if let Some(left) = block.left {
                    let left = &self.blocks[left];
                    assert_eq!(left.offset + left.size, block.offset);
                    assert_eq!(left.tag, block.tag);
                    assert!(
                        left.allocated || block.allocated,
                        "two adjacent free blocks"
                    );
                }
                if let Some(right) = block.right {
                    assert_eq!(block.offset + block.size, self.blocks[right].offset);
                }
                if block.allocated {
                    assert!(block.prev_free.is_none());
                    assert!(block.next_free.is_none());
                } else {
                    let (fl, sl) = lower_bound_indices(block.size);
                    assert!(self.first_level_mask & (1 << fl) != 0);
                    assert!(self.second_level_masks[fl] & (1 << sl) != 0);
                    let mut cursor = self.free_lists[fl][sl];
                    let mut found = false;
                    while let Some(current) = cursor {
                        if current == index {
                            found = true;
                            break;
                        }
                        cursor = self.blocks[current].next_free;
                    }
                    assert!(found, "free block missing from its free list");
                }
            }
            for fl in 0..FL_COUNT {
                for sl in 0..SL_COUNT {
                    let occupied = self.free_lists[fl][sl].is_some();
                    assert_eq!(self.second_level_masks[fl] & (1 << sl) != 0, occupied);
                }
                let row_occupied = self.second_level_masks[fl] != 0;
                assert_eq!(self.first_level_mask & (1 << fl) != 0, row_occupied);
            }
        }

        fn free_block_count(&self) -> usize {
            self.blocks.iter().filter(|(_, b)| !b.allocated).count()
        }
    }

    #[test]
    fn size_class_mapping() {
        // Denormals: one sub-class per size below 32.
        assert_eq!(lower_bound_indices(1), (0, 0));
        assert_eq!(lower_bound_indices(31), (0, 30));
        // First normal row subdivides [32, 64) into steps of one.
        assert_eq!(lower_bound_indices(32), (1, 0));
        assert_eq!(lower_bound_indices(33), (1, 1));
        assert_eq!(lower_bound_indices(63), (1, 31));
        assert_eq!(lower_bound_indices(64), (2, 0));
        // [128, 256) subdivides in steps of four.
        assert_eq!(lower_bound_indices(128), (3, 0));
        assert_eq!(lower_bound_indices(129), (3, 0));
        assert_eq!(lower_bound_indices(132), (3, 1));
    }

    #[test]
    fn upper_bound_rounds_to_next_class() {
        // Exact class boundaries stay put.
        assert_eq!(upper_bound_indices(128), (3, 0));
        // 129 must search from the 132 class.
        assert_eq!(upper_bound_indices(129), (3, 1));
        // Rounding can carry into the next first level.
        assert_eq!(upper_bound_indices(255), (4, 0));
        // Denormals are exact already.
        assert_eq!(upper_bound_indices(7), (0, 6));
    }

    #[test]
    fn alloc_respects_alignment_and_span() {
        let mut tlsf = Tlsf::new();
        tlsf.add_root(7, 1 << 16);

        for &(size, align) in &[(37u32, 16u32), (1, 1), (4096, 4096), (100, 0), (33, 64)] {
            let allocation = tlsf.alloc(size, align).unwrap();
            let align = align.max(1);
            assert_eq!(allocation.offset % align, 0);
            assert_eq!(allocation.tag, 7);
            let (offset, span) = tlsf.block_span(allocation.block);
            assert!(allocation.offset + size <= offset + span);
            tlsf.check_invariants();
        }
    }

    #[test]
    fn free_coalesces_back_to_root() {
        let mut tlsf = Tlsf::new();
        tlsf.add_root(0, 1 << 20);

        let a = tlsf.alloc(100, 1).unwrap();
        let b = tlsf.alloc(200, 1).unwrap();
        let c = tlsf.alloc(300, 1).unwrap();
        tlsf.check_invariants();

        // Free out of order so coalescing has to merge in both directions.
        tlsf.free(b.block);
        tlsf.check_invariants();
        tlsf.free(a.block);
        tlsf.check_invariants();
        tlsf.free(c.block);
        tlsf.check_invariants();

        assert_eq!(tlsf.free_block_count(), 1);
        let (fl, sl) = lower_bound_indices(1 << 20);
        let root = tlsf.free_lists[fl][sl].unwrap();
        assert_eq!(tlsf.blocks[root].offset, 0);
        assert_eq!(tlsf.blocks[root].size, 1 << 20);
    }

    #[test]
    fn alloc_free_is_idempotent_on_topology() {
        let mut tlsf = Tlsf::new();
        tlsf.add_root(0, 1 << 20);
        let keep = tlsf.alloc(1024, 256).unwrap();

        let snapshot: Vec<(u32, u32, bool)> = tlsf
            .blocks
            .iter()
            .map(|(_, b)| (b.offset, b.size, b.allocated))
            .collect();
        let masks = (tlsf.first_level_mask, tlsf.second_level_masks);

        let transient = tlsf.alloc(4096, 64).unwrap();
        tlsf.free(transient.block);

        let after: Vec<(u32, u32, bool)> = tlsf
            .blocks
            .iter()
            .map(|(_, b)| (b.offset, b.size, b.allocated))
            .collect();
        assert_eq!(snapshot, after);
        assert_eq!(masks, (tlsf.first_level_mask, tlsf.second_level_masks));

        tlsf.free(keep.block);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut tlsf = Tlsf::new();
        tlsf.add_root(0, 4096);
        assert!(tlsf.alloc(1 << 20, 1).is_none());
        let a = tlsf.alloc(4096, 1).unwrap();
        assert!(tlsf.alloc(1, 1).is_none());
        tlsf.free(a.block);
        assert!(tlsf.alloc(4096, 1).is_some());
    }

    #[test]
    fn multiple_roots_keep_their_tags() {
        let mut tlsf = Tlsf::new();
        tlsf.add_root(10, 4096);
        tlsf.add_root(11, 4096);

        let a = tlsf.alloc(4096, 1).unwrap();
        let b = tlsf.alloc(4096, 1).unwrap();
        assert_ne!(a.tag, b.tag);
        assert!([a.tag, b.tag].contains(&10));
        assert!([a.tag, b.tag].contains(&11));
        // Blocks from different roots must never merge.
        tlsf.free(a.block);
        tlsf.free(b.block);
        assert_eq!(tlsf.free_block_count(), 2);
        tlsf.check_invariants();
    }

    #[test]
    fn mixed_workload_returns_to_single_root_block() {
        let mut tlsf = Tlsf::new();
        let root_size = 1 << 23;
        tlsf.add_root(1, root_size);

        let mut live = Vec::new();
        for i in 0..1000 {
            let allocation = if i % 2 == 0 {
                tlsf.alloc(37, 16).unwrap()
            } else {
                tlsf.alloc(4096, 4096).unwrap()
            };
            if i % 2 == 1 {
                tlsf.free(allocation.block);
            } else {
                live.push(allocation);
            }
        }
        tlsf.check_invariants();
        for allocation in live {
            tlsf.free(allocation.block);
        }

        tlsf.check_invariants();
        assert_eq!(tlsf.free_block_count(), 1);
        let (fl, sl) = lower_bound_indices(root_size);
        assert!(tlsf.first_level_mask & (1 << fl) != 0);
        assert!(tlsf.second_level_masks[fl] & (1 << sl) != 0);
        let root = tlsf.free_lists[fl][sl].unwrap();
        assert_eq!(tlsf.blocks[root].size, root_size);
        assert_eq!(tlsf.blocks[root].offset, 0);
    }

    #[test]
    #[should_panic]
    fn double_free_asserts() {
        let mut tlsf = Tlsf::new();
        tlsf.add_root(0, 4096);
        let a = tlsf.alloc(128, 1).unwrap();
        tlsf.free(a.block);
        tlsf.free(a.block);
    }

    #[test]
    fn clear_accepts_fully_freed_state() {
        let mut tlsf = Tlsf::new();
        tlsf.add_root(0, 1 << 16);
        let a = tlsf.alloc(512, 16).unwrap();
        let b = tlsf.alloc(8192, 4096).unwrap();
        tlsf.free(a.block);
        tlsf.free(b.block);
        tlsf.clear();
        assert_eq!(tlsf.free_block_count(), 0);
    }
}
