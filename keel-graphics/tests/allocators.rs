//! Allocator stack exercised through the public API: the TLSF byte
//! allocator under a mixed workload, and the page-chained stack
//! allocator driven like a frame arena.

use keel_graphics::{PagePool, StackAllocator, Tlsf, TlsfAllocation};

#[test]
fn tlsf_mixed_workload_survives_churn() {
    let mut tlsf = Tlsf::new();
    tlsf.add_root(42, 8 << 20);

    let mut live: Vec<TlsfAllocation> = Vec::new();
    for round in 0..1000 {
        let allocation = if round % 2 == 0 {
            tlsf.alloc(37, 16).expect("small allocation failed")
        } else {
            tlsf.alloc(4096, 4096).expect("page allocation failed")
        };
        assert_eq!(allocation.tag, 42);

        // Release every odd-numbered allocation immediately, keep the
        // rest until the end.
        if round % 2 == 1 {
            tlsf.free(allocation.block);
        } else {
            live.push(allocation);
        }
    }

    // Alignment must hold for everything still live.
    for allocation in &live {
        assert_eq!(allocation.offset % 16, 0);
    }

    for allocation in live {
        tlsf.free(allocation.block);
    }

    // Fully freed: the whole root is one block again and can be handed
    // out in a single allocation.
    let whole = tlsf.alloc(8 << 20, 1).expect("root did not coalesce");
    assert_eq!(whole.offset, 0);
    tlsf.free(whole.block);
    tlsf.clear();
}

#[test]
fn tlsf_interleaved_roots_never_cross() {
    let mut tlsf = Tlsf::new();
    tlsf.add_root(0, 1 << 16);
    tlsf.add_root(1, 1 << 16);

    let mut per_root: [Vec<TlsfAllocation>; 2] = [Vec::new(), Vec::new()];
    for _ in 0..64 {
        let allocation = tlsf.alloc(1024, 64).unwrap();
        per_root[allocation.tag as usize].push(allocation);
    }

    // Offsets within a root must be pairwise disjoint.
    for allocations in &per_root {
        let mut offsets: Vec<u32> = allocations.iter().map(|a| a.offset).collect();
        offsets.sort_unstable();
        for pair in offsets.windows(2) {
            assert!(pair[1] - pair[0] >= 1024);
        }
    }

    for allocations in per_root {
        for allocation in allocations {
            tlsf.free(allocation.block);
        }
    }
    tlsf.clear();
}

struct LeasedPages {
    outstanding: usize,
}

impl PagePool for LeasedPages {
    type Page = Vec<u8>;

    fn alloc_page(&mut self, size: u32) -> Vec<u8> {
        self.outstanding += 1;
        vec![0; size as usize]
    }

    fn free_page(&mut self, _page: Vec<u8>) {
        self.outstanding -= 1;
    }
}

#[test]
fn stack_allocator_behaves_like_a_frame_arena() {
    let mut stack = StackAllocator::new(1 << 12, LeasedPages { outstanding: 0 });

    // Two simulated frames; the second must reuse the first frame's
    // pages in order without going back to the pool.
    let mut first_frame = Vec::new();
    for _ in 0..40 {
        first_frame.push(stack.alloc(200, 8).unwrap());
    }
    let pages_after_first = stack.pool().outstanding;
    assert!(pages_after_first >= 2);

    stack.reset();
    let mut second_frame = Vec::new();
    for _ in 0..40 {
        second_frame.push(stack.alloc(200, 8).unwrap());
    }
    assert_eq!(stack.pool().outstanding, pages_after_first);

    for (a, b) in first_frame.iter().zip(&second_frame) {
        assert_eq!(a.page, b.page);
        assert_eq!(a.offset, b.offset);
    }
}
