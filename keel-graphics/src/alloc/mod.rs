//! CPU-side allocators underpinning GPU memory management and per-frame
//! scratch: a two-level segregated-fit byte allocator and a page-chained
//! bump allocator.

mod stack;
mod tlsf;

pub use stack::{HeapPage, HeapPagePool, PagePool, StackAllocation, StackAllocator};
pub use tlsf::{Tlsf, TlsfAllocation, TlsfBlockId};
