//! Lock-free fixed-block pool allocator.
//!
//! Each block is a free-list node: a header holding one machine pointer
//! (`next`) immediately followed by `block_size` bytes of payload. A block
//! is either linked from exactly one pool's free-list head or owned
//! exclusively by whoever called [`Pool::allocate`] — the two sets never
//! overlap.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::arch::barriers;
use crate::arch::x86_64::cycles;
use crate::error::{KernelError, KernelResult};
use crate::mm::bump::BumpArena;

/// One pool block's free-list header. The payload begins immediately after
/// this struct, so `block_size` must already account for it at
/// construction (see [`Pool::init`]).
#[repr(C)]
struct BlockHeader {
    next: AtomicPtr<BlockHeader>,
}

/// A fixed-size free-list allocator over a single contiguous arena region.
pub struct Pool {
    block_size: usize,
    alignment: usize,
    total_blocks: usize,
    stride: usize,
    /// Distance from a block's start to its payload. Always a multiple of
    /// `alignment` (and thus at least `size_of::<BlockHeader>()`, rounded
    /// up), so that if the block start is `alignment`-aligned the payload
    /// is too -- the header itself only ever needs pointer alignment.
    payload_offset: usize,
    arena_start: usize,
    arena_len: usize,
    head: AtomicPtr<BlockHeader>,
    available: core::sync::atomic::AtomicUsize,
}

// SAFETY: all mutable state is behind atomics; `arena_start`/`arena_len`
// are set once at init and read-only thereafter.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    /// Construct an empty, uninitialized pool. Call [`Pool::init`] once
    /// before use.
    pub const fn empty() -> Self {
        Self {
            block_size: 0,
            alignment: 1,
            total_blocks: 0,
            stride: 0,
            payload_offset: 0,
            arena_start: 0,
            arena_len: 0,
            head: AtomicPtr::new(core::ptr::null_mut()),
            available: core::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Reserve `num_blocks * stride(block_size, alignment)` bytes from
    /// `arena`, write per-block headers in order, and link them into a
    /// LIFO free list. Every block is reachable from the head exactly once
    /// once this returns `Ok`.
    pub fn init(
        &mut self,
        arena: &BumpArena,
        block_size: usize,
        num_blocks: usize,
        alignment: usize,
    ) -> KernelResult<()> {
        let header_size = core::mem::size_of::<BlockHeader>();
        // Pad the header out to a full `alignment`-sized slot rather than
        // placing the payload at a fixed `header_size` offset: since every
        // block start is itself `alignment`-aligned (the arena hands back
        // an aligned base and `stride` is a multiple of `alignment`), a
        // payload offset that is also a multiple of `alignment` keeps the
        // payload pointer aligned regardless of how `alignment` compares to
        // `header_size`.
        let payload_offset = align_up(header_size, alignment);
        let stride = align_up(payload_offset + block_size, alignment);
        let region_size = stride * num_blocks;

        let base = arena
            .reserve(region_size, alignment)
            .ok_or(KernelError::AllocationExhausted { size: region_size })?;

        self.block_size = block_size;
        self.alignment = alignment;
        self.total_blocks = num_blocks;
        self.stride = stride;
        self.payload_offset = payload_offset;
        self.arena_start = base as usize;
        self.arena_len = region_size;

        let mut head: *mut BlockHeader = core::ptr::null_mut();
        // Link in reverse so the first block ends up at the head (order of
        // the free list does not matter beyond "every block reachable
        // exactly once" -- callers never depend on allocation order).
        for i in (0..num_blocks).rev() {
            let addr = self.arena_start + i * stride;
            let block = addr as *mut BlockHeader;
            // SAFETY: `addr` lies within the just-reserved region, is
            // stride-aligned (hence block-aligned), and is not yet visible
            // to any other thread.
            unsafe {
                (*block).next = AtomicPtr::new(head);
            }
            head = block;
        }

        self.head = AtomicPtr::new(head);
        self.available = core::sync::atomic::AtomicUsize::new(num_blocks);
        Ok(())
    }

    /// Pop a block off the free list. `Acquire` on success so the caller's
    /// reads/writes into the payload observe whatever the block's prior
    /// owner left there (relevant only if the caller relies on zeroed or
    /// preserved memory, which this API does not itself guarantee).
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return None;
            }
            // SAFETY: any non-null value read from `self.head` points at a
            // live block header within the arena; it cannot be freed
            // concurrently because only `allocate`/`deallocate` touch it
            // and both only ever observe headers reachable from the list.
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };

            match self.head.compare_exchange_weak(
                head,
                next,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.available.fetch_sub(1, Ordering::Relaxed);
                    let payload = (head as usize) + self.payload_offset;
                    return NonNull::new(payload as *mut u8);
                }
                Err(observed) => {
                    head = observed;
                    cycles::serialize();
                    barriers::cpu_pause();
                }
            }
        }
    }

    /// Push a block back onto the free list. `Release` on success so the
    /// writes this caller made into the payload are visible to whoever
    /// allocates it next.
    ///
    /// # Safety
    /// `ptr` must be a payload pointer previously returned by
    /// `self.allocate()` and not already freed.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let block = (ptr.as_ptr() as usize - self.payload_offset) as *mut BlockHeader;

        debug_assert!(self.contains(ptr), "free of pointer outside pool arena");

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `block` was derived from a pointer this pool handed
            // out; it is not reachable from the free list (it was owned by
            // the caller), so writing its `next` field is exclusive.
            unsafe {
                (*block).next = AtomicPtr::new(head);
            }
            match self.head.compare_exchange_weak(
                head,
                block,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.available.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(observed) => head = observed,
            }
        }
    }

    /// True if `ptr` falls within this pool's arena at a block boundary.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        if addr < self.arena_start + self.payload_offset {
            return false;
        }
        let offset = addr - self.arena_start - self.payload_offset;
        offset % self.stride == 0 && addr < self.arena_start + self.arena_len
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub fn available_blocks(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }
}

fn align_up(addr: usize, alignment: usize) -> usize {
    (addr + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;

    fn test_pool(num_blocks: usize, block_size: usize) -> (Vec<u8>, BumpArena, Pool) {
        test_pool_aligned(num_blocks, block_size, 8)
    }

    fn test_pool_aligned(
        num_blocks: usize,
        block_size: usize,
        alignment: usize,
    ) -> (Vec<u8>, BumpArena, Pool) {
        let mut backing = vec![0u8; (block_size + alignment * 2) * num_blocks + alignment * 4];
        let start = backing.as_mut_ptr() as usize;
        // SAFETY: backing outlives arena and pool within the test.
        let arena = unsafe { BumpArena::new(start, backing.len()) };
        let mut pool = Pool::empty();
        pool.init(&arena, block_size, num_blocks, alignment).unwrap();
        (backing, arena, pool)
    }

    #[test]
    fn allocate_returns_blocks_within_arena_and_aligned() {
        let (_backing, _arena, pool) = test_pool(4, 64);
        for _ in 0..4 {
            let p = pool.allocate().unwrap();
            assert!(pool.contains(p));
            assert_eq!(p.as_ptr() as usize % 8, 0);
        }
        assert!(pool.allocate().is_none());
    }

    #[test]
    fn round_trip_lifo() {
        let (_backing, _arena, pool) = test_pool(4, 64);
        let p = pool.allocate().unwrap();
        // SAFETY: p was just allocated from this pool and not yet freed.
        unsafe { pool.deallocate(p) };
        let p2 = pool.allocate().unwrap();
        assert_eq!(p.as_ptr(), p2.as_ptr());
    }

    #[test]
    fn exhaustion_then_free_then_succeed() {
        let (_backing, _arena, pool) = test_pool(4, 64);
        let mut allocated = Vec::new();
        for _ in 0..4 {
            allocated.push(pool.allocate().unwrap());
        }
        assert!(pool.allocate().is_none());
        let freed = allocated.pop().unwrap();
        // SAFETY: freed was allocated from this pool above.
        unsafe { pool.deallocate(freed) };
        let reallocated = pool.allocate().unwrap();
        assert_eq!(freed.as_ptr(), reallocated.as_ptr());
    }

    // Regression test: with alignment=8 (equal to `size_of::<BlockHeader>()`)
    // a naive `payload = head + header_size` offset happens to already be
    // aligned, masking a bug that only shows up once alignment exceeds the
    // header size.
    #[test]
    fn allocate_respects_alignment_wider_than_header() {
        for &alignment in &[64usize, 4096usize] {
            let (_backing, _arena, pool) = test_pool_aligned(4, 256, alignment);
            for _ in 0..4 {
                let p = pool.allocate().unwrap();
                assert!(pool.contains(p));
                assert_eq!(
                    p.as_ptr() as usize % alignment,
                    0,
                    "payload misaligned for alignment={alignment}"
                );
            }
        }
    }

    #[test]
    fn disjointness_of_free_and_live_sets() {
        let (_backing, _arena, pool) = test_pool(4, 64);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(pool.available_blocks(), 2);
    }
}
