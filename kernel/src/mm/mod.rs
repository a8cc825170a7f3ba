//! Memory management: bump arena (§4.2), lock-free fixed-block pools
//! (§4.3), and the NUMA-routing layer above them (§4.4).

pub mod bump;
pub mod numa;
pub mod pool;

use core::ptr::NonNull;

use spin::Once;

use crate::config::{BLOCKS_PER_SIZE_CLASS, SIZE_CLASSES};
use crate::error::{KernelError, KernelResult};

/// Total bytes reserved for the arena backing every NUMA node's pools.
/// Sized generously above `sum(size_class * blocks_per_class) *
/// MAX_NUMA_NODES` so a single-node boot (the common case today) leaves
/// ample headroom; pools simply stop initializing extra nodes if this is
/// ever too small, surfacing as an early `AllocationExhausted` at boot.
const ARENA_SIZE: usize = {
    let mut total = 0usize;
    let mut i = 0;
    while i < SIZE_CLASSES.len() {
        total += SIZE_CLASSES[i] * BLOCKS_PER_SIZE_CLASS;
        i += 1;
    }
    total * 2
};

#[repr(align(4096))]
struct Arena([u8; ARENA_SIZE]);

static mut ARENA_BACKING: Arena = Arena([0u8; ARENA_SIZE]);

static NUMA_MANAGER: Once<numa::NumaManager> = Once::new();

/// Initialize the bump arena and every NUMA node's size-class pools.
/// Idempotent and safe to call concurrently -- `spin::Once` guarantees the
/// body below runs exactly once; every caller (including concurrent host
/// unit tests reaching this through `Stack::allocate`) blocks until that
/// single run completes.
pub fn init() -> KernelResult<()> {
    let mut init_result = Ok(());
    NUMA_MANAGER.call_once(|| {
        // SAFETY: ARENA_BACKING is written only from within this
        // `call_once` body, which `spin::Once` guarantees runs at most once
        // across all callers.
        let (start, len) = unsafe {
            let ptr = core::ptr::addr_of_mut!(ARENA_BACKING);
            ((*ptr).0.as_mut_ptr() as usize, ARENA_SIZE)
        };
        // SAFETY: `start`/`len` describe ARENA_BACKING exclusively; nothing
        // else reads or writes that range except through the arena/pools
        // built on top of it.
        let arena = unsafe { bump::BumpArena::new(start, len) };

        let mut manager = numa::NumaManager::new();
        if let Err(e) = manager.initialize(&arena) {
            log::error!("mm: pool initialization failed: {e}");
            init_result = Err(e);
        } else {
            log::info!("mm: {} NUMA node(s) initialized, {ARENA_SIZE} byte arena", manager.node_count());
        }
        manager
    });
    init_result
}

fn manager() -> &'static numa::NumaManager {
    NUMA_MANAGER
        .get()
        .expect("mm::init() must run before any allocation")
}

/// A task's exclusively-owned stack region, sized and node-placed via the
/// NUMA manager.
pub struct Stack {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: a Stack is owned by exactly one Task at a time; the pointer is
// never aliased while live.
unsafe impl Send for Stack {}

impl Stack {
    /// Allocate a stack of at least `size` bytes on `node`.
    pub fn allocate(size: usize, node: usize) -> KernelResult<Self> {
        let base = manager()
            .allocate(size, node)
            .ok_or(KernelError::AllocationExhausted { size })?;
        Ok(Self { base, size })
    }

    /// Address of the top of the stack (highest address, exclusive), the
    /// starting point for a fresh `stack_pointer`.
    pub fn top(&self) -> usize {
        self.base.as_ptr() as usize + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: `self.base` was allocated from `manager()` in
        // `Stack::allocate` and is dropped exactly once.
        unsafe { manager().deallocate(self.base) };
    }
}

/// Allocate a single fixed-size block for general kernel bookkeeping
/// (never user-facing; "no general malloc" still holds since every
/// request must map to a declared size class).
pub fn alloc_block(size: usize, node: usize) -> KernelResult<NonNull<u8>> {
    manager().allocate_or_err(size, node)
}

/// # Safety
/// `ptr` must have come from [`alloc_block`] and not already be freed.
pub unsafe fn free_block(ptr: NonNull<u8>) {
    // SAFETY: forwarded from this function's contract.
    unsafe { manager().deallocate(ptr) };
}

pub fn stats() -> MemoryStats {
    let m = manager();
    MemoryStats {
        total_allocations: m.total_allocations(),
        total_deallocations: m.total_deallocations(),
        peak_bytes_allocated: m.peak_bytes_allocated(),
        mean_alloc_cycles: m.mean_alloc_cycles(),
        max_alloc_cycles: m.max_alloc_cycles(),
        node_count: m.node_count(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub total_allocations: u64,
    pub total_deallocations: u64,
    pub peak_bytes_allocated: u64,
    pub mean_alloc_cycles: u64,
    pub max_alloc_cycles: u64,
    pub node_count: usize,
}
