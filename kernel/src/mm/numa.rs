//! NUMA-aware memory manager: routes allocations to a `{node, size-class}`
//! pool and tracks allocation statistics.
//!
//! Distinct from [`crate::sched::numa`], which places *tasks* onto NUMA
//! nodes; this module places *allocations*.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::arch::x86_64::cycles;
use crate::config::{BLOCKS_PER_SIZE_CLASS, MAX_NUMA_NODES, SIZE_CLASSES};
use crate::error::{KernelError, KernelResult};
use crate::mm::bump::BumpArena;
use crate::mm::pool::Pool;

/// One memory-locality domain: an id plus one pool per size class.
pub struct NumaNode {
    id: usize,
    pools: [Pool; SIZE_CLASSES.len()],
}

impl NumaNode {
    const fn empty(id: usize) -> Self {
        const EMPTY: Pool = Pool::empty();
        Self {
            id,
            pools: [EMPTY; SIZE_CLASSES.len()],
        }
    }

    fn init(&mut self, arena: &BumpArena) -> KernelResult<()> {
        for (pool, &size) in self.pools.iter_mut().zip(SIZE_CLASSES.iter()) {
            pool.init(arena, size, BLOCKS_PER_SIZE_CLASS, size.min(4096).max(8))?;
        }
        Ok(())
    }

    fn pool_for(&self, size: usize) -> Option<&Pool> {
        SIZE_CLASSES
            .iter()
            .position(|&class| class >= size)
            .map(|idx| &self.pools[idx])
    }

    fn owns(&self, ptr: NonNull<u8>) -> Option<&Pool> {
        self.pools.iter().find(|pool| pool.contains(ptr))
    }
}

#[derive(Default)]
struct Stats {
    total_allocations: AtomicU64,
    total_deallocations: AtomicU64,
    total_bytes_allocated: AtomicU64,
    peak_bytes_allocated: AtomicU64,
    sum_alloc_cycles: AtomicU64,
    max_alloc_cycles: AtomicU64,
}

/// Detects node count (platform topology, or a single-node fallback) and
/// routes `allocate`/`deallocate` calls to the right `{node, size-class}`
/// pool.
pub struct NumaManager {
    node_count: AtomicUsize,
    nodes: [NumaNode; MAX_NUMA_NODES],
    stats: Stats,
}

impl NumaManager {
    pub const fn new() -> Self {
        const EMPTY_NODE: NumaNode = NumaNode::empty(0);
        let mut nodes = [EMPTY_NODE; MAX_NUMA_NODES];
        let mut i = 0;
        while i < MAX_NUMA_NODES {
            nodes[i] = NumaNode::empty(i);
            i += 1;
        }

        Self {
            node_count: AtomicUsize::new(0),
            nodes,
            stats: Stats {
                total_allocations: AtomicU64::new(0),
                total_deallocations: AtomicU64::new(0),
                total_bytes_allocated: AtomicU64::new(0),
                peak_bytes_allocated: AtomicU64::new(0),
                sum_alloc_cycles: AtomicU64::new(0),
                max_alloc_cycles: AtomicU64::new(0),
            },
        }
    }

    /// Detect node count from platform topology (none available on this
    /// target yet, so a single node is assumed, matching §6's fallback)
    /// and build every node's size-class pools from `arena`.
    pub fn initialize(&mut self, arena: &BumpArena) -> KernelResult<()> {
        let detected = detect_node_count();
        for node in self.nodes.iter_mut().take(detected) {
            node.init(arena)?;
        }
        self.node_count.store(detected, Ordering::Release);
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.node_count.load(Ordering::Acquire)
    }

    /// Allocate `size` bytes from `node`'s smallest fitting size class,
    /// falling back to any other node if `node` can't satisfy it.
    pub fn allocate(&self, size: usize, node: usize) -> Option<NonNull<u8>> {
        let t0 = cycles::read_cycle();
        let result = self.allocate_uncounted(size, node);
        let t1 = cycles::read_cycle();
        let elapsed = cycles::elapsed(t0, t1);

        if result.is_some() {
            self.stats
                .total_allocations
                .fetch_add(1, Ordering::Relaxed);
            let new_total = self
                .stats
                .total_bytes_allocated
                .fetch_add(size as u64, Ordering::Relaxed)
                + size as u64;
            self.stats
                .peak_bytes_allocated
                .fetch_max(new_total, Ordering::Relaxed);
            self.stats
                .sum_alloc_cycles
                .fetch_add(elapsed, Ordering::Relaxed);
            self.stats
                .max_alloc_cycles
                .fetch_max(elapsed, Ordering::Relaxed);
        }
        result
    }

    fn allocate_uncounted(&self, size: usize, node: usize) -> Option<NonNull<u8>> {
        let count = self.node_count();
        if count == 0 {
            return None;
        }

        if let Some(n) = self.nodes.get(node.min(count - 1)) {
            if let Some(pool) = n.pool_for(size) {
                if let Some(p) = pool.allocate() {
                    return Some(p);
                }
            }
        }

        // Fall back to any other node, documented per §4.4 step 2.
        for n in self.nodes.iter().take(count) {
            if n.id == node {
                continue;
            }
            if let Some(pool) = n.pool_for(size) {
                if let Some(p) = pool.allocate() {
                    return Some(p);
                }
            }
        }
        None
    }

    /// Allocate or fail with [`KernelError::AllocationExhausted`].
    pub fn allocate_or_err(&self, size: usize, node: usize) -> KernelResult<NonNull<u8>> {
        self.allocate(size, node)
            .ok_or(KernelError::AllocationExhausted { size })
    }

    /// Identify the owning pool by range check across all nodes and size
    /// classes, then deallocate into it.
    ///
    /// # Safety
    /// `ptr` must have been returned by a prior `allocate` on this manager
    /// and not already deallocated.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let count = self.node_count();
        for node in self.nodes.iter().take(count) {
            if let Some(pool) = node.owns(ptr) {
                // SAFETY: forwarded from this function's own contract.
                unsafe { pool.deallocate(ptr) };
                self.stats
                    .total_deallocations
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        debug_assert!(false, "deallocate of pointer owned by no pool");
    }

    pub fn total_allocations(&self) -> u64 {
        self.stats.total_allocations.load(Ordering::Relaxed)
    }

    pub fn total_deallocations(&self) -> u64 {
        self.stats.total_deallocations.load(Ordering::Relaxed)
    }

    pub fn peak_bytes_allocated(&self) -> u64 {
        self.stats.peak_bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn mean_alloc_cycles(&self) -> u64 {
        let n = self.stats.total_allocations.load(Ordering::Relaxed);
        if n == 0 {
            0
        } else {
            self.stats.sum_alloc_cycles.load(Ordering::Relaxed) / n
        }
    }

    pub fn max_alloc_cycles(&self) -> u64 {
        self.stats.max_alloc_cycles.load(Ordering::Relaxed)
    }
}

impl Default for NumaManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Platform topology detection. No firmware table reader exists yet for
/// this target, so a single node is always reported, matching §6's
/// documented fallback.
fn detect_node_count() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;

    fn test_manager() -> (Vec<u8>, BumpArena, NumaManager) {
        let mut backing = vec![0u8; 1 << 20];
        let start = backing.as_mut_ptr() as usize;
        // SAFETY: backing outlives arena/manager within the test.
        let arena = unsafe { BumpArena::new(start, backing.len()) };
        let mut manager = NumaManager::new();
        manager.initialize(&arena).unwrap();
        (backing, arena, manager)
    }

    #[test]
    fn single_node_fallback_detected() {
        let (_b, _a, manager) = test_manager();
        assert_eq!(manager.node_count(), 1);
    }

    #[test]
    fn allocate_maps_to_smallest_fitting_class() {
        let (_b, _a, manager) = test_manager();
        let p = manager.allocate(100, 0).unwrap();
        assert_eq!(manager.total_allocations(), 1);
        // SAFETY: p was just allocated from this manager.
        unsafe { manager.deallocate(p) };
        assert_eq!(manager.total_deallocations(), 1);
    }

    #[test]
    fn stats_track_peak_bytes() {
        let (_b, _a, manager) = test_manager();
        let _p1 = manager.allocate(64, 0).unwrap();
        let _p2 = manager.allocate(64, 0).unwrap();
        assert!(manager.peak_bytes_allocated() >= 128);
    }
}
