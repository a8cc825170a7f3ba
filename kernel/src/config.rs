//! Tunable constants collected in one place rather than scattered as magic
//! numbers through `mm` and `sched`.

/// Number of size classes each NUMA node's pool array carries: 64, 128,
/// 256, ..., up to and including `SIZE_CLASSES[SIZE_CLASS_COUNT - 1]`,
/// which must be >= one page.
pub const SIZE_CLASSES: [usize; 7] = [64, 128, 256, 512, 1024, 2048, 4096];

/// Blocks reserved per size class, per NUMA node, at boot.
pub const BLOCKS_PER_SIZE_CLASS: usize = 256;

/// Upper bound on NUMA nodes this kernel core will track. Real topology
/// detection reports fewer; this only bounds the static array.
pub const MAX_NUMA_NODES: usize = 8;

/// Upper bound on logical CPUs. Bounds the static `CpuCore` array.
pub const MAX_CPUS: usize = 32;

/// Upper bound on simultaneously-live tasks. Bounds the task table.
pub const MAX_TASKS: usize = 4096;

/// Default stack size for a task that does not request one explicitly.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024;

/// Minimum permitted task stack size.
pub const MIN_STACK_SIZE: usize = 4 * 1024;

/// Cycles between automatic `balance_load()` invocations from
/// `schedule_next()`.
pub const BALANCE_INTERVAL: u64 = 1_000_000;

/// Load-score delta between the busiest and idlest core that triggers a
/// migration in `balance_load()`.
pub const BALANCE_THRESHOLD: u32 = 2;

/// Maximum number of tasks migrated in a single `balance_load()` call.
pub const MAX_MIGRATIONS_PER_BALANCE: usize = 1;
