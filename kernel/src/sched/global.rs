//! Lock-free task table plus the global, multi-core scheduler: task
//! creation/destruction, the periodic load balancer, and per-core lookup.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Once;

use super::core::CpuCore;
use super::task::{CpuSet, EntryFn, Priority, Task, TaskId, TaskState};
use crate::arch::x86_64::{cycles, disable_interrupts, topology};
use crate::config::{
    BALANCE_INTERVAL, BALANCE_THRESHOLD, DEFAULT_STACK_SIZE, MAX_CPUS, MAX_MIGRATIONS_PER_BALANCE,
    MAX_TASKS,
};
use crate::error::{KernelError, KernelResult};

/// One task table slot. `id == 0` means empty; any other value means the
/// slot holds a live, published `Task` with that id. `id == SENTINEL` means
/// a writer has reserved the slot and is still constructing the task.
struct TaskSlot {
    id: AtomicU64,
    task: UnsafeCell<MaybeUninit<Task>>,
}

const RESERVED: u64 = u64::MAX;

// SAFETY: every access to `task` is gated by a CAS on `id` that grants the
// winner exclusive rights to that memory for exactly one phase (construct,
// or destroy); never more than one core holds that right at a time.
unsafe impl Sync for TaskSlot {}

impl TaskSlot {
    const fn empty() -> Self {
        Self {
            id: AtomicU64::new(0),
            task: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Fixed-capacity, lock-free task registry. Tasks are addressed by
/// `TaskId`; `slot_index` maps an id onto one of `MAX_TASKS` slots, and ids
/// are never reused while their slot is occupied (monotonic counter, per
/// §9 O2) -- only the physical slot is, once a prior occupant is destroyed.
pub struct TaskTable {
    slots: [TaskSlot; MAX_TASKS],
    next_id: AtomicU64,
}

impl TaskTable {
    const fn new() -> Self {
        const EMPTY: TaskSlot = TaskSlot::empty();
        Self {
            slots: [EMPTY; MAX_TASKS],
            next_id: AtomicU64::new(1),
        }
    }

    fn slot_index(id: TaskId) -> usize {
        ((id - 1) % MAX_TASKS as u64) as usize
    }

    /// Reserve a fresh id, run `build(id)` to construct the task in place,
    /// and publish it. Scans at most `MAX_TASKS` candidate ids (one full
    /// lap of the slot ring) before giving up with `TaskTableFull`.
    fn insert(&self, build: impl FnOnce(TaskId) -> KernelResult<Task>) -> KernelResult<NonNull<Task>> {
        for _ in 0..MAX_TASKS {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).max(1);
            let slot = &self.slots[Self::slot_index(id)];
            if slot
                .id
                .compare_exchange(0, RESERVED, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            return match build(id) {
                Ok(task) => {
                    // SAFETY: the CAS above gives this call exclusive
                    // write access to the slot's task cell until `id` is
                    // published in the store below.
                    let cell = unsafe { &mut *slot.task.get() };
                    cell.write(task);
                    let ptr = NonNull::new(cell.as_mut_ptr()).unwrap();
                    slot.id.store(id, Ordering::Release);
                    Ok(ptr)
                }
                Err(e) => {
                    slot.id.store(0, Ordering::Release);
                    Err(e)
                }
            };
        }
        Err(KernelError::TaskTableFull)
    }

    /// Look up a live task by id.
    pub fn lookup(&self, id: TaskId) -> Option<NonNull<Task>> {
        if id == 0 || id == RESERVED {
            return None;
        }
        let slot = &self.slots[Self::slot_index(id)];
        if slot.id.load(Ordering::Acquire) != id {
            return None;
        }
        // SAFETY: `id` matched a published slot under Acquire, which
        // synchronizes with the Release store in `insert`; the task is
        // fully initialized.
        let cell = unsafe { &mut *slot.task.get() };
        NonNull::new(cell.as_mut_ptr())
    }

    /// Free `id`'s slot, dropping the task in place (releasing its stack).
    /// Returns `false` if `id` was already destroyed or never existed.
    ///
    /// # Caller contract
    /// The caller must know the task is no longer reachable from any ready
    /// queue and is not any core's `current_task` -- `sched::core::CpuCore`
    /// upholds this by only calling `destroy` on tasks it just dequeued
    /// (never anyone's current task, by P7) or retired a full scheduling
    /// epoch after they stopped running.
    pub fn destroy(&self, id: TaskId) -> bool {
        if id == 0 || id == RESERVED {
            return false;
        }
        let slot = &self.slots[Self::slot_index(id)];
        if slot
            .id
            .compare_exchange(id, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        // SAFETY: winning the CAS from `id` to 0 gives this call the sole
        // right to drop the slot's contents; ids are never reused while
        // occupied, so no concurrent `lookup`/`destroy` can still be
        // holding this id as a match.
        unsafe { (*slot.task.get()).assume_init_drop() };
        true
    }
}

static TASK_TABLE: TaskTable = TaskTable::new();

pub(super) fn task_table() -> &'static TaskTable {
    &TASK_TABLE
}

/// The multi-core scheduler: one `CpuCore` per brought-up logical CPU.
pub struct Scheduler {
    cores: [Option<CpuCore>; MAX_CPUS],
    core_count: usize,
    last_balance_stamp: AtomicU64,
}

static SCHEDULER: Once<Scheduler> = Once::new();

fn scheduler() -> &'static Scheduler {
    SCHEDULER.get().expect("sched::global::init() must run before use")
}

/// Bring up `core_count` (clamped to `[1, MAX_CPUS]`) `CpuCore`s, each with
/// its own idle task. Idempotent like `mm::init` -- concurrent callers block
/// on the single `Once` run.
pub fn init(core_count: usize) -> KernelResult<()> {
    let core_count = core_count.clamp(1, MAX_CPUS);
    let mut init_result = Ok(());
    SCHEDULER.call_once(|| {
        const EMPTY: Option<CpuCore> = None;
        let mut cores = [EMPTY; MAX_CPUS];
        for (core_id, slot) in cores.iter_mut().enumerate().take(core_count) {
            match spawn_idle(core_id as u8) {
                Ok(idle) => *slot = Some(CpuCore::new(core_id as u8, idle)),
                Err(e) => {
                    init_result = Err(e);
                    break;
                }
            }
        }
        Scheduler {
            cores,
            core_count,
            last_balance_stamp: AtomicU64::new(0),
        }
    });
    init_result
}

fn spawn_idle(core_id: u8) -> KernelResult<NonNull<Task>> {
    TASK_TABLE.insert(|id| {
        Task::new(
            id,
            Priority::Idle,
            idle_entry,
            core_id as usize,
            DEFAULT_STACK_SIZE,
            0,
            CpuSet::single(core_id),
        )
    })
}

extern "C" fn idle_entry(_core_id: usize) -> ! {
    loop {
        crate::arch::idle();
    }
}

fn current_cpu_id() -> usize {
    topology::logical_cpu_id(scheduler().core_count)
}

/// The `CpuCore` for whichever logical CPU is currently executing.
pub fn current_core() -> &'static CpuCore {
    scheduler().cores[current_cpu_id()]
        .as_ref()
        .expect("current core must have been initialized by sched::global::init")
}

pub fn core(core_id: usize) -> Option<&'static CpuCore> {
    scheduler().cores.get(core_id).and_then(|c| c.as_ref())
}

pub fn core_count() -> usize {
    scheduler().core_count
}

/// Whether `init` has completed. The timer interrupt handler checks this
/// before driving `schedule_next`, since the PIT can start ticking before
/// the scheduler is brought up.
pub fn is_initialized() -> bool {
    SCHEDULER.get().is_some()
}

/// Create a task, placing it on whichever eligible core (one whose
/// affinity bit is set) currently has the fewest ready tasks.
pub fn create_task(
    priority: Priority,
    entry: EntryFn,
    argument: usize,
    stack_size: usize,
    node: usize,
    affinity: CpuSet,
) -> KernelResult<TaskId> {
    let s = scheduler();
    let target = least_loaded_core_allowed_by(s, &affinity).ok_or(KernelError::NoEligibleCore)?;

    let ptr = TASK_TABLE.insert(|id| Task::new(id, priority, entry, argument, stack_size, node, affinity))?;
    // SAFETY: `ptr` was just published by `insert` and is not yet visible
    // to any other core.
    let id = unsafe { ptr.as_ref() }.id;

    let target_core = s.cores[target]
        .as_ref()
        .expect("least_loaded_core_allowed_by only returns initialized cores");
    if !target_core.add_task(ptr) {
        TASK_TABLE.destroy(id);
        return Err(KernelError::TaskTableFull);
    }
    Ok(id)
}

fn least_loaded_core_allowed_by(s: &Scheduler, affinity: &CpuSet) -> Option<usize> {
    (0..s.core_count)
        .filter(|&i| affinity.contains(i as u8))
        .filter_map(|i| s.cores[i].as_ref().map(|c| (i, c.load_score())))
        .min_by_key(|&(_, load)| load)
        .map(|(i, _)| i)
}

/// Mark a task Terminated. If it happens to be sitting Ready in the
/// *current* core's own queue, reclaim it immediately; otherwise the core
/// that eventually touches it (dequeues it as a candidate, or retires it
/// after running it) reclaims it lazily -- see `sched::core::CpuCore`'s
/// `retiring_id` and `dequeue_next`.
///
/// Returns `Err(KernelError::InvalidTaskId)` if `id` was already destroyed
/// or never existed.
pub fn destroy_task(id: TaskId) -> KernelResult<()> {
    let Some(ptr) = TASK_TABLE.lookup(id) else {
        return Err(KernelError::InvalidTaskId { id });
    };
    // SAFETY: `state` is independently atomic; safe to touch from any core
    // regardless of who currently owns the task.
    unsafe { ptr.as_ref() }.set_state(TaskState::Terminated);

    if current_core().remove_task(ptr) {
        TASK_TABLE.destroy(id);
    }
    Ok(())
}

/// Voluntarily give up the CPU. Equivalent to a preemption for accounting
/// purposes.
pub fn yield_now() {
    let _guard = disable_interrupts();
    current_core().schedule();
}

/// Run one scheduling decision on the current core, triggering a load
/// balance pass first if `BALANCE_INTERVAL` cycles have elapsed since the
/// last one.
pub fn schedule_next() {
    let s = scheduler();
    let now = cycles::read_cycle();
    let last = s.last_balance_stamp.load(Ordering::Relaxed);
    if cycles::elapsed(last, now) > BALANCE_INTERVAL {
        s.last_balance_stamp.store(now, Ordering::Relaxed);
        balance_load();
    }
    let _guard = disable_interrupts();
    current_core().schedule();
}

/// Move up to `MAX_MIGRATIONS_PER_BALANCE` tasks from the current core to
/// the least-loaded eligible core, if the gap exceeds `BALANCE_THRESHOLD`.
///
/// Per §5's concurrency model, a core only ever dequeues from its *own*
/// ready queue as migration donor; delivery to the target core goes through
/// that core's single-slot `incoming` handoff rather than this call
/// reaching into the target's queue directly.
pub fn balance_load() {
    let s = scheduler();
    let this_id = current_cpu_id();
    let Some(this_core) = s.cores[this_id].as_ref() else {
        return;
    };

    let mut target_id = this_id;
    let mut target_load = this_core.load_score();
    for (i, core) in s.cores.iter().enumerate().take(s.core_count) {
        if i == this_id {
            continue;
        }
        if let Some(c) = core {
            let load = c.load_score();
            if load < target_load {
                target_load = load;
                target_id = i;
            }
        }
    }
    if target_id == this_id {
        return;
    }

    let this_load = this_core.load_score();
    if this_load.saturating_sub(target_load) < BALANCE_THRESHOLD {
        return;
    }
    let Some(target_core) = s.cores[target_id].as_ref() else {
        return;
    };

    for _ in 0..MAX_MIGRATIONS_PER_BALANCE {
        let Some(victim) = this_core.take_migration_victim(target_id as u8) else {
            break;
        };
        if !target_core.offer_incoming(victim) {
            this_core.add_task(victim);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `TaskTable` is a lock-free structure built for concurrent access, so
    // these tests share the process-wide `TASK_TABLE` static (via
    // `task_table()`) rather than building a local instance -- at `MAX_TASKS`
    // slots a stack-local `TaskTable` would be a multi-megabyte frame. Each
    // test allocates its own fresh id from the monotonic counter, so
    // concurrently running tests never observe each other's slots.

    fn ok_build(id: TaskId) -> KernelResult<Task> {
        Task::new(id, Priority::Normal, dummy_entry, 0, 8192, 0, CpuSet::all())
    }

    extern "C" fn dummy_entry(_: usize) -> ! {
        loop {}
    }

    #[test]
    fn insert_lookup_destroy_roundtrip() {
        let _ = crate::mm::init();
        let table = task_table();
        let ptr = table.insert(ok_build).unwrap();
        let id = unsafe { ptr.as_ref() }.id;

        assert_eq!(table.lookup(id), Some(ptr));
        assert!(table.destroy(id));
        assert_eq!(table.lookup(id), None);
        // Double destroy is a no-op, not a double free.
        assert!(!table.destroy(id));
    }

    #[test]
    fn failed_build_rolls_back_the_slot() {
        let _ = crate::mm::init();
        let table = task_table();
        let err = table.insert(|_id| Err(KernelError::AllocationExhausted { size: 0 }));
        assert!(err.is_err());

        // The table must still be usable afterward -- the reserved slot was
        // released, not leaked in the RESERVED state.
        let ptr = table.insert(ok_build).unwrap();
        let id = unsafe { ptr.as_ref() }.id;
        assert_eq!(table.lookup(id), Some(ptr));
    }

    #[test]
    fn lookup_rejects_empty_and_reserved_sentinels() {
        let table = task_table();
        assert_eq!(table.lookup(0), None);
        assert_eq!(table.lookup(RESERVED), None);
    }

    #[test]
    fn init_brings_up_the_requested_core_count() {
        let _ = crate::mm::init();
        let _ = super::init(2);
        assert!(is_initialized());
        assert_eq!(core_count(), 2);
        assert!(core(0).is_some());
        assert!(core(1).is_some());
    }

    #[test]
    fn least_loaded_core_allowed_by_respects_affinity() {
        let _ = crate::mm::init();
        let _ = super::init(2);
        let s = scheduler();

        // Affinity pinned to cpu 1 must never resolve to cpu 0.
        let pinned = CpuSet::single(1);
        assert_eq!(least_loaded_core_allowed_by(s, &pinned), Some(1));

        // An affinity mask matching no brought-up core resolves to nothing.
        let impossible = CpuSet::from_mask(0);
        assert_eq!(least_loaded_core_allowed_by(s, &impossible), None);
    }

    #[test]
    fn create_task_honors_affinity_and_reports_no_eligible_core() {
        let _ = crate::mm::init();
        let _ = super::init(2);

        let id = create_task(Priority::Normal, dummy_entry, 0, 8192, 0, CpuSet::single(0))
            .expect("cpu 0 is always eligible");
        assert!(task_table().lookup(id).is_some());

        let err = create_task(
            Priority::Normal,
            dummy_entry,
            0,
            8192,
            0,
            CpuSet::from_mask(0),
        );
        assert_eq!(err, Err(KernelError::NoEligibleCore));
    }

    #[test]
    fn destroy_task_marks_terminated_and_rejects_unknown_ids() {
        let _ = crate::mm::init();
        let _ = super::init(2);

        let id = create_task(Priority::Low, dummy_entry, 0, 8192, 0, CpuSet::all()).unwrap();
        assert!(destroy_task(id).is_ok());
        let ptr = task_table().lookup(id);
        // Either already reclaimed (same-core fast path fired) or still
        // present but Terminated, awaiting lazy reclaim -- both are correct.
        if let Some(ptr) = ptr {
            assert_eq!(unsafe { ptr.as_ref() }.state(), TaskState::Terminated);
        }

        assert_eq!(
            destroy_task(999_999),
            Err(KernelError::InvalidTaskId { id: 999_999 })
        );
    }
}
