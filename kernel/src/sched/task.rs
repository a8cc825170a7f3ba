//! Task object: priority, lifecycle state, stack, and CPU context.

use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::arch::x86_64::context::CpuContext;
use crate::arch::x86_64::cycles;
use crate::error::KernelResult;
use crate::mm::Stack;

/// A task's scheduling urgency. Lower ordinal = dequeued first. Exactly
/// five levels -- no fair-share weighting, no CFS-style dynamic boosting.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Idle = 4,
}

pub const PRIORITY_LEVELS: usize = 5;

impl Priority {
    pub const ALL: [Priority; PRIORITY_LEVELS] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Idle,
    ];

    pub const fn ordinal(self) -> usize {
        self as usize
    }
}

/// Task lifecycle state. Transitions are constrained -- see `Task::set_state`
/// callers in `sched::core`/`sched::global`, the only places allowed to move
/// a task between states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready = 0,
    Running = 1,
    Blocked = 2,
    Terminated = 3,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Ready,
            1 => TaskState::Running,
            2 => TaskState::Blocked,
            _ => TaskState::Terminated,
        }
    }
}

/// CPU affinity bitmask: bit k set means the task may run on CPU k.
#[derive(Debug, Clone, Copy)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const fn all() -> Self {
        Self(!0u64)
    }

    pub const fn single(cpu: u8) -> Self {
        Self(1u64 << cpu)
    }

    pub const fn from_mask(mask: u64) -> Self {
        Self(mask)
    }

    pub fn contains(&self, cpu: u8) -> bool {
        (self.0 & (1u64 << cpu)) != 0
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Cycle-timestamped accounting for a task, per §3's Task aggregate.
/// Fields are atomics so cross-core reads (e.g. a debug dump, or
/// `destroy_task` running on a different core than the owner) never tear,
/// even though only the owning CpuCore ever writes them during normal
/// scheduling.
#[derive(Debug, Default)]
pub struct TaskStats {
    pub created_at: AtomicU64,
    pub last_resumed_at: AtomicU64,
    pub runtime_cycles: AtomicU64,
    /// 0 means "no deadline set".
    pub deadline_cycles: AtomicU64,
}

impl TaskStats {
    pub fn deadline(&self) -> Option<u64> {
        match self.deadline_cycles.load(Ordering::Relaxed) {
            0 => None,
            d => Some(d),
        }
    }
}

/// A task's entry function: receives the user-supplied argument.
pub type EntryFn = extern "C" fn(usize) -> !;

pub type TaskId = u64;

/// Task control block. Owns its stack; the stack is released when the task
/// is dropped (on destruction, after the scheduler has reclaimed it from
/// every ready queue and `current_task` slot).
pub struct Task {
    pub id: TaskId,
    pub priority: Priority,
    state: AtomicU8,
    pub affinity: CpuSet,
    pub stack: Stack,
    pub context: CpuContext,
    pub stats: TaskStats,
}

impl Task {
    /// Construction procedure: allocate the stack, zero and wire up the
    /// context to land on the trampoline, enable interrupts, reset FPU
    /// state, and stamp `created_at`. Publishes as Ready.
    pub fn new(
        id: TaskId,
        priority: Priority,
        entry: EntryFn,
        argument: usize,
        stack_size: usize,
        node: usize,
        affinity: CpuSet,
    ) -> KernelResult<Self> {
        let stack_size = stack_size.max(crate::config::MIN_STACK_SIZE);
        let stack = Stack::allocate(stack_size, node)?;
        let top = stack.top();
        let context = CpuContext::new_task(task_trampoline as usize, top, entry as usize, argument);

        Ok(Self {
            id,
            priority,
            state: AtomicU8::new(TaskState::Ready as u8),
            affinity,
            stack,
            context,
            stats: TaskStats {
                created_at: AtomicU64::new(cycles::read_cycle()),
                last_resumed_at: AtomicU64::new(0),
                runtime_cycles: AtomicU64::new(0),
                deadline_cycles: AtomicU64::new(0),
            },
        })
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `state`. Only the transitions named in §7's state machine are
    /// legal; anything else is a scheduler bug, asserted in debug builds and
    /// otherwise applied as written (undefined downstream behavior, per the
    /// documented `InvalidTransition` error class).
    pub fn set_state(&self, state: TaskState) {
        debug_assert!(
            is_legal_transition(self.state(), state),
            "illegal task state transition: {:?} -> {:?}",
            self.state(),
            state
        );
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn can_run_on(&self, cpu: u8) -> bool {
        self.affinity.contains(cpu)
    }
}

/// Ready -> Running (dispatched), Running -> Ready (preempted/yielded),
/// Running -> Blocked (waiting), Blocked -> Ready (woken), and anything ->
/// Terminated (exit, or destroyed from another core) are the only legal
/// moves. A state transitioning to itself is never requested by this
/// crate's callers and is therefore also rejected.
fn is_legal_transition(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    matches!(
        (from, to),
        (Ready, Running)
            | (Running, Ready)
            | (Running, Blocked)
            | (Blocked, Ready)
            | (Ready, Terminated)
            | (Running, Terminated)
            | (Blocked, Terminated)
    )
}

/// Entry shim every freshly-created task's context lands on. Loads the
/// user argument and entry pointer out of the ABI registers the construction
/// procedure placed them in, calls the user body, and on return terminates
/// the task -- a task body MUST NOT simply return into unspecified memory.
extern "C" fn task_trampoline(argument: usize, entry: usize) -> ! {
    // SAFETY: `entry` was written into this context by `Task::new` as a
    // valid `EntryFn` pointer; it is called exactly once, here.
    let entry: EntryFn = unsafe { core::mem::transmute::<usize, EntryFn>(entry) };
    entry(argument);
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn dummy_entry(_: usize) -> ! {
        loop {}
    }

    #[test]
    fn priority_ordering_is_critical_first() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert!(Priority::Low < Priority::Idle);
    }

    #[test]
    fn cpu_set_single_contains_only_that_cpu() {
        let set = CpuSet::single(3);
        assert!(set.contains(3));
        assert!(!set.contains(0));
        assert!(!set.contains(4));
    }

    #[test]
    fn new_task_starts_ready_with_stamped_created_at() {
        let _ = crate::mm::init();
        let task = Task::new(1, Priority::Normal, dummy_entry, 0, 8192, 0, CpuSet::all());
        assert!(task.is_ok());
        let task = task.unwrap();
        assert_eq!(task.state(), TaskState::Ready);
    }

    #[test]
    fn deadline_defaults_to_none() {
        let _ = crate::mm::init();
        let task = Task::new(1, Priority::Normal, dummy_entry, 0, 8192, 0, CpuSet::all()).unwrap();
        assert_eq!(task.stats.deadline(), None);
    }
}
