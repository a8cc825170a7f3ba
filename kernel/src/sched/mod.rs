//! Tickless, priority-preemptive per-CPU scheduler.
//!
//! `task` defines the task control block and lifecycle; `queue` is the O(1)
//! priority ready queue each `CpuCore` (in `core`) owns; `global` ties every
//! core together into one `Scheduler`, owns the lock-free task table, and
//! implements cross-core load balancing.

pub mod core;
pub mod global;
pub mod queue;
pub mod task;
pub mod task_ptr;

pub use global::{
    core_count, create_task, current_core, destroy_task, init, schedule_next, yield_now,
};
pub use task::{CpuSet, EntryFn, Priority, TaskId, TaskState};

/// Called from the x86_64 PIT handler on every timer tick. Drives
/// preemption: each tick is one scheduling opportunity for the core it
/// fires on.
pub fn timer_tick() {
    if !global::is_initialized() {
        return;
    }
    schedule_next();
}
