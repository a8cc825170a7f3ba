//! Per-CPU scheduling core: the ready queue, currently-running task, and the
//! dispatch loop that ties them together via `switch_context`.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use super::queue::ReadyQueue;
use super::task::{Task, TaskState};
use crate::arch::x86_64::{context, cycles};

/// One logical CPU's scheduling state. Every field except `idle_task` is
/// either atomic or behind its own lock; `idle_task` is set once at
/// construction and never reassigned.
pub struct CpuCore {
    core_id: u8,
    current_task: AtomicPtr<Task>,
    idle_task: NonNull<Task>,
    ready_queue: Mutex<ReadyQueue>,

    /// Single-slot lock-free MPSC handoff: another core's `balance_load`
    /// writes a migrated task here via CAS; this core drains it at the top
    /// of its own `schedule()` and enqueues it locally. Per §5's documented
    /// escape hatch, this is the only form of cross-core ready-queue
    /// mutation this scheduler performs.
    incoming: AtomicPtr<Task>,

    /// TaskId of a task this core terminated on its *previous* `schedule()`
    /// call, reclaimed at the top of this call. Deferring by one full
    /// scheduling epoch guarantees the terminated task's stack is no longer
    /// live in any register/stack state before its memory is freed --
    /// mirrors a tick-delayed reclaim discipline, just keyed to "one more
    /// switch happened" instead of a tick count. 0 means empty.
    retiring_id: AtomicU64,

    task_count: AtomicUsize,
    switch_count: AtomicU64,
    sum_switch_cycles: AtomicU64,
    max_switch_cycles: AtomicU64,
}

// SAFETY: `idle_task` is the only non-atomic, non-locked field; it is
// written once at construction and read-only afterward, so sharing a
// `&CpuCore` across cores (as the global scheduler does) is sound.
unsafe impl Send for CpuCore {}
unsafe impl Sync for CpuCore {}

impl CpuCore {
    pub fn new(core_id: u8, idle_task: NonNull<Task>) -> Self {
        Self {
            core_id,
            current_task: AtomicPtr::new(idle_task.as_ptr()),
            idle_task,
            ready_queue: Mutex::new(ReadyQueue::new()),
            incoming: AtomicPtr::new(core::ptr::null_mut()),
            retiring_id: AtomicU64::new(0),
            task_count: AtomicUsize::new(0),
            switch_count: AtomicU64::new(0),
            sum_switch_cycles: AtomicU64::new(0),
            max_switch_cycles: AtomicU64::new(0),
        }
    }

    pub fn core_id(&self) -> u8 {
        self.core_id
    }

    pub fn current_task_ptr(&self) -> NonNull<Task> {
        NonNull::new(self.current_task.load(Ordering::Acquire))
            .expect("CpuCore.current_task is never null after construction")
    }

    pub fn idle_task_ptr(&self) -> NonNull<Task> {
        self.idle_task
    }

    /// Place a Ready task on this core's queue. Used both for initial
    /// placement in `create_task` and to re-home a migrated task drained
    /// from `incoming`.
    pub fn add_task(&self, task: NonNull<Task>) -> bool {
        let added = self.ready_queue.lock().enqueue(task);
        if added {
            self.task_count.fetch_add(1, Ordering::Relaxed);
        }
        added
    }

    /// Remove a task from this core's ready queue if it is sitting there.
    /// Used by `destroy_task`'s same-core fast path.
    pub fn remove_task(&self, task: NonNull<Task>) -> bool {
        let removed = self.ready_queue.lock().remove(task);
        if removed {
            self.task_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Hand a task to this core for migration. Fails (returns `false`) if
    /// another donor's handoff is still pending drain -- the caller is
    /// expected to keep the task locally and try again on a later balance
    /// pass rather than block.
    pub(super) fn offer_incoming(&self, task: NonNull<Task>) -> bool {
        self.incoming
            .compare_exchange(
                core::ptr::null_mut(),
                task.as_ptr(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Pull the least-urgent ready task eligible to run on `target_cpu` off
    /// this core's own queue. Per §5, a core only ever donates from its own
    /// queue during load balancing -- never reaches into another core's.
    pub(super) fn take_migration_victim(&self, target_cpu: u8) -> Option<NonNull<Task>> {
        let victim = self
            .ready_queue
            .lock()
            .take_lowest_priority(&|ptr| {
                // SAFETY: queue lock excludes concurrent removal of `ptr`
                // while this predicate runs.
                unsafe { ptr.as_ref() }.can_run_on(target_cpu)
            });
        if victim.is_some() {
            self.task_count.fetch_sub(1, Ordering::Relaxed);
        }
        victim
    }

    /// Ready-task count, the scheduler's load-balancing weight. Intentionally
    /// simple (§9 O1 leaves the exact weighting to the implementation): count
    /// alone is enough to trigger migration under sustained imbalance without
    /// needing per-task runtime estimates this kernel has no way to predict.
    pub fn load_score(&self) -> u32 {
        self.task_count.load(Ordering::Relaxed) as u32
    }

    pub fn switch_count(&self) -> u64 {
        self.switch_count.load(Ordering::Relaxed)
    }

    pub fn mean_switch_cycles(&self) -> u64 {
        let n = self.switch_count.load(Ordering::Relaxed);
        if n == 0 {
            0
        } else {
            self.sum_switch_cycles.load(Ordering::Relaxed) / n
        }
    }

    pub fn max_switch_cycles(&self) -> u64 {
        self.max_switch_cycles.load(Ordering::Relaxed)
    }

    /// Run the dispatch algorithm once: reclaim what the previous call
    /// retired, drain an inbound migration, pick the next task, and switch
    /// to it if it differs from the one currently running.
    ///
    /// # Safety (caller contract)
    /// Must run with interrupts masked on this core -- `switch_context`
    /// cannot tolerate being re-entered mid-save. The timer handler runs on
    /// an interrupt gate (IF cleared on entry) and `global::yield_now`/
    /// `global::schedule_next` mask interrupts themselves with
    /// `arch::x86_64::disable_interrupts`'s RAII guard before calling this;
    /// any other caller must do the same.
    pub fn schedule(&self) {
        let t0 = cycles::read_cycle();

        let retiring = self.retiring_id.swap(0, Ordering::AcqRel);
        if retiring != 0 {
            super::global::task_table().destroy(retiring);
        }

        let incoming = self.incoming.swap(core::ptr::null_mut(), Ordering::AcqRel);
        if let Some(task) = NonNull::new(incoming) {
            self.add_task(task);
        }

        let next = self.dequeue_next();
        let next = next.unwrap_or(self.idle_task);
        let prev = self.current_task_ptr();

        if next == prev {
            return;
        }

        if prev != self.idle_task {
            // SAFETY: `prev` is this core's own current_task; only this
            // core mutates a task's state/stats while it owns it.
            let prev_ref = unsafe { prev.as_ref() };
            match prev_ref.state() {
                TaskState::Running => {
                    prev_ref.set_state(TaskState::Ready);
                    let enqueued = self.ready_queue.lock().enqueue(prev);
                    debug_assert!(enqueued, "ready queue full re-enqueuing preempted task");
                }
                TaskState::Terminated => {
                    self.task_count.fetch_sub(1, Ordering::Relaxed);
                    self.retiring_id.store(prev_ref.id, Ordering::Release);
                }
                TaskState::Blocked => {
                    // Caller already transitioned prev to Blocked before
                    // invoking schedule(); nothing left to do here.
                }
                TaskState::Ready => {
                    debug_assert!(false, "current_task observed already Ready");
                }
            }
            let last_resumed = prev_ref.stats.last_resumed_at.load(Ordering::Relaxed);
            prev_ref
                .stats
                .runtime_cycles
                .fetch_add(cycles::elapsed(last_resumed, t0), Ordering::Relaxed);
        }

        // SAFETY: `next` is either the idle task (lives for the kernel's
        // entire lifetime) or was just dequeued from this core's own ready
        // queue, so it cannot be `current_task` anywhere else (P7).
        let next_ref = unsafe { next.as_ref() };
        next_ref.set_state(TaskState::Running);
        next_ref.stats.last_resumed_at.store(t0, Ordering::Relaxed);
        self.current_task.store(next.as_ptr(), Ordering::Release);

        // SAFETY: prev/next are distinct, valid, live `Task` pointers; the
        // caller's contract guarantees interrupts are masked around this
        // call.
        unsafe {
            context::switch_context(&mut (*prev.as_ptr()).context, &(*next.as_ptr()).context);
        }

        let t1 = cycles::read_cycle();
        let elapsed = cycles::elapsed(t0, t1);
        self.switch_count.fetch_add(1, Ordering::Relaxed);
        self.sum_switch_cycles.fetch_add(elapsed, Ordering::Relaxed);
        self.max_switch_cycles.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Dequeue the next eligible task, reclaiming any Terminated task found
    /// along the way (safe immediately: a task dequeued from a ready queue
    /// cannot simultaneously be anyone's `current_task`, per P7).
    fn dequeue_next(&self) -> Option<NonNull<Task>> {
        let mut queue = self.ready_queue.lock();
        loop {
            let candidate = queue.dequeue()?;
            // SAFETY: queue lock excludes concurrent removal while this
            // reads the candidate's state.
            if unsafe { candidate.as_ref() }.state() == TaskState::Terminated {
                self.task_count.fetch_sub(1, Ordering::Relaxed);
                let id = unsafe { candidate.as_ref() }.id;
                super::global::task_table().destroy(id);
                continue;
            }
            return Some(candidate);
        }
    }

    /// Entry point for the timer interrupt handler.
    pub fn on_timer_interrupt(&self) {
        self.schedule();
    }

    /// Terminate the currently running task and never return to it.
    pub fn handle_task_exit(&self) -> ! {
        let current = self.current_task_ptr();
        // SAFETY: `current` is this core's own current_task.
        unsafe { current.as_ref() }.set_state(TaskState::Terminated);
        self.schedule();
        unreachable!("a terminated task's context is never resumed")
    }
}

#[cfg(test)]
mod tests {
    use std::boxed::Box;

    use super::*;
    use super::super::task::{CpuSet, Priority};

    extern "C" fn dummy_entry(_: usize) -> ! {
        loop {}
    }

    fn leaked_task(id: u64, priority: Priority, affinity: CpuSet) -> NonNull<Task> {
        let _ = crate::mm::init();
        let task = Task::new(id, priority, dummy_entry, 0, 8192, 0, affinity).unwrap();
        NonNull::from(Box::leak(Box::new(task)))
    }

    fn fresh_core(core_id: u8) -> CpuCore {
        let idle = leaked_task(u64::MAX - core_id as u64, Priority::Idle, CpuSet::all());
        CpuCore::new(core_id, idle)
    }

    #[test]
    fn add_task_increments_load_score() {
        let core = fresh_core(0);
        assert_eq!(core.load_score(), 0);
        let t = leaked_task(1, Priority::Normal, CpuSet::all());
        assert!(core.add_task(t));
        assert_eq!(core.load_score(), 1);
    }

    #[test]
    fn remove_task_decrements_load_score_only_if_present() {
        let core = fresh_core(0);
        let t = leaked_task(2, Priority::Normal, CpuSet::all());
        assert!(!core.remove_task(t));
        core.add_task(t);
        assert!(core.remove_task(t));
        assert_eq!(core.load_score(), 0);
        assert!(!core.remove_task(t));
    }

    #[test]
    fn take_migration_victim_respects_target_affinity() {
        let core = fresh_core(0);
        let pinned = leaked_task(3, Priority::Normal, CpuSet::single(0));
        let portable = leaked_task(4, Priority::Normal, CpuSet::all());
        core.add_task(pinned);
        core.add_task(portable);

        // Only `portable` is eligible to run on cpu 1; the pinned task must
        // be skipped over, not migrated.
        let victim = core.take_migration_victim(1).unwrap();
        assert_eq!(victim, portable);
        assert_eq!(core.load_score(), 1);
    }

    #[test]
    fn take_migration_victim_empty_queue_returns_none() {
        let core = fresh_core(0);
        assert!(core.take_migration_victim(1).is_none());
    }

    #[test]
    fn offer_incoming_fails_while_a_handoff_is_undrained() {
        let core = fresh_core(0);
        let a = leaked_task(5, Priority::Normal, CpuSet::all());
        let b = leaked_task(6, Priority::Normal, CpuSet::all());
        assert!(core.offer_incoming(a));
        assert!(!core.offer_incoming(b));
    }
}
