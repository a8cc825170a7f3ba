//! Kernel core library: NUMA-aware memory pools, the tickless
//! priority-preemptive scheduler, and the task abstraction binding them
//! together.
//!
//! Bootloader handoff, BIOS/UEFI bring-up, paging setup, and user-facing
//! device drivers are all out of scope -- this crate picks up from a CPU
//! already in long mode with a stack and builds the three pillars above on
//! top of it.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
// Custom test runner only for bare-metal; host target uses the standard
// #[test] harness.
#![cfg_attr(target_os = "none", test_runner(crate::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]

// Host target (e.g. for `cargo test --lib`): use std so unit tests scattered
// through the bare-metal modules can allocate scratch `Vec`/`Box` state.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod error;
pub mod log_service;
pub mod mm;
pub mod sched;
pub mod sync;

mod test_framework;

pub use error::{KernelError, KernelResult};
pub use sched::{CpuSet, Priority, TaskId, TaskState};
#[cfg(test)]
pub use test_framework::test_runner;
pub use test_framework::{
    cycles_to_ns, exit_qemu, read_timestamp, test_panic_handler, BenchmarkRunner, QemuExitCode,
    Testable,
};

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Hook called once from the boot sequence (`arch::x86_64::boot::run`)
/// right after the scheduler is up, before interrupts are enabled. Task
/// *bodies* are workload-specific and out of this kernel core's scope, so
/// the default does nothing; an embedder wanting a running system edits
/// this function to `sched::create_task` whatever it needs.
pub fn spawn_initial_tasks() {}
