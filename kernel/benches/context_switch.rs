//! Context switch benchmark.
//!
//! Two tasks ping-pong on a single core via `yield_now`; the scheduler's
//! own per-core switch accounting (`CpuCore::mean_switch_cycles` /
//! `max_switch_cycles`) gives the measurement, so this drives real
//! `switch_context` calls rather than a synthetic register save/restore.

#![no_std]
#![no_main]

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use trade_kernel::sched::{self, global, CpuSet, Priority};
use trade_kernel::{arch, exit_qemu, mm, serial_println, QemuExitCode};

const TARGET_NS: u64 = 10_000;
const ITERATIONS: usize = 1000;

static REMAINING: AtomicUsize = AtomicUsize::new(2 * ITERATIONS);
static DONE: [AtomicBool; 2] = [AtomicBool::new(false), AtomicBool::new(false)];

extern "C" fn pong(surrogate_id: usize) -> ! {
    while REMAINING.fetch_sub(1, Ordering::AcqRel) > 0 {
        sched::yield_now();
    }
    DONE[surrogate_id].store(true, Ordering::Release);
    global::core(0).unwrap().handle_task_exit();
}

#[no_mangle]
pub extern "C" fn _start() -> ! {
    serial_println!("Context Switch Benchmark");
    serial_println!("========================");
    serial_println!("Target: < {} ns", TARGET_NS);
    serial_println!();

    arch::init();
    arch::x86_64::context::init_fpu();
    mm::init().expect("memory subsystem init failed");
    sched::init(1).expect("scheduler init failed");

    sched::create_task(Priority::Normal, pong, 0, 0, 0, CpuSet::single(0)).expect("create task 0");
    sched::create_task(Priority::Normal, pong, 1, 0, 0, CpuSet::single(0)).expect("create task 1");

    while !(DONE[0].load(Ordering::Acquire) && DONE[1].load(Ordering::Acquire)) {
        sched::schedule_next();
    }

    let core = global::core(0).unwrap();
    let mean_ns = to_ns(core.mean_switch_cycles());
    let max_ns = to_ns(core.max_switch_cycles());

    serial_println!("Switches: {}", core.switch_count());
    serial_println!("Mean: {} ns, Max: {} ns", mean_ns, max_ns);

    if mean_ns < TARGET_NS {
        serial_println!("PASS ({}ns < {}ns)", mean_ns, TARGET_NS);
    } else {
        serial_println!("FAIL ({}ns >= {}ns)", mean_ns, TARGET_NS);
    }

    exit_qemu(QemuExitCode::Success)
}

fn to_ns(cycles: u64) -> u64 {
    trade_kernel::cycles_to_ns(cycles)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("Benchmark panic: {}", info);
    exit_qemu(QemuExitCode::Failed)
}
