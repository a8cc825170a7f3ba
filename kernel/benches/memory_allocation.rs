//! Memory allocation benchmark.
//!
//! Measures the speed of the fixed-block pool allocator at a few
//! representative stack sizes, plus deallocation (pool free-list push).

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use trade_kernel::{exit_qemu, mm, serial_println, BenchmarkRunner, QemuExitCode};

const TARGET_NS: u64 = 1000;

#[no_mangle]
pub extern "C" fn _start() -> ! {
    serial_println!("Memory Allocation Benchmark");
    serial_println!("===========================");
    serial_println!("Target: < {} ns", TARGET_NS);
    serial_println!();

    mm::init().expect("memory subsystem init failed");

    let runner = BenchmarkRunner::new();

    let small = runner.run_benchmark("alloc 4KiB stack", || {
        let stack = mm::Stack::allocate(4096, 0).expect("pool exhausted");
        core::hint::black_box(&stack);
    });
    let medium = runner.run_benchmark("alloc 16KiB stack", || {
        let stack = mm::Stack::allocate(16 * 1024, 0).expect("pool exhausted");
        core::hint::black_box(&stack);
    });
    let large = runner.run_benchmark("alloc 64KiB stack", || {
        let stack = mm::Stack::allocate(64 * 1024, 0).expect("pool exhausted");
        core::hint::black_box(&stack);
    });

    serial_println!("\nTarget analysis:");
    check_target("4KiB", small.avg_time_ns, TARGET_NS);
    check_target("16KiB", medium.avg_time_ns, TARGET_NS);
    check_target("64KiB", large.avg_time_ns, TARGET_NS * 2);

    exit_qemu(QemuExitCode::Success)
}

fn check_target(name: &str, avg_ns: u64, target_ns: u64) {
    if avg_ns < target_ns {
        serial_println!("{:<12} PASS ({}ns < {}ns)", name, avg_ns, target_ns);
    } else {
        serial_println!("{:<12} FAIL ({}ns >= {}ns)", name, avg_ns, target_ns);
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("Benchmark panic: {}", info);
    exit_qemu(QemuExitCode::Failed)
}
