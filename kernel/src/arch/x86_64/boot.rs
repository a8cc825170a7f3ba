//! Shared boot sequence, entered either from the multiboot2 path
//! ([`kernel_main`]) or directly from the binary's own `_start` when the
//! image is loaded without a multiboot2-aware loader (e.g. QEMU `-kernel`).
//!
//! Wiring `kernel_main` up as the ELF entry point for a real multiboot2
//! loader is a linker-script/build-system concern outside this crate's
//! source tree; this module only provides the symbol and the magic check.

use super::{context, entry, multiboot, timer};
use crate::{arch, log_service, mm, sched};

/// Multiboot2 entry point. `info_addr` (the physical address of the
/// multiboot2 information structure the loader built) is accepted but
/// unused -- this kernel core has no use yet for memory maps or module
/// lists from that structure; it exists so the signature matches what a
/// multiboot2 loader actually calls with.
#[no_mangle]
pub extern "C" fn kernel_main(magic: u32, info_addr: u64) -> ! {
    let _ = info_addr;
    if !multiboot::verify_magic(magic) {
        crate::println!("[EARLY] warning: unrecognized boot magic {magic:#x}, proceeding anyway");
    }
    run()
}

/// The actual bring-up sequence, shared by [`kernel_main`] and the
/// binary's own `_start`. Never returns.
pub fn run() -> ! {
    entry::arch_early_init();

    arch::init();
    context::init_fpu();

    mm::init().expect("memory subsystem init failed");
    log_service::log_init();
    log_service::install_log_facade(log::LevelFilter::Info);

    let cycles_a = super::cycles::read_cycle();
    let cycles_b = super::cycles::read_cycle();
    debug_assert!(cycles_b >= cycles_a, "TSC must not run backwards across two back-to-back reads");

    // This kernel core never brings up application processors (SIPI/INIT is
    // firmware-sequencing territory, out of scope); one CpuCore is all the
    // hardware this binary itself boots on.
    sched::init(1).expect("scheduler init failed");
    crate::spawn_initial_tasks();

    timer::setup_timer(10);
    arch::enable_interrupts();

    log::info!("boot: kernel core initialized");

    // Halt-waits via the per-core idle task (`sched::global::idle_entry`,
    // which calls `arch::idle()`) whenever nothing else is ready -- this
    // loop itself never needs to halt directly.
    loop {
        sched::schedule_next();
    }
}
