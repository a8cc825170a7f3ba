//! Earliest-possible bring-up, run before `arch::x86_64::init`'s GDT/IDT
//! setup even has a chance to be preempted.

/// Mask interrupts and emit the boot banner. Safe to call before the GDT,
/// IDT, or any subsystem below `arch` exists -- `println!` only depends on
/// `serial::SERIAL1`, which self-initializes on first use.
pub fn arch_early_init() {
    // SAFETY: cli takes no memory operand and only affects IF; always safe
    // this early, before any interrupt source is configured.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }

    crate::println!("trade-kernel v{}", env!("CARGO_PKG_VERSION"));
    crate::println!("[EARLY] x86_64 entry reached");
}
