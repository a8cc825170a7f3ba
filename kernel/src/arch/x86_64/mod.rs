//! x86_64 architecture support.
//!
//! Provides hardware initialization (GDT, IDT, legacy PIC), interrupt
//! control, serial I/O (COM1 at 0x3F8), and cycle-counter access for the
//! platform this kernel core targets. Bootloader handoff and BIOS/UEFI
//! bring-up are assumed to have already happened by the time `_start` runs
//! -- this kernel core picks up from a CPU already in long mode with a
//! stack, which is the interface this module's `init()` builds on.

#![allow(clippy::missing_safety_doc)]

pub mod apic;
pub mod boot;
pub mod context;
pub mod cycles;
pub mod entry;
pub mod gdt;
pub mod idt;
pub mod msr;
pub mod multiboot;
pub mod serial;
pub mod timer;
pub mod topology;

use spin::Mutex;

/// The legacy 8259 PIC pair, remapped so IRQ0..15 land on vectors 32..47.
pub static PICS: Mutex<pic8259::ChainedPics> =
    Mutex::new(unsafe { pic8259::ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;
/// Interrupt vector the Local APIC timer is programmed to fire on.
pub const TIMER_VECTOR: u8 = PIC_1_OFFSET;

/// Early architecture bring-up: GDT, IDT, legacy PIC masked off.
///
/// Interrupts stay disabled on return; the caller enables them once the
/// scheduler and its idle tasks exist.
pub fn init() {
    // SAFETY: cli disables interrupts; required before touching the GDT/IDT
    // so no handler can fire mid-setup. No memory access.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }

    gdt::init();
    idt::init();

    // SAFETY: initialize() programs ICW1-ICW4 on the 8259 pair and leaves
    // every IRQ line masked; no handler is registered yet to receive them.
    unsafe {
        PICS.lock().initialize();
    }
    disable_all_legacy_irqs();
}

fn disable_all_legacy_irqs() {
    // SAFETY: writing 0xFF to both PIC data ports masks every legacy IRQ
    // line. Defined behavior per the 8259 datasheet.
    unsafe {
        use x86_64::instructions::port::Port;
        Port::<u8>::new(0x21).write(0xFFu8);
        Port::<u8>::new(0xA1).write(0xFFu8);
    }
}

/// Halt the CPU permanently. Used by fatal/panic paths.
pub fn halt() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

/// Enable hardware interrupts.
pub fn enable_interrupts() {
    x86_64::instructions::interrupts::enable();
}

/// RAII guard: disables interrupts now, restores the prior state on drop.
pub fn disable_interrupts() -> impl Drop {
    struct InterruptGuard {
        was_enabled: bool,
    }

    impl Drop for InterruptGuard {
        fn drop(&mut self) {
            if self.was_enabled {
                x86_64::instructions::interrupts::enable();
            }
        }
    }

    let was_enabled = x86_64::instructions::interrupts::are_enabled();
    x86_64::instructions::interrupts::disable();
    InterruptGuard { was_enabled }
}

/// Put the CPU to sleep until the next interrupt.
pub fn idle() {
    x86_64::instructions::hlt();
}

/// Serializing barrier, used to mitigate speculative-execution side
/// channels around privilege-sensitive reads.
#[inline(always)]
pub fn speculation_barrier() {
    // SAFETY: lfence serializes instruction execution; no memory side
    // effects, flags preserved.
    unsafe {
        core::arch::asm!("lfence", options(nostack, nomem, preserves_flags));
    }
}

pub fn serial_init() -> uart_16550::SerialPort {
    // SAFETY: SerialPort::new(0x3F8) addresses the standard COM1 I/O base;
    // the port is initialized immediately after construction.
    let mut serial_port = unsafe { uart_16550::SerialPort::new(0x3F8) };
    serial_port.init();
    serial_port
}

#[allow(dead_code)]
pub unsafe fn outb(port: u16, value: u8) {
    x86_64::instructions::port::Port::new(port).write(value);
}

#[allow(dead_code)]
pub unsafe fn inb(port: u16) -> u8 {
    x86_64::instructions::port::Port::new(port).read()
}
