//! Local APIC driver.
//!
//! Additive to the legacy 8259 PIC setup in the parent module -- the PIC
//! remains this kernel core's default timer source (see `timer.rs`); this
//! module exists so a caller who wants APIC-based timing or cross-CPU IPIs
//! has one, per SPEC_FULL.md's "8259 or APIC" wording for the boot
//! sequence's timer step.
//!
//! The Local APIC is memory-mapped at 0xFEE0_0000. This kernel core never
//! leaves identity mapping (no higher-half relocation, no bootloader
//! physical-memory offset), so unlike a kernel with its own page tables this
//! driver reads/writes that physical address directly -- there is no
//! `phys_to_virt` translation to perform. The I/O APIC and external-IRQ
//! routing are out of scope: this crate never brings up a second core via
//! SIPI/INIT, so there is no interrupt source that needs routing to
//! anywhere other than the boot CPU's own LVT/IDT.

use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use super::msr::{rdmsr, wrmsr};
use crate::error::{KernelError, KernelResult};
use crate::sync::once_lock::GlobalState;

/// IA32_APIC_BASE MSR address: holds the APIC's physical base and the
/// global enable bit.
const IA32_APIC_BASE_MSR: u32 = 0x1B;
/// Bit 11 of IA32_APIC_BASE: global APIC enable.
const IA32_APIC_BASE_ENABLE: u64 = 1 << 11;

/// Default Local APIC MMIO base (identity-mapped; QEMU and real hardware
/// both reset to this address unless relocated via IA32_APIC_BASE).
const LAPIC_DEFAULT_BASE: usize = 0xFEE0_0000;

const LAPIC_ID: u32 = 0x020;
const LAPIC_TPR: u32 = 0x080;
const LAPIC_EOI: u32 = 0x0B0;
const LAPIC_SVR: u32 = 0x0F0;
const LAPIC_ICR_LOW: u32 = 0x300;
const LAPIC_ICR_HIGH: u32 = 0x310;
const LAPIC_LVT_TIMER: u32 = 0x320;
const LAPIC_LVT_LINT0: u32 = 0x350;
const LAPIC_LVT_LINT1: u32 = 0x360;
const LAPIC_LVT_ERROR: u32 = 0x370;
const LAPIC_TIMER_INIT_COUNT: u32 = 0x380;
const LAPIC_TIMER_DIV: u32 = 0x3E0;

/// LVT mask bit (bit 16): 1 silences that entry.
const LVT_MASK: u32 = 1 << 16;
/// Spurious Interrupt Vector Register software-enable bit (bit 8).
const SVR_ENABLE: u32 = 1 << 8;
/// Conventional spurious vector.
const SPURIOUS_VECTOR: u8 = 0xFF;
/// Periodic timer mode, LVT Timer bits 18:17 = 01.
const TIMER_MODE_PERIODIC: u32 = 0b01 << 17;

/// Local APIC register file, accessed by volatile MMIO.
struct LocalApic {
    base: usize,
}

// SAFETY: `base` is a plain physical address; every access goes through
// volatile reads/writes and the handle lives behind `APIC` below, which
// serializes access.
unsafe impl Send for LocalApic {}

impl LocalApic {
    fn read(&self, offset: u32) -> u32 {
        let addr = self.base + offset as usize;
        // SAFETY: `addr` is a well-known Local APIC register inside the
        // identity-mapped MMIO page at `self.base`.
        unsafe { ptr::read_volatile(addr as *const u32) }
    }

    fn write(&self, offset: u32, value: u32) {
        let addr = self.base + offset as usize;
        // SAFETY: same as `read`; volatile write so the compiler can't
        // elide or reorder the store past other MMIO accesses.
        unsafe { ptr::write_volatile(addr as *mut u32, value) }
    }

    fn read_id(&self) -> u8 {
        ((self.read(LAPIC_ID) >> 24) & 0xFF) as u8
    }

    fn mask_all_lvt(&self) {
        self.write(LAPIC_LVT_TIMER, LVT_MASK);
        self.write(LAPIC_LVT_LINT0, LVT_MASK);
        self.write(LAPIC_LVT_LINT1, LVT_MASK);
        self.write(LAPIC_LVT_ERROR, LVT_MASK);
    }

    fn enable(&self) {
        self.write(LAPIC_SVR, SVR_ENABLE | SPURIOUS_VECTOR as u32);
    }

    fn set_task_priority(&self, priority: u8) {
        self.write(LAPIC_TPR, priority as u32);
    }

    fn send_eoi(&self) {
        self.write(LAPIC_EOI, 0);
    }

    fn setup_timer(&self, vector: u8, divide: u8, initial_count: u32) {
        self.write(LAPIC_TIMER_INIT_COUNT, 0);
        self.write(LAPIC_TIMER_DIV, divide as u32);
        self.write(LAPIC_LVT_TIMER, TIMER_MODE_PERIODIC | vector as u32);
        self.write(LAPIC_TIMER_INIT_COUNT, initial_count);
    }

    fn stop_timer(&self) {
        self.write(LAPIC_TIMER_INIT_COUNT, 0);
        self.write(LAPIC_LVT_TIMER, LVT_MASK);
    }

    /// Write the ICR to send an IPI. High dword carries the destination,
    /// low dword the vector plus delivery mode (Fixed); writing the low
    /// dword last is what actually triggers delivery.
    fn send_ipi(&self, dest_apic_id: u8, vector: u8) {
        self.write(LAPIC_ICR_HIGH, (dest_apic_id as u32) << 24);
        self.write(LAPIC_ICR_LOW, vector as u32);
    }
}

static APIC: GlobalState<LocalApic> = GlobalState::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Bring up the Local APIC: read its MMIO base from
/// `IA32_APIC_BASE`, ensure the global enable bit is set, mask every LVT
/// entry, then software-enable it with the spurious vector and an
/// all-priorities-accepted TPR.
///
/// Idempotent in the `AlreadyExists`-on-second-call sense every other
/// subsystem `init()` in this crate follows; safe to call from a single
/// bootstrapping core only (no cross-CPU synchronization here, matching
/// this crate never bringing up application processors).
pub fn init() -> KernelResult<()> {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return Err(KernelError::AlreadyExists { subsystem: "apic" });
    }

    let base_msr = rdmsr(IA32_APIC_BASE_MSR);
    if base_msr & IA32_APIC_BASE_ENABLE == 0 {
        wrmsr(IA32_APIC_BASE_MSR, base_msr | IA32_APIC_BASE_ENABLE);
    }
    let base = (base_msr & 0xFFFF_F000) as usize;
    let base = if base == 0 { LAPIC_DEFAULT_BASE } else { base };

    let lapic = LocalApic { base };
    lapic.mask_all_lvt();
    lapic.enable();
    lapic.set_task_priority(0);

    APIC.init(lapic)
        .map_err(|_| KernelError::AlreadyExists { subsystem: "apic" })
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Read this CPU's Local APIC id. `None` if `init()` has not run.
pub fn read_id() -> Option<u8> {
    APIC.with(|a| a.read_id())
}

/// Signal end-of-interrupt for the vector an APIC-driven handler just
/// serviced. No-op if `init()` has not run.
pub fn send_eoi() {
    APIC.with(|a| a.send_eoi());
}

/// Program the LVT Timer for periodic interrupts on `vector`, dividing the
/// bus clock by `divide`'s encoded ratio and reloading from
/// `initial_count` each period. No-op if `init()` has not run.
pub fn setup_timer(vector: u8, divide: u8, initial_count: u32) {
    APIC.with(|a| a.setup_timer(vector, divide, initial_count));
}

/// Stop the LVT Timer. No-op if `init()` has not run.
pub fn stop_timer() {
    APIC.with(|a| a.stop_timer());
}

/// Send a fixed-delivery-mode IPI to `dest_apic_id` on `vector`.
///
/// `dest_apic_id` must be a real hardware Local APIC id, not a logical
/// core index -- `sched::global`'s core ids (from `topology::logical_cpu_id`)
/// are logical, and this crate maintains no logical-to-physical mapping
/// table, so `sched::global::balance_load` intentionally does not call this.
/// No-op if `init()` has not run.
pub fn send_ipi(dest_apic_id: u8, vector: u8) {
    APIC.with(|a| a.send_ipi(dest_apic_id, vector));
}

#[cfg(test)]
mod tests {
    use super::*;

    // APIC registers are real MMIO; nothing here can be exercised on a host
    // test target (and `init()` must never run outside a booted kernel, so
    // this intentionally never calls it). This only pins down that every
    // accessor is safely inert before `init()` has run.
    #[test]
    fn uninitialized_reads_return_none_and_writes_are_quiet() {
        assert!(!is_initialized());
        assert_eq!(read_id(), None);
        send_eoi();
        setup_timer(32, 0x03, 1);
        stop_timer();
        send_ipi(0, 32);
    }
}
