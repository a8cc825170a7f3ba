//! x86_64 CPU context record and the `switch_context` primitive.
//!
//! Field order below is the hard ABI the assembly in [`context_switch`]
//! and [`load_context`] reads and writes; every offset used there is
//! derived from this declaration and re-checked by the const assertions
//! at the bottom of the file. The FPU/SIMD save area is the first field so
//! that the struct's own 64-byte alignment (required by `fxsave`) places
//! it at a 64-aligned address with no padding games.

use core::arch::asm;

/// FXSAVE/FXRSTOR area. 512 bytes, 64-byte aligned. Extended state beyond
/// legacy x87/SSE (AVX etc.) is out of scope: this kernel's workloads are
/// expected to stick to SSE2, and XSAVE support is not assumed present.
pub const FPU_STATE_SIZE: usize = 512;

#[repr(C, align(64))]
#[derive(Clone)]
pub struct CpuContext {
    pub fpu_state: [u8; FPU_STATE_SIZE],

    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,

    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cr3: u64,

    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
}

/// RFLAGS with the interrupt-enable bit set and the reserved bit 1 set,
/// matching the CPU's power-on default layout.
const RFLAGS_IF: u64 = 0x202;

const KERNEL_CS: u16 = 0x08;
const KERNEL_DS: u16 = 0x10;

impl CpuContext {
    /// Build a context for a brand-new task whose instruction pointer is
    /// the trampoline: stack pointer at the top of the stack minus one
    /// machine word, base pointer equal to the stack pointer, flags with
    /// interrupts enabled, FPU state at its reset value. The trampoline
    /// receives `argument` in `rdi` and the real task entry point in `rsi`,
    /// following the System V argument order.
    pub fn new_task(trampoline: usize, stack_top: usize, entry: usize, argument: usize) -> Self {
        let rsp = (stack_top - core::mem::size_of::<u64>()) as u64;
        let mut ctx = Self {
            fpu_state: [0u8; FPU_STATE_SIZE],
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: argument as u64,
            rsi: entry as u64,
            rbp: rsp,
            rbx: 0,
            rdx: 0,
            rcx: 0,
            rax: 0,
            rsp,
            rip: trampoline as u64,
            rflags: RFLAGS_IF,
            cr3: read_cr3(),
            cs: KERNEL_CS,
            ss: KERNEL_DS,
            ds: KERNEL_DS,
            es: KERNEL_DS,
            fs: 0,
            gs: 0,
        };
        init_fpu_reset_image(&mut ctx.fpu_state);
        ctx
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self {
            fpu_state: [0u8; FPU_STATE_SIZE],
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: 0,
            rsi: 0,
            rbp: 0,
            rbx: 0,
            rdx: 0,
            rcx: 0,
            rax: 0,
            rsp: 0,
            rip: 0,
            rflags: RFLAGS_IF,
            cr3: 0,
            cs: KERNEL_CS,
            ss: KERNEL_DS,
            ds: KERNEL_DS,
            es: KERNEL_DS,
            fs: 0,
            gs: 0,
        }
    }
}

impl CpuContext {
    pub fn instruction_pointer(&self) -> usize {
        self.rip as usize
    }

    pub fn set_instruction_pointer(&mut self, ip: usize) {
        self.rip = ip as u64;
    }

    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }

    pub fn set_return_value(&mut self, value: usize) {
        self.rax = value as u64;
    }
}

// SAFETY: a CpuContext is only ever mutated by the CPU core that owns the
// task it belongs to (or, during `switch_context`, by the two cooperating
// halves of that single call); nothing aliases it across cores.
unsafe impl Send for CpuContext {}
unsafe impl Sync for CpuContext {}

fn read_cr3() -> u64 {
    let cr3: u64;
    // SAFETY: reading CR3 is always valid in ring 0; no side effects.
    unsafe {
        asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
    }
    cr3
}

/// Initializes an FXSAVE-format save area to the state produced by
/// `fninit` plus default SSE control bits, so a task that never touches
/// the FPU still resumes into a well-defined state if it later does.
fn init_fpu_reset_image(area: &mut [u8; FPU_STATE_SIZE]) {
    // FCW (bytes 0-1): 0x037F is the x87 power-on default control word.
    area[0] = 0x7F;
    area[1] = 0x03;
    // MXCSR (bytes 24-27): 0x1F80 is the SSE power-on default.
    area[24] = 0x80;
    area[25] = 0x1F;
}

const OFF_FPU: usize = 0;
const OFF_R15: usize = FPU_STATE_SIZE;
const OFF_RSP: usize = OFF_R15 + 15 * 8;
const OFF_RIP: usize = OFF_RSP + 8;
const OFF_RFLAGS: usize = OFF_RIP + 8;
const OFF_CR3: usize = OFF_RFLAGS + 8;

const _: () = assert!(OFF_R15 == core::mem::offset_of!(CpuContext, r15));
const _: () = assert!(OFF_RSP == core::mem::offset_of!(CpuContext, rsp));
const _: () = assert!(OFF_RIP == core::mem::offset_of!(CpuContext, rip));
const _: () = assert!(OFF_RFLAGS == core::mem::offset_of!(CpuContext, rflags));
const _: () = assert!(OFF_CR3 == core::mem::offset_of!(CpuContext, cr3));

/// Save the running context into `*current`, load `*next`, and transfer
/// control to it. Per §4.5, every general-purpose register, `rsp`, `rip`,
/// `rflags`, and `cr3` move through this routine; FPU state is handled
/// separately by [`save_fpu_state`]/[`restore_fpu_state`] around the call
/// site, since the scheduler only pays that cost for tasks that actually
/// touch the FPU.
///
/// # Safety
/// Must be called with scheduler-relevant interrupts masked; `current`
/// and `next` must both be valid, non-overlapping `CpuContext` pointers.
#[no_mangle]
pub unsafe extern "C" fn context_switch(current: *mut CpuContext, next: *const CpuContext) {
    // SAFETY: offsets below are derived from OFF_* consts, checked above
    // against the struct's real layout. `current`/`next` validity is the
    // caller's contract.
    unsafe {
        asm!(
            "mov [rdi + {r15}], r15",
            "mov [rdi + {r14}], r14",
            "mov [rdi + {r13}], r13",
            "mov [rdi + {r12}], r12",
            "mov [rdi + {r11}], r11",
            "mov [rdi + {r10}], r10",
            "mov [rdi + {r9}],  r9",
            "mov [rdi + {r8}],  r8",
            "mov [rdi + {rdi}], rdi",
            "mov [rdi + {rsi}], rsi",
            "mov [rdi + {rbp}], rbp",
            "mov [rdi + {rbx}], rbx",
            "mov [rdi + {rdx}], rdx",
            "mov [rdi + {rcx}], rcx",
            "mov [rdi + {rax}], rax",
            "mov [rdi + {rsp}], rsp",
            "lea rax, [rip + 1f]",
            "mov [rdi + {rip}], rax",
            "pushfq",
            "pop qword ptr [rdi + {rflags}]",

            "mov rax, [rsi + {cr3}]",
            "mov rcx, cr3",
            "cmp rax, rcx",
            "je 2f",
            "mov cr3, rax",
            "2:",

            "mov r15, [rsi + {r15}]",
            "mov r14, [rsi + {r14}]",
            "mov r13, [rsi + {r13}]",
            "mov r12, [rsi + {r12}]",
            "mov r11, [rsi + {r11}]",
            "mov r10, [rsi + {r10}]",
            "mov r9,  [rsi + {r9}]",
            "mov r8,  [rsi + {r8}]",
            "mov rbp, [rsi + {rbp}]",
            "mov rbx, [rsi + {rbx}]",
            "mov rdx, [rsi + {rdx}]",
            "mov rcx, [rsi + {rcx}]",
            "mov rax, [rsi + {rax}]",
            "mov rdi, [rsi + {rdi}]",

            "push qword ptr [rsi + {rflags}]",
            "popfq",
            "mov rsp, [rsi + {rsp}]",
            "push qword ptr [rsi + {rip}]",
            "mov rsi, [rsi + {rsi}]",
            "ret",
            "1:",

            r15 = const OFF_R15,
            r14 = const OFF_R15 + 8,
            r13 = const OFF_R15 + 16,
            r12 = const OFF_R15 + 24,
            r11 = const OFF_R15 + 32,
            r10 = const OFF_R15 + 40,
            r9 = const OFF_R15 + 48,
            r8 = const OFF_R15 + 56,
            rdi = const OFF_R15 + 64,
            rsi = const OFF_R15 + 72,
            rbp = const OFF_R15 + 80,
            rbx = const OFF_R15 + 88,
            rdx = const OFF_R15 + 96,
            rcx = const OFF_R15 + 104,
            rax = const OFF_R15 + 112,
            rsp = const OFF_RSP,
            rip = const OFF_RIP,
            rflags = const OFF_RFLAGS,
            cr3 = const OFF_CR3,
            in("rdi") current,
            in("rsi") next,
        );
    }
}

/// Safe wrapper around [`context_switch`]. Called from
/// `crate::arch::context::switch_context()`.
pub fn switch_context(from: &mut CpuContext, to: &CpuContext) {
    // SAFETY: `from`/`to` are valid, distinct references for the duration
    // of the call; the caller (the scheduler) masks interrupts around it.
    unsafe {
        context_switch(from as *mut _, to as *const _);
    }
}

/// Load a context with no previous context to save -- used to enter the
/// very first task on a core.
///
/// # Safety
/// Must be called with interrupts disabled; never returns.
#[no_mangle]
pub unsafe extern "C" fn load_context(context: *const CpuContext) -> ! {
    // SAFETY: same offset scheme as `context_switch`'s load half.
    unsafe {
        asm!(
            "mov rax, [rdi + {cr3}]",
            "mov cr3, rax",
            "mov r15, [rdi + {r15}]",
            "mov r14, [rdi + {r14}]",
            "mov r13, [rdi + {r13}]",
            "mov r12, [rdi + {r12}]",
            "mov r11, [rdi + {r11}]",
            "mov r10, [rdi + {r10}]",
            "mov r9,  [rdi + {r9}]",
            "mov r8,  [rdi + {r8}]",
            "mov rbp, [rdi + {rbp}]",
            "mov rbx, [rdi + {rbx}]",
            "mov rdx, [rdi + {rdx}]",
            "mov rcx, [rdi + {rcx}]",
            "mov rax, [rdi + {rax}]",
            "mov rsi, [rdi + {rsi}]",
            "push qword ptr [rdi + {rflags}]",
            "popfq",
            "mov rsp, [rdi + {rsp}]",
            "push qword ptr [rdi + {rip}]",
            "mov rdi, [rdi + {rdi}]",
            "ret",
            cr3 = const OFF_CR3,
            r15 = const OFF_R15,
            r14 = const OFF_R15 + 8,
            r13 = const OFF_R15 + 16,
            r12 = const OFF_R15 + 24,
            r11 = const OFF_R15 + 32,
            r10 = const OFF_R15 + 40,
            r9 = const OFF_R15 + 48,
            r8 = const OFF_R15 + 56,
            rdi = const OFF_R15 + 64,
            rsi = const OFF_R15 + 72,
            rbp = const OFF_R15 + 80,
            rbx = const OFF_R15 + 88,
            rdx = const OFF_R15 + 96,
            rcx = const OFF_R15 + 104,
            rax = const OFF_R15 + 112,
            rsp = const OFF_RSP,
            rip = const OFF_RIP,
            rflags = const OFF_RFLAGS,
            in("rdi") context,
            options(noreturn),
        );
    }
}

/// Save FPU/SSE state. Only called for tasks known to use the FPU, since
/// `fxsave`/`fxrstor` are not free.
pub fn save_fpu_state(area: &mut [u8; FPU_STATE_SIZE]) {
    // SAFETY: `area` is 64-byte aligned (embedded in a `CpuContext`, whose
    // repr forces that alignment) and large enough for FXSAVE's 512-byte
    // image.
    unsafe {
        asm!("fxsave [{}]", in(reg) area.as_mut_ptr(), options(nostack));
    }
}

pub fn restore_fpu_state(area: &[u8; FPU_STATE_SIZE]) {
    // SAFETY: same alignment/size argument as `save_fpu_state`; `area`
    // holds a previously-saved (or freshly reset) FXSAVE image.
    unsafe {
        asm!("fxrstor [{}]", in(reg) area.as_ptr(), options(nostack));
    }
}

/// Enable the FPU and SSE for the current CPU. Called once at boot before
/// any task's FPU state is touched.
pub fn init_fpu() {
    // SAFETY: flips EM/MP in CR0 and OSFXSR/OSXMMEXCPT in CR4, the
    // standard x86_64 sequence to enable hardware FP and SSE; `fninit`
    // resets the x87 unit. Run once, single-threaded, at boot.
    unsafe {
        asm!(
            "mov rax, cr0",
            "and ax, 0xFFFB",
            "or ax, 0x2",
            "mov cr0, rax",
            "mov rax, cr4",
            "or ax, 0x600",
            "mov cr4, rax",
            "fninit",
            out("rax") _,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_rsp_is_below_stack_top_and_word_aligned() {
        let ctx = CpuContext::new_task(0x1000, 0x8000, 0x2000, 42);
        assert!(ctx.rsp < 0x8000);
        assert_eq!(ctx.rsp % 8, 0);
        assert_eq!(ctx.rbp, ctx.rsp);
    }

    #[test]
    fn new_task_enables_interrupts_and_loads_argument_and_entry() {
        let ctx = CpuContext::new_task(0x1000, 0x8000, 0x2000, 0xdead);
        assert_eq!(ctx.rflags & 0x200, 0x200);
        assert_eq!(ctx.rdi, 0xdead);
        assert_eq!(ctx.rsi, 0x2000);
        assert_eq!(ctx.rip, 0x1000);
    }

    #[test]
    fn fpu_area_is_64_byte_aligned_within_context() {
        let ctx = CpuContext::default();
        let addr = ctx.fpu_state.as_ptr() as usize;
        assert_eq!(addr % 64, 0);
    }
}
