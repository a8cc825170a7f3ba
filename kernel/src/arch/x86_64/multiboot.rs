//! Multiboot2 header: loader discoverability only.
//!
//! This embeds the tag structure a multiboot2-compliant loader (GRUB2 et
//! al.) scans for in the first 32KiB of the image to recognize it as
//! bootable and hand off control to `arch::x86_64::boot::kernel_main`. The
//! 32-bit-protected-mode bring-up, A20 line, and the jump into long mode
//! are the loader's job, not this crate's -- by the time `kernel_main`
//! runs, the CPU is already in 64-bit mode with a stack, which is this
//! kernel core's assumed starting point everywhere else.

use core::arch::global_asm;

/// Magic value a multiboot2 loader passes back in `%eax` on handoff,
/// confirming it recognized and processed the header below.
pub const MULTIBOOT2_BOOT_MAGIC: u32 = 0x36d76289;

global_asm!(
    r#"
.section .multiboot_header, "aw"
.align 8

multiboot_header_start:
    .long 0xe85250d6                                      // magic
    .long 0                                                // architecture: i386
    .long multiboot_header_end - multiboot_header_start    // header length
    .long -(0xe85250d6 + 0 + (multiboot_header_end - multiboot_header_start))

    // end tag
    .word 0
    .word 0
    .long 8
multiboot_header_end:
"#
);

/// True if `magic` is what a multiboot2 loader hands back on successful
/// handoff; `false` means `kernel_main` was entered some other way (direct
/// QEMU `-kernel` load without a multiboot2-aware loader, a test harness,
/// etc.) and `info_addr` should not be trusted as a multiboot2 info
/// structure.
pub fn verify_magic(magic: u32) -> bool {
    magic == MULTIBOOT2_BOOT_MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_only_the_documented_magic() {
        assert!(verify_magic(MULTIBOOT2_BOOT_MAGIC));
        assert!(!verify_magic(0));
        assert!(!verify_magic(MULTIBOOT2_BOOT_MAGIC.wrapping_add(1)));
    }
}
