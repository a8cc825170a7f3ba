//! Thin re-export layer over the x86_64 context-switch primitive.
//!
//! This crate targets x86_64 only, so unlike the multi-arch dispatch this
//! module used to do, there is nothing to select between -- callers reach
//! for `crate::arch::x86_64::context` directly. Kept as a module boundary
//! so scheduler code doesn't need to know the arch path.

pub use crate::arch::x86_64::context::{
    init_fpu, restore_fpu_state, save_fpu_state, switch_context, CpuContext, FPU_STATE_SIZE,
};
