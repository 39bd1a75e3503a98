// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Helper functions for the Cortex-M architecture.
//!
//! Two masking primitives are provided. `save_and_set_interrupt_mask` raises
//! BASEPRI to [`INTERRUPT_MASK_CEILING`] and is the critical section used by
//! drivers. `disable_interrupts` sets PRIMASK; an interrupt held off by
//! PRIMASK still wakes the core from `wfi`, one held off by BASEPRI does not,
//! so the idle path sleeps under PRIMASK.
//!
//! On anything other than a bare-metal ARM target the registers are
//! simulated in atomics so that drivers can be exercised on the host.

/// Interrupts with a priority value numerically at or above this ceiling are
/// masked by [`save_and_set_interrupt_mask`].
///
/// The MT7697 implements 3 priority bits (the top bits of the byte).
pub const INTERRUPT_MASK_CEILING: u32 = 0x20;

/// Saved BASEPRI value returned by [`save_and_set_interrupt_mask`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterruptMask(u32);

impl InterruptMask {
    /// Raw BASEPRI value captured when the mask was taken.
    pub fn basepri(&self) -> u32 {
        self.0
    }
}

/// NOP instruction
#[cfg(any(doc, all(target_arch = "arm", target_os = "none")))]
#[inline(always)]
pub fn nop() {
    use core::arch::asm;
    unsafe {
        asm!("nop", options(nomem, nostack, preserves_flags));
    }
}

/// WFI instruction
#[cfg(any(doc, all(target_arch = "arm", target_os = "none")))]
#[inline(always)]
pub unsafe fn wfi() {
    use core::arch::asm;
    asm!("wfi", options(nomem, preserves_flags));
}

/// Data synchronization barrier
#[cfg(any(doc, all(target_arch = "arm", target_os = "none")))]
#[inline(always)]
pub fn dsb() {
    use core::arch::asm;
    unsafe {
        asm!("dsb sy", options(nostack, preserves_flags));
    }
}

/// Instruction synchronization barrier
#[cfg(any(doc, all(target_arch = "arm", target_os = "none")))]
#[inline(always)]
pub fn isb() {
    use core::arch::asm;
    unsafe {
        asm!("isb sy", options(nostack, preserves_flags));
    }
}

#[cfg(any(doc, all(target_arch = "arm", target_os = "none")))]
#[inline(always)]
fn read_basepri() -> u32 {
    use core::arch::asm;
    let value: u32;
    unsafe {
        asm!("mrs {}, BASEPRI", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

#[cfg(any(doc, all(target_arch = "arm", target_os = "none")))]
#[inline(always)]
fn write_basepri(value: u32) {
    use core::arch::asm;
    unsafe {
        asm!("msr BASEPRI, {}", in(reg) value, options(nostack, preserves_flags));
        asm!("isb sy", options(nostack, preserves_flags));
    }
}

/// Set PRIMASK.
#[cfg(any(doc, all(target_arch = "arm", target_os = "none")))]
#[inline(always)]
pub fn disable_interrupts() {
    use core::arch::asm;
    unsafe {
        asm!("cpsid i", options(nostack, preserves_flags));
    }
}

/// Clear PRIMASK.
#[cfg(any(doc, all(target_arch = "arm", target_os = "none")))]
#[inline(always)]
pub fn enable_interrupts() {
    use core::arch::asm;
    unsafe {
        asm!("cpsie i", options(nostack, preserves_flags));
    }
}

/// Whether PRIMASK is set.
#[cfg(any(doc, all(target_arch = "arm", target_os = "none")))]
#[inline(always)]
pub fn interrupts_disabled() -> bool {
    use core::arch::asm;
    let primask: u32;
    unsafe {
        asm!("mrs {}, PRIMASK", out(reg) primask, options(nomem, nostack, preserves_flags));
    }
    primask & 1 == 1
}

// Mock implementations for tests on the host. BASEPRI and PRIMASK live in
// atomics; barriers and WFI do nothing.
#[cfg(not(any(doc, all(target_arch = "arm", target_os = "none"))))]
mod mock {
    use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    pub(super) static BASEPRI: AtomicU32 = AtomicU32::new(0);
    pub(super) static PRIMASK: AtomicBool = AtomicBool::new(false);

    pub(super) fn read_basepri() -> u32 {
        BASEPRI.load(Ordering::SeqCst)
    }

    pub(super) fn write_basepri(value: u32) {
        BASEPRI.store(value, Ordering::SeqCst);
    }

    pub(super) fn set_primask(value: bool) {
        PRIMASK.store(value, Ordering::SeqCst);
    }

    pub(super) fn primask() -> bool {
        PRIMASK.load(Ordering::SeqCst)
    }
}

#[cfg(not(any(doc, all(target_arch = "arm", target_os = "none"))))]
use mock::{read_basepri, write_basepri};

/// NOP instruction (mock)
#[cfg(not(any(doc, all(target_arch = "arm", target_os = "none"))))]
pub fn nop() {
    core::hint::spin_loop();
}

/// WFI instruction (mock)
#[cfg(not(any(doc, all(target_arch = "arm", target_os = "none"))))]
pub unsafe fn wfi() {}

/// Data synchronization barrier (mock)
#[cfg(not(any(doc, all(target_arch = "arm", target_os = "none"))))]
pub fn dsb() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Instruction synchronization barrier (mock)
#[cfg(not(any(doc, all(target_arch = "arm", target_os = "none"))))]
pub fn isb() {
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
}

/// Set PRIMASK (mock)
#[cfg(not(any(doc, all(target_arch = "arm", target_os = "none"))))]
pub fn disable_interrupts() {
    mock::set_primask(true);
}

/// Clear PRIMASK (mock)
#[cfg(not(any(doc, all(target_arch = "arm", target_os = "none"))))]
pub fn enable_interrupts() {
    mock::set_primask(false);
}

/// Whether PRIMASK is set (mock)
#[cfg(not(any(doc, all(target_arch = "arm", target_os = "none"))))]
pub fn interrupts_disabled() -> bool {
    mock::primask()
}

/// Busy loop of `count` NOPs.
///
/// Used around power transitions where the bus fabric needs settling time.
/// The counts passed in are empirical.
#[inline(always)]
pub fn pipeline_settle(count: usize) {
    for _ in 0..count {
        nop();
    }
}

/// Mask interrupts at or below [`INTERRUPT_MASK_CEILING`] and return the
/// previous BASEPRI.
///
/// A stricter mask that is already in place is left alone, so nested calls
/// never unmask anything.
pub fn save_and_set_interrupt_mask() -> InterruptMask {
    let previous = read_basepri();
    if previous == 0 || previous > INTERRUPT_MASK_CEILING {
        write_basepri(INTERRUPT_MASK_CEILING);
    }
    InterruptMask(previous)
}

/// Restore the BASEPRI captured by [`save_and_set_interrupt_mask`].
pub fn restore_interrupt_mask(mask: InterruptMask) {
    write_basepri(mask.0);
}

/// Current BASEPRI value.
pub fn current_interrupt_mask() -> u32 {
    read_basepri()
}

/// Atomic operation
///
/// Runs `f` inside a save/restore pair of the interrupt mask.
pub fn atomic<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let mask = save_and_set_interrupt_mask();
    let res = f();
    restore_interrupt_mask(mask);
    res
}
