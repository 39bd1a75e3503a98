// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! ARM FPU Block

use core::cell::Cell;

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs};

register_structs! {
    pub FpuRegisters {
        (0x00 => _reserved0),

        /// Floating-point Context Control Register
        (0x04 => fpccr: ReadWrite<u32, FPCCR::Register>),

        /// Floating-point Context Address Register
        (0x08 => fpcar: ReadWrite<u32, FPCAR::Register>),

        /// Floating-point Default Status Control Register
        (0x0C => fpdscr: ReadWrite<u32, FPDSCR::Register>),

        (0x10 => @END),
    }
}

register_bitfields![u32,
    FPCCR [
        ASPEN   OFFSET(31)  NUMBITS(1),
        LSPEN   OFFSET(30)  NUMBITS(1),
        MONRDY  OFFSET(8)   NUMBITS(1),
        BFRDY   OFFSET(6)   NUMBITS(1),
        MMRDY   OFFSET(5)   NUMBITS(1),
        HFRDY   OFFSET(4)   NUMBITS(1),
        THREAD  OFFSET(3)   NUMBITS(1),
        USER    OFFSET(1)   NUMBITS(1),
        LSPACT  OFFSET(0)   NUMBITS(1),
    ],

    FPCAR [
        ADDRESS OFFSET(3)   NUMBITS(29),
    ],

    FPDSCR [
        AHP     OFFSET(26)  NUMBITS(1),
        DN      OFFSET(25)  NUMBITS(1),
        FZ      OFFSET(24)  NUMBITS(1),
        RMode   OFFSET(22)  NUMBITS(2),
    ],
];

pub const FPU_BASE: usize = 0xE000_EF30;

/// The FPU control block in MMIO space.
///
/// # Safety
///
/// Only valid on a Cortex-M4F core.
pub unsafe fn registers() -> &'static FpuRegisters {
    &*(FPU_BASE as *const FpuRegisters)
}

/// Turn on automatic and lazy stacking of the FP context on exception entry.
pub fn enable_lazy_stacking(registers: &FpuRegisters) {
    registers
        .fpccr
        .modify(FPCCR::ASPEN::SET + FPCCR::LSPEN::SET);
}

pub fn default_status(registers: &FpuRegisters) -> u32 {
    registers.fpdscr.get()
}

/// Saved FPCCR and FPCAR.
pub struct FpuSnapshot {
    fpccr: Cell<u32>,
    fpcar: Cell<u32>,
}

impl FpuSnapshot {
    pub const fn new() -> Self {
        FpuSnapshot {
            fpccr: Cell::new(0),
            fpcar: Cell::new(0),
        }
    }

    pub fn save(&self, registers: &FpuRegisters) {
        self.fpccr.set(registers.fpccr.get());
        self.fpcar.set(registers.fpcar.get());
    }

    pub fn restore(&self, registers: &FpuRegisters) {
        registers.fpcar.set(self.fpcar.get());
        registers.fpccr.set(self.fpccr.get());
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;
    use std::boxed::Box;

    #[test]
    fn snapshot_round_trip() {
        let regs: &FpuRegisters =
            Box::leak(Box::new(unsafe { core::mem::zeroed::<FpuRegisters>() }));
        enable_lazy_stacking(regs);
        regs.fpcar.set(0x2000_1ff8);

        let snapshot = FpuSnapshot::new();
        snapshot.save(regs);
        regs.fpccr.set(0);
        regs.fpcar.set(0);
        snapshot.restore(regs);

        assert!(regs.fpccr.is_set(FPCCR::ASPEN));
        assert!(regs.fpccr.is_set(FPCCR::LSPEN));
        assert_eq!(regs.fpcar.get(), 0x2000_1ff8);
    }
}
