// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! ARM System Control Block
//!
//! <http://infocenter.arm.com/help/index.jsp?topic=/com.arm.doc.dui0553a/CIHFDJCA.html>

use core::cell::Cell;

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite};
use tock_registers::{register_bitfields, register_structs};

use crate::nvic::NvicRegisters;

register_structs! {
    /// In an ARMv7-M processor, a System Control Block (SCB) in the SCS
    /// provides key status information and control features for the processor.
    pub ScbRegisters {
        /// CPUID Base Register
        (0x00 => cpuid: ReadOnly<u32>),

        /// Interrupt Control and State Register
        (0x04 => icsr: ReadWrite<u32, InterruptControlAndState::Register>),

        /// Vector Table Offset Register
        (0x08 => vtor: ReadWrite<u32, VectorTableOffset::Register>),

        /// Application Interrupt and Reset Control Register
        (0x0c => aircr: ReadWrite<u32, ApplicationInterruptAndReset::Register>),

        /// System Control Register
        (0x10 => scr: ReadWrite<u32, SystemControl::Register>),

        /// Configuration and Control Register
        (0x14 => ccr: ReadWrite<u32, ConfigurationAndControl::Register>),

        /// System Handler Priority Registers, byte addressed. Byte n holds
        /// the priority of exception n + 4.
        (0x18 => shp: [ReadWrite<u8>; 12]),

        /// System Handler Control and State Register
        (0x24 => shcsr: ReadWrite<u32, SystemHandlerControlAndState::Register>),

        /// Fault status and address registers, not touched here.
        (0x28 => _reserved0),

        /// Coprocessor Access Control Register
        (0x88 => cpacr: ReadWrite<u32, CoprocessorAccessControl::Register>),

        /// 0xE000ED8C, Reserved.
        (0x8c => _reserved1),

        (0x90 => @END),
    }
}

register_bitfields![u32,
    InterruptControlAndState [
        /// Pendable SerVice.
        PENDSVSET       OFFSET(28)  NUMBITS(1),

        /// Write 1 to clear PendSV.
        PENDSVCLR       OFFSET(27)  NUMBITS(1),

        /// Pendable SysTick.
        PENDSTSET       OFFSET(26)  NUMBITS(1),

        /// Write 1 to clear PendST.
        PENDSTCLR       OFFSET(25)  NUMBITS(1),

        /// Whether an external interrupt (from NVIC) is pending.
        ISRPENDING      OFFSET(22)  NUMBITS(1),

        /// Exception number of the currently executing handler, 0 in thread
        /// mode.
        VECTACTIVE      OFFSET(0)   NUMBITS(9)
    ],

    VectorTableOffset [
        /// Bits [31:7] of the vector table address
        TBLOFF          OFFSET(7)   NUMBITS(25)
    ],

    ApplicationInterruptAndReset [
        /// Key field. Must write 0x05FA or write is ignored.
        VECTKEY         OFFSET(16)  NUMBITS(16),

        /// Binary point position for priority grouping.
        PRIGROUP        OFFSET(8)   NUMBITS(3),

        /// Writing 1 to this bit requests a Local reset.
        SYSRESETREQ     OFFSET(2)   NUMBITS(1)
    ],

    SystemControl [
        SEVONPEND       OFFSET(4)   NUMBITS(1),
        SLEEPDEEP       OFFSET(2)   NUMBITS(1),
        SLEEPONEXIT     OFFSET(1)   NUMBITS(1)
    ],

    ConfigurationAndControl [
        STKALIGN        OFFSET(9)   NUMBITS(1),
        BFHFNMIGN       OFFSET(8)   NUMBITS(1),
        DIV_0_TRAP      OFFSET(4)   NUMBITS(1),
        UNALIGN_TRP     OFFSET(3)   NUMBITS(1),
        USERSETMPEND    OFFSET(1)   NUMBITS(1),
        NONBASETHRDENA  OFFSET(0)   NUMBITS(1)
    ],

    SystemHandlerControlAndState [
        USGFAULTENA     OFFSET(18)  NUMBITS(1),
        BUSFAULTENA     OFFSET(17)  NUMBITS(1),
        MEMFAULTENA     OFFSET(16)  NUMBITS(1),
        SVCALLPENDED    OFFSET(15)  NUMBITS(1),
        SYSTICKACT      OFFSET(11)  NUMBITS(1),
        PENDSVACT       OFFSET(10)  NUMBITS(1),
        MONITORACT      OFFSET(8)   NUMBITS(1),
        SVCALLACT       OFFSET(7)   NUMBITS(1)
    ],

    CoprocessorAccessControl [
        CP11            OFFSET(22)  NUMBITS(2),
        CP10            OFFSET(20)  NUMBITS(2)
    ]
];

/// Base of the SCB in the System Control Space.
pub const SCB_BASE: usize = 0xe000_ed00;

/// The SCB in MMIO space.
///
/// # Safety
///
/// Only valid on a Cortex-M core.
pub unsafe fn registers() -> &'static ScbRegisters {
    &*(SCB_BASE as *const ScbRegisters)
}

/// Offset of external interrupt 0 in the exception numbering.
pub const EXTERNAL_INTERRUPT_BASE: u32 = 16;

/// Indices into `SHPR` of the handlers whose priorities survive a power
/// down: MemManage, BusFault, UsageFault, SVCall, DebugMonitor, PendSV and
/// SysTick.
const SAVED_HANDLER_PRIORITIES: [usize; 7] = [0, 1, 2, 7, 8, 10, 11];

pub struct Scb<'a> {
    registers: &'a ScbRegisters,
}

impl<'a> Scb<'a> {
    pub const fn new(registers: &'a ScbRegisters) -> Self {
        Scb { registers }
    }

    /// Allow the core to go into deep sleep on WFI.
    ///
    /// The specific definition of "deep sleep" is chip specific.
    pub fn set_sleepdeep(&self) {
        self.registers.scr.modify(SystemControl::SLEEPDEEP::SET);
    }

    /// Do not allow the core to go into deep sleep on WFI.
    pub fn unset_sleepdeep(&self) {
        self.registers.scr.modify(SystemControl::SLEEPDEEP::CLEAR);
    }

    pub fn is_sleepdeep(&self) -> bool {
        self.registers.scr.is_set(SystemControl::SLEEPDEEP)
    }

    pub fn cpuid(&self) -> u32 {
        self.registers.cpuid.get()
    }

    /// Exception number of the handler currently running.
    pub fn vector_active(&self) -> u32 {
        self.registers.icsr.read(InterruptControlAndState::VECTACTIVE)
    }

    /// relocate interrupt vector table
    pub fn set_vector_table_offset(&self, offset: u32) {
        self.registers.vtor.set(offset);
    }

    /// Software reset using the ARM System Control Block
    pub fn reset(&self) {
        self.registers.aircr.modify(
            ApplicationInterruptAndReset::VECTKEY.val(0x05FA)
                + ApplicationInterruptAndReset::PRIGROUP.val(0b111)
                + ApplicationInterruptAndReset::SYSRESETREQ::SET,
        );
    }

    /// Grant full access to the FPU (CP10 and CP11).
    pub fn enable_fpu(&self) {
        self.registers.cpacr.modify(
            CoprocessorAccessControl::CP10.val(0b11) + CoprocessorAccessControl::CP11.val(0b11),
        );
    }
}

/// Saved copy of the system control registers a power down clears.
pub struct ScbSnapshot {
    actlr: Cell<u32>,
    vtor: Cell<u32>,
    scr: Cell<u32>,
    ccr: Cell<u32>,
    shp: [Cell<u8>; SAVED_HANDLER_PRIORITIES.len()],
    shcsr: Cell<u32>,
    cpacr: Cell<u32>,
}

impl ScbSnapshot {
    pub const fn new() -> Self {
        const BYTE: Cell<u8> = Cell::new(0);
        ScbSnapshot {
            actlr: Cell::new(0),
            vtor: Cell::new(0),
            scr: Cell::new(0),
            ccr: Cell::new(0),
            shp: [BYTE; SAVED_HANDLER_PRIORITIES.len()],
            shcsr: Cell::new(0),
            cpacr: Cell::new(0),
        }
    }

    /// ACTLR lives next to the NVIC, so both blocks are needed.
    pub fn save(&self, scb: &ScbRegisters, nvic: &NvicRegisters) {
        self.actlr.set(nvic.actlr.get());
        self.vtor.set(scb.vtor.get());
        self.scr.set(scb.scr.get());
        self.ccr.set(scb.ccr.get());
        for (saved, &idx) in self.shp.iter().zip(SAVED_HANDLER_PRIORITIES.iter()) {
            saved.set(scb.shp[idx].get());
        }
        self.shcsr.set(scb.shcsr.get());
        self.cpacr.set(scb.cpacr.get());
    }

    /// The vector table goes back first so that any exception taken while
    /// restoring lands in the right handler.
    pub fn restore(&self, scb: &ScbRegisters, nvic: &NvicRegisters) {
        scb.vtor.set(self.vtor.get());
        scb.cpacr.set(self.cpacr.get());
        scb.ccr.set(self.ccr.get());
        for (saved, &idx) in self.shp.iter().zip(SAVED_HANDLER_PRIORITIES.iter()) {
            scb.shp[idx].set(saved.get());
        }
        scb.shcsr.set(self.shcsr.get());
        nvic.actlr.set(self.actlr.get());
        scb.scr.set(self.scr.get());
    }

    pub fn saved_vtor(&self) -> u32 {
        self.vtor.get()
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;
    use std::boxed::Box;

    fn leak<T>() -> &'static T {
        Box::leak(Box::new(unsafe { core::mem::zeroed::<T>() }))
    }

    #[test]
    fn sleepdeep_and_vector_active() {
        let regs: &ScbRegisters = leak();
        let scb = Scb::new(regs);
        scb.set_sleepdeep();
        assert_eq!(regs.scr.get(), 1 << 2);
        scb.unset_sleepdeep();
        assert!(!scb.is_sleepdeep());

        regs.icsr.set(16 + 21);
        assert_eq!(scb.vector_active(), 37);
    }

    #[test]
    fn snapshot_round_trip() {
        let regs: &ScbRegisters = leak();
        let nvic: &NvicRegisters = leak();
        regs.vtor.set(0x0010_0000);
        regs.scr.set(0x10);
        regs.ccr.set(0x218);
        regs.shcsr.set(0x0007_0000);
        regs.cpacr.set(0x00f0_0000);
        for (idx, shp) in regs.shp.iter().enumerate() {
            shp.set(0x20 + idx as u8);
        }
        nvic.actlr.set(0x2);

        let snapshot = ScbSnapshot::new();
        snapshot.save(regs, nvic);

        regs.vtor.set(0);
        regs.scr.set(0);
        regs.ccr.set(0x200);
        regs.shcsr.set(0);
        regs.cpacr.set(0);
        for shp in regs.shp.iter() {
            shp.set(0);
        }
        nvic.actlr.set(0);

        snapshot.restore(regs, nvic);
        assert_eq!(regs.vtor.get(), 0x0010_0000);
        assert_eq!(regs.scr.get(), 0x10);
        assert_eq!(regs.ccr.get(), 0x218);
        assert_eq!(regs.shcsr.get(), 0x0007_0000);
        assert_eq!(regs.cpacr.get(), 0x00f0_0000);
        assert_eq!(nvic.actlr.get(), 0x2);
        for idx in SAVED_HANDLER_PRIORITIES {
            assert_eq!(regs.shp[idx].get(), 0x20 + idx as u8);
        }
        // Reserved handler slots are not part of the snapshot.
        assert_eq!(regs.shp[3].get(), 0);
    }
}
