// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Cortex-M NVIC
//!
//! Most NVIC configuration is in the NVIC registers:
//! <https://developer.arm.com/docs/100165/0201/nested-vectored-interrupt-controller/nvic-programmers-model/table-of-nvic-registers>
//!
//! The ICTR and ACTLR sit in the same page of the System Control Space but
//! outside the SCB proper. Both are included here since this block starts at
//! the base of that page.

use core::cell::Cell;

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite};
use tock_registers::{register_bitfields, register_structs};

/// Largest number of external interrupts an ARMv7-M NVIC can implement.
pub const MAX_IRQS: usize = 240;

const MAX_IRQ_WORDS: usize = MAX_IRQS.div_ceil(32);

register_structs! {
    /// NVIC Registers.
    ///
    /// Note this generic interface exposes all possible NVICs. Most cores will
    /// not implement all NVIC_XXXX registers.
    pub NvicRegisters {
        (0x000 => _reserved0),

        /// Interrupt Controller Type Register
        (0x004 => pub(crate) ictr: ReadOnly<u32, InterruptControllerType::Register>),

        /// Auxiliary Control Register
        (0x008 => pub(crate) actlr: ReadWrite<u32, AuxiliaryControl::Register>),

        (0x00c => _reserved1),

        /// Interrupt Set-Enable Registers
        (0x100 => iser: [ReadWrite<u32, NvicSetClear::Register>; 8]),

        (0x120 => _reserved2),

        /// Interrupt Clear-Enable Registers
        (0x180 => icer: [ReadWrite<u32, NvicSetClear::Register>; 8]),

        (0x1a0 => _reserved3),

        /// Interrupt Set-Pending Registers
        (0x200 => ispr: [ReadWrite<u32, NvicSetClear::Register>; 8]),

        (0x220 => _reserved4),

        /// Interrupt Clear-Pending Registers
        (0x280 => icpr: [ReadWrite<u32, NvicSetClear::Register>; 8]),

        (0x2a0 => _reserved5),

        /// Interrupt Active Bit Registers
        (0x300 => iabr: [ReadOnly<u32, NvicSetClear::Register>; 8]),

        (0x320 => _reserved6),

        /// Interrupt Priority Registers, one byte per interrupt
        (0x400 => ipr: [ReadWrite<u8>; MAX_IRQS]),

        (0x4f0 => @END),
    }
}

register_bitfields![u32,
    InterruptControllerType [
        /// Total number of interrupt lines in groups of 32
        INTLINESNUM     OFFSET(0)   NUMBITS(4)
    ],

    AuxiliaryControl [
        DISOOFP         OFFSET(9)   NUMBITS(1),
        DISFPCA         OFFSET(8)   NUMBITS(1),
        DISFOLD         OFFSET(2)   NUMBITS(1),
        DISDEFWBUF      OFFSET(1)   NUMBITS(1),
        DISMCYCINT      OFFSET(0)   NUMBITS(1)
    ],

    NvicSetClear [
        /// For register NVIC_XXXXn, access interrupt (m+(32*n)).
        BITS            OFFSET(0)   NUMBITS(32)
    ]
];

/// Base of the NVIC page in the System Control Space.
pub const NVIC_BASE: usize = 0xe000_e000;

/// The NVIC in MMIO space.
///
/// # Safety
///
/// Only valid on a Cortex-M core, and callers must not create aliasing
/// drivers that disagree about the state of the block.
pub unsafe fn registers() -> &'static NvicRegisters {
    &*(NVIC_BASE as *const NvicRegisters)
}

/// Interrupt enable, pending and priority control for external interrupts.
pub struct Nvic<'a> {
    registers: &'a NvicRegisters,
}

impl<'a> Nvic<'a> {
    pub const fn new(registers: &'a NvicRegisters) -> Self {
        Nvic { registers }
    }

    fn bank(irq: u32) -> (usize, u32) {
        ((irq / 32) as usize, 1 << (irq & 31))
    }

    /// Enable the interrupt
    pub fn enable(&self, irq: u32) {
        let (idx, bit) = Self::bank(irq);
        if idx < MAX_IRQ_WORDS {
            self.registers.iser[idx].set(bit);
        }
    }

    /// Disable the interrupt
    pub fn disable(&self, irq: u32) {
        let (idx, bit) = Self::bank(irq);
        if idx < MAX_IRQ_WORDS {
            self.registers.icer[idx].set(bit);
        }
    }

    /// Clear pending state
    pub fn clear_pending(&self, irq: u32) {
        let (idx, bit) = Self::bank(irq);
        if idx < MAX_IRQ_WORDS {
            self.registers.icpr[idx].set(bit);
        }
    }

    pub fn is_enabled(&self, irq: u32) -> bool {
        let (idx, bit) = Self::bank(irq);
        idx < MAX_IRQ_WORDS && self.registers.iser[idx].get() & bit != 0
    }

    pub fn is_pending(&self, irq: u32) -> bool {
        let (idx, bit) = Self::bank(irq);
        idx < MAX_IRQ_WORDS && self.registers.ispr[idx].get() & bit != 0
    }

    pub fn is_active(&self, irq: u32) -> bool {
        let (idx, bit) = Self::bank(irq);
        idx < MAX_IRQ_WORDS && self.registers.iabr[idx].get() & bit != 0
    }

    /// Set the priority byte. Unimplemented low-order bits read back as zero
    /// on hardware.
    pub fn set_priority(&self, irq: u32, priority: u8) {
        if let Some(ipr) = self.registers.ipr.get(irq as usize) {
            ipr.set(priority);
        }
    }

    pub fn priority(&self, irq: u32) -> u8 {
        self.registers
            .ipr
            .get(irq as usize)
            .map_or(0, |ipr| ipr.get())
    }

    /// Number of interrupt lines the core reports, in banks of 32.
    pub fn implemented_banks(&self) -> usize {
        (self.registers.ictr.read(InterruptControllerType::INTLINESNUM) + 1) as usize
    }
}

/// Saved NVIC enable and priority state.
///
/// Only the first `irqs` interrupts are saved and restored.
pub struct NvicSnapshot {
    irqs: usize,
    enabled: [Cell<u32>; MAX_IRQ_WORDS],
    priority: [Cell<u8>; MAX_IRQS],
}

impl NvicSnapshot {
    pub const fn new(irqs: usize) -> Self {
        const WORD: Cell<u32> = Cell::new(0);
        const BYTE: Cell<u8> = Cell::new(0);
        NvicSnapshot {
            irqs: if irqs > MAX_IRQS { MAX_IRQS } else { irqs },
            enabled: [WORD; MAX_IRQ_WORDS],
            priority: [BYTE; MAX_IRQS],
        }
    }

    fn words(&self) -> usize {
        self.irqs.div_ceil(32)
    }

    pub fn save(&self, registers: &NvicRegisters) {
        for (saved, iser) in self.enabled.iter().zip(registers.iser.iter()).take(self.words()) {
            saved.set(iser.get());
        }
        for (saved, ipr) in self.priority.iter().zip(registers.ipr.iter()).take(self.irqs) {
            saved.set(ipr.get());
        }
    }

    /// Priorities are written while every saved interrupt is disabled; the
    /// enables go back last since they re-open interrupt delivery.
    pub fn restore(&self, registers: &NvicRegisters) {
        for icer in registers.icer.iter().take(self.words()) {
            icer.set(!0);
        }
        for (saved, ipr) in self.priority.iter().zip(registers.ipr.iter()).take(self.irqs) {
            ipr.set(saved.get());
        }
        for (saved, iser) in self.enabled.iter().zip(registers.iser.iter()).take(self.words()) {
            iser.set(saved.get());
        }
    }

    pub fn saved_enable(&self, word: usize) -> u32 {
        self.enabled.get(word).map_or(0, Cell::get)
    }

    pub fn saved_priority(&self, irq: usize) -> u8 {
        self.priority.get(irq).map_or(0, Cell::get)
    }
}
