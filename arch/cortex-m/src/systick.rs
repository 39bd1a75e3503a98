// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! ARM Cortex-M SysTick peripheral.
//!
//! Drives the periodic RTOS tick. The idle path stops it while the core
//! sleeps and lets it resume from wherever the count was left.

use core::cell::Cell;

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite};
use tock_registers::{register_bitfields, register_structs};

register_structs! {
    pub SysTickRegisters {
        (0x00 => syst_csr: ReadWrite<u32, ControlAndStatus::Register>),
        (0x04 => syst_rvr: ReadWrite<u32, ReloadValue::Register>),
        (0x08 => syst_cvr: ReadWrite<u32, CurrentValue::Register>),
        (0x0c => syst_calib: ReadOnly<u32, CalibrationValue::Register>),
        (0x10 => @END),
    }
}

register_bitfields![u32,
    ControlAndStatus [
        /// Returns 1 if timer counted to 0 since last time this was read.
        COUNTFLAG 16,

        /// Clock source is (0) External Clock or (1) Processor Clock.
        CLKSOURCE 2,

        /// Set to 1 to enable SysTick exception request.
        TICKINT 1,

        /// Enable the counter (1 == Enabled).
        ENABLE 0
    ],

    ReloadValue [
        /// Value loaded to `syst_cvr` when counter is enabled and reaches 0.
        RELOAD          OFFSET(0)  NUMBITS(24)
    ],

    CurrentValue [
        /// Reads current value. Write of any value sets to 0.
        CURRENT         OFFSET(0)  NUMBITS(24)
    ],

    CalibrationValue [
        /// 0 if device provides reference clock to processor.
        NOREF           OFFSET(31) NUMBITS(1),

        /// 0 if TENMS value is exact, 1 if inexact or not given.
        SKEW            OFFSET(30) NUMBITS(1),

        /// Reload value for 10ms ticks, or 0 if no calibration.
        TENMS           OFFSET(0)  NUMBITS(24)
    ]
];

pub const SYSTICK_BASE: usize = 0xe000_e010;

/// The SysTick block in MMIO space.
///
/// # Safety
///
/// Only valid on a Cortex-M core.
pub unsafe fn registers() -> &'static SysTickRegisters {
    &*(SYSTICK_BASE as *const SysTickRegisters)
}

/// The ARM Cortex-M SysTick peripheral
///
/// Documented in the Cortex-MX Devices Generic User Guide, Chapter 4.4
pub struct SysTick<'a> {
    registers: &'a SysTickRegisters,
    hertz: u32,
}

impl<'a> SysTick<'a> {
    /// `clock_speed` is the frequency of SysTick tics in Hertz. Pass 0 to use
    /// the calibration value reported by hardware.
    pub const fn new(registers: &'a SysTickRegisters, clock_speed: u32) -> Self {
        SysTick {
            registers,
            hertz: clock_speed,
        }
    }

    // Return the tic frequency in hertz. An explicit clock speed wins over
    // the hardware calibration value.
    fn hertz(&self) -> u32 {
        let tenms = self.registers.syst_calib.read(CalibrationValue::TENMS);
        if tenms == 0 || self.hertz != 0 {
            self.hertz
        } else {
            // The `tenms` register is the reload value for 10ms, so
            // Hertz = number of tics in 1 second = tenms * 100
            tenms * 100
        }
    }

    /// Program a periodic tick of `tick_rate_hz` and start it with its
    /// interrupt enabled.
    pub fn start_periodic(&self, tick_rate_hz: u32) {
        let reload = self.hertz() / tick_rate_hz.max(1);
        // n.b.: 4.4.5 'hints and tips' suggests setting reload before value
        self.registers
            .syst_rvr
            .write(ReloadValue::RELOAD.val(reload.saturating_sub(1)));
        self.registers.syst_cvr.set(0);
        self.registers.syst_csr.write(
            ControlAndStatus::ENABLE::SET
                + ControlAndStatus::TICKINT::SET
                + ControlAndStatus::CLKSOURCE::SET,
        );
    }

    /// Stop counting. The current value is kept.
    pub fn stop(&self) {
        self.registers.syst_csr.modify(ControlAndStatus::ENABLE::CLEAR);
    }

    /// Continue counting from the current value.
    pub fn resume(&self) {
        self.registers.syst_csr.modify(ControlAndStatus::ENABLE::SET);
    }

    pub fn is_running(&self) -> bool {
        self.registers.syst_csr.is_set(ControlAndStatus::ENABLE)
    }

    pub fn interrupt_enabled(&self) -> bool {
        self.registers.syst_csr.is_set(ControlAndStatus::TICKINT)
    }

    pub fn current_value(&self) -> u32 {
        self.registers.syst_cvr.read(CurrentValue::CURRENT)
    }

    pub fn reset(&self) {
        self.registers.syst_csr.set(0);
        self.registers.syst_rvr.set(0);
        self.registers.syst_cvr.set(0);
    }
}

/// Saved SysTick control word.
pub struct SysTickSnapshot {
    ctrl: Cell<u32>,
}

impl SysTickSnapshot {
    pub const fn new() -> Self {
        SysTickSnapshot { ctrl: Cell::new(0) }
    }

    /// Capture CTRL, then mask the tick exception so it cannot fire while
    /// the rest of the context is saved.
    pub fn save(&self, registers: &SysTickRegisters) {
        self.ctrl.set(registers.syst_csr.get());
        registers.syst_csr.modify(ControlAndStatus::TICKINT::CLEAR);
    }

    pub fn restore(&self, registers: &SysTickRegisters) {
        registers.syst_csr.set(self.ctrl.get());
    }
}
