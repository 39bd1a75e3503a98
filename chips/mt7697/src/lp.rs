// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Sleep-mode driver.
//!
//! Three depths are available:
//!
//! - `Sleep`: the core clock stops on `wfi`, everything else keeps running.
//! - `LegacySleep`: the bus moves to the crystal and the PMU takes over, but
//!   every SRAM bank and peripheral keeps its state.
//! - `DeepSleep`: only the retained SRAM bank stays powered. The hardware
//!   context is saved before and restored after, and the Wi-Fi subsystem
//!   (connsys) is handed ownership of the shared bus for the duration.
//!
//! The driver does not consult sleep locks; choosing a mode is the caller's
//! job.

use core::cell::Cell;

use cortexm::scb::Scb;
use cortexm::support;
use tock_cells::optional_cell::OptionalCell;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs};

use crate::config::{CONFIG, SETTLE_NOPS};
use crate::context::HardwareContext;
use crate::log::{debug, error, warning};

/// Start of the power-management block (PMU, SRAM retention, bus clock).
pub const POWER_BASE: usize = 0x8300_8000;

const SRAM_BANKS_ALL: u32 = 0xff;
/// The bank holding the stack and the saved context.
const SRAM_BANK_RETAINED: u32 = 1 << 0;

register_structs! {
    pub PowerRegisters {
        (0x00 => bus_clock: ReadWrite<u32, BusClock::Register>),
        (0x04 => pmu_control: ReadWrite<u32, PmuControl::Register>),
        /// One bit per SRAM bank, set to keep the contents in sleep.
        (0x08 => sram_retention: ReadWrite<u32>),
        /// One bit per SRAM bank, set to cut power in sleep.
        (0x0c => sram_power_down: ReadWrite<u32>),
        (0x10 => @END),
    }
}

register_bitfields![u32,
    BusClock [
        SEL OFFSET(0) NUMBITS(2) [
            Xtal = 0,
            Pll1 = 1,
            Pll2 = 2
        ]
    ],

    PmuControl [
        /// Hand sleep sequencing to the PMU on the next `wfi`.
        HW_CONTROL 0
    ]
];

/// # Safety
///
/// `POWER_BASE` must map a [`PowerRegisters`] block, which only holds on an
/// MT7697.
pub unsafe fn registers() -> &'static PowerRegisters {
    &*(POWER_BASE as *const PowerRegisters)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SleepMode {
    Sleep,
    LegacySleep,
    DeepSleep,
}

impl SleepMode {
    fn index(&self) -> usize {
        match self {
            SleepMode::Sleep => 0,
            SleepMode::LegacySleep => 1,
            SleepMode::DeepSleep => 2,
        }
    }
}

/// Bus ownership handshake with the Wi-Fi subsystem. Each call returns 0 on
/// success.
pub trait Connsys {
    fn get_own_enable_int(&self) -> i32;
    fn give_n9_own(&self) -> i32;
    fn get_ownership(&self) -> i32;
}

/// What to do when connsys refuses the bus before deep sleep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HandshakePolicy {
    LogAndProceed,
    Abort,
}

impl HandshakePolicy {
    pub const fn from_config() -> Self {
        if CONFIG.strict_connsys_handshake {
            HandshakePolicy::Abort
        } else {
            HandshakePolicy::LogAndProceed
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LpError {
    /// Connsys handshake failed with this status. Nothing was powered down.
    ConnsysHandshake(i32),
}

/// Enters a sleep mode and returns once the core is awake again.
pub trait SleepEntry {
    fn enter(&self, mode: SleepMode) -> Result<(), LpError>;
}

pub struct LowPower<'a> {
    registers: &'a PowerRegisters,
    scb: Scb<'a>,
    context: &'a HardwareContext<'a>,
    connsys: OptionalCell<&'a dyn Connsys>,
    policy: Cell<HandshakePolicy>,
    settle_nops: usize,
    wakeups: [Cell<u32>; 3],
}

impl<'a> LowPower<'a> {
    pub fn new(registers: &'a PowerRegisters, context: &'a HardwareContext<'a>) -> Self {
        LowPower {
            registers,
            scb: Scb::new(context.core().scb),
            context,
            connsys: OptionalCell::empty(),
            policy: Cell::new(HandshakePolicy::from_config()),
            settle_nops: SETTLE_NOPS,
            wakeups: [Cell::new(0), Cell::new(0), Cell::new(0)],
        }
    }

    pub fn set_connsys(&self, connsys: &'a dyn Connsys) {
        self.connsys.set(connsys);
    }

    pub fn set_handshake_policy(&self, policy: HandshakePolicy) {
        self.policy.set(policy);
    }

    pub fn handshake_policy(&self) -> HandshakePolicy {
        self.policy.get()
    }

    /// Completed sleeps in `mode` since boot.
    pub fn wakeup_count(&self, mode: SleepMode) -> u32 {
        self.wakeups[mode.index()].get()
    }

    fn connsys_handshake(&self) -> Result<(), LpError> {
        let status = self.connsys.map_or(0, |connsys| {
            let status = connsys.get_own_enable_int();
            if status != 0 {
                status
            } else {
                connsys.give_n9_own()
            }
        });
        if status == 0 {
            return Ok(());
        }
        match self.policy.get() {
            HandshakePolicy::LogAndProceed => {
                warning!("connsys handshake failed ({}), sleeping anyway", status);
                Ok(())
            }
            HandshakePolicy::Abort => {
                error!("connsys handshake failed ({})", status);
                Err(LpError::ConnsysHandshake(status))
            }
        }
    }

    fn wait_for_interrupt(&self) {
        support::dsb();
        support::pipeline_settle(self.settle_nops);
        unsafe {
            support::wfi();
        }
        support::isb();
        support::pipeline_settle(self.settle_nops);
    }

    fn power_down(&self, mode: SleepMode) -> Result<(), LpError> {
        let deep = mode == SleepMode::DeepSleep;
        if deep {
            self.connsys_handshake()?;
        }

        let regs = self.registers;
        let clock = regs.bus_clock.get();
        regs.bus_clock.modify(BusClock::SEL::Xtal);
        if deep {
            regs.sram_retention.set(SRAM_BANK_RETAINED);
            regs.sram_power_down.set(SRAM_BANKS_ALL & !SRAM_BANK_RETAINED);
        } else {
            regs.sram_retention.set(SRAM_BANKS_ALL);
            regs.sram_power_down.set(0);
        }
        regs.pmu_control.modify(PmuControl::HW_CONTROL::SET);
        self.scb.set_sleepdeep();

        if deep {
            self.context.backup();
        }
        self.wait_for_interrupt();
        if deep {
            self.context.restore();
        }

        self.scb.unset_sleepdeep();
        regs.pmu_control.modify(PmuControl::HW_CONTROL::CLEAR);
        regs.sram_retention.set(SRAM_BANKS_ALL);
        regs.sram_power_down.set(0);
        regs.bus_clock.set(clock);

        if deep {
            let status = self.connsys.map_or(0, |connsys| connsys.get_ownership());
            if status != 0 {
                warning!("connsys ownership not returned ({})", status);
            }
        }
        Ok(())
    }
}

impl SleepEntry for LowPower<'_> {
    fn enter(&self, mode: SleepMode) -> Result<(), LpError> {
        if CONFIG.trace_sleep {
            debug!("enter {:?}", mode);
        }
        match mode {
            SleepMode::Sleep => {
                self.scb.unset_sleepdeep();
                support::dsb();
                unsafe {
                    support::wfi();
                }
                support::isb();
            }
            SleepMode::LegacySleep | SleepMode::DeepSleep => self.power_down(mode)?,
        }
        let count = &self.wakeups[mode.index()];
        count.set(count.get().wrapping_add(1));
        if CONFIG.trace_sleep {
            debug!("woke from {:?}", mode);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;
    use std::boxed::Box;

    struct MockConnsys {
        enable_int: i32,
        give: i32,
        ownership: i32,
        calls: Cell<u32>,
        ownership_calls: Cell<u32>,
    }

    impl MockConnsys {
        fn new(enable_int: i32, give: i32, ownership: i32) -> Self {
            MockConnsys {
                enable_int,
                give,
                ownership,
                calls: Cell::new(0),
                ownership_calls: Cell::new(0),
            }
        }
    }

    impl Connsys for MockConnsys {
        fn get_own_enable_int(&self) -> i32 {
            self.calls.set(self.calls.get() + 1);
            self.enable_int
        }

        fn give_n9_own(&self) -> i32 {
            self.calls.set(self.calls.get() + 1);
            self.give
        }

        fn get_ownership(&self) -> i32 {
            self.ownership_calls.set(self.ownership_calls.get() + 1);
            self.ownership
        }
    }

    fn setup() -> (&'static PowerRegisters, &'static LowPower<'static>) {
        let regs: &'static PowerRegisters =
            Box::leak(Box::new(unsafe { core::mem::zeroed::<PowerRegisters>() }));
        regs.bus_clock.write(BusClock::SEL::Pll1);
        let context = crate::context::test::context();
        let lp: &'static LowPower<'static> = Box::leak(Box::new(LowPower::new(regs, context)));
        (regs, lp)
    }

    #[test]
    fn light_sleep_leaves_power_alone() {
        let (regs, lp) = setup();
        lp.scb.set_sleepdeep();
        lp.enter(SleepMode::Sleep).unwrap();
        assert!(!lp.scb.is_sleepdeep());
        assert_eq!(regs.bus_clock.read(BusClock::SEL), 1);
        assert_eq!(regs.sram_retention.get(), 0);
        assert_eq!(lp.wakeup_count(SleepMode::Sleep), 1);
        assert_eq!(lp.context.cycles(), 0);
    }

    #[test]
    fn legacy_sleep_restores_clock_and_power() {
        let (regs, lp) = setup();
        let connsys: &'static MockConnsys = Box::leak(Box::new(MockConnsys::new(0, 0, 0)));
        lp.set_connsys(connsys);
        lp.enter(SleepMode::LegacySleep).unwrap();
        assert_eq!(regs.bus_clock.read(BusClock::SEL), 1);
        assert!(!regs.pmu_control.is_set(PmuControl::HW_CONTROL));
        assert_eq!(regs.sram_retention.get(), SRAM_BANKS_ALL);
        assert_eq!(regs.sram_power_down.get(), 0);
        assert!(!lp.scb.is_sleepdeep());
        assert_eq!(connsys.calls.get(), 0);
        assert_eq!(lp.context.cycles(), 0);
        assert_eq!(lp.wakeup_count(SleepMode::LegacySleep), 1);
    }

    #[test]
    fn deep_sleep_saves_context_and_hands_off_bus() {
        let (regs, lp) = setup();
        let connsys: &'static MockConnsys = Box::leak(Box::new(MockConnsys::new(0, 0, 0)));
        lp.set_connsys(connsys);
        lp.enter(SleepMode::DeepSleep).unwrap();
        assert_eq!(connsys.calls.get(), 2);
        assert_eq!(connsys.ownership_calls.get(), 1);
        assert_eq!(lp.context.cycles(), 1);
        assert_eq!(regs.bus_clock.read(BusClock::SEL), 1);
        assert!(!lp.scb.is_sleepdeep());
        assert_eq!(lp.wakeup_count(SleepMode::DeepSleep), 1);
    }

    #[test]
    fn handshake_failure_follows_policy() {
        let (regs, lp) = setup();
        let connsys: &'static MockConnsys = Box::leak(Box::new(MockConnsys::new(-1, 0, 0)));
        lp.set_connsys(connsys);

        lp.set_handshake_policy(HandshakePolicy::Abort);
        assert_eq!(
            lp.enter(SleepMode::DeepSleep),
            Err(LpError::ConnsysHandshake(-1))
        );
        assert_eq!(connsys.calls.get(), 1);
        assert_eq!(lp.context.cycles(), 0);
        assert_eq!(lp.wakeup_count(SleepMode::DeepSleep), 0);
        assert_eq!(regs.bus_clock.read(BusClock::SEL), 1);

        lp.set_handshake_policy(HandshakePolicy::LogAndProceed);
        assert_eq!(lp.enter(SleepMode::DeepSleep), Ok(()));
        assert_eq!(lp.context.cycles(), 1);
        assert_eq!(lp.wakeup_count(SleepMode::DeepSleep), 1);
    }

    #[test]
    fn give_failure_is_reported() {
        let (_, lp) = setup();
        let connsys: &'static MockConnsys = Box::leak(Box::new(MockConnsys::new(0, 5, 0)));
        lp.set_connsys(connsys);
        lp.set_handshake_policy(HandshakePolicy::Abort);
        assert_eq!(
            lp.enter(SleepMode::DeepSleep),
            Err(LpError::ConnsysHandshake(5))
        );
        assert_eq!(connsys.calls.get(), 2);
    }
}
