// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! General purpose timers.
//!
//! Two countdown ports clocked from the 32 kHz domain plus two free-running
//! counters (32 kHz and 1 MHz) that never stop. The free-run counters back
//! the busy-wait delays and the elapsed-time measurement of the idle path.

use core::cell::Cell;

use cortexm::support;
use tock_cells::optional_cell::OptionalCell;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs};

use crate::isr::InterruptHandler;
use crate::log::{debug, trace};

pub const GPT0: usize = 0;
pub const GPT1: usize = 1;
pub const GPT_PORT_MAX: usize = 2;

/// Frequency of the countdown ports and of the slow free-run counter.
pub const GPT_32K_HZ: u32 = 32_768;

/// Longest timeout whose tick count fits the 32-bit length register.
pub const MAX_TIMEOUT_MS: u32 = 130_150_523;

/// Start of the general-purpose timer block.
pub const GPT_BASE: usize = 0x8305_0000;

register_structs! {
    pub GptRegisters {
        /// Expiry status, one bit per port. Write 1 to clear.
        (0x000 => irq_status: ReadWrite<u32, PortBits::Register>),
        /// Expiry interrupt enable, one bit per port.
        (0x004 => irq_enable: ReadWrite<u32, PortBits::Register>),
        (0x008 => _reserved0),
        (0x010 => port: [GptPortRegisters; GPT_PORT_MAX]),
        (0x030 => _reserved1),
        /// Free-running 32 kHz counter.
        (0x040 => free_run_32k: ReadWrite<u32>),
        /// Free-running 1 MHz counter.
        (0x044 => free_run_1m: ReadWrite<u32>),
        (0x048 => @END),
    },

    GptPortRegisters {
        (0x00 => ctrl: ReadWrite<u32, PortControl::Register>),
        /// Countdown length in 32 kHz ticks.
        (0x04 => length: ReadWrite<u32>),
        (0x08 => count: ReadWrite<u32>),
        (0x0c => _reserved0),
        (0x10 => @END),
    }
}

register_bitfields![u32,
    PortBits [
        PORT0 0,
        PORT1 1
    ],

    PortControl [
        /// Start counting down.
        EN      OFFSET(0)   NUMBITS(1) [],
        /// Reload from LENGTH on expiry instead of stopping.
        MODE    OFFSET(1)   NUMBITS(1) [
            OneShot = 0,
            Repeat = 1
        ]
    ]
];

/// # Safety
///
/// `GPT_BASE` must map a [`GptRegisters`] block, which only holds on an
/// MT7697.
pub unsafe fn registers() -> &'static GptRegisters {
    &*(GPT_BASE as *const GptRegisters)
}

/// Callback for an expiring port. Runs in interrupt context.
pub trait GptClient {
    fn fired(&self, port: usize);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerMode {
    OneShot,
    Repeat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RunningStatus {
    Stopped,
    Running,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreeRunClock {
    Clock32k,
    Clock1M,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GptError {
    /// Port number out of range.
    Port,
    /// Port not initialized, or busy for the requested operation.
    Error,
    /// Port already initialized.
    PortUsed,
    /// Timeout of zero or beyond `MAX_TIMEOUT_MS`.
    InvalidParameter,
}

struct PortState<'a> {
    initialized: Cell<bool>,
    status: Cell<RunningStatus>,
    mode: Cell<TimerMode>,
    client: OptionalCell<&'a dyn GptClient>,
}

impl PortState<'_> {
    const fn new() -> Self {
        PortState {
            initialized: Cell::new(false),
            status: Cell::new(RunningStatus::Stopped),
            mode: Cell::new(TimerMode::OneShot),
            client: OptionalCell::empty(),
        }
    }
}

pub struct Gpt<'a> {
    registers: &'a GptRegisters,
    ports: [PortState<'a>; GPT_PORT_MAX],
}

/// Milliseconds to 32 kHz ticks at the nominal rate.
pub fn ms_to_ticks(ms: u32) -> u32 {
    ((ms as u64 * GPT_32K_HZ as u64) / 1000) as u32
}

impl<'a> Gpt<'a> {
    pub const fn new(registers: &'a GptRegisters) -> Self {
        Gpt {
            registers,
            ports: [PortState::new(), PortState::new()],
        }
    }

    fn port(&self, port: usize) -> Result<&PortState<'a>, GptError> {
        self.ports.get(port).ok_or(GptError::Port)
    }

    fn initialized_port(&self, port: usize) -> Result<&PortState<'a>, GptError> {
        let state = self.port(port)?;
        if state.initialized.get() {
            Ok(state)
        } else {
            Err(GptError::Error)
        }
    }

    pub fn init(&self, port: usize) -> Result<(), GptError> {
        let state = self.port(port)?;
        support::atomic(|| {
            if state.initialized.get() {
                return Err(GptError::PortUsed);
            }
            let hw = &self.registers.port[port];
            hw.ctrl.set(0);
            hw.length.set(0);
            self.registers.irq_enable.set(self.registers.irq_enable.get() & !(1 << port));
            state.initialized.set(true);
            state.status.set(RunningStatus::Stopped);
            Ok(())
        })
    }

    /// Release a stopped port. The registered client is dropped.
    pub fn deinit(&self, port: usize) -> Result<(), GptError> {
        let state = self.initialized_port(port)?;
        support::atomic(|| {
            if state.status.get() == RunningStatus::Running {
                return Err(GptError::Error);
            }
            state.initialized.set(false);
            state.client.clear();
            Ok(())
        })
    }

    /// Install the expiry client, returning the one it replaces.
    pub fn register_callback(
        &self,
        port: usize,
        client: &'a dyn GptClient,
    ) -> Result<Option<&'a dyn GptClient>, GptError> {
        let state = self.initialized_port(port)?;
        Ok(support::atomic(|| state.client.replace(client)))
    }

    pub fn start_timer(&self, port: usize, timeout_ms: u32, mode: TimerMode) -> Result<(), GptError> {
        let state = self.initialized_port(port)?;
        if timeout_ms == 0 || timeout_ms > MAX_TIMEOUT_MS {
            return Err(GptError::InvalidParameter);
        }
        support::atomic(|| {
            if state.status.get() == RunningStatus::Running {
                return Err(GptError::Error);
            }
            let hw = &self.registers.port[port];
            hw.length.set(ms_to_ticks(timeout_ms));
            let mode_field = match mode {
                TimerMode::OneShot => PortControl::MODE::OneShot,
                TimerMode::Repeat => PortControl::MODE::Repeat,
            };
            self.registers.irq_status.set(1 << port);
            self.registers.irq_enable.set(self.registers.irq_enable.get() | (1 << port));
            hw.ctrl.write(mode_field + PortControl::EN::SET);
            state.mode.set(mode);
            state.status.set(RunningStatus::Running);
            trace!("gpt{} start {} ms", port, timeout_ms);
            Ok(())
        })
    }

    /// Stop a port. Stopping a stopped port succeeds.
    pub fn stop_timer(&self, port: usize) -> Result<(), GptError> {
        let state = self.initialized_port(port)?;
        support::atomic(|| {
            if state.status.get() == RunningStatus::Stopped {
                return;
            }
            self.halt(port);
            state.status.set(RunningStatus::Stopped);
        });
        Ok(())
    }

    fn halt(&self, port: usize) {
        self.registers.port[port].ctrl.modify(PortControl::EN::CLEAR);
        self.registers.irq_enable.set(self.registers.irq_enable.get() & !(1 << port));
        self.registers.irq_status.set(1 << port);
    }

    pub fn get_running_status(&self, port: usize) -> Result<RunningStatus, GptError> {
        Ok(self.port(port)?.status.get())
    }

    /// Programmed countdown length of `port`, in 32 kHz ticks.
    pub fn programmed_ticks(&self, port: usize) -> Result<u32, GptError> {
        self.port(port)?;
        Ok(self.registers.port[port].length.get())
    }

    pub fn get_free_run_count(&self, clock: FreeRunClock) -> u32 {
        match clock {
            FreeRunClock::Clock32k => self.registers.free_run_32k.get(),
            FreeRunClock::Clock1M => self.registers.free_run_1m.get(),
        }
    }

    /// Ticks between two free-run readings, across counter wrap.
    pub fn get_duration_count(&self, start: u32, end: u32) -> u32 {
        end.wrapping_sub(start)
    }

    pub fn delay_ms(&self, ms: u32) {
        let start = self.get_free_run_count(FreeRunClock::Clock32k);
        let ticks = ms_to_ticks(ms);
        while self.get_duration_count(start, self.get_free_run_count(FreeRunClock::Clock32k)) < ticks {
            support::nop();
        }
    }

    pub fn delay_us(&self, us: u32) {
        let start = self.get_free_run_count(FreeRunClock::Clock1M);
        while self.get_duration_count(start, self.get_free_run_count(FreeRunClock::Clock1M)) < us {
            support::nop();
        }
    }

    /// Service expired ports. A one-shot port is marked stopped before its
    /// client runs, so the client may start it again.
    pub fn handle_interrupt(&self) {
        let pending = self.registers.irq_status.get() & self.registers.irq_enable.get();
        for (port, state) in self.ports.iter().enumerate() {
            if pending & (1 << port) == 0 {
                continue;
            }
            self.registers.irq_status.set(1 << port);
            if state.mode.get() == TimerMode::OneShot {
                self.halt(port);
                state.status.set(RunningStatus::Stopped);
            }
            debug!("gpt{} fired", port);
            state.client.map(|client| client.fired(port));
        }
    }
}

impl InterruptHandler for Gpt<'_> {
    fn handle_irq(&self, _irq: u32) {
        self.handle_interrupt();
    }
}

#[cfg(test)]
pub(crate) mod test {
    extern crate std;

    use super::*;
    use std::boxed::Box;

    pub(crate) fn registers() -> &'static GptRegisters {
        Box::leak(Box::new(unsafe { core::mem::zeroed::<GptRegisters>() }))
    }

    /// Simulate the hardware raising the expiry status of `port`.
    pub(crate) fn expire(registers: &GptRegisters, port: usize) {
        registers.irq_status.set(1 << port);
    }

    pub(crate) fn set_free_run_32k(registers: &GptRegisters, value: u32) {
        registers.free_run_32k.set(value);
    }

    struct Restarter {
        gpt: OptionalCell<&'static Gpt<'static>>,
        status_in_callback: Cell<Option<RunningStatus>>,
        fired: Cell<usize>,
        restart: bool,
    }

    impl GptClient for Restarter {
        fn fired(&self, port: usize) {
            self.fired.set(self.fired.get() + 1);
            self.gpt.map(|gpt| {
                self.status_in_callback.set(gpt.get_running_status(port).ok());
                if self.restart {
                    assert_eq!(gpt.start_timer(port, 10, TimerMode::OneShot), Ok(()));
                }
            });
        }
    }

    fn setup(restart: bool) -> (&'static GptRegisters, &'static Gpt<'static>, &'static Restarter) {
        let regs = registers();
        let gpt: &'static Gpt<'static> = Box::leak(Box::new(Gpt::new(regs)));
        let client: &'static Restarter = Box::leak(Box::new(Restarter {
            gpt: OptionalCell::new(gpt),
            status_in_callback: Cell::new(None),
            fired: Cell::new(0),
            restart,
        }));
        gpt.init(GPT0).unwrap();
        gpt.register_callback(GPT0, client).unwrap();
        (regs, gpt, client)
    }

    #[test]
    fn port_validation() {
        let gpt = Gpt::new(registers());
        assert_eq!(gpt.init(GPT_PORT_MAX), Err(GptError::Port));
        assert_eq!(
            gpt.start_timer(GPT0, 5, TimerMode::OneShot),
            Err(GptError::Error)
        );
        assert_eq!(gpt.init(GPT0), Ok(()));
        assert_eq!(gpt.init(GPT0), Err(GptError::PortUsed));
        assert_eq!(
            gpt.start_timer(GPT0, 0, TimerMode::OneShot),
            Err(GptError::InvalidParameter)
        );
        assert_eq!(gpt.deinit(GPT1), Err(GptError::Error));
    }

    #[test]
    fn start_reports_running_and_programs_length() {
        let (regs, gpt, _) = setup(false);
        gpt.start_timer(GPT0, 1000, TimerMode::OneShot).unwrap();
        assert_eq!(gpt.get_running_status(GPT0), Ok(RunningStatus::Running));
        assert_eq!(regs.port[GPT0].length.get(), 32_768);
        assert!(regs.port[GPT0].ctrl.is_set(PortControl::EN));
        assert_eq!(gpt.deinit(GPT0), Err(GptError::Error));
    }

    #[test]
    fn start_on_running_port_leaves_it_alone() {
        let (_, gpt, _) = setup(false);
        gpt.start_timer(GPT0, 100, TimerMode::Repeat).unwrap();
        let programmed = gpt.programmed_ticks(GPT0).unwrap();
        assert_eq!(
            gpt.start_timer(GPT0, 7, TimerMode::OneShot),
            Err(GptError::Error)
        );
        assert_eq!(gpt.programmed_ticks(GPT0), Ok(programmed));
        assert_eq!(gpt.get_running_status(GPT0), Ok(RunningStatus::Running));
    }

    #[test]
    fn stop_is_idempotent() {
        let (regs, gpt, _) = setup(false);
        assert_eq!(gpt.stop_timer(GPT0), Ok(()));
        gpt.start_timer(GPT0, 3, TimerMode::OneShot).unwrap();
        assert_eq!(gpt.stop_timer(GPT0), Ok(()));
        assert_eq!(gpt.stop_timer(GPT0), Ok(()));
        assert_eq!(gpt.get_running_status(GPT0), Ok(RunningStatus::Stopped));
        assert!(!regs.port[GPT0].ctrl.is_set(PortControl::EN));
    }

    #[test]
    fn one_shot_stops_before_callback() {
        let (regs, gpt, client) = setup(true);
        gpt.start_timer(GPT0, 5, TimerMode::OneShot).unwrap();
        expire(regs, GPT0);
        gpt.handle_interrupt();
        assert_eq!(client.fired.get(), 1);
        assert_eq!(client.status_in_callback.get(), Some(RunningStatus::Stopped));
        // The callback restarted the port.
        assert_eq!(gpt.get_running_status(GPT0), Ok(RunningStatus::Running));
        assert_eq!(gpt.programmed_ticks(GPT0), Ok(ms_to_ticks(10)));
    }

    #[test]
    fn repeat_keeps_running() {
        let (regs, gpt, client) = setup(false);
        gpt.start_timer(GPT0, 5, TimerMode::Repeat).unwrap();
        expire(regs, GPT0);
        gpt.handle_interrupt();
        assert_eq!(client.status_in_callback.get(), Some(RunningStatus::Running));
        assert!(regs.port[GPT0].ctrl.is_set(PortControl::EN));
    }

    #[test]
    fn interrupt_for_disabled_port_is_ignored() {
        let (regs, gpt, client) = setup(false);
        expire(regs, GPT0);
        gpt.handle_interrupt();
        assert_eq!(client.fired.get(), 0);
    }

    #[test]
    fn free_run_and_duration() {
        let regs = registers();
        let gpt = Gpt::new(regs);
        set_free_run_32k(regs, 0xffff_fff0);
        assert_eq!(gpt.get_free_run_count(FreeRunClock::Clock32k), 0xffff_fff0);
        assert_eq!(gpt.get_duration_count(0xffff_fff0, 0x10), 0x20);
        // Zero-length delays return immediately without the counter moving.
        gpt.delay_ms(0);
        gpt.delay_us(0);
    }

    #[test]
    fn register_callback_returns_previous() {
        let (_, gpt, _) = setup(false);
        let other: &'static Restarter = Box::leak(Box::new(Restarter {
            gpt: OptionalCell::empty(),
            status_in_callback: Cell::new(None),
            fired: Cell::new(0),
            restart: false,
        }));
        assert!(gpt.register_callback(GPT0, other).unwrap().is_some());
        assert_eq!(gpt.register_callback(GPT1, other).err(), Some(GptError::Error));
    }
}
