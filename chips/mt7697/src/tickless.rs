// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Tickless idle.
//!
//! When the RTOS has nothing to run for the next `T` ticks it calls
//! [`TicklessIdle::suppress_ticks_and_sleep`]. The periodic tick is stopped,
//! a one-shot GPT alarm is armed for the idle period less the wake-up
//! overhead of the chosen sleep mode, and the core sleeps until the alarm
//! or any other interrupt wakes it. Time actually spent asleep is measured
//! on the 32 kHz free-running counter and handed back to the RTOS as ticks,
//! never more than `T`. The part of a tick left over after a wake is carried
//! into the next idle period so the RTOS clock does not fall behind.
//!
//! Deep sleep is only chosen while no sleep lock is held.

use core::cell::Cell;

use cortexm::support;
use cortexm::systick::SysTick;
use tock_cells::optional_cell::OptionalCell;

use crate::clock::{FrequencyMeter, LowPowerClock};
use crate::config::{TicklessConfig, CONFIG};
use crate::gpt::{FreeRunClock, Gpt, TimerMode, MAX_TIMEOUT_MS};
use crate::log::{debug, warning};
use crate::lp::{SleepEntry, SleepMode};
use crate::sleep_manager::SleepManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SleepModeStatus {
    /// A task became ready; do not sleep.
    Abort,
    /// Sleep, waking for the next timeout at the latest.
    Standard,
    /// No task waits on a timeout. The idle period is unbounded, but the
    /// wake alarm is still armed for the requested ticks so the clock
    /// calibration and tick reconciliation keep running.
    NoTasksWaitingTimeout,
}

/// The scheduler hooks the idle path needs.
pub trait Rtos {
    /// Called with interrupts disabled, right before committing to sleep.
    fn confirm_sleep_mode_status(&self) -> SleepModeStatus;
    /// Advance the tick count by `ticks` without running the tick handler
    /// that many times.
    fn step_tick(&self, ticks: u32);
    fn tick_count(&self) -> u32;
}

/// The periodic tick interrupt.
pub trait TickSource {
    fn stop(&self);
    fn resume(&self);
}

impl TickSource for SysTick<'_> {
    fn stop(&self) {
        SysTick::stop(self);
    }

    fn resume(&self) {
        SysTick::resume(self);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IdleOutcome {
    /// The RTOS vetoed the sleep.
    Aborted,
    Slept {
        mode: SleepMode,
        /// Wake alarm actually programmed.
        alarm_ms: u32,
        /// Ticks handed back to the RTOS.
        stepped_ticks: u32,
    },
}

/// Pick the sleep depth for an idle period of `ms`.
pub fn select_sleep_mode(ms: u32, locked: bool, config: &TicklessConfig) -> SleepMode {
    if ms < config.legacy_sleep_threshold_ms {
        SleepMode::Sleep
    } else if ms <= config.deep_sleep_threshold_ms || locked {
        SleepMode::LegacySleep
    } else {
        SleepMode::DeepSleep
    }
}

fn overhead_ms(mode: SleepMode, config: &TicklessConfig) -> u32 {
    match mode {
        SleepMode::Sleep => config.sleep_overhead_ms,
        SleepMode::LegacySleep => config.legacy_sleep_overhead_ms,
        SleepMode::DeepSleep => config.deep_sleep_overhead_ms,
    }
}

pub struct TicklessIdle<'a> {
    gpt: &'a Gpt<'a>,
    sleep: &'a dyn SleepEntry,
    sleep_manager: &'a SleepManager,
    clock: &'a LowPowerClock,
    rtos: &'a dyn Rtos,
    tick_source: &'a dyn TickSource,
    meter: OptionalCell<&'a dyn FrequencyMeter>,
    config: TicklessConfig,
    /// Time slept but not yet stepped, in 32 kHz ticks scaled by
    /// `tick_rate_hz * 1000`. Always below the clock rate in mHz.
    residue: Cell<u64>,
}

impl<'a> TicklessIdle<'a> {
    pub fn new(
        gpt: &'a Gpt<'a>,
        sleep: &'a dyn SleepEntry,
        sleep_manager: &'a SleepManager,
        clock: &'a LowPowerClock,
        rtos: &'a dyn Rtos,
        tick_source: &'a dyn TickSource,
        config: TicklessConfig,
    ) -> Self {
        TicklessIdle {
            gpt,
            sleep,
            sleep_manager,
            clock,
            rtos,
            tick_source,
            meter: OptionalCell::empty(),
            config,
            residue: Cell::new(0),
        }
    }

    /// Claim the wake timer port.
    pub fn init(&self) -> Result<(), crate::gpt::GptError> {
        self.gpt.init(self.config.wake_timer_port)
    }

    pub fn set_frequency_meter(&self, meter: &'a dyn FrequencyMeter) {
        self.meter.set(meter);
    }

    pub fn config(&self) -> &TicklessConfig {
        &self.config
    }

    fn ticks_to_ms(&self, ticks: u32) -> u32 {
        let ms = ticks as u64 * 1000 / self.config.tick_rate_hz.max(1) as u64;
        ms.min(u32::MAX as u64) as u32
    }

    /// Whole RTOS ticks in `elapsed` 32 kHz ticks plus the carried residue,
    /// at most `limit`. An overshoot past `limit` drops the residue.
    fn reconcile(&self, elapsed: u32, limit: u32) -> u32 {
        let millihertz = self.clock.frequency_millihertz().max(1) as u64;
        let scaled =
            elapsed as u64 * self.config.tick_rate_hz as u64 * 1000 + self.residue.get();
        let whole = scaled / millihertz;
        if whole > limit as u64 {
            self.residue.set(0);
            limit
        } else {
            self.residue.set(scaled % millihertz);
            whole as u32
        }
    }

    /// Sleep for at most `expected_idle_ticks` RTOS ticks.
    ///
    /// Panics if the wake alarm cannot be armed, since sleeping without one
    /// could stall the scheduler indefinitely.
    pub fn suppress_ticks_and_sleep(&self, expected_idle_ticks: u32) -> IdleOutcome {
        let port = self.config.wake_timer_port;

        self.tick_source.stop();
        let start = self.gpt.get_free_run_count(FreeRunClock::Clock32k);
        support::disable_interrupts();

        if self.rtos.confirm_sleep_mode_status() == SleepModeStatus::Abort {
            self.tick_source.resume();
            support::enable_interrupts();
            return IdleOutcome::Aborted;
        }

        self.meter.map(|meter| {
            self.clock
                .recalibrate_if_due(start, self.config.calibration_interval_ticks, *meter)
        });

        let ms = self.ticks_to_ms(expected_idle_ticks);
        let mode = select_sleep_mode(ms, self.sleep_manager.is_deep_sleep_locked(), &self.config);
        let alarm_ms = ms
            .saturating_sub(overhead_ms(mode, &self.config))
            .clamp(1, MAX_TIMEOUT_MS);

        if let Err(err) = self.gpt.start_timer(port, alarm_ms, TimerMode::OneShot) {
            panic!("tickless: wake alarm on gpt{} failed: {:?}", port, err);
        }
        if let Err(err) = self.sleep.enter(mode) {
            warning!("tickless: {:?} not entered: {:?}", mode, err);
        }
        // Cannot fail: the port was just started.
        let _ = self.gpt.stop_timer(port);

        let end = self.gpt.get_free_run_count(FreeRunClock::Clock32k);
        let elapsed = self.gpt.get_duration_count(start, end);
        let stepped_ticks = self.reconcile(elapsed, expected_idle_ticks);
        self.rtos.step_tick(stepped_ticks);

        self.tick_source.resume();
        support::enable_interrupts();

        if CONFIG.trace_sleep {
            debug!(
                "tickless: {:?} {} ms, stepped {} of {}, tick {}",
                mode,
                alarm_ms,
                stepped_ticks,
                expected_idle_ticks,
                self.rtos.tick_count()
            );
        }
        IdleOutcome::Slept {
            mode,
            alarm_ms,
            stepped_ticks,
        }
    }
}
