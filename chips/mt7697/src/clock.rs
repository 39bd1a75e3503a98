// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The 32 kHz low-power clock.
//!
//! The crystal is nominally 32.768 kHz but drifts with temperature and part.
//! Its frequency is kept in milli-hertz and every conversion is done in
//! 64-bit fixed point, so no floating point runs on the idle path. A
//! [`FrequencyMeter`] supplied by the board re-measures the crystal against
//! a faster reference.

use core::cell::Cell;

use crate::log::{info, warning};

pub const NOMINAL_32K_MILLIHERTZ: u32 = 32_768_000;

/// Measurements further than this from nominal are discarded.
const TOLERANCE_PERCENT: u32 = 5;

/// Measures the real 32 kHz frequency.
pub trait FrequencyMeter {
    /// Frequency in milli-hertz, or `None` if the measurement failed.
    fn measure_millihertz(&self) -> Option<u32>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockError {
    /// The meter did not produce a value.
    NoMeasurement,
    /// The value was implausibly far from nominal.
    OutOfRange(u32),
}

pub struct LowPowerClock {
    millihertz: Cell<u32>,
    last_calibration: Cell<Option<u32>>,
}

impl LowPowerClock {
    pub const fn new() -> Self {
        LowPowerClock {
            millihertz: Cell::new(NOMINAL_32K_MILLIHERTZ),
            last_calibration: Cell::new(None),
        }
    }

    pub fn frequency_millihertz(&self) -> u32 {
        self.millihertz.get()
    }

    fn plausible(millihertz: u32) -> bool {
        let span = NOMINAL_32K_MILLIHERTZ / 100 * TOLERANCE_PERCENT;
        millihertz >= NOMINAL_32K_MILLIHERTZ - span && millihertz <= NOMINAL_32K_MILLIHERTZ + span
    }

    pub fn set_frequency(&self, millihertz: u32) -> Result<(), ClockError> {
        if !Self::plausible(millihertz) {
            return Err(ClockError::OutOfRange(millihertz));
        }
        self.millihertz.set(millihertz);
        Ok(())
    }

    /// Measure now and adopt the result if it is plausible.
    pub fn recalibrate(&self, meter: &dyn FrequencyMeter) -> Result<u32, ClockError> {
        let measured = meter.measure_millihertz().ok_or(ClockError::NoMeasurement)?;
        self.set_frequency(measured).inspect_err(|_| {
            warning!("32k calibration rejected: {} mHz", measured);
        })?;
        info!("32k calibrated to {} mHz", measured);
        Ok(measured)
    }

    /// Recalibrate if `interval` ticks have passed since the last attempt.
    /// `now` is the 32 kHz free-run count. Returns whether a measurement was
    /// attempted.
    pub fn recalibrate_if_due(&self, now: u32, interval: u32, meter: &dyn FrequencyMeter) -> bool {
        let due = match self.last_calibration.get() {
            None => true,
            Some(last) => now.wrapping_sub(last) >= interval,
        };
        if due {
            self.last_calibration.set(Some(now));
            // A rejected measurement keeps the previous factor.
            let _ = self.recalibrate(meter);
        }
        due
    }

    /// 32 kHz ticks to RTOS ticks at `tick_rate_hz`, rounded down.
    pub fn ticks_to_os_ticks(&self, ticks: u32, tick_rate_hz: u32) -> u32 {
        let scaled = ticks as u64 * tick_rate_hz as u64 * 1000 / self.millihertz.get() as u64;
        scaled.min(u32::MAX as u64) as u32
    }

    pub fn ticks_to_ms(&self, ticks: u32) -> u32 {
        let ms = ticks as u64 * 1_000_000 / self.millihertz.get() as u64;
        ms.min(u32::MAX as u64) as u32
    }

    pub fn ms_to_ticks(&self, ms: u32) -> u32 {
        let ticks = ms as u64 * self.millihertz.get() as u64 / 1_000_000;
        ticks.min(u32::MAX as u64) as u32
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct FixedMeter(Option<u32>);

    impl FrequencyMeter for FixedMeter {
        fn measure_millihertz(&self) -> Option<u32> {
            self.0
        }
    }

    #[test]
    fn nominal_conversions() {
        let clock = LowPowerClock::new();
        assert_eq!(clock.ticks_to_os_ticks(32_768, 1000), 1000);
        assert_eq!(clock.ticks_to_os_ticks(32_768 * 5, 1), 5);
        assert_eq!(clock.ticks_to_ms(16_384), 500);
        assert_eq!(clock.ms_to_ticks(2000), 65_536);
        assert_eq!(clock.ticks_to_os_ticks(0, 1000), 0);
    }

    #[test]
    fn calibration_changes_factor() {
        let clock = LowPowerClock::new();
        assert_eq!(clock.recalibrate(&FixedMeter(Some(32_000_000))), Ok(32_000_000));
        assert_eq!(clock.ticks_to_os_ticks(32_000, 1000), 1000);
        assert_eq!(clock.ms_to_ticks(1000), 32_000);
    }

    #[test]
    fn implausible_measurement_is_rejected() {
        let clock = LowPowerClock::new();
        assert_eq!(
            clock.recalibrate(&FixedMeter(Some(40_000_000))),
            Err(ClockError::OutOfRange(40_000_000))
        );
        assert_eq!(
            clock.recalibrate(&FixedMeter(None)),
            Err(ClockError::NoMeasurement)
        );
        assert_eq!(clock.frequency_millihertz(), NOMINAL_32K_MILLIHERTZ);
    }

    #[test]
    fn recalibration_interval_handles_wrap() {
        let clock = LowPowerClock::new();
        let meter = FixedMeter(Some(32_700_000));
        assert!(clock.recalibrate_if_due(0xffff_ff00, 1000, &meter));
        assert!(!clock.recalibrate_if_due(0x0000_0100, 1000, &meter));
        assert!(clock.recalibrate_if_due(0x0000_0400, 1000, &meter));
        assert_eq!(clock.frequency_millihertz(), 32_700_000);
    }
}
