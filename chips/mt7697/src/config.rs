// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Compile-time configuration of the chip crate.
//!
//! Boolean options come from cargo features and are folded into the `CONFIG`
//! constant, which is the only place in this crate where `cfg!(feature)` is
//! used to configure behavior. Numeric tunables are plain constants that a
//! board can override when it constructs the drivers.

use crate::gpt;

/// Data structure holding compile-time configuration options.
pub(crate) struct Config {
    /// Refuse to enter deep sleep when the connsys ownership handshake fails.
    ///
    /// The default is to log the failure and power down anyway.
    pub(crate) strict_connsys_handshake: bool,

    /// Log every sleep entry and exit at debug level.
    pub(crate) trace_sleep: bool,
}

pub(crate) const CONFIG: Config = Config {
    strict_connsys_handshake: cfg!(feature = "strict_connsys_handshake"),
    trace_sleep: cfg!(feature = "trace_sleep"),
};

/// NOPs executed before and after `wfi` on a power transition.
///
/// Empirical: the flash and bus fabric need this long to settle. Shorter
/// sequences were observed to bus fault on silicon.
pub const SETTLE_NOPS: usize = 16;

/// Tunables of the tickless idle scheduler.
#[derive(Clone, Copy, Debug)]
pub struct TicklessConfig {
    /// RTOS tick rate.
    pub tick_rate_hz: u32,
    /// Idle periods shorter than this only execute `wfi`.
    pub legacy_sleep_threshold_ms: u32,
    /// Idle periods longer than this may use deep sleep.
    pub deep_sleep_threshold_ms: u32,
    /// Time from the wake event to the scheduler running again, per mode.
    pub sleep_overhead_ms: u32,
    pub legacy_sleep_overhead_ms: u32,
    pub deep_sleep_overhead_ms: u32,
    /// GPT port reserved for the wake alarm.
    pub wake_timer_port: usize,
    /// How often the 32 kHz clock is re-measured, in 32 kHz ticks.
    pub calibration_interval_ticks: u32,
}

impl TicklessConfig {
    pub const DEFAULT: TicklessConfig = TicklessConfig {
        tick_rate_hz: 1000,
        legacy_sleep_threshold_ms: 2,
        deep_sleep_threshold_ms: 4,
        sleep_overhead_ms: 0,
        legacy_sleep_overhead_ms: 1,
        deep_sleep_overhead_ms: 2,
        wake_timer_port: gpt::GPT1,
        // About 60 seconds.
        calibration_interval_ticks: 60 * 32_768,
    };
}
