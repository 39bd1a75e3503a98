// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Peripheral implementations for the MediaTek MT7697 (Cortex-M4F).
//!
//! Centered on power management: tickless idle, the sleep-lock table, and
//! the context save and restore around deep sleep, plus the drivers whose
//! state has to survive it.

#![crate_name = "mt7697"]
#![crate_type = "rlib"]
#![no_std]

mod log;

pub mod chip;
pub mod clock;
pub mod config;
pub mod context;
pub mod gpio;
pub mod gpt;
pub mod isr;
pub mod lp;
pub mod nvic;
pub mod sleep_manager;
pub mod tickless;
pub mod uart;
pub mod vfifo;
