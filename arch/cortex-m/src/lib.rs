// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Generic support for Cortex-M4 platforms: the core peripherals, barrier
//! and interrupt-mask primitives, and saved copies of the core state that a
//! power down loses.

#![crate_name = "cortexm"]
#![crate_type = "rlib"]
#![no_std]

pub mod fpu;
pub mod nvic;
pub mod scb;
pub mod support;
pub mod systick;

/// The core peripheral blocks of one Cortex-M4 core.
#[derive(Clone, Copy)]
pub struct CoreRegisters<'a> {
    pub nvic: &'a nvic::NvicRegisters,
    pub scb: &'a scb::ScbRegisters,
    pub systick: &'a systick::SysTickRegisters,
    pub fpu: &'a fpu::FpuRegisters,
}

impl CoreRegisters<'static> {
    /// The blocks at their architectural addresses.
    ///
    /// # Safety
    ///
    /// Only valid on a Cortex-M4 core.
    pub unsafe fn hardware() -> Self {
        CoreRegisters {
            nvic: nvic::registers(),
            scb: scb::registers(),
            systick: systick::registers(),
            fpu: fpu::registers(),
        }
    }
}
