// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Interrupt numbers of the MT7697 CM4 subsystem.

pub const UART0: u32 = 0;
pub const DMA: u32 = 1;
pub const HIF: u32 = 2;
pub const I2C0: u32 = 3;
pub const I2C1: u32 = 4;
pub const UART1: u32 = 5;
pub const CRYPTO: u32 = 6;
pub const SERIAL_FLASH: u32 = 7;
pub const EINT: u32 = 8;
pub const BTIF: u32 = 9;
pub const WDT: u32 = 10;
pub const SPI_SLAVE: u32 = 12;
pub const N9_WDT: u32 = 13;
pub const ADC: u32 = 14;
pub const GPT3: u32 = 20;
pub const GPT: u32 = 24;
pub const CONNSYS_OWN: u32 = 31;

/// Number of external interrupt lines.
pub const IRQ_NUMBER_MAX: usize = 96;
