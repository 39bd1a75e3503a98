// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Chip-level peripheral set.

use cortexm::scb::Scb;
use cortexm::CoreRegisters;

use crate::clock::LowPowerClock;
use crate::context::HardwareContext;
use crate::gpio::{Gpio, GpioRegisters};
use crate::gpt::{Gpt, GptRegisters};
use crate::isr::{IsrTable, NvicError};
use crate::log::debug;
use crate::nvic;
use crate::sleep_manager::SleepManager;
use crate::uart::{Uart, UartPort, UartRegisters};
use crate::vfifo::{DmaRegisters, VfifoDma};

pub struct Mt7697DefaultPeripherals<'a> {
    pub isr: IsrTable<'a>,
    pub gpt: Gpt<'a>,
    pub sleep_manager: SleepManager,
    pub clock: LowPowerClock,
    pub dma: VfifoDma<'a>,
    pub uart0: Uart<'a>,
    pub uart1: Uart<'a>,
    pub gpio: Gpio<'a>,
}

impl Mt7697DefaultPeripherals<'static> {
    /// # Safety
    ///
    /// Only valid on an MT7697, and only once.
    pub unsafe fn new() -> Self {
        Self::with_registers(
            crate::gpt::registers(),
            crate::vfifo::registers(),
            [
                crate::uart::registers(UartPort::Uart0),
                crate::uart::registers(UartPort::Uart1),
            ],
            crate::gpio::registers(),
        )
    }
}

impl<'a> Mt7697DefaultPeripherals<'a> {
    pub fn with_registers(
        gpt: &'a GptRegisters,
        dma: &'a DmaRegisters,
        uarts: [&'a UartRegisters; 2],
        gpio: &'a GpioRegisters,
    ) -> Self {
        Self {
            isr: IsrTable::new(),
            gpt: Gpt::new(gpt),
            sleep_manager: SleepManager::new(),
            clock: LowPowerClock::new(),
            dma: VfifoDma::new(dma),
            uart0: Uart::new(uarts[0], UartPort::Uart0),
            uart1: Uart::new(uarts[1], UartPort::Uart1),
            gpio: Gpio::new(gpio),
        }
    }

    /// Wire the drivers to each other and to their interrupt lines.
    pub fn init(&'a self) -> Result<(), NvicError> {
        for uart in [&self.uart0, &self.uart1] {
            let port = uart.port();
            if let (Some(tx), Some(rx)) = (
                self.dma.channel(port.tx_channel()),
                self.dma.channel(port.rx_channel()),
            ) {
                uart.set_dma_channels(tx, rx);
            }
            uart.set_sleep_manager(&self.sleep_manager);
            self.isr.register_isr_handler(port.irq(), uart)?;
        }
        self.isr.register_isr_handler(nvic::DMA, &self.dma)?;
        self.isr.register_isr_handler(nvic::GPT, &self.gpt)?;
        debug!("mt7697 peripherals ready");
        Ok(())
    }

    /// The deep-sleep context over these peripherals.
    pub fn hardware_context(&'a self, core: CoreRegisters<'a>) -> HardwareContext<'a> {
        HardwareContext::new(core, [&self.uart0, &self.uart1], &self.gpio)
    }

    /// Returns whether a handler ran.
    pub fn service_interrupt(&self, irq: u32) -> bool {
        self.isr.dispatch(irq).is_ok()
    }

    /// Service whatever exception the core is currently handling.
    pub fn service_active(&self, scb: &Scb) -> bool {
        self.isr.dispatch_active(scb).is_ok()
    }
}
