// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Hardware context kept across deep sleep.
//!
//! Deep sleep cuts power to the core and to most peripherals. Everything the
//! firmware configured in them is saved here right before the power down
//! and written back right after the wake, with interrupts masked throughout.
//!
//! The save order is fixed by `SEQUENCE`. Restore walks it backwards, so
//! the NVIC, which re-opens interrupt delivery, always comes back last.

use core::cell::Cell;

use cortexm::fpu::FpuSnapshot;
use cortexm::nvic::NvicSnapshot;
use cortexm::scb::ScbSnapshot;
use cortexm::systick::SysTickSnapshot;
use cortexm::CoreRegisters;

use crate::gpio::Gpio;
use crate::log::trace;
use crate::nvic::IRQ_NUMBER_MAX;
use crate::uart::Uart;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Domain {
    Nvic,
    Fpu,
    SystemControl,
    Uart,
    Gpio,
}

struct DomainOps {
    domain: Domain,
    save: fn(&HardwareContext<'_>),
    restore: fn(&HardwareContext<'_>),
}

const SEQUENCE: [DomainOps; 5] = [
    DomainOps {
        domain: Domain::Nvic,
        save: save_nvic,
        restore: restore_nvic,
    },
    DomainOps {
        domain: Domain::Fpu,
        save: save_fpu,
        restore: restore_fpu,
    },
    DomainOps {
        domain: Domain::SystemControl,
        save: save_system_control,
        restore: restore_system_control,
    },
    DomainOps {
        domain: Domain::Uart,
        save: save_uart,
        restore: restore_uart,
    },
    DomainOps {
        domain: Domain::Gpio,
        save: save_gpio,
        restore: restore_gpio,
    },
];

fn save_nvic(ctx: &HardwareContext<'_>) {
    ctx.nvic.save(ctx.core.nvic);
}

fn restore_nvic(ctx: &HardwareContext<'_>) {
    ctx.nvic.restore(ctx.core.nvic);
}

fn save_fpu(ctx: &HardwareContext<'_>) {
    ctx.fpu.save(ctx.core.fpu);
}

fn restore_fpu(ctx: &HardwareContext<'_>) {
    ctx.fpu.restore(ctx.core.fpu);
}

// SysTick CTRL is captured last so its interrupt is masked only once the
// rest of the block is saved.
fn save_system_control(ctx: &HardwareContext<'_>) {
    ctx.scb.save(ctx.core.scb, ctx.core.nvic);
    ctx.systick.save(ctx.core.systick);
}

fn restore_system_control(ctx: &HardwareContext<'_>) {
    ctx.systick.restore(ctx.core.systick);
    ctx.scb.restore(ctx.core.scb, ctx.core.nvic);
}

fn save_uart(ctx: &HardwareContext<'_>) {
    for uart in ctx.uarts.iter() {
        uart.backup();
    }
}

fn restore_uart(ctx: &HardwareContext<'_>) {
    for uart in ctx.uarts.iter() {
        uart.restore();
    }
}

fn save_gpio(ctx: &HardwareContext<'_>) {
    ctx.gpio.backup();
}

fn restore_gpio(ctx: &HardwareContext<'_>) {
    ctx.gpio.restore();
}

pub struct HardwareContext<'a> {
    core: CoreRegisters<'a>,
    nvic: NvicSnapshot,
    scb: ScbSnapshot,
    systick: SysTickSnapshot,
    fpu: FpuSnapshot,
    uarts: [&'a Uart<'a>; 2],
    gpio: &'a Gpio<'a>,
    cycles: Cell<u32>,
}

impl<'a> HardwareContext<'a> {
    pub fn new(core: CoreRegisters<'a>, uarts: [&'a Uart<'a>; 2], gpio: &'a Gpio<'a>) -> Self {
        HardwareContext {
            core,
            nvic: NvicSnapshot::new(IRQ_NUMBER_MAX),
            scb: ScbSnapshot::new(),
            systick: SysTickSnapshot::new(),
            fpu: FpuSnapshot::new(),
            uarts,
            gpio,
            cycles: Cell::new(0),
        }
    }

    pub fn core(&self) -> CoreRegisters<'a> {
        self.core
    }

    /// Domains in the order they are saved.
    pub fn backup_order() -> [Domain; 5] {
        SEQUENCE.map(|step| step.domain)
    }

    /// Must run with interrupts masked.
    pub fn backup(&self) {
        for step in SEQUENCE.iter() {
            (step.save)(self);
            trace!("saved {:?}", step.domain);
        }
    }

    /// Must run with interrupts masked.
    pub fn restore(&self) {
        for step in SEQUENCE.iter().rev() {
            (step.restore)(self);
            trace!("restored {:?}", step.domain);
        }
        self.cycles.set(self.cycles.get().wrapping_add(1));
    }

    /// Completed backup and restore cycles.
    pub fn cycles(&self) -> u32 {
        self.cycles.get()
    }
}

#[cfg(test)]
pub(crate) mod test {
    extern crate std;

    use super::*;
    use crate::gpio::{GpioRegisters, Pull};
    use crate::uart::test::{dma_config, CONFIG_115200};
    use crate::uart::{UartClient, UartEvent, UartPort, UartRegisters};
    use crate::vfifo::{DmaRegisters, VfifoDma};
    use cortexm::fpu::{self, FpuRegisters};
    use cortexm::nvic::{Nvic, NvicRegisters};
    use cortexm::scb::{Scb, ScbRegisters};
    use cortexm::systick::{SysTick, SysTickRegisters};
    use std::boxed::Box;
    use std::vec::Vec;

    fn leak<T>() -> &'static T {
        Box::leak(Box::new(unsafe { core::mem::zeroed::<T>() }))
    }

    /// Raw bytes of a register block.
    fn image<T>(block: &T) -> Vec<u8> {
        let bytes = unsafe {
            core::slice::from_raw_parts(block as *const T as *const u8, core::mem::size_of::<T>())
        };
        bytes.to_vec()
    }

    /// Simulate the power rail dropping.
    fn wipe<T>(block: &T) {
        unsafe { core::ptr::write_bytes(block as *const T as *mut T, 0, 1) };
    }

    struct Quiet;

    impl UartClient for Quiet {
        fn uart_event(&self, _port: UartPort, _event: UartEvent) {}
    }

    /// A context over zeroed core blocks with idle peripherals.
    pub(crate) fn context() -> &'static HardwareContext<'static> {
        let core = CoreRegisters {
            nvic: leak::<NvicRegisters>(),
            scb: leak::<ScbRegisters>(),
            systick: leak::<SysTickRegisters>(),
            fpu: leak::<FpuRegisters>(),
        };
        let uart0: &'static Uart<'static> = Box::leak(Box::new(Uart::new(
            leak::<UartRegisters>(),
            UartPort::Uart0,
        )));
        let uart1: &'static Uart<'static> = Box::leak(Box::new(Uart::new(
            leak::<UartRegisters>(),
            UartPort::Uart1,
        )));
        let gpio: &'static Gpio<'static> = Box::leak(Box::new(Gpio::new(leak::<GpioRegisters>())));
        Box::leak(Box::new(HardwareContext::new(core, [uart0, uart1], gpio)))
    }

    #[test]
    fn order_is_fixed() {
        assert_eq!(
            HardwareContext::backup_order(),
            [
                Domain::Nvic,
                Domain::Fpu,
                Domain::SystemControl,
                Domain::Uart,
                Domain::Gpio
            ]
        );
    }

    #[test]
    fn round_trip_restores_every_domain() {
        let core = CoreRegisters {
            nvic: leak::<NvicRegisters>(),
            scb: leak::<ScbRegisters>(),
            systick: leak::<SysTickRegisters>(),
            fpu: leak::<FpuRegisters>(),
        };
        let dma_regs = leak::<DmaRegisters>();
        let uart_regs = [leak::<UartRegisters>(), leak::<UartRegisters>()];
        let gpio_regs = leak::<GpioRegisters>();

        let dma: &'static VfifoDma<'static> = Box::leak(Box::new(VfifoDma::new(dma_regs)));
        let uart0: &'static Uart<'static> =
            Box::leak(Box::new(Uart::new(uart_regs[0], UartPort::Uart0)));
        let uart1: &'static Uart<'static> =
            Box::leak(Box::new(Uart::new(uart_regs[1], UartPort::Uart1)));
        let gpio: &'static Gpio<'static> = Box::leak(Box::new(Gpio::new(gpio_regs)));
        uart0.set_dma_channels(dma.channel(0).unwrap(), dma.channel(1).unwrap());
        let ctx = HardwareContext::new(core, [uart0, uart1], gpio);

        let nvic = Nvic::new(core.nvic);
        let scb = Scb::new(core.scb);
        let systick = SysTick::new(core.systick, 32_000_000);
        nvic.enable(crate::nvic::GPT);
        nvic.set_priority(crate::nvic::GPT, 0x40);
        nvic.set_priority(crate::nvic::UART0, 0xa0);
        scb.set_vector_table_offset(0x1000_0200);
        scb.enable_fpu();
        fpu::enable_lazy_stacking(core.fpu);
        systick.start_periodic(1000);

        uart0.init(CONFIG_115200).unwrap();
        assert!(uart0.set_dma(dma_config::<16, 16>()).is_ok());
        uart0.register_callback(&Quiet).unwrap();
        uart0.send_dma(b"in flight");
        gpio.make_output(7).unwrap();
        gpio.set(7).unwrap();
        gpio.make_input(35, Pull::Up).unwrap();

        let scb_before = image(core.scb);
        let fpu_before = image(core.fpu);
        let uart_before = image(uart_regs[0]);
        let dma_before = image(dma_regs);
        let gpio_before = image(gpio_regs);

        ctx.backup();
        assert!(systick.is_running());
        assert!(!systick.interrupt_enabled());

        wipe(core.nvic);
        wipe(core.scb);
        wipe(core.systick);
        wipe(core.fpu);
        wipe(uart_regs[0]);
        wipe(dma_regs);
        wipe(gpio_regs);

        ctx.restore();
        assert_eq!(image(core.scb), scb_before);
        assert_eq!(image(core.fpu), fpu_before);
        assert_eq!(image(uart_regs[0]), uart_before);
        assert_eq!(image(dma_regs), dma_before);
        assert_eq!(image(gpio_regs), gpio_before);
        assert!(nvic.is_enabled(crate::nvic::GPT));
        assert!(!nvic.is_enabled(crate::nvic::UART0));
        assert_eq!(nvic.priority(crate::nvic::GPT), 0x40);
        assert_eq!(nvic.priority(crate::nvic::UART0), 0xa0);
        assert!(systick.is_running());
        assert!(systick.interrupt_enabled());
        assert_eq!(uart0.get_available_send_space(), 16 - 9);
        assert_eq!(ctx.cycles(), 1);
    }
}
