// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! GPIO and pin multiplexing.
//!
//! Only what the power path needs: pins can be driven and read, and the
//! whole bank configuration survives deep sleep through
//! [`Gpio::backup`] and [`Gpio::restore`].

use core::cell::Cell;

use cortexm::support;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite};
use tock_registers::register_structs;

use crate::log::trace;

/// Start of the GPIO and pin-mux block.
pub const GPIO_BASE: usize = 0x8300_b000;

/// Pins 0..=60 in two 32-bit banks.
pub const GPIO_PIN_MAX: u32 = 61;
const BANKS: usize = 2;
/// Four bits of function select per pin.
const PINMUX_WORDS: usize = 8;

register_structs! {
    pub GpioRegisters {
        (0x000 => pinmux: [ReadWrite<u32>; PINMUX_WORDS]),
        (0x020 => dout: [ReadWrite<u32>; BANKS]),
        (0x028 => _reserved0),
        (0x030 => doe: [ReadWrite<u32>; BANKS]),
        (0x038 => _reserved1),
        (0x040 => din: [ReadOnly<u32>; BANKS]),
        (0x048 => _reserved2),
        (0x050 => pullup: [ReadWrite<u32>; BANKS]),
        (0x058 => pulldown: [ReadWrite<u32>; BANKS]),
        (0x060 => ies: [ReadWrite<u32>; BANKS]),
        (0x068 => @END),
    }
}

/// # Safety
///
/// `GPIO_BASE` must map a [`GpioRegisters`] block, which only holds on an
/// MT7697.
pub unsafe fn registers() -> &'static GpioRegisters {
    &*(GPIO_BASE as *const GpioRegisters)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GpioError {
    InvalidPin,
    InvalidFunction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pull {
    None,
    Up,
    Down,
}

#[derive(Clone, Copy, Default)]
struct Snapshot {
    pinmux: [u32; PINMUX_WORDS],
    dout: [u32; BANKS],
    doe: [u32; BANKS],
    pullup: [u32; BANKS],
    pulldown: [u32; BANKS],
    ies: [u32; BANKS],
}

pub struct Gpio<'a> {
    registers: &'a GpioRegisters,
    saved: Cell<Snapshot>,
}

fn locate(pin: u32) -> Result<(usize, u32), GpioError> {
    if pin >= GPIO_PIN_MAX {
        return Err(GpioError::InvalidPin);
    }
    Ok(((pin / 32) as usize, 1 << (pin % 32)))
}

/// Pins share a word, so the read-modify-write must not be split by an
/// interrupt touching a neighbour.
fn set_bit(reg: &ReadWrite<u32>, mask: u32, on: bool) {
    support::atomic(|| {
        let value = reg.get();
        reg.set(if on { value | mask } else { value & !mask });
    });
}

impl<'a> Gpio<'a> {
    pub fn new(registers: &'a GpioRegisters) -> Self {
        Gpio {
            registers,
            saved: Cell::new(Snapshot::default()),
        }
    }

    pub fn set_function(&self, pin: u32, function: u8) -> Result<(), GpioError> {
        locate(pin)?;
        if function > 0xf {
            return Err(GpioError::InvalidFunction);
        }
        let reg = &self.registers.pinmux[(pin / 8) as usize];
        let shift = (pin % 8) * 4;
        support::atomic(|| {
            reg.set((reg.get() & !(0xf << shift)) | ((function as u32) << shift));
        });
        Ok(())
    }

    pub fn make_output(&self, pin: u32) -> Result<(), GpioError> {
        let (bank, mask) = locate(pin)?;
        set_bit(&self.registers.doe[bank], mask, true);
        Ok(())
    }

    pub fn make_input(&self, pin: u32, pull: Pull) -> Result<(), GpioError> {
        let (bank, mask) = locate(pin)?;
        set_bit(&self.registers.doe[bank], mask, false);
        set_bit(&self.registers.ies[bank], mask, true);
        set_bit(&self.registers.pullup[bank], mask, pull == Pull::Up);
        set_bit(&self.registers.pulldown[bank], mask, pull == Pull::Down);
        Ok(())
    }

    pub fn set(&self, pin: u32) -> Result<(), GpioError> {
        let (bank, mask) = locate(pin)?;
        set_bit(&self.registers.dout[bank], mask, true);
        Ok(())
    }

    pub fn clear(&self, pin: u32) -> Result<(), GpioError> {
        let (bank, mask) = locate(pin)?;
        set_bit(&self.registers.dout[bank], mask, false);
        Ok(())
    }

    pub fn read(&self, pin: u32) -> Result<bool, GpioError> {
        let (bank, mask) = locate(pin)?;
        Ok(self.registers.din[bank].get() & mask != 0)
    }

    pub fn backup(&self) {
        let regs = self.registers;
        let mut snapshot = Snapshot::default();
        for (saved, reg) in snapshot.pinmux.iter_mut().zip(regs.pinmux.iter()) {
            *saved = reg.get();
        }
        for bank in 0..BANKS {
            snapshot.dout[bank] = regs.dout[bank].get();
            snapshot.doe[bank] = regs.doe[bank].get();
            snapshot.pullup[bank] = regs.pullup[bank].get();
            snapshot.pulldown[bank] = regs.pulldown[bank].get();
            snapshot.ies[bank] = regs.ies[bank].get();
        }
        self.saved.set(snapshot);
        trace!("gpio saved");
    }

    /// Output levels are written before output enables so no pin glitches
    /// on the way back.
    pub fn restore(&self) {
        let regs = self.registers;
        let snapshot = self.saved.get();
        for bank in 0..BANKS {
            regs.dout[bank].set(snapshot.dout[bank]);
            regs.pullup[bank].set(snapshot.pullup[bank]);
            regs.pulldown[bank].set(snapshot.pulldown[bank]);
            regs.ies[bank].set(snapshot.ies[bank]);
        }
        for (reg, saved) in regs.pinmux.iter().zip(snapshot.pinmux.iter()) {
            reg.set(*saved);
        }
        for bank in 0..BANKS {
            regs.doe[bank].set(snapshot.doe[bank]);
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    extern crate std;

    use super::*;
    use std::boxed::Box;

    pub(crate) fn registers() -> &'static GpioRegisters {
        Box::leak(Box::new(unsafe { core::mem::zeroed::<GpioRegisters>() }))
    }

    #[test]
    fn pins_out_of_range() {
        let gpio = Gpio::new(registers());
        assert_eq!(gpio.set(GPIO_PIN_MAX), Err(GpioError::InvalidPin));
        assert_eq!(gpio.set_function(3, 0x10), Err(GpioError::InvalidFunction));
    }

    #[test]
    fn drive_and_mux() {
        let regs = registers();
        let gpio = Gpio::new(regs);
        gpio.make_output(33).unwrap();
        gpio.set(33).unwrap();
        assert_eq!(regs.dout[1].get(), 1 << 1);
        assert_eq!(regs.doe[1].get(), 1 << 1);
        gpio.clear(33).unwrap();
        assert_eq!(regs.dout[1].get(), 0);

        gpio.set_function(9, 7).unwrap();
        assert_eq!(regs.pinmux[1].get(), 7 << 4);
        gpio.make_input(2, Pull::Up).unwrap();
        assert_eq!(regs.pullup[0].get(), 1 << 2);
        assert_eq!(regs.pulldown[0].get(), 0);
    }

    #[test]
    fn neighbouring_pins_keep_their_bits() {
        let regs = registers();
        let gpio = Gpio::new(regs);
        regs.dout[0].set(0xa5a5_0000);
        for pin in [0, 1, 2, 3] {
            gpio.set(pin).unwrap();
        }
        // As if from a handler running inside a driver's critical section.
        support::atomic(|| gpio.clear(1)).unwrap();
        assert_eq!(regs.dout[0].get(), 0xa5a5_000d);

        gpio.set_function(8, 2).unwrap();
        support::atomic(|| gpio.set_function(9, 5)).unwrap();
        gpio.set_function(8, 4).unwrap();
        assert_eq!(regs.pinmux[1].get(), (5 << 4) | 4);
    }

    #[test]
    fn backup_restore_round_trip() {
        let regs = registers();
        let gpio = Gpio::new(regs);
        gpio.set_function(4, 3).unwrap();
        gpio.make_output(4).unwrap();
        gpio.set(4).unwrap();
        gpio.make_input(40, Pull::Down).unwrap();
        gpio.backup();

        // Deep sleep loses the bank.
        for reg in regs.pinmux.iter() {
            reg.set(0);
        }
        for bank in 0..BANKS {
            regs.dout[bank].set(0);
            regs.doe[bank].set(0);
            regs.pulldown[bank].set(0);
            regs.ies[bank].set(0);
        }

        gpio.restore();
        assert_eq!(regs.pinmux[0].get(), 3 << 16);
        assert_eq!(regs.dout[0].get(), 1 << 4);
        assert_eq!(regs.doe[0].get(), 1 << 4);
        assert_eq!(regs.pulldown[1].get(), 1 << 8);
        assert_eq!(regs.ies[1].get(), 1 << 8);
    }
}
