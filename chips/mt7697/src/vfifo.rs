// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Virtual FIFO DMA channels.
//!
//! A VFIFO channel is a ring buffer in RAM shared between the CPU and the
//! DMA engine. Each side owns one pointer: for a TX channel the CPU advances
//! the write pointer and the engine drains at the read pointer, for an RX
//! channel it is the other way round. Both pointers carry a wrap bit that
//! toggles every time the pointer passes the end of the buffer, which tells
//! a full ring from an empty one.
//!
//! The engine raises a threshold interrupt when a TX channel drains down to
//! its threshold or an RX channel fills up to it, and an RX timeout
//! interrupt when bytes sit in the ring without reaching the threshold.

use core::cell::Cell;

use tock_cells::optional_cell::OptionalCell;
use tock_cells::take_cell::TakeCell;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs};

use crate::log::trace;

/// Start of the DMA block holding the VFIFO channels.
pub const DMA_BASE: usize = 0x8301_0000;

pub const VFIFO_CHANNELS: usize = 4;
pub const UART0_TX_CHANNEL: usize = 0;
pub const UART0_RX_CHANNEL: usize = 1;
pub const UART1_TX_CHANNEL: usize = 2;
pub const UART1_RX_CHANNEL: usize = 3;

/// Largest ring a 16-bit pointer offset can address.
pub const VFIFO_MAX_SIZE: usize = 0xffff;

register_structs! {
    pub DmaRegisters {
        /// Interrupt pending, one bit per channel.
        (0x000 => global_status: ReadWrite<u32>),
        (0x004 => _reserved0),
        (0x100 => channel: [VfifoChannelRegisters; VFIFO_CHANNELS]),
        (0x500 => @END),
    },

    pub VfifoChannelRegisters {
        (0x00 => wrptr: ReadWrite<u32, Pointer::Register>),
        (0x04 => rdptr: ReadWrite<u32, Pointer::Register>),
        (0x08 => intsta: ReadWrite<u32, Interrupt::Register>),
        /// Write 1 to acknowledge the matching `intsta` bit.
        (0x0c => ackint: ReadWrite<u32, Interrupt::Register>),
        (0x10 => con: ReadWrite<u32, Control::Register>),
        (0x14 => start: ReadWrite<u32, Start::Register>),
        (0x18 => pgmaddr: ReadWrite<u32>),
        (0x1c => ffsize: ReadWrite<u32>),
        (0x20 => threshold: ReadWrite<u32>),
        /// RX only: room left when the sender is asked to pause.
        (0x24 => altlen: ReadWrite<u32>),
        /// RX only: idle time before a timeout interrupt.
        (0x28 => timeout: ReadWrite<u32>),
        (0x2c => _reserved0),
        (0x100 => @END),
    }
}

register_bitfields![u32,
    Pointer [
        OFFSET  OFFSET(0)   NUMBITS(16) [],
        WRAP    OFFSET(16)  NUMBITS(1) []
    ],

    Interrupt [
        THRESHOLD   0,
        TIMEOUT     1
    ],

    Control [
        THRESHOLD_IE    OFFSET(0)   NUMBITS(1) [],
        TIMEOUT_IE      OFFSET(1)   NUMBITS(1) [],
        DIR             OFFSET(2)   NUMBITS(1) [
            MemoryToPeripheral = 0,
            PeripheralToMemory = 1
        ]
    ],

    Start [
        STR 15
    ]
];

/// # Safety
///
/// `DMA_BASE` must map a [`DmaRegisters`] block, which only holds on an
/// MT7697.
pub unsafe fn registers() -> &'static DmaRegisters {
    &*(DMA_BASE as *const DmaRegisters)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Tx,
    Rx,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VfifoEvent {
    Threshold,
    Timeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VfifoError {
    /// Buffer empty, too large or not word aligned.
    Buffer,
    /// Threshold or alert length larger than the buffer.
    Threshold,
}

/// Receives the interrupts of one channel. Runs in interrupt context.
pub trait DmaClient {
    fn vfifo_event(&self, channel: usize, event: VfifoEvent);
}

#[derive(Clone, Copy, Default)]
struct ChannelSnapshot {
    con: u32,
    pgmaddr: u32,
    ffsize: u32,
    threshold: u32,
    altlen: u32,
    timeout: u32,
    wrptr: u32,
    rdptr: u32,
    start: u32,
}

pub struct VfifoChannel<'a> {
    registers: &'a VfifoChannelRegisters,
    id: usize,
    direction: Direction,
    buffer: TakeCell<'static, [u8]>,
    size: Cell<usize>,
    saved: Cell<ChannelSnapshot>,
    client: OptionalCell<&'a dyn DmaClient>,
}

impl<'a> VfifoChannel<'a> {
    fn new(registers: &'a VfifoChannelRegisters, id: usize) -> Self {
        VfifoChannel {
            registers,
            id,
            direction: if id % 2 == 0 {
                Direction::Tx
            } else {
                Direction::Rx
            },
            buffer: TakeCell::empty(),
            size: Cell::new(0),
            saved: Cell::new(ChannelSnapshot::default()),
            client: OptionalCell::empty(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn set_client(&self, client: &'a dyn DmaClient) {
        self.client.set(client);
    }

    pub fn clear_client(&self) {
        self.client.clear();
    }

    pub fn is_configured(&self) -> bool {
        self.buffer.is_some()
    }

    /// Hand `buffer` to the channel and program the ring. `alert` and
    /// `timeout` only apply to RX channels.
    pub fn configure(
        &self,
        buffer: &'static mut [u8],
        threshold: usize,
        alert: usize,
        timeout: u32,
    ) -> Result<(), (VfifoError, &'static mut [u8])> {
        let size = buffer.len();
        if size == 0 || size > VFIFO_MAX_SIZE || buffer.as_ptr() as usize % 4 != 0 {
            return Err((VfifoError::Buffer, buffer));
        }
        if threshold > size || alert > size {
            return Err((VfifoError::Threshold, buffer));
        }

        let regs = self.registers;
        regs.start.write(Start::STR::CLEAR);
        regs.pgmaddr.set(buffer.as_ptr() as usize as u32);
        regs.ffsize.set(size as u32);
        regs.threshold.set(threshold as u32);
        regs.wrptr.set(0);
        regs.rdptr.set(0);
        match self.direction {
            Direction::Tx => regs.con.write(Control::DIR::MemoryToPeripheral),
            Direction::Rx => {
                regs.altlen.set(alert as u32);
                regs.timeout.set(timeout);
                regs.con.write(Control::DIR::PeripheralToMemory);
            }
        }
        self.size.set(size);
        self.buffer.replace(buffer);
        Ok(())
    }

    /// Stop the channel and give the buffer back.
    pub fn release(&self) -> Option<&'static mut [u8]> {
        self.stop();
        self.registers
            .con
            .modify(Control::THRESHOLD_IE::CLEAR + Control::TIMEOUT_IE::CLEAR);
        self.size.set(0);
        self.buffer.take()
    }

    pub fn start(&self) {
        self.registers.start.write(Start::STR::SET);
    }

    pub fn stop(&self) {
        self.registers.start.write(Start::STR::CLEAR);
    }

    pub fn set_timeout(&self, timeout: u32) {
        self.registers.timeout.set(timeout);
    }

    pub fn size(&self) -> usize {
        self.size.get()
    }

    /// Bytes between the read and the write pointer.
    pub fn valid_bytes(&self) -> usize {
        let size = self.size.get();
        if size == 0 {
            return 0;
        }
        let write = self.registers.wrptr.read(Pointer::OFFSET) as usize;
        let read = self.registers.rdptr.read(Pointer::OFFSET) as usize;
        if self.registers.wrptr.read(Pointer::WRAP) == self.registers.rdptr.read(Pointer::WRAP) {
            write.saturating_sub(read)
        } else {
            (size + write).saturating_sub(read)
        }
    }

    pub fn free_space(&self) -> usize {
        self.size.get().saturating_sub(self.valid_bytes())
    }

    fn advance(&self, pointer: &ReadWrite<u32, Pointer::Register>, count: usize) {
        let size = self.size.get();
        let mut offset = pointer.read(Pointer::OFFSET) as usize + count;
        let mut wrap = pointer.read(Pointer::WRAP);
        if offset >= size {
            offset -= size;
            wrap ^= 1;
        }
        pointer.write(Pointer::OFFSET.val(offset as u32) + Pointer::WRAP.val(wrap));
    }

    /// Copy as much of `data` into a TX ring as fits. Returns the count.
    pub fn push(&self, data: &[u8]) -> usize {
        let count = data.len().min(self.free_space());
        if count == 0 {
            return 0;
        }
        let start = self.registers.wrptr.read(Pointer::OFFSET) as usize;
        let size = self.size.get();
        self.buffer.map(|ring| {
            for (i, byte) in data[..count].iter().enumerate() {
                ring[(start + i) % size] = *byte;
            }
        });
        self.advance(&self.registers.wrptr, count);
        count
    }

    /// Copy as many received bytes as `buf` holds out of an RX ring.
    pub fn pop(&self, buf: &mut [u8]) -> usize {
        let count = buf.len().min(self.valid_bytes());
        if count == 0 {
            return 0;
        }
        let start = self.registers.rdptr.read(Pointer::OFFSET) as usize;
        let size = self.size.get();
        self.buffer.map(|ring| {
            for (i, byte) in buf[..count].iter_mut().enumerate() {
                *byte = ring[(start + i) % size];
            }
        });
        self.advance(&self.registers.rdptr, count);
        count
    }

    /// Drop everything in the ring.
    pub fn purge(&self) {
        self.registers.rdptr.set(self.registers.wrptr.get());
    }

    pub fn enable_threshold_interrupt(&self) {
        self.registers.con.modify(Control::THRESHOLD_IE::SET);
    }

    pub fn disable_threshold_interrupt(&self) {
        self.registers.con.modify(Control::THRESHOLD_IE::CLEAR);
    }

    pub fn enable_timeout_interrupt(&self) {
        self.registers.con.modify(Control::TIMEOUT_IE::SET);
    }

    pub fn disable_timeout_interrupt(&self) {
        self.registers.con.modify(Control::TIMEOUT_IE::CLEAR);
    }

    pub fn threshold_interrupt_enabled(&self) -> bool {
        self.registers.con.is_set(Control::THRESHOLD_IE)
    }

    pub fn timeout_interrupt_enabled(&self) -> bool {
        self.registers.con.is_set(Control::TIMEOUT_IE)
    }

    pub fn backup(&self) {
        let regs = self.registers;
        self.saved.set(ChannelSnapshot {
            con: regs.con.get(),
            pgmaddr: regs.pgmaddr.get(),
            ffsize: regs.ffsize.get(),
            threshold: regs.threshold.get(),
            altlen: regs.altlen.get(),
            timeout: regs.timeout.get(),
            wrptr: regs.wrptr.get(),
            rdptr: regs.rdptr.get(),
            start: regs.start.get(),
        });
    }

    /// Ring geometry first, then pointers, then the start bit.
    pub fn restore(&self) {
        let regs = self.registers;
        let saved = self.saved.get();
        regs.pgmaddr.set(saved.pgmaddr);
        regs.ffsize.set(saved.ffsize);
        regs.threshold.set(saved.threshold);
        regs.altlen.set(saved.altlen);
        regs.timeout.set(saved.timeout);
        regs.wrptr.set(saved.wrptr);
        regs.rdptr.set(saved.rdptr);
        regs.con.set(saved.con);
        regs.start.set(saved.start);
    }

    fn handle_interrupt(&self) {
        let status = self.registers.intsta.extract();
        self.registers.ackint.set(status.get());
        if status.is_set(Interrupt::THRESHOLD) && self.threshold_interrupt_enabled() {
            trace!("vfifo{} threshold", self.id);
            self.client
                .map(|client| client.vfifo_event(self.id, VfifoEvent::Threshold));
        }
        if status.is_set(Interrupt::TIMEOUT) && self.timeout_interrupt_enabled() {
            trace!("vfifo{} timeout", self.id);
            self.client
                .map(|client| client.vfifo_event(self.id, VfifoEvent::Timeout));
        }
    }
}

pub struct VfifoDma<'a> {
    registers: &'a DmaRegisters,
    channels: [VfifoChannel<'a>; VFIFO_CHANNELS],
}

impl<'a> VfifoDma<'a> {
    pub fn new(registers: &'a DmaRegisters) -> Self {
        VfifoDma {
            registers,
            channels: [
                VfifoChannel::new(&registers.channel[0], 0),
                VfifoChannel::new(&registers.channel[1], 1),
                VfifoChannel::new(&registers.channel[2], 2),
                VfifoChannel::new(&registers.channel[3], 3),
            ],
        }
    }

    pub fn channel(&self, id: usize) -> Option<&VfifoChannel<'a>> {
        self.channels.get(id)
    }

    /// Demultiplex the shared DMA interrupt to the owning channels.
    pub fn handle_interrupt(&self) {
        let pending = self.registers.global_status.get();
        for channel in self.channels.iter() {
            if pending & (1 << channel.id) != 0 {
                channel.handle_interrupt();
            }
        }
    }
}

impl crate::isr::InterruptHandler for VfifoDma<'_> {
    fn handle_irq(&self, _irq: u32) {
        self.handle_interrupt();
    }
}
