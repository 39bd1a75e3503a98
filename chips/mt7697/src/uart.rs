// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! UART with VFIFO DMA.
//!
//! A port starts in polling mode after [`Uart::init`]. Handing it a pair of
//! VFIFO buffers with [`Uart::set_dma`] and a client with
//! [`Uart::register_callback`] moves it to DMA mode, in which
//! [`Uart::send_dma`] and [`Uart::receive_dma`] copy in and out of the rings
//! and never block.
//!
//! While bytes are queued for transmission the port holds a sleep lock so
//! the chip does not power down under the shifter. The lock is dropped from
//! the transmit-complete interrupt once the TX ring is empty and the line is
//! idle.

use core::cell::Cell;

use cortexm::support;
use tock_cells::optional_cell::OptionalCell;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs};

use crate::isr::InterruptHandler;
use crate::log::{debug, error, trace};
use crate::nvic;
use crate::sleep_manager::{SleepHandle, SleepManager};
use crate::vfifo::{self, DmaClient, VfifoChannel, VfifoEvent, VFIFO_MAX_SIZE};

/// Register block of UART0.
pub const UART0_BASE: usize = 0x8303_0000;
/// Register block of UART1.
pub const UART1_BASE: usize = 0x8304_0000;

/// Module clock feeding the baud generator.
const UART_CLOCK_HZ: u32 = 40_000_000;

register_structs! {
    pub UartRegisters {
        /// RBR on read, THR on write.
        (0x00 => rbr_thr: ReadWrite<u32>),
        (0x04 => ier: ReadWrite<u32, Ier::Register>),
        (0x08 => fcr: ReadWrite<u32, Fcr::Register>),
        (0x0c => lcr: ReadWrite<u32, Lcr::Register>),
        (0x10 => mcr: ReadWrite<u32, Mcr::Register>),
        (0x14 => lsr: ReadWrite<u32, Lsr::Register>),
        (0x18 => msr: ReadWrite<u32>),
        (0x1c => scr: ReadWrite<u32>),
        /// Divisor latch, only reachable with LCR.DLAB set.
        (0x20 => dll: ReadWrite<u32>),
        (0x24 => dlm: ReadWrite<u32>),
        (0x28 => efr: ReadWrite<u32, Efr::Register>),
        (0x2c => xon1: ReadWrite<u32>),
        (0x30 => xoff1: ReadWrite<u32>),
        (0x34 => highspeed: ReadWrite<u32>),
        (0x38 => sample_count: ReadWrite<u32>),
        (0x3c => sample_point: ReadWrite<u32>),
        (0x40 => escape_dat: ReadWrite<u32>),
        (0x44 => escape_en: ReadWrite<u32>),
        (0x48 => dma_en: ReadWrite<u32, DmaEnable::Register>),
        (0x4c => fracdiv_l: ReadWrite<u32>),
        (0x50 => fracdiv_m: ReadWrite<u32>),
        (0x54 => @END),
    }
}

register_bitfields![u32,
    Ier [
        /// Received data available.
        ERBFI   0,
        /// Transmit holding register empty.
        ETBEI   1,
        /// Line status.
        ELSI    2
    ],

    Fcr [
        FIFOE   0,
        CLRR    1,
        CLRT    2
    ],

    Lcr [
        WLS     OFFSET(0)   NUMBITS(2) [
            Bits5 = 0,
            Bits6 = 1,
            Bits7 = 2,
            Bits8 = 3
        ],
        STB     OFFSET(2)   NUMBITS(1) [
            One = 0,
            Two = 1
        ],
        PEN     OFFSET(3)   NUMBITS(1) [],
        EPS     OFFSET(4)   NUMBITS(1) [
            Odd = 0,
            Even = 1
        ],
        SB      OFFSET(6)   NUMBITS(1) [],
        DLAB    OFFSET(7)   NUMBITS(1) []
    ],

    Mcr [
        RTS     1
    ],

    Lsr [
        DR      0,
        OE      1,
        PE      2,
        FE      3,
        BI      4,
        THRE    5,
        TEMT    6
    ],

    Efr [
        SW_FLOW     OFFSET(0)   NUMBITS(4) [
            Disabled = 0,
            TxRx = 0b1010
        ],
        ENHANCED    OFFSET(4)   NUMBITS(1) [],
        AUTO_RTS    OFFSET(6)   NUMBITS(1) [],
        AUTO_CTS    OFFSET(7)   NUMBITS(1) []
    ],

    DmaEnable [
        RX          0,
        TX          1,
        TO_AUTORST  2
    ]
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UartPort {
    Uart0,
    Uart1,
}

impl UartPort {
    pub fn irq(&self) -> u32 {
        match self {
            UartPort::Uart0 => nvic::UART0,
            UartPort::Uart1 => nvic::UART1,
        }
    }

    pub fn tx_channel(&self) -> usize {
        match self {
            UartPort::Uart0 => vfifo::UART0_TX_CHANNEL,
            UartPort::Uart1 => vfifo::UART1_TX_CHANNEL,
        }
    }

    pub fn rx_channel(&self) -> usize {
        match self {
            UartPort::Uart0 => vfifo::UART0_RX_CHANNEL,
            UartPort::Uart1 => vfifo::UART1_RX_CHANNEL,
        }
    }

    fn sleep_handle_name(&self) -> &'static str {
        match self {
            UartPort::Uart0 => "uart0",
            UartPort::Uart1 => "uart1",
        }
    }
}

/// # Safety
///
/// The port's base must map a [`UartRegisters`] block, which only holds on
/// an MT7697.
pub unsafe fn registers(port: UartPort) -> &'static UartRegisters {
    match port {
        UartPort::Uart0 => &*(UART0_BASE as *const UartRegisters),
        UartPort::Uart1 => &*(UART1_BASE as *const UartRegisters),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Baudrate {
    B110,
    B300,
    B1200,
    B2400,
    B4800,
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
    B230400,
    B460800,
    B921600,
}

impl Baudrate {
    pub fn hz(&self) -> u32 {
        match self {
            Baudrate::B110 => 110,
            Baudrate::B300 => 300,
            Baudrate::B1200 => 1200,
            Baudrate::B2400 => 2400,
            Baudrate::B4800 => 4800,
            Baudrate::B9600 => 9600,
            Baudrate::B19200 => 19200,
            Baudrate::B38400 => 38400,
            Baudrate::B57600 => 57600,
            Baudrate::B115200 => 115200,
            Baudrate::B230400 => 230400,
            Baudrate::B460800 => 460800,
            Baudrate::B921600 => 921600,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WordLength {
    Bits5,
    Bits6,
    Bits7,
    Bits8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UartConfig {
    pub baudrate: Baudrate,
    pub word_length: WordLength,
    pub stop_bit: StopBits,
    pub parity: Parity,
}

/// VFIFO rings for one port. Both buffers must be word aligned.
pub struct DmaConfig {
    pub send_buffer: &'static mut [u8],
    /// The TX threshold interrupt fires once the ring drains to this level.
    pub send_threshold: usize,
    pub receive_buffer: &'static mut [u8],
    /// The RX threshold interrupt fires once this many bytes are queued.
    pub receive_threshold: usize,
    /// Free space at which the sender is throttled.
    pub receive_alert: usize,
    pub receive_timeout: u32,
}

/// Buffers handed back by [`Uart::deinit`].
pub struct DmaBuffers {
    pub send: &'static mut [u8],
    pub receive: &'static mut [u8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UartState {
    Uninitialized,
    PollInitialized,
    DmaInitialized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UartError {
    /// Invalid argument.
    Parameter,
    /// Port already initialized or client already registered.
    Busy,
    /// Port not initialized.
    Uninitialized,
    /// Missing collaborator or exhausted resource.
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UartEvent {
    TransactionError,
    ReadyToRead,
    ReadyToWrite,
}

/// Runs in interrupt context.
pub trait UartClient {
    fn uart_event(&self, port: UartPort, event: UartEvent);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Hardware,
    Software { xon: u8, xoff: u8, escape: u8 },
}

#[derive(Clone, Copy, Default)]
struct UartSnapshot {
    ier: u32,
    lcr: u32,
    mcr: u32,
    dll: u32,
    dlm: u32,
    highspeed: u32,
    sample_count: u32,
    sample_point: u32,
    fracdiv_l: u32,
    fracdiv_m: u32,
    dma_en: u32,
}

pub struct Uart<'a> {
    registers: &'a UartRegisters,
    port: UartPort,
    state: Cell<UartState>,
    config: Cell<Option<UartConfig>>,
    flow: Cell<FlowControl>,
    dma_configured: Cell<bool>,
    tx: OptionalCell<&'a VfifoChannel<'a>>,
    rx: OptionalCell<&'a VfifoChannel<'a>>,
    sleep_manager: OptionalCell<&'a SleepManager>,
    sleep_handle: OptionalCell<SleepHandle>,
    tx_locked: Cell<bool>,
    client: OptionalCell<&'a dyn UartClient>,
    saved: Cell<UartSnapshot>,
}

impl<'a> Uart<'a> {
    pub fn new(registers: &'a UartRegisters, port: UartPort) -> Self {
        Uart {
            registers,
            port,
            state: Cell::new(UartState::Uninitialized),
            config: Cell::new(None),
            flow: Cell::new(FlowControl::None),
            dma_configured: Cell::new(false),
            tx: OptionalCell::empty(),
            rx: OptionalCell::empty(),
            sleep_manager: OptionalCell::empty(),
            sleep_handle: OptionalCell::empty(),
            tx_locked: Cell::new(false),
            client: OptionalCell::empty(),
            saved: Cell::new(UartSnapshot::default()),
        }
    }

    pub fn set_sleep_manager(&self, sleep_manager: &'a SleepManager) {
        self.sleep_manager.set(sleep_manager);
    }

    /// Attach this port's VFIFO channels and become their client.
    pub fn set_dma_channels(&'a self, tx: &'a VfifoChannel<'a>, rx: &'a VfifoChannel<'a>) {
        tx.set_client(self);
        rx.set_client(self);
        self.tx.set(tx);
        self.rx.set(rx);
    }

    pub fn port(&self) -> UartPort {
        self.port
    }

    pub fn state(&self) -> UartState {
        self.state.get()
    }

    pub fn config(&self) -> Option<UartConfig> {
        self.config.get()
    }

    fn require_initialized(&self) -> Result<(), UartError> {
        match self.state.get() {
            UartState::Uninitialized => Err(UartError::Uninitialized),
            _ => Ok(()),
        }
    }

    /// Claim the port for polling I/O. The state check and the transition
    /// happen in one critical section, so of two racing callers exactly one
    /// wins and the other gets `Busy`.
    pub fn init(&self, config: UartConfig) -> Result<(), UartError> {
        support::atomic(|| {
            if self.state.get() != UartState::Uninitialized {
                return Err(UartError::Busy);
            }
            let handle = self
                .sleep_manager
                .map(|manager| manager.set_sleep_handle(self.port.sleep_handle_name()))
                .transpose()
                .map_err(|_| UartError::Error)?;
            if let Some(handle) = handle {
                self.sleep_handle.set(handle);
            }

            let regs = self.registers;
            regs.ier.set(0);
            regs.dma_en.set(0);
            regs.efr.set(0);
            regs.escape_en.set(0);
            regs.fcr.write(Fcr::FIFOE::SET + Fcr::CLRR::SET + Fcr::CLRT::SET);
            self.program_baudrate(config.baudrate);
            self.program_format(config.word_length, config.stop_bit, config.parity);

            self.config.set(Some(config));
            self.flow.set(FlowControl::None);
            self.state.set(UartState::PollInitialized);
            Ok(())
        })?;
        debug!("uart{} init {}", self.port as u8, config.baudrate.hz());
        Ok(())
    }

    /// Return the port to reset state. Valid from any state; DMA buffers
    /// are handed back if the port had them.
    pub fn deinit(&self) -> Option<DmaBuffers> {
        let buffers = support::atomic(|| {
            let regs = self.registers;
            regs.ier.set(0);
            regs.dma_en.set(0);
            regs.efr.set(0);
            regs.escape_en.set(0);

            let buffers = if self.dma_configured.get() {
                let send = self.tx.and_then(|tx| tx.release());
                let receive = self.rx.and_then(|rx| rx.release());
                send.zip(receive)
                    .map(|(send, receive)| DmaBuffers { send, receive })
            } else {
                None
            };
            self.dma_configured.set(false);

            self.sleep_manager.map(|manager| {
                self.sleep_handle.take().map(|handle| {
                    let _ = manager.force_unlock(handle);
                    let _ = manager.release_sleep_handle(handle);
                });
            });
            self.tx_locked.set(false);
            self.client.clear();
            self.config.set(None);
            self.flow.set(FlowControl::None);
            self.state.set(UartState::Uninitialized);
            buffers
        });
        debug!("uart{} deinit", self.port as u8);
        buffers
    }

    /// Give the port its VFIFO rings. On error the buffers come back with
    /// the error.
    pub fn set_dma(&self, config: DmaConfig) -> Result<(), (UartError, DmaConfig)> {
        support::atomic(|| self.claim_dma(config))
    }

    fn claim_dma(&self, config: DmaConfig) -> Result<(), (UartError, DmaConfig)> {
        match self.state.get() {
            UartState::Uninitialized => return Err((UartError::Uninitialized, config)),
            UartState::DmaInitialized => return Err((UartError::Busy, config)),
            UartState::PollInitialized => {}
        }
        if self.dma_configured.get() {
            return Err((UartError::Busy, config));
        }
        let valid_ring = |buffer: &[u8]| {
            !buffer.is_empty() && buffer.len() <= VFIFO_MAX_SIZE && buffer.as_ptr() as usize % 4 == 0
        };
        if !valid_ring(config.send_buffer)
            || !valid_ring(config.receive_buffer)
            || config.send_threshold > config.send_buffer.len()
            || config.receive_threshold > config.receive_buffer.len()
            || config.receive_alert > config.receive_buffer.len()
        {
            return Err((UartError::Parameter, config));
        }
        let (tx, rx) = match self.channels() {
            Some(channels) => channels,
            None => return Err((UartError::Error, config)),
        };

        let DmaConfig {
            send_buffer,
            send_threshold,
            receive_buffer,
            receive_threshold,
            receive_alert,
            receive_timeout,
        } = config;
        if let Err((_, send_buffer)) = tx.configure(send_buffer, send_threshold, 0, 0) {
            return Err((
                UartError::Parameter,
                DmaConfig {
                    send_buffer,
                    send_threshold,
                    receive_buffer,
                    receive_threshold,
                    receive_alert,
                    receive_timeout,
                },
            ));
        }
        if let Err((_, receive_buffer)) =
            rx.configure(receive_buffer, receive_threshold, receive_alert, receive_timeout)
        {
            let send_buffer = tx.release().unwrap_or(&mut []);
            return Err((
                UartError::Parameter,
                DmaConfig {
                    send_buffer,
                    send_threshold,
                    receive_buffer,
                    receive_threshold,
                    receive_alert,
                    receive_timeout,
                },
            ));
        }

        self.registers
            .dma_en
            .write(DmaEnable::RX::SET + DmaEnable::TX::SET + DmaEnable::TO_AUTORST::SET);
        tx.start();
        rx.start();
        self.dma_configured.set(true);
        if self.client.is_some() {
            self.enter_dma_mode();
        }
        Ok(())
    }

    pub fn register_callback(&self, client: &'a dyn UartClient) -> Result<(), UartError> {
        support::atomic(|| {
            self.require_initialized()?;
            if self.client.is_some() {
                return Err(UartError::Busy);
            }
            self.client.set(client);
            if self.dma_configured.get() {
                self.enter_dma_mode();
            }
            Ok(())
        })
    }

    fn enter_dma_mode(&self) {
        self.rx.map(|rx| {
            rx.enable_threshold_interrupt();
            rx.enable_timeout_interrupt();
        });
        self.registers.ier.modify(Ier::ELSI::SET);
        self.state.set(UartState::DmaInitialized);
        trace!("uart{} dma mode", self.port as u8);
    }

    fn dma_channels(&self) -> Option<(&'a VfifoChannel<'a>, &'a VfifoChannel<'a>)> {
        if self.state.get() != UartState::DmaInitialized {
            return None;
        }
        self.channels()
    }

    fn channels(&self) -> Option<(&'a VfifoChannel<'a>, &'a VfifoChannel<'a>)> {
        self.tx.map(|tx| *tx).zip(self.rx.map(|rx| *rx))
    }

    /// Queue as much of `data` as the TX ring has room for and return the
    /// count. A short write arms the TX threshold interrupt, which reports
    /// `ReadyToWrite` once the ring drains.
    pub fn send_dma(&self, data: &[u8]) -> usize {
        let Some((tx, _)) = self.dma_channels() else {
            return 0;
        };
        support::atomic(|| {
            let queued = tx.push(data);
            if queued > 0 && !self.tx_locked.get() {
                self.sleep_manager.map(|manager| {
                    self.sleep_handle.map(|handle| {
                        let _ = manager.lock_sleep(*handle);
                    });
                });
                self.tx_locked.set(true);
                self.registers.ier.modify(Ier::ETBEI::SET);
            }
            if queued < data.len() {
                tx.enable_threshold_interrupt();
            }
            queued
        })
    }

    /// Copy out up to `buf.len()` received bytes. A short read arms the RX
    /// threshold interrupt.
    pub fn receive_dma(&self, buf: &mut [u8]) -> usize {
        let Some((_, rx)) = self.dma_channels() else {
            return 0;
        };
        support::atomic(|| {
            let read = rx.pop(buf);
            if read < buf.len() {
                rx.enable_threshold_interrupt();
            }
            read
        })
    }

    pub fn get_available_send_space(&self) -> usize {
        self.dma_channels().map_or(0, |(tx, _)| tx.free_space())
    }

    pub fn get_available_receive_bytes(&self) -> usize {
        self.dma_channels().map_or(0, |(_, rx)| rx.valid_bytes())
    }

    /// Receive timeout of the RX ring, in DMA engine ticks.
    pub fn set_dma_timeout(&self, timeout: u32) -> Result<(), UartError> {
        self.require_initialized()?;
        if !self.dma_configured.get() {
            return Err(UartError::Uninitialized);
        }
        self.rx.map(|rx| rx.set_timeout(timeout));
        Ok(())
    }

    pub fn put_char(&self, byte: u8) -> Result<(), UartError> {
        self.require_initialized()?;
        while !self.registers.lsr.is_set(Lsr::THRE) {
            support::nop();
        }
        self.registers.rbr_thr.set(byte as u32);
        Ok(())
    }

    pub fn get_char(&self) -> Result<u8, UartError> {
        self.require_initialized()?;
        while !self.registers.lsr.is_set(Lsr::DR) {
            support::nop();
        }
        Ok(self.registers.rbr_thr.get() as u8)
    }

    pub fn send_polling(&self, data: &[u8]) -> Result<usize, UartError> {
        for byte in data {
            self.put_char(*byte)?;
        }
        Ok(data.len())
    }

    pub fn receive_polling(&self, buf: &mut [u8]) -> Result<usize, UartError> {
        for byte in buf.iter_mut() {
            *byte = self.get_char()?;
        }
        Ok(buf.len())
    }

    pub fn set_baudrate(&self, baudrate: Baudrate) -> Result<(), UartError> {
        self.require_initialized()?;
        self.program_baudrate(baudrate);
        if let Some(mut config) = self.config.get() {
            config.baudrate = baudrate;
            self.config.set(Some(config));
        }
        Ok(())
    }

    pub fn set_format(
        &self,
        word_length: WordLength,
        stop_bit: StopBits,
        parity: Parity,
    ) -> Result<(), UartError> {
        self.require_initialized()?;
        self.program_format(word_length, stop_bit, parity);
        if let Some(mut config) = self.config.get() {
            config.word_length = word_length;
            config.stop_bit = stop_bit;
            config.parity = parity;
            self.config.set(Some(config));
        }
        Ok(())
    }

    pub fn set_hardware_flowcontrol(&self) -> Result<(), UartError> {
        self.set_flowcontrol(FlowControl::Hardware)
    }

    pub fn set_software_flowcontrol(&self, xon: u8, xoff: u8, escape: u8) -> Result<(), UartError> {
        self.set_flowcontrol(FlowControl::Software { xon, xoff, escape })
    }

    pub fn disable_flowcontrol(&self) -> Result<(), UartError> {
        self.set_flowcontrol(FlowControl::None)
    }

    pub fn flowcontrol(&self) -> FlowControl {
        self.flow.get()
    }

    fn set_flowcontrol(&self, flow: FlowControl) -> Result<(), UartError> {
        self.require_initialized()?;
        self.apply_flowcontrol(flow);
        self.flow.set(flow);
        Ok(())
    }

    fn apply_flowcontrol(&self, flow: FlowControl) {
        let regs = self.registers;
        match flow {
            FlowControl::None => {
                regs.efr.set(0);
                regs.escape_en.set(0);
            }
            FlowControl::Hardware => {
                regs.escape_en.set(0);
                regs.mcr.modify(Mcr::RTS::SET);
                regs.efr
                    .write(Efr::ENHANCED::SET + Efr::AUTO_RTS::SET + Efr::AUTO_CTS::SET);
            }
            FlowControl::Software { xon, xoff, escape } => {
                regs.xon1.set(xon as u32);
                regs.xoff1.set(xoff as u32);
                regs.escape_dat.set(escape as u32);
                regs.escape_en.set(1);
                regs.efr.write(Efr::ENHANCED::SET + Efr::SW_FLOW::TxRx);
            }
        }
    }

    /// Divisor, then sample count and sample point within one bit time, in
    /// high-speed mode 3.
    fn program_baudrate(&self, baudrate: Baudrate) {
        let regs = self.registers;
        let data = UART_CLOCK_HZ / baudrate.hz();
        let divisor = (data >> 8) + 1;
        let sample_count = (data / divisor).saturating_sub(1);
        let sample_point = if sample_count == 3 {
            0
        } else {
            (sample_count / 2).saturating_sub(1)
        };

        regs.lcr.modify(Lcr::DLAB::SET);
        regs.dll.set(divisor & 0xff);
        regs.dlm.set((divisor >> 8) & 0xff);
        regs.lcr.modify(Lcr::DLAB::CLEAR);
        regs.highspeed.set(3);
        regs.sample_count.set(sample_count);
        regs.sample_point.set(sample_point);
        regs.fracdiv_l.set(0);
        regs.fracdiv_m.set(0);
    }

    fn program_format(&self, word_length: WordLength, stop_bit: StopBits, parity: Parity) {
        let wls = match word_length {
            WordLength::Bits5 => Lcr::WLS::Bits5,
            WordLength::Bits6 => Lcr::WLS::Bits6,
            WordLength::Bits7 => Lcr::WLS::Bits7,
            WordLength::Bits8 => Lcr::WLS::Bits8,
        };
        let stb = match stop_bit {
            StopBits::One => Lcr::STB::One,
            StopBits::Two => Lcr::STB::Two,
        };
        let parity = match parity {
            Parity::None => Lcr::PEN::CLEAR,
            Parity::Odd => Lcr::PEN::SET + Lcr::EPS::Odd,
            Parity::Even => Lcr::PEN::SET + Lcr::EPS::Even,
        };
        self.registers.lcr.modify(wls + stb + parity);
    }

    /// Save the port registers and, in DMA mode, both VFIFO channels.
    pub fn backup(&self) {
        if self.state.get() == UartState::Uninitialized {
            return;
        }
        let regs = self.registers;
        self.saved.set(UartSnapshot {
            ier: regs.ier.get(),
            lcr: regs.lcr.get(),
            mcr: regs.mcr.get(),
            dll: regs.dll.get(),
            dlm: regs.dlm.get(),
            highspeed: regs.highspeed.get(),
            sample_count: regs.sample_count.get(),
            sample_point: regs.sample_point.get(),
            fracdiv_l: regs.fracdiv_l.get(),
            fracdiv_m: regs.fracdiv_m.get(),
            dma_en: regs.dma_en.get(),
        });
        if self.dma_configured.get() {
            self.tx.map(|tx| tx.backup());
            self.rx.map(|rx| rx.backup());
        }
    }

    /// Reprogram the port after a power cycle. Flow control is re-issued
    /// from the driver's record rather than from the saved registers, and
    /// interrupts are enabled last.
    pub fn restore(&self) {
        if self.state.get() == UartState::Uninitialized {
            return;
        }
        let regs = self.registers;
        let saved = self.saved.get();
        regs.fcr.write(Fcr::FIFOE::SET + Fcr::CLRR::SET + Fcr::CLRT::SET);
        regs.lcr.set(saved.lcr);
        regs.lcr.modify(Lcr::DLAB::SET);
        regs.dll.set(saved.dll);
        regs.dlm.set(saved.dlm);
        regs.lcr.set(saved.lcr);
        regs.highspeed.set(saved.highspeed);
        regs.sample_count.set(saved.sample_count);
        regs.sample_point.set(saved.sample_point);
        regs.fracdiv_l.set(saved.fracdiv_l);
        regs.fracdiv_m.set(saved.fracdiv_m);
        regs.mcr.set(saved.mcr);
        if self.dma_configured.get() {
            self.tx.map(|tx| tx.restore());
            self.rx.map(|rx| rx.restore());
        }
        regs.dma_en.set(saved.dma_en);
        self.apply_flowcontrol(self.flow.get());
        regs.ier.set(saved.ier);
    }

    fn notify(&self, event: UartEvent) {
        self.client.map(|client| client.uart_event(self.port, event));
    }

    /// Line status and transmit-complete interrupt of the port.
    pub fn handle_interrupt(&self) {
        let lsr = self.registers.lsr.extract();
        if lsr.any_matching_bits_set(Lsr::OE::SET + Lsr::PE::SET + Lsr::FE::SET + Lsr::BI::SET) {
            error!("uart{} line error {}", self.port as u8, lsr.get());
            self.tx.map(|tx| tx.purge());
            self.rx.map(|rx| rx.purge());
            self.registers.fcr.write(Fcr::FIFOE::SET + Fcr::CLRR::SET + Fcr::CLRT::SET);
            self.notify(UartEvent::TransactionError);
        }

        if self.tx_locked.get() && lsr.is_set(Lsr::TEMT) {
            let drained = self.tx.map_or(true, |tx| tx.valid_bytes() == 0);
            if drained {
                self.registers.ier.modify(Ier::ETBEI::CLEAR);
                self.sleep_manager.map(|manager| {
                    self.sleep_handle.map(|handle| {
                        let _ = manager.unlock_sleep(*handle);
                    });
                });
                self.tx_locked.set(false);
                trace!("uart{} tx idle", self.port as u8);
            }
        }
    }
}

impl DmaClient for Uart<'_> {
    fn vfifo_event(&self, channel: usize, event: VfifoEvent) {
        if self.state.get() != UartState::DmaInitialized {
            return;
        }
        if channel == self.port.tx_channel() {
            self.tx.map(|tx| tx.disable_threshold_interrupt());
            self.notify(UartEvent::ReadyToWrite);
        } else {
            if event == VfifoEvent::Threshold {
                self.rx.map(|rx| rx.disable_threshold_interrupt());
            }
            self.notify(UartEvent::ReadyToRead);
        }
    }
}

impl InterruptHandler for Uart<'_> {
    fn handle_irq(&self, _irq: u32) {
        self.handle_interrupt();
    }
}

#[cfg(test)]
pub(crate) mod test {
    extern crate std;

    use super::*;
    use crate::sleep_manager::SleepManagerError;
    use crate::vfifo::test::{buffer, hw_drain, hw_raise, hw_receive};
    use crate::vfifo::{DmaRegisters, VfifoDma};
    use std::boxed::Box;

    pub(crate) const CONFIG_115200: UartConfig = UartConfig {
        baudrate: Baudrate::B115200,
        word_length: WordLength::Bits8,
        stop_bit: StopBits::One,
        parity: Parity::None,
    };

    pub(crate) fn registers() -> &'static UartRegisters {
        Box::leak(Box::new(unsafe { core::mem::zeroed::<UartRegisters>() }))
    }

    pub(crate) fn dma_config<const TX: usize, const RX: usize>() -> DmaConfig {
        DmaConfig {
            send_buffer: buffer::<TX>(),
            send_threshold: 2,
            receive_buffer: buffer::<RX>(),
            receive_threshold: 4,
            receive_alert: 2,
            receive_timeout: 50,
        }
    }

    struct Recorder {
        events: Cell<usize>,
        last: Cell<Option<UartEvent>>,
    }

    impl UartClient for Recorder {
        fn uart_event(&self, port: UartPort, event: UartEvent) {
            assert_eq!(port, UartPort::Uart0);
            self.events.set(self.events.get() + 1);
            self.last.set(Some(event));
        }
    }

    struct Harness {
        regs: &'static UartRegisters,
        dma_regs: &'static DmaRegisters,
        dma: &'static VfifoDma<'static>,
        sleep: &'static SleepManager,
        uart: &'static Uart<'static>,
        client: &'static Recorder,
    }

    fn harness() -> Harness {
        let regs = registers();
        let dma_regs = crate::vfifo::test::registers();
        let dma: &'static VfifoDma<'static> = Box::leak(Box::new(VfifoDma::new(dma_regs)));
        let sleep: &'static SleepManager = Box::leak(Box::new(SleepManager::new()));
        let uart: &'static Uart<'static> = Box::leak(Box::new(Uart::new(regs, UartPort::Uart0)));
        let client: &'static Recorder = Box::leak(Box::new(Recorder {
            events: Cell::new(0),
            last: Cell::new(None),
        }));
        uart.set_sleep_manager(sleep);
        uart.set_dma_channels(
            dma.channel(vfifo::UART0_TX_CHANNEL).unwrap(),
            dma.channel(vfifo::UART0_RX_CHANNEL).unwrap(),
        );
        Harness {
            regs,
            dma_regs,
            dma,
            sleep,
            uart,
            client,
        }
    }

    fn dma_ready() -> Harness {
        let h = harness();
        h.uart.init(CONFIG_115200).unwrap();
        assert!(h.uart.set_dma(dma_config::<8, 8>()).is_ok());
        h.uart.register_callback(h.client).unwrap();
        h
    }

    #[test]
    fn second_init_is_busy() {
        let h = harness();
        assert_eq!(h.uart.init(CONFIG_115200), Ok(()));
        assert_eq!(h.uart.state(), UartState::PollInitialized);
        assert_eq!(h.uart.init(CONFIG_115200), Err(UartError::Busy));
        assert_eq!(h.uart.state(), UartState::PollInitialized);
        let handle = h.uart.sleep_handle.map(|handle| *handle).unwrap();
        assert_eq!(h.sleep.handle_name(handle), Some("uart0"));
    }

    #[test]
    fn init_claims_the_port_once() {
        let h = harness();
        let mut handles = std::vec::Vec::new();
        while let Ok(handle) = h.sleep.set_sleep_handle("other") {
            handles.push(handle);
        }
        // No sleep handle left: nothing is claimed or programmed.
        assert_eq!(h.uart.init(CONFIG_115200), Err(UartError::Error));
        assert_eq!(h.uart.state(), UartState::Uninitialized);
        assert_eq!(h.regs.dll.get(), 0);
        assert!(h.uart.config().is_none());

        h.sleep.release_sleep_handle(handles[0]).unwrap();
        // Claiming from inside another critical section still works.
        let first = support::atomic(|| h.uart.init(CONFIG_115200));
        assert_eq!(first, Ok(()));
        h.regs.dll.set(0x55);
        assert_eq!(h.uart.init(CONFIG_115200), Err(UartError::Busy));
        // The loser neither reprograms the line nor takes a handle.
        assert_eq!(h.regs.dll.get(), 0x55);
        assert_eq!(h.sleep.set_sleep_handle("late"), Err(SleepManagerError::NoFreeHandle));

        h.uart.register_callback(h.client).unwrap();
        let other: &'static Recorder = Box::leak(Box::new(Recorder {
            events: Cell::new(0),
            last: Cell::new(None),
        }));
        assert_eq!(h.uart.register_callback(other), Err(UartError::Busy));
        assert!(h.uart.set_dma(dma_config::<8, 8>()).is_ok());
        assert_eq!(h.uart.state(), UartState::DmaInitialized);
        let (err, _) = h.uart.set_dma(dma_config::<8, 8>()).err().unwrap();
        assert_eq!(err, UartError::Busy);
    }

    #[test]
    fn init_programs_line() {
        let h = harness();
        h.uart
            .init(UartConfig {
                parity: Parity::Even,
                stop_bit: StopBits::Two,
                word_length: WordLength::Bits7,
                ..CONFIG_115200
            })
            .unwrap();
        assert_eq!(h.regs.dll.get(), 2);
        assert_eq!(h.regs.dlm.get(), 0);
        assert_eq!(h.regs.sample_count.get(), 172);
        assert_eq!(h.regs.sample_point.get(), 85);
        assert_eq!(h.regs.highspeed.get(), 3);
        assert!(h.regs.lcr.matches_all(
            Lcr::WLS::Bits7 + Lcr::STB::Two + Lcr::PEN::SET + Lcr::EPS::Even + Lcr::DLAB::CLEAR
        ));

        h.uart.set_baudrate(Baudrate::B921600).unwrap();
        assert_eq!(h.regs.dll.get(), 1);
        assert_eq!(h.regs.sample_count.get(), 42);
        assert_eq!(h.uart.config().map(|c| c.baudrate), Some(Baudrate::B921600));
    }

    #[test]
    fn set_dma_checks_state_and_buffers() {
        let h = harness();
        let (err, config) = h.uart.set_dma(dma_config::<8, 8>()).err().unwrap();
        assert_eq!(err, UartError::Uninitialized);

        h.uart.init(CONFIG_115200).unwrap();
        let bad = DmaConfig {
            receive_alert: 9,
            ..config
        };
        let (err, config) = h.uart.set_dma(bad).err().unwrap();
        assert_eq!(err, UartError::Parameter);
        let bad = DmaConfig {
            send_threshold: 9,
            receive_alert: 2,
            ..config
        };
        let (err, _) = h.uart.set_dma(bad).err().unwrap();
        assert_eq!(err, UartError::Parameter);
        assert_eq!(h.uart.state(), UartState::PollInitialized);
    }

    #[test]
    fn dma_mode_needs_buffers_and_client() {
        let h = harness();
        assert_eq!(h.uart.register_callback(h.client), Err(UartError::Uninitialized));
        h.uart.init(CONFIG_115200).unwrap();
        h.uart.register_callback(h.client).unwrap();
        assert_eq!(h.uart.state(), UartState::PollInitialized);
        assert_eq!(h.uart.send_dma(b"early"), 0);
        assert_eq!(h.uart.register_callback(h.client), Err(UartError::Busy));

        assert!(h.uart.set_dma(dma_config::<8, 8>()).is_ok());
        assert_eq!(h.uart.state(), UartState::DmaInitialized);
        let rx = h.dma.channel(vfifo::UART0_RX_CHANNEL).unwrap();
        assert!(rx.threshold_interrupt_enabled());
        assert!(rx.timeout_interrupt_enabled());
        let (err, _) = h.uart.set_dma(dma_config::<8, 8>()).err().unwrap();
        assert_eq!(err, UartError::Busy);
    }

    #[test]
    fn send_dma_is_bounded_by_ring_space() {
        let h = dma_ready();
        let tx = h.dma.channel(vfifo::UART0_TX_CHANNEL).unwrap();
        assert_eq!(h.uart.get_available_send_space(), 8);

        assert_eq!(h.uart.send_dma(b"0123456789ab"), 8);
        assert_eq!(h.uart.get_available_send_space(), 0);
        assert!(tx.threshold_interrupt_enabled());
        assert!(h.sleep.is_deep_sleep_locked());
        assert!(h.regs.ier.is_set(Ier::ETBEI));

        hw_drain(tx, 8);
        let released = h.uart.deinit().unwrap();
        assert_eq!(&released.send[..], b"01234567");
    }

    #[test]
    fn transmit_complete_releases_sleep_lock() {
        let h = dma_ready();
        let tx = h.dma.channel(vfifo::UART0_TX_CHANNEL).unwrap();
        assert_eq!(h.uart.send_dma(b"hi"), 2);
        assert_eq!(h.sleep.lock_count(), 1);
        // A second write while locked does not stack another lock.
        assert_eq!(h.uart.send_dma(b"!"), 1);
        assert_eq!(h.sleep.lock_count(), 1);

        h.regs.lsr.write(Lsr::TEMT::SET + Lsr::THRE::SET);
        h.uart.handle_interrupt();
        assert!(h.sleep.is_deep_sleep_locked());

        hw_drain(tx, 3);
        h.uart.handle_interrupt();
        assert!(!h.sleep.is_deep_sleep_locked());
        assert!(!h.regs.ier.is_set(Ier::ETBEI));
    }

    #[test]
    fn threshold_events_reach_client() {
        let h = dma_ready();
        let rx = h.dma.channel(vfifo::UART0_RX_CHANNEL).unwrap();
        hw_receive(rx, b"abcde");
        hw_raise(h.dma_regs, vfifo::UART0_RX_CHANNEL, 0b01);
        h.dma.handle_interrupt();
        assert_eq!(h.client.last.get(), Some(UartEvent::ReadyToRead));
        assert!(!rx.threshold_interrupt_enabled());

        assert_eq!(h.uart.get_available_receive_bytes(), 5);
        let mut buf = [0u8; 8];
        assert_eq!(h.uart.receive_dma(&mut buf), 5);
        assert_eq!(&buf[..5], b"abcde");
        assert!(rx.threshold_interrupt_enabled());

        let tx = h.dma.channel(vfifo::UART0_TX_CHANNEL).unwrap();
        h.uart.send_dma(b"0123456789");
        hw_drain(tx, 7);
        hw_raise(h.dma_regs, vfifo::UART0_TX_CHANNEL, 0b01);
        h.dma.handle_interrupt();
        assert_eq!(h.client.last.get(), Some(UartEvent::ReadyToWrite));
        assert!(!tx.threshold_interrupt_enabled());
    }

    #[test]
    fn receive_timeout_reports_short_data() {
        let h = dma_ready();
        let rx = h.dma.channel(vfifo::UART0_RX_CHANNEL).unwrap();
        // Fewer bytes than the threshold of 4; only the timeout fires.
        hw_receive(rx, b"ab");
        hw_raise(h.dma_regs, vfifo::UART0_RX_CHANNEL, 0b10);
        h.dma.handle_interrupt();
        assert_eq!(h.client.events.get(), 1);
        assert_eq!(h.client.last.get(), Some(UartEvent::ReadyToRead));
        assert!(rx.threshold_interrupt_enabled());
        assert!(rx.timeout_interrupt_enabled());

        let mut buf = [0u8; 4];
        assert_eq!(h.uart.receive_dma(&mut buf), 2);
        assert_eq!(&buf[..2], b"ab");
    }

    #[test]
    fn line_error_purges_and_reports() {
        let h = dma_ready();
        let rx = h.dma.channel(vfifo::UART0_RX_CHANNEL).unwrap();
        hw_receive(rx, b"junk");
        h.regs.lsr.write(Lsr::OE::SET + Lsr::DR::SET);
        h.uart.handle_interrupt();
        assert_eq!(h.client.last.get(), Some(UartEvent::TransactionError));
        assert_eq!(h.uart.get_available_receive_bytes(), 0);
    }

    #[test]
    fn deinit_from_any_state() {
        let h = harness();
        assert!(h.uart.deinit().is_none());
        assert_eq!(h.uart.state(), UartState::Uninitialized);

        let h = dma_ready();
        h.uart.send_dma(b"x");
        assert!(h.sleep.is_deep_sleep_locked());
        let buffers = h.uart.deinit().unwrap();
        assert_eq!(buffers.receive.len(), 8);
        assert_eq!(h.uart.state(), UartState::Uninitialized);
        assert_eq!(h.sleep.get_lock_status(), 0);
        assert_eq!(h.uart.send_dma(b"x"), 0);

        // The handle went back to the pool and the port can start over.
        h.uart.init(CONFIG_115200).unwrap();
        h.uart.register_callback(h.client).unwrap();
    }

    #[test]
    fn polling_io() {
        let h = harness();
        assert_eq!(h.uart.put_char(b'a'), Err(UartError::Uninitialized));
        h.uart.init(CONFIG_115200).unwrap();
        h.regs.lsr.write(Lsr::THRE::SET + Lsr::DR::SET);
        assert_eq!(h.uart.send_polling(b"ok"), Ok(2));
        assert_eq!(h.regs.rbr_thr.get(), b'k' as u32);
        let mut buf = [0u8; 2];
        assert_eq!(h.uart.receive_polling(&mut buf), Ok(2));
        assert_eq!(buf, [b'k', b'k']);
        assert_eq!(h.uart.get_char(), Ok(b'k'));
    }

    #[test]
    fn restore_reapplies_flow_control() {
        let h = dma_ready();
        h.uart.set_software_flowcontrol(0x11, 0x13, 0x77).unwrap();
        h.uart.set_dma_timeout(80).unwrap();
        h.uart.backup();

        h.regs.efr.set(0);
        h.regs.xon1.set(0);
        h.regs.xoff1.set(0);
        h.regs.dll.set(0);
        h.regs.lcr.set(0);
        h.regs.ier.set(0);

        h.uart.restore();
        assert!(h.regs.efr.matches_all(Efr::ENHANCED::SET + Efr::SW_FLOW::TxRx));
        assert_eq!(h.regs.xon1.get(), 0x11);
        assert_eq!(h.regs.xoff1.get(), 0x13);
        assert_eq!(h.regs.escape_dat.get(), 0x77);
        assert_eq!(h.regs.dll.get(), 2);
        assert!(h.regs.lcr.matches_all(Lcr::WLS::Bits8 + Lcr::DLAB::CLEAR));
        assert!(h.regs.ier.is_set(Ier::ELSI));
        assert_eq!(h.uart.flowcontrol(), FlowControl::Software {
            xon: 0x11,
            xoff: 0x13,
            escape: 0x77
        });
    }
}
