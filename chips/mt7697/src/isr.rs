// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! External interrupt dispatch.
//!
//! One handler per IRQ line. Registering a handler on a line that already
//! has one replaces it and hands the old one back to the caller; handlers
//! are never chained.

use core::cell::Cell;

use cortexm::scb::{Scb, EXTERNAL_INTERRUPT_BASE};
use cortexm::support;
use tock_cells::optional_cell::OptionalCell;

use crate::log::warning;
use crate::nvic::IRQ_NUMBER_MAX;

/// Implemented by drivers that service an interrupt line.
pub trait InterruptHandler {
    fn handle_irq(&self, irq: u32);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NvicError {
    /// IRQ number outside the table.
    InvalidParameter,
    /// No handler registered for the IRQ that fired.
    NoIsr,
}

pub struct IsrTable<'a> {
    handlers: [OptionalCell<&'a dyn InterruptHandler>; IRQ_NUMBER_MAX],
    dropped: Cell<u32>,
}

impl<'a> IsrTable<'a> {
    pub const fn new() -> Self {
        IsrTable {
            handlers: [const { OptionalCell::empty() }; IRQ_NUMBER_MAX],
            dropped: Cell::new(0),
        }
    }

    fn slot(&self, irq: u32) -> Result<&OptionalCell<&'a dyn InterruptHandler>, NvicError> {
        self.handlers
            .get(irq as usize)
            .ok_or(NvicError::InvalidParameter)
    }

    /// Install `handler` for `irq`, returning whatever was installed before.
    pub fn register_isr_handler(
        &self,
        irq: u32,
        handler: &'a dyn InterruptHandler,
    ) -> Result<Option<&'a dyn InterruptHandler>, NvicError> {
        let slot = self.slot(irq)?;
        Ok(support::atomic(|| slot.replace(handler)))
    }

    pub fn unregister_isr_handler(
        &self,
        irq: u32,
    ) -> Result<Option<&'a dyn InterruptHandler>, NvicError> {
        let slot = self.slot(irq)?;
        Ok(support::atomic(|| slot.take()))
    }

    pub fn is_registered(&self, irq: u32) -> bool {
        self.slot(irq).map_or(false, |slot| slot.is_some())
    }

    /// Run the handler for `irq`. An interrupt without a handler is counted
    /// and dropped.
    pub fn dispatch(&self, irq: u32) -> Result<(), NvicError> {
        let slot = self.slot(irq)?;
        slot.map(|handler| handler.handle_irq(irq)).ok_or_else(|| {
            self.dropped.set(self.dropped.get().wrapping_add(1));
            warning!("no isr for irq {}", irq);
            NvicError::NoIsr
        })
    }

    /// Entry from the shared trap vector: find the active exception and
    /// dispatch it.
    pub fn dispatch_active(&self, scb: &Scb) -> Result<(), NvicError> {
        let vector = scb.vector_active();
        if vector < EXTERNAL_INTERRUPT_BASE {
            return Err(NvicError::InvalidParameter);
        }
        self.dispatch(vector - EXTERNAL_INTERRUPT_BASE)
    }

    /// Interrupts dropped because no handler was registered.
    pub fn dropped_count(&self) -> u32 {
        self.dropped.get()
    }
}
