// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Sleep locks.
//!
//! A driver that must not be powered down mid-operation allocates a named
//! handle once, then locks and unlocks it around the operation. Locks on a
//! handle nest. Deep sleep is only eligible while no handle is locked.

use core::cell::Cell;

use cortexm::support;
use tock_cells::optional_cell::OptionalCell;

use crate::log::{error, trace};

/// Number of handles, one bit each in the lock status word.
pub const MAX_SLEEP_HANDLES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SleepHandle(u8);

impl SleepHandle {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SleepManagerError {
    /// Handle out of range or not allocated.
    InvalidHandle,
    /// Every handle is in use.
    NoFreeHandle,
    /// Unlock without a matching lock.
    NotLocked,
    /// Lock count would exceed its storage.
    Overflow,
    /// Release of a handle that is still locked.
    Locked,
}

struct Slot {
    name: OptionalCell<&'static str>,
    count: Cell<u8>,
}

impl Slot {
    const fn new() -> Self {
        Slot {
            name: OptionalCell::empty(),
            count: Cell::new(0),
        }
    }
}

pub struct SleepManager {
    slots: [Slot; MAX_SLEEP_HANDLES],
    lock_status: Cell<u32>,
}

impl SleepManager {
    pub const fn new() -> Self {
        SleepManager {
            slots: [const { Slot::new() }; MAX_SLEEP_HANDLES],
            lock_status: Cell::new(0),
        }
    }

    fn slot(&self, handle: SleepHandle) -> Result<&Slot, SleepManagerError> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.name.is_some())
            .ok_or(SleepManagerError::InvalidHandle)
    }

    /// Allocate a handle tagged with `name`.
    pub fn set_sleep_handle(&self, name: &'static str) -> Result<SleepHandle, SleepManagerError> {
        support::atomic(|| {
            let (index, slot) = self
                .slots
                .iter()
                .enumerate()
                .find(|(_, slot)| slot.name.is_none())
                .ok_or(SleepManagerError::NoFreeHandle)?;
            slot.name.set(name);
            slot.count.set(0);
            trace!("sleep handle {} -> {}", index, name);
            Ok(SleepHandle(index as u8))
        })
    }

    pub fn lock_sleep(&self, handle: SleepHandle) -> Result<(), SleepManagerError> {
        let slot = self.slot(handle)?;
        support::atomic(|| {
            let count = slot.count.get();
            if count == u8::MAX {
                return Err(SleepManagerError::Overflow);
            }
            slot.count.set(count + 1);
            self.lock_status
                .set(self.lock_status.get() | (1 << handle.index()));
            Ok(())
        })
    }

    pub fn unlock_sleep(&self, handle: SleepHandle) -> Result<(), SleepManagerError> {
        let slot = self.slot(handle)?;
        support::atomic(|| {
            let count = slot.count.get();
            if count == 0 {
                error!("sleep handle {} unlocked more often than locked", handle.index());
                return Err(SleepManagerError::NotLocked);
            }
            slot.count.set(count - 1);
            if count == 1 {
                self.lock_status
                    .set(self.lock_status.get() & !(1 << handle.index()));
            }
            Ok(())
        })
    }

    /// Drop every lock held through `handle`.
    pub fn force_unlock(&self, handle: SleepHandle) -> Result<(), SleepManagerError> {
        let slot = self.slot(handle)?;
        support::atomic(|| {
            slot.count.set(0);
            self.lock_status
                .set(self.lock_status.get() & !(1 << handle.index()));
        });
        Ok(())
    }

    pub fn release_sleep_handle(&self, handle: SleepHandle) -> Result<(), SleepManagerError> {
        let slot = self.slot(handle)?;
        support::atomic(|| {
            if slot.count.get() != 0 {
                return Err(SleepManagerError::Locked);
            }
            slot.name.clear();
            Ok(())
        })
    }

    /// Bit n set means handle n holds at least one lock.
    pub fn get_lock_status(&self) -> u32 {
        self.lock_status.get()
    }

    pub fn is_deep_sleep_locked(&self) -> bool {
        self.get_lock_status() != 0
    }

    /// Sum of the lock counts of every handle.
    pub fn lock_count(&self) -> u32 {
        support::atomic(|| self.slots.iter().map(|slot| slot.count.get() as u32).sum())
    }

    pub fn handle_name(&self, handle: SleepHandle) -> Option<&'static str> {
        self.slots
            .get(handle.index())
            .and_then(|slot| slot.name.map(|name| *name))
    }
}
