//! The global IRQ slot table
//!
//! A slot is a kernel-side interrupt vector. The low 32 are reserved for
//! CPU exceptions at boot, the rest are handed out to hardware pins on a
//! first-free basis. Running out of slots is fatal, callers `expect()` on
//! the returned option.

use super::Gsi;

pub const NUM_SLOTS: usize = 256;
pub const NUM_EXCEPTION_SLOTS: usize = 32;

/// Identifies a hardware interrupt pin in the kernel's pin arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinId(pub u16);

#[derive(Clone, Copy)]
struct Slot {
    active: bool,
    pin: Option<PinId>,
}

pub struct SlotTable {
    slots: [Slot; NUM_SLOTS],
}

impl SlotTable {
    pub const fn new() -> Self {
        Self {
            slots: [Slot {
                active: false,
                pin: None,
            }; NUM_SLOTS],
        }
    }

    /// Mark the first `n` slots active with no pin behind them
    pub fn reserve_low(&mut self, n: usize) {
        for slot in self.slots.iter_mut().take(n) {
            slot.active = true;
        }
    }

    /// Reserve a single slot with no pin behind it
    ///
    /// Used for vectors the kernel claims statically (the scheduler tick).
    /// Panics if the slot is already taken, a static reservation that loses
    /// the race is a kernel bug.
    pub fn reserve(&mut self, index: u8) {
        let slot = self
            .slots
            .get_mut(index as usize)
            .expect("Slot index out of range");

        assert!(!slot.active, "Statically reserved slot already bound");
        slot.active = true;
    }

    /// Link a pin to the first inactive slot and return the slot index
    ///
    /// Binding an already-bound pin returns its existing slot, re-binding
    /// to a different slot is not supported. Returns `None` when the table
    /// is saturated (the `no_vectors` condition, fatal for the caller).
    pub fn bind(&mut self, pin: PinId) -> Option<u8> {
        if let Some(existing) = self.slot_of(pin) {
            return Some(existing);
        }

        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| !slot.active)?;

        slot.active = true;
        slot.pin = Some(pin);

        #[allow(clippy::cast_possible_truncation, reason = "NUM_SLOTS is 256")]
        let index = index as u8;

        Some(index)
    }

    /// The pin a slot serves, if any
    pub fn pin_at(&self, index: u8) -> Option<PinId> {
        self.slots.get(index as usize).and_then(|slot| slot.pin)
    }

    /// The slot serving a pin, if it is bound
    pub fn slot_of(&self, pin: PinId) -> Option<u8> {
        self.slots
            .iter()
            .position(|slot| slot.pin == Some(pin))
            .map(|index| {
                #[allow(clippy::cast_possible_truncation, reason = "NUM_SLOTS is 256")]
                let index = index as u8;

                index
            })
    }

    pub fn is_active(&self, index: u8) -> bool {
        self.slots
            .get(index as usize)
            .is_some_and(|slot| slot.active)
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A contiguous GSI range owned by one I/O interrupt controller
///
/// Used at discovery time to check that no two controllers claim
/// overlapping ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GsiRange {
    pub base: Gsi,
    pub count: u32,
}

impl GsiRange {
    pub fn contains(&self, gsi: Gsi) -> bool {
        gsi >= self.base && gsi - self.base < self.count
    }

    pub fn overlaps(&self, other: &GsiRange) -> bool {
        self.base < other.base + other.count && other.base < self.base + self.count
    }
}
