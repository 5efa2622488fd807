#![allow(unused)]

use log::warn;

use super::Core;
use crate::system_bus::SystemBus;
use crate::Allocator;

/// Process-wide lock serializing the read-modify-write of an atomic memory operation across
/// every hart attached to the same system bus.
///
/// A single instance is shared (via [`Allocated`](crate::Allocated) handle) by every [`Core`]
/// constructed against the same bus; see [`Core::new`]. Real hardware enforces this with a bus
/// arbiter; this model enforces it explicitly since [`Core`] instances otherwise have no shared
/// mutable state at all.
#[derive(Debug, Clone)]
pub struct BusLock {
    owner_hart_id: Option<u32>,
}

impl Default for BusLock {
    fn default() -> Self {
        Self::new()
    }
}

impl BusLock {
    pub fn new() -> Self {
        Self {
            owner_hart_id: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.owner_hart_id.is_some()
    }

    pub fn owner(&self) -> Option<u32> {
        self.owner_hart_id
    }

    /// Attempts to acquire the lock for `hart_id`. Returns `true` if the lock is now (or was
    /// already) held by `hart_id`, `false` if another hart holds it.
    fn acquire(&mut self, hart_id: u32) -> bool {
        match self.owner_hart_id {
            None => {
                self.owner_hart_id = Some(hart_id);
                true
            }
            Some(owner) => owner == hart_id,
        }
    }

    /// Releases the lock, but only if `hart_id` is the current owner.
    fn release(&mut self, hart_id: u32) {
        if self.owner_hart_id == Some(hart_id) {
            self.owner_hart_id = None;
        }
    }
}

/// A single hart's `LR`/`SC` reservation.
///
/// The RISC-V spec requires an implementation to guarantee forward progress for a well-formed
/// `LR`/`SC` sequence: the reservation must not spuriously expire before some bounded number of
/// steps have been taken. This model tracks that bound as a simple countdown, configured via
/// [`Config::lr_sc_forward_progress_limit`](super::Config::lr_sc_forward_progress_limit), rather
/// than attempting to model the cache-line eviction behavior real hardware uses to decide when a
/// reservation breaks.
#[derive(Debug, Clone)]
pub struct Reservation {
    address: Option<u32>,
    countdown: u32,
}

impl Default for Reservation {
    fn default() -> Self {
        Self::new()
    }
}

impl Reservation {
    pub fn new() -> Self {
        Self {
            address: None,
            countdown: 0,
        }
    }

    fn set(&mut self, address: u32, limit: u32) {
        self.address = Some(address);
        self.countdown = limit;
    }

    fn clear(&mut self) {
        self.address = None;
        self.countdown = 0;
    }

    fn is_valid_for(&self, address: u32) -> bool {
        self.address == Some(address)
    }

    /// Consumes one step of the forward-progress budget, invalidating the reservation once it
    /// runs out. Called once per retired instruction.
    fn tick(&mut self) {
        if self.address.is_some() {
            match self.countdown.checked_sub(1) {
                Some(0) | None => self.clear(),
                Some(remaining) => self.countdown = remaining,
            }
        }
    }
}

impl<A: Allocator, B: SystemBus<A>> Core<A, B> {
    /// Executes the reservation-setting half of `LR`: records that this hart now holds a
    /// reservation on `address`, valid for [`Config::lr_sc_forward_progress_limit`] further
    /// retired instructions.
    pub(super) fn load_reserved(&self, allocator: &mut A, address: u32) {
        let limit = self.config.lr_sc_forward_progress_limit;
        let hart_id = self.config.hart_id;
        self.bus_lock.get_mut(allocator).acquire(hart_id);
        self.reservation.get_mut(allocator).set(address, limit);
        self.bus_lock.get_mut(allocator).release(hart_id);
    }

    /// Executes `SC`: returns whether the store should actually be performed, i.e. whether this
    /// hart's reservation is still valid for `address`. The reservation is consumed either way,
    /// per the RISC-V spec ("Regardless of success or failure, executing an SC.W instruction
    /// invalidates any reservation held by this hart").
    pub(super) fn store_conditional(&self, allocator: &mut A, address: u32) -> bool {
        let valid = self.reservation.get(allocator).is_valid_for(address);
        self.reservation.get_mut(allocator).clear();
        valid
    }

    /// Takes the process-wide bus lock for the duration of an AMO's read-modify-write. If
    /// another hart already holds it, the operation proceeds anyway rather than faulting or
    /// blocking: a well-behaved guest image does not perform overlapping AMOs on the same
    /// address from two harts without its own synchronization, and failing the instruction here
    /// would be worse than the race it is meant to prevent.
    pub(super) fn atomic_rmw_lock(&self, allocator: &mut A) {
        let hart_id = self.config.hart_id;
        if !self.bus_lock.get_mut(allocator).acquire(hart_id) {
            warn!(
                "hart {hart_id} performing an atomic memory operation while the bus lock is held \
                 by hart {:?}; proceeding without exclusive access",
                self.bus_lock.get(allocator).owner()
            );
        }
    }

    /// Releases the bus lock taken by [`Self::atomic_rmw_lock`], and invalidates any reservation
    /// this hart was holding (an AMO other than `SC` is not part of an `LR`/`SC` sequence).
    pub(super) fn atomic_rmw_unlock(&self, allocator: &mut A) {
        self.reservation.get_mut(allocator).clear();
        self.bus_lock.get_mut(allocator).release(self.config.hart_id);
    }

    /// Decays this hart's reservation's forward-progress budget. Called once per retired
    /// instruction from [`Self::step_with`].
    pub(super) fn tick_reservation(&self, allocator: &mut A) {
        self.reservation.get_mut(allocator).tick();
    }

    /// Unconditionally drops any reservation this hart is holding. Called on every trap, since a
    /// trap between `LR` and `SC` must cause the `SC` to fail.
    pub(super) fn invalidate_reservation(&self, allocator: &mut A) {
        self.reservation.get_mut(allocator).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_lock_is_reentrant_for_owner() {
        let mut lock = BusLock::new();
        assert!(lock.acquire(0));
        assert!(lock.acquire(0));
        assert!(!lock.acquire(1));
        lock.release(0);
        assert!(lock.acquire(1));
    }

    #[test]
    fn reservation_valid_only_for_matching_address() {
        let mut reservation = Reservation::new();
        reservation.set(0x1000, 17);
        assert!(reservation.is_valid_for(0x1000));
        assert!(!reservation.is_valid_for(0x1004));
    }

    #[test]
    fn reservation_expires_after_forward_progress_limit() {
        let mut reservation = Reservation::new();
        reservation.set(0x1000, 2);
        reservation.tick();
        assert!(reservation.is_valid_for(0x1000));
        reservation.tick();
        assert!(!reservation.is_valid_for(0x1000));
    }
}
