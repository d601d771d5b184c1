//! Fixed-capacity hardware watchpoint table.

use crate::debugger::register::debug::{AccessType, BreakSize};
use crate::debugger::sys;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const WATCHPOINT_SLOTS: usize = sys::HW_SLOTS;

const DRAIN_TIMEOUT: Duration = Duration::from_millis(1000);
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Removal synchronization for one hardware slot. While `removing` is set no
/// new hit handler may enter; the slot is cleared once `active_handlers`
/// drains to zero (or the drain times out).
#[derive(Default)]
pub(super) struct SlotSync {
    removing: AtomicBool,
    active_handlers: AtomicI32,
}

impl SlotSync {
    pub fn removing(&self) -> bool {
        self.removing.load(Ordering::SeqCst)
    }

    pub fn begin_remove(&self) {
        self.removing.store(true, Ordering::SeqCst);
    }

    pub fn end_remove(&self) {
        self.removing.store(false, Ordering::SeqCst);
    }

    pub fn enter_handler(&self) {
        self.active_handlers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn leave_handler(&self) {
        self.active_handlers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Poll until every in-flight handler left, bounded by [`DRAIN_TIMEOUT`].
    /// Returns false on timeout, removal proceeds anyway: handlers check
    /// `removing` before touching slot state.
    pub fn drain(&self) -> bool {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.active_handlers.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(DRAIN_POLL);
        }
        true
    }
}

#[derive(Clone, Copy, Default)]
struct WatchSlot {
    used: bool,
    address: u64,
    size: Option<BreakSize>,
    access: Option<AccessType>,
}

/// A view of one armed watchpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchpointView {
    pub index: usize,
    pub address: u64,
    pub size: BreakSize,
    pub access: AccessType,
}

pub(super) struct WatchpointTable {
    slots: Mutex<[WatchSlot; WATCHPOINT_SLOTS]>,
    sync: [SlotSync; WATCHPOINT_SLOTS],
}

impl Default for WatchpointTable {
    fn default() -> Self {
        Self {
            slots: Mutex::new([WatchSlot::default(); WATCHPOINT_SLOTS]),
            sync: Default::default(),
        }
    }
}

impl WatchpointTable {
    /// Lowest free slot index, if any.
    pub fn find_free(&self) -> Option<usize> {
        let slots = self.slots.lock().unwrap();
        slots.iter().position(|s| !s.used)
    }

    pub fn record(&self, index: usize, address: u64, size: BreakSize, access: AccessType) {
        let mut slots = self.slots.lock().unwrap();
        slots[index] = WatchSlot {
            used: true,
            address,
            size: Some(size),
            access: Some(access),
        };
    }

    pub fn clear(&self, index: usize) {
        let mut slots = self.slots.lock().unwrap();
        slots[index] = WatchSlot::default();
    }

    pub fn find_by_address(&self, address: u64) -> Option<usize> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .position(|s| s.used && s.address == address)
    }

    /// Map a reported fault address onto a slot: containment in
    /// [address, address+size) first, then an 8-byte-aligned fallback for
    /// hardware that reports the access rounded down.
    pub fn match_fault(&self, fault: u64) -> Option<usize> {
        let slots = self.slots.lock().unwrap();

        let exact = slots.iter().position(|s| {
            s.used && fault >= s.address && fault < s.address + s.size.map_or(0, |sz| sz as u64)
        });
        if exact.is_some() {
            return exact;
        }

        let aligned = fault & !0x7;
        slots
            .iter()
            .position(|s| s.used && (s.address & !0x7) == aligned)
    }

    pub fn view(&self, index: usize) -> Option<WatchpointView> {
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(index)?;
        slot.used.then(|| WatchpointView {
            index,
            address: slot.address,
            size: slot.size.expect("armed slot carries a size"),
            access: slot.access.expect("armed slot carries an access type"),
        })
    }

    /// Every armed slot that is not mid-removal.
    pub fn active_views(&self) -> Vec<WatchpointView> {
        (0..WATCHPOINT_SLOTS)
            .filter(|&i| !self.sync(i).removing())
            .filter_map(|i| self.view(i))
            .collect()
    }

    pub fn sync(&self, index: usize) -> &SlotSync {
        &self.sync[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(address: u64, size: BreakSize) -> WatchpointTable {
        let table = WatchpointTable::default();
        let idx = table.find_free().unwrap();
        table.record(idx, address, size, AccessType::Write);
        table
    }

    #[test]
    fn test_lowest_slot_first() {
        let table = WatchpointTable::default();
        assert_eq!(table.find_free(), Some(0));
        table.record(0, 0x1000, BreakSize::Bytes4, AccessType::Write);
        assert_eq!(table.find_free(), Some(1));
        table.clear(0);
        assert_eq!(table.find_free(), Some(0));
    }

    #[test]
    fn test_fault_match_by_range() {
        let table = table_with(0x1000, BreakSize::Bytes4);
        assert_eq!(table.match_fault(0x1000), Some(0));
        assert_eq!(table.match_fault(0x1003), Some(0));
        assert_eq!(table.match_fault(0x1004), Some(0)); // aligned fallback
        assert_eq!(table.match_fault(0x2000), None);
    }

    #[test]
    fn test_fault_match_aligned_fallback() {
        let table = table_with(0x1004, BreakSize::Bytes2);
        // hardware reported the containing 8-byte granule
        assert_eq!(table.match_fault(0x1000), Some(0));
    }

    #[test]
    fn test_removal_blocks_new_handlers() {
        let table = table_with(0x1000, BreakSize::Bytes8);
        table.sync(0).begin_remove();
        assert!(table.sync(0).removing());
        assert!(table.active_views().is_empty());
        assert!(table.sync(0).drain());
        table.sync(0).end_remove();
        assert_eq!(table.active_views().len(), 1);
    }

    #[test]
    fn test_drain_times_out_with_stuck_handler() {
        let table = table_with(0x1000, BreakSize::Bytes1);
        table.sync(0).enter_handler();
        table.sync(0).begin_remove();
        assert!(!table.sync(0).drain());
        table.sync(0).leave_handler();
        assert!(table.sync(0).drain());
    }
}
