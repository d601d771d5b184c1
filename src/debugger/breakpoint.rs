//! Execution breakpoint tables: a fixed-capacity hardware table and an
//! unbounded software table keyed by address.

use crate::debugger::code::TRAP_LEN;
use crate::debugger::sys;
use crate::debugger::watchpoint::SlotSync;
use std::collections::HashMap;
use std::sync::Mutex;

pub const BREAKPOINT_SLOTS: usize = sys::HW_SLOTS;

/// Breakpoint implementation selector.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BreakpointKind {
    /// Debug-register execution breakpoint, scarce.
    Hardware,
    /// Trap instruction patched over the code stream, abundant.
    Software,
}

#[derive(Clone, Copy, Default)]
struct HwSlot {
    used: bool,
    address: u64,
    hits: u32,
    /// 0 = wait mode (stop on hit), >0 = trace mode (silently single-step
    /// this many instructions, then auto-remove).
    target_hits: u32,
    /// Trace mode ends early when the program counter reaches this address.
    trace_end: Option<u64>,
}

/// Software breakpoint bookkeeping: the bytes the trap replaced plus hit
/// counters mirroring the hardware slots.
#[derive(Clone, Copy, Debug)]
pub(super) struct SwBreakpoint {
    pub saved: [u8; TRAP_LEN],
    pub hits: u32,
    pub target_hits: u32,
}

/// Which table a stop at a known address resolved to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(super) enum BreakpointMatch {
    Hardware(usize),
    Software(u64),
}

pub(super) struct BreakpointTable {
    hw: Mutex<[HwSlot; BREAKPOINT_SLOTS]>,
    hw_sync: [SlotSync; BREAKPOINT_SLOTS],
    software: Mutex<HashMap<u64, SwBreakpoint>>,
}

impl Default for BreakpointTable {
    fn default() -> Self {
        Self {
            hw: Mutex::new([HwSlot::default(); BREAKPOINT_SLOTS]),
            hw_sync: Default::default(),
            software: Mutex::new(HashMap::new()),
        }
    }
}

impl BreakpointTable {
    pub fn find_free_hw(&self) -> Option<usize> {
        let slots = self.hw.lock().unwrap();
        slots.iter().position(|s| !s.used)
    }

    pub fn record_hw(&self, index: usize, address: u64, target_hits: u32, trace_end: Option<u64>) {
        let mut slots = self.hw.lock().unwrap();
        slots[index] = HwSlot {
            used: true,
            address,
            hits: 0,
            target_hits,
            trace_end,
        };
    }

    pub fn clear_hw(&self, index: usize) {
        let mut slots = self.hw.lock().unwrap();
        slots[index] = HwSlot::default();
    }

    pub fn hw_address(&self, index: usize) -> Option<u64> {
        let slots = self.hw.lock().unwrap();
        slots[index].used.then_some(slots[index].address)
    }

    /// Target count of a hardware slot, 0 for wait mode.
    pub fn hw_target(&self, index: usize) -> u32 {
        self.hw.lock().unwrap()[index].target_hits
    }

    pub fn hw_trace_end(&self, index: usize) -> Option<u64> {
        self.hw.lock().unwrap()[index].trace_end
    }

    /// Increment and return the cumulative hit count of a hardware slot.
    pub fn bump_hw_hits(&self, index: usize) -> u32 {
        let mut slots = self.hw.lock().unwrap();
        slots[index].hits += 1;
        slots[index].hits
    }

    pub fn find_hw_by_address(&self, address: u64) -> Option<usize> {
        let slots = self.hw.lock().unwrap();
        slots.iter().position(|s| s.used && s.address == address)
    }

    pub fn hw_sync(&self, index: usize) -> &SlotSync {
        &self.hw_sync[index]
    }

    pub fn insert_software(&self, address: u64, bp: SwBreakpoint) -> bool {
        let mut sw = self.software.lock().unwrap();
        if sw.contains_key(&address) {
            return false;
        }
        sw.insert(address, bp);
        true
    }

    pub fn remove_software(&self, address: u64) -> Option<SwBreakpoint> {
        self.software.lock().unwrap().remove(&address)
    }

    pub fn software(&self, address: u64) -> Option<SwBreakpoint> {
        self.software.lock().unwrap().get(&address).copied()
    }

    pub fn bump_software_hits(&self, address: u64) -> u32 {
        let mut sw = self.software.lock().unwrap();
        match sw.get_mut(&address) {
            Some(bp) => {
                bp.hits += 1;
                bp.hits
            }
            None => 0,
        }
    }

    /// The bytes present at the address before the trap was patched in. Used
    /// by disassembler-type collaborators to reconstruct the original
    /// instruction for display.
    pub fn software_original_bytes(&self, address: u64) -> Option<[u8; TRAP_LEN]> {
        self.software.lock().unwrap().get(&address).map(|bp| bp.saved)
    }

    /// Resolve a stopped thread's program counter to a breakpoint. Hardware
    /// first; the software lookup tolerates a one-byte overshoot on x86_64
    /// where the trap instruction advances the instruction pointer.
    pub fn match_pc(&self, pc: u64) -> Option<BreakpointMatch> {
        if let Some(index) = self.find_hw_by_address(pc) {
            return Some(BreakpointMatch::Hardware(index));
        }

        let sw = self.software.lock().unwrap();
        if sw.contains_key(&pc) {
            return Some(BreakpointMatch::Software(pc));
        }
        #[cfg(target_arch = "x86_64")]
        if pc > 0 && sw.contains_key(&(pc - 1)) {
            return Some(BreakpointMatch::Software(pc - 1));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hw_slots_allocate_lowest_first() {
        let table = BreakpointTable::default();
        assert_eq!(table.find_free_hw(), Some(0));
        table.record_hw(0, 0x4000, 0, None);
        table.record_hw(1, 0x4010, 5, None);
        assert_eq!(table.find_free_hw(), Some(2));

        table.clear_hw(0);
        assert_eq!(table.find_free_hw(), Some(0));
        assert_eq!(table.hw_address(1), Some(0x4010));
        assert_eq!(table.hw_target(1), 5);
    }

    #[test]
    fn test_hw_hit_counting() {
        let table = BreakpointTable::default();
        table.record_hw(0, 0x4000, 3, None);
        assert_eq!(table.bump_hw_hits(0), 1);
        assert_eq!(table.bump_hw_hits(0), 2);
        assert_eq!(table.bump_hw_hits(0), 3);
    }

    #[test]
    fn test_one_software_breakpoint_per_address() {
        let table = BreakpointTable::default();
        let bp = SwBreakpoint {
            saved: [0x90; TRAP_LEN],
            hits: 0,
            target_hits: 0,
        };
        assert!(table.insert_software(0x5000, bp));
        assert!(!table.insert_software(0x5000, bp));
        assert_eq!(table.software_original_bytes(0x5000), Some([0x90; TRAP_LEN]));

        assert!(table.remove_software(0x5000).is_some());
        assert!(table.remove_software(0x5000).is_none());
        assert_eq!(table.software_original_bytes(0x5000), None);
    }

    #[test]
    fn test_match_pc_prefers_hardware() {
        let table = BreakpointTable::default();
        table.record_hw(0, 0x6000, 0, None);
        table.insert_software(
            0x7000,
            SwBreakpoint {
                saved: [0; TRAP_LEN],
                hits: 0,
                target_hits: 0,
            },
        );

        assert_eq!(table.match_pc(0x6000), Some(BreakpointMatch::Hardware(0)));
        assert_eq!(table.match_pc(0x7000), Some(BreakpointMatch::Software(0x7000)));
        assert_eq!(table.match_pc(0x8000), None);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_match_pc_tolerates_trap_overshoot() {
        let table = BreakpointTable::default();
        table.insert_software(
            0x7000,
            SwBreakpoint {
                saved: [0; TRAP_LEN],
                hits: 0,
                target_hits: 0,
            },
        );
        // INT3 leaves the instruction pointer one past the breakpoint
        assert_eq!(table.match_pc(0x7001), Some(BreakpointMatch::Software(0x7000)));
    }
}
