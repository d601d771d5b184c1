//! Trap instruction encoding for software breakpoints.

/// Width in bytes of the trap instruction patched over a breakpoint address.
#[cfg(target_arch = "x86_64")]
pub const TRAP_LEN: usize = 1;
#[cfg(target_arch = "aarch64")]
pub const TRAP_LEN: usize = 4;

/// INT3
#[cfg(target_arch = "x86_64")]
const TRAP_INSTRUCTION: u64 = 0xCC;
/// BRK #0
#[cfg(target_arch = "aarch64")]
const TRAP_INSTRUCTION: u64 = 0xD420_0000;

#[cfg(target_arch = "x86_64")]
const TRAP_MASK: u64 = 0xFF;
#[cfg(target_arch = "aarch64")]
const TRAP_MASK: u64 = 0xFFFF_FFFF;

/// Merge the trap instruction into the low bytes of a machine word read from
/// the breakpoint address.
pub fn patch_word(word: i64) -> i64 {
    ((word as u64 & !TRAP_MASK) | TRAP_INSTRUCTION) as i64
}

/// Merge previously saved original bytes back into a machine word.
pub fn restore_word(word: i64, saved: &[u8; TRAP_LEN]) -> i64 {
    let mut original = [0u8; 8];
    original[..TRAP_LEN].copy_from_slice(saved);
    ((word as u64 & !TRAP_MASK) | u64::from_le_bytes(original)) as i64
}

/// Extract the bytes that the trap instruction will overwrite.
pub fn saved_bytes(word: i64) -> [u8; TRAP_LEN] {
    let mut saved = [0u8; TRAP_LEN];
    saved.copy_from_slice(&word.to_le_bytes()[..TRAP_LEN]);
    saved
}

/// True if the word at a breakpoint address currently carries the trap.
pub fn is_patched(word: i64) -> bool {
    (word as u64 & TRAP_MASK) == TRAP_INSTRUCTION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_restore_round_trip() {
        let word = 0x1122_3344_5566_7788u64 as i64;
        let saved = saved_bytes(word);
        let patched = patch_word(word);
        assert!(is_patched(patched));
        assert_ne!(patched, word);
        assert_eq!(restore_word(patched, &saved), word);
    }

    #[test]
    fn test_patch_preserves_high_bytes() {
        let word = 0x1122_3344_5566_7788u64 as i64;
        let patched = patch_word(word) as u64;
        assert_eq!(patched & !TRAP_MASK, word as u64 & !TRAP_MASK);
    }
}
