//! System-wide constants for the srshm workspace.
//!
//! Single source of truth for region naming, sizing, and timing defaults.
//! Imported by both crates — no duplication permitted.

/// Suffix appended to a repository name to form the Main SHM region name.
pub const MAIN_SHM_SUFFIX: &str = "main";

/// Suffix appended to a repository name to form the Ext SHM region name.
pub const EXT_SHM_SUFFIX: &str = "ext";

/// Suffix appended to a repository name to form the lock-file region name.
pub const LOCK_SHM_SUFFIX: &str = "lock";

/// Initial Main SHM size in bytes (header + zero module records).
pub const MAIN_SHM_MIN_SIZE: usize = 4096;

/// Initial Ext SHM size in bytes (just the reserved `wasted` counter slot).
pub const EXT_SHM_MIN_SIZE: usize = 4096;

/// Upper bound on a single region, matching the teacher's sizing guard.
pub const SHM_MAX_SIZE: usize = 1_073_741_824; // 1GB

/// Offset 0 in Ext SHM is never a valid allocation — it is the absent
/// sentinel, and the first 8 bytes there hold the running `wasted` counter.
pub const EXT_NULL_OFFSET: u64 = 0;

/// Byte width of the `wasted` counter reserved at Ext offset 0.
pub const EXT_WASTED_COUNTER_SIZE: u64 = 8;

/// Byte width of the whole reserved Ext header: the `wasted` counter
/// followed by the bump allocator's `next_free` cursor. Allocatable space
/// starts immediately after this.
pub const EXT_HEADER_SIZE: u64 = 16;

/// Fixed width of a module revision buffer: `YYYY-MM-DD` plus NUL.
pub const MODULE_REV_SIZE: usize = 11;

/// Default number of consecutive `defrag()` passes a compaction run is
/// allowed before giving up (the pass order is fixed, not retried, but a
/// caller-level compaction loop uses this as a sanity backstop).
pub const DEFRAG_MAX_PASSES: u32 = 1;

/// Default shared-lock acquisition timeout before `with_recovery` escalates
/// to an exclusive recovery sweep.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// CPU cache line size in bytes, used to pad the lock header away from the
/// module array so readers spinning on the lock don't thrash module reads.
pub const CACHE_LINE_SIZE: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_consistent() {
        assert!(MAIN_SHM_MIN_SIZE > 0);
        assert!(EXT_SHM_MIN_SIZE > EXT_WASTED_COUNTER_SIZE as usize);
        assert!(MAIN_SHM_MIN_SIZE < SHM_MAX_SIZE);
    }

    #[test]
    fn null_offset_is_reserved_by_wasted_counter() {
        assert_eq!(EXT_NULL_OFFSET, 0);
        assert!(EXT_HEADER_SIZE as usize <= EXT_SHM_MIN_SIZE);
    }

    #[test]
    fn revision_buffer_fits_iso_date_plus_nul() {
        assert_eq!(MODULE_REV_SIZE, "2024-01-01".len() + 1);
    }
}
