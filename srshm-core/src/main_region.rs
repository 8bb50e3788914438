//! The Main SHM region itself: the header plus the fixed-stride module
//! array that follows it directly in memory (spec §4.3's layout/offset
//! model). Main SHM only ever grows by remap-and-append — existing module
//! records never move, which is what lets readers hold a raw pointer to one
//! across the lock's shared hold (spec §9 design note, invariant I5).

use srshm_common::consts::{MAIN_SHM_MIN_SIZE, SHM_MAX_SIZE};
use srshm_common::error::{ShmError, ShmResult};
use srshm_common::region::SharedRegion;

use crate::layout::{MAIN_SHM_MAGIC, MAIN_SHM_VERSION, MainHeader, ModuleRecord};

const HEADER_SIZE: usize = std::mem::size_of::<MainHeader>();
const RECORD_SIZE: usize = std::mem::size_of::<ModuleRecord>();

/// Owns the Main SHM mapping and exposes the header/module-array view over
/// it.
pub struct MainRegion {
    region: SharedRegion,
}

impl MainRegion {
    /// Create a brand-new Main SHM region with a zeroed, freshly stamped
    /// header and no modules.
    pub fn create(path: impl Into<std::path::PathBuf>) -> ShmResult<Self> {
        let mut region = SharedRegion::create(path, MAIN_SHM_MIN_SIZE as u64)?;
        {
            let header = unsafe { &mut *(region.as_mut_ptr() as *mut MainHeader) };
            *header = unsafe { std::mem::zeroed() };
            header.magic = MAIN_SHM_MAGIC;
            header.version = MAIN_SHM_VERSION;
            unsafe {
                srshm_common::pshared::RawRwLock::init_in_place(
                    std::ptr::addr_of_mut!(header.rwlock),
                )?;
                srshm_common::pshared::RawRwLock::init_in_place(
                    std::ptr::addr_of_mut!(header.lydmods_lock),
                )?;
            }
        }
        Ok(Self { region })
    }

    /// Attach to an existing Main SHM region, validating its header.
    pub fn attach(path: impl Into<std::path::PathBuf>) -> ShmResult<Self> {
        let region = SharedRegion::attach(path)?;
        let this = Self { region };
        let header = this.header();
        if header.magic != MAIN_SHM_MAGIC {
            return Err(ShmError::Corruption {
                message: "main shm magic mismatch".into(),
            });
        }
        if header.version != MAIN_SHM_VERSION {
            return Err(ShmError::VersionMismatch {
                expected: MAIN_SHM_VERSION,
                found: header.version,
            });
        }
        Ok(this)
    }

    /// Immutable header view.
    pub fn header(&self) -> &MainHeader {
        unsafe { &*(self.region.as_ptr() as *const MainHeader) }
    }

    /// Mutable header view. Caller must hold `main_shm.lock` exclusively for
    /// any mutation beyond the embedded locks' own internal state.
    pub fn header_mut(&mut self) -> &mut MainHeader {
        unsafe { &mut *(self.region.as_mut_ptr() as *mut MainHeader) }
    }

    /// Live module records, in array order. Order is append order, not
    /// sorted — lookups are a linear scan (spec §9: acceptable given the
    /// expected module-catalog scale).
    pub fn modules(&self) -> &[ModuleRecord] {
        let count = self.header().module_count as usize;
        if count == 0 {
            return &[];
        }
        let ptr = unsafe { self.region.as_ptr().add(HEADER_SIZE) as *const ModuleRecord };
        unsafe { std::slice::from_raw_parts(ptr, count) }
    }

    /// Mutable view of live module records.
    pub fn modules_mut(&mut self) -> &mut [ModuleRecord] {
        let count = self.header().module_count as usize;
        if count == 0 {
            return &mut [];
        }
        let ptr = unsafe { self.region.as_mut_ptr().add(HEADER_SIZE) as *mut ModuleRecord };
        unsafe { std::slice::from_raw_parts_mut(ptr, count) }
    }

    /// Split-borrow the header and module array simultaneously. Sound
    /// because the two views never overlap — the header lives in
    /// `[0, HEADER_SIZE)` and the module array starts at `HEADER_SIZE`.
    /// The recovery sweep needs both at once: the header to walk the
    /// connection/RPC tables, the module array to clear subscriptions.
    pub fn header_and_modules_mut(&mut self) -> (&mut MainHeader, &mut [ModuleRecord]) {
        let count = self.header().module_count as usize;
        let base = self.region.as_mut_ptr();
        let header = unsafe { &mut *(base as *mut MainHeader) };
        let modules = if count == 0 {
            &mut []
        } else {
            let ptr = unsafe { base.add(HEADER_SIZE) as *mut ModuleRecord };
            unsafe { std::slice::from_raw_parts_mut(ptr, count) }
        };
        (header, modules)
    }

    /// Grow the mapping, if needed, so `capacity` module records fit after
    /// the header. Caller must hold `main_shm.lock` exclusively.
    pub fn reserve(&mut self, capacity: u32) -> ShmResult<()> {
        let needed = HEADER_SIZE as u64 + capacity as u64 * RECORD_SIZE as u64;
        if needed <= self.region.len() as u64 {
            return Ok(());
        }
        if needed > SHM_MAX_SIZE as u64 {
            return Err(ShmError::NoMemory {
                what: "main shm".into(),
                needed,
            });
        }
        self.region.remap(needed)
    }

    /// Append a new module record, growing the mapping first if needed.
    pub fn push_module(&mut self, record: ModuleRecord) -> ShmResult<()> {
        let count = self.header().module_count;
        self.reserve(count + 1)?;
        let ptr = unsafe {
            self.region
                .as_mut_ptr()
                .add(HEADER_SIZE + count as usize * RECORD_SIZE) as *mut ModuleRecord
        };
        unsafe { ptr.write(record) };
        self.header_mut().module_count = count + 1;
        Ok(())
    }

    /// Remove the module record at `idx` by swapping the last record into
    /// its place, matching the subscription registry's swap-with-last
    /// convention. The vacated trailing slot stays mapped (Main SHM never
    /// shrinks) and is simply reused by the next `push_module`.
    pub fn swap_remove_module(&mut self, idx: usize) -> ModuleRecord {
        let last = self.header().module_count as usize - 1;
        let modules = self.modules_mut();
        modules.swap(idx, last);
        let removed = modules[last];
        self.header_mut().module_count -= 1;
        removed
    }

    /// Raw byte length of the mapping, for diagnostics.
    pub fn mapped_len(&self) -> usize {
        self.region.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_stamps_header() {
        let dir = tempdir().unwrap();
        let region = MainRegion::create(dir.path().join("main.bin")).unwrap();
        assert_eq!(region.header().magic, MAIN_SHM_MAGIC);
        assert_eq!(region.header().module_count, 0);
    }

    #[test]
    fn push_then_remove_preserves_other_records() {
        let dir = tempdir().unwrap();
        let mut region = MainRegion::create(dir.path().join("main.bin")).unwrap();

        let mut a: ModuleRecord = unsafe { std::mem::zeroed() };
        a.name_offset = 64;
        let mut b: ModuleRecord = unsafe { std::mem::zeroed() };
        b.name_offset = 128;

        region.push_module(a).unwrap();
        region.push_module(b).unwrap();
        assert_eq!(region.header().module_count, 2);

        region.swap_remove_module(0);
        assert_eq!(region.header().module_count, 1);
        assert_eq!(region.modules()[0].name_offset, 128);
    }

    #[test]
    fn attach_rejects_wrong_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.bin");
        std::fs::write(&path, vec![0u8; MAIN_SHM_MIN_SIZE]).unwrap();
        assert!(MainRegion::attach(path).is_err());
    }
}
