//! The Ext SHM offset allocator: an append-only bump allocator plus explicit
//! `wasted` accounting (spec §4.4). Deallocation never reclaims space inline
//! — it only marks bytes wasted — because the defragmenter is the only thing
//! allowed to change existing offsets, and only while every process has the
//! `ext_remap_lock` held for writing.

use srshm_common::consts::SHM_MAX_SIZE;
use srshm_common::error::{ShmError, ShmResult};

use crate::ext::ExtRegion;

/// Thin wrapper that performs every Ext byte allocation/free through one
/// choke point, so I2 (wasted accounting) is trivially testable in
/// isolation.
pub struct ExtAllocator<'a> {
    ext: &'a mut ExtRegion,
}

impl<'a> ExtAllocator<'a> {
    /// Borrow an [`ExtRegion`] for allocation.
    pub fn new(ext: &'a mut ExtRegion) -> Self {
        Self { ext }
    }

    /// Allocate `len` bytes, growing the region (via `remap`) if the current
    /// mapping doesn't have room. Returns the offset of the first byte.
    ///
    /// Caller must hold `ext_remap_lock` for writing before calling this, so
    /// no other process observes an in-progress remap.
    pub fn alloc(&mut self, len: u64) -> ShmResult<u64> {
        if len == 0 {
            return Err(ShmError::InvalidArgument {
                message: "cannot allocate zero bytes".into(),
            });
        }
        let offset = self.ext.next_free();
        let end = offset.checked_add(len).ok_or_else(|| ShmError::NoMemory {
            what: "ext allocation".into(),
            needed: len,
        })?;

        if end > self.ext.len() {
            let grown = end.max(self.ext.len() * 2).min(SHM_MAX_SIZE as u64);
            if grown < end {
                return Err(ShmError::NoMemory {
                    what: "ext region".into(),
                    needed: end,
                });
            }
            self.ext.remap(grown)?;
        }

        self.ext.set_next_free(end);
        Ok(offset)
    }

    /// Allocate room for `s` plus its terminating NUL and write it.
    pub fn alloc_str(&mut self, s: &str) -> ShmResult<u64> {
        let offset = self.alloc(s.len() as u64 + 1)?;
        self.ext.write_str(offset, s)?;
        Ok(offset)
    }

    /// Allocate room for `values` and write them as a packed `u64` array.
    pub fn alloc_u64_array(&mut self, values: &[u64]) -> ShmResult<u64> {
        if values.is_empty() {
            return Ok(0);
        }
        let offset = self.alloc(values.len() as u64 * 8)?;
        self.ext.write_u64_array(offset, values)?;
        Ok(offset)
    }

    /// Allocate room for `items` and write them as a packed record array.
    pub fn alloc_records<T: Copy>(&mut self, items: &[T]) -> ShmResult<u64> {
        if items.is_empty() {
            return Ok(0);
        }
        let offset = self.alloc(std::mem::size_of::<T>() as u64 * items.len() as u64)?;
        self.ext.write_records(offset, items)?;
        Ok(offset)
    }

    /// Replace a `(offset, count)` record array with `new_items`: allocate a
    /// fresh array, write it, and mark the old one wasted. Every dynamic
    /// array in Main SHM (dependencies, subscriptions, connections, RPCs)
    /// is mutated this way so wasted-byte accounting stays exact (spec I2,
    /// testable per spec §8).
    pub fn rewrite_records<T: Copy>(
        &mut self,
        old_offset: u64,
        old_count: u32,
        new_items: &[T],
    ) -> ShmResult<(u64, u32)> {
        let new_offset = self.alloc_records(new_items)?;
        self.free(old_offset, std::mem::size_of::<T>() as u64 * old_count as u64);
        Ok((new_offset, new_items.len() as u32))
    }

    /// Mark `len` bytes starting at `offset` as wasted. Does not zero or
    /// otherwise touch the bytes — only the defragmenter's dense rebuild
    /// actually reclaims them.
    pub fn free(&mut self, offset: u64, len: u64) {
        if offset == 0 || len == 0 {
            return;
        }
        self.ext.add_wasted(len);
    }

    /// Current wasted byte count.
    pub fn wasted(&self) -> u64 {
        self.ext.wasted()
    }

    /// Total live (allocated-and-not-wasted) bytes, useful for sizing a
    /// single up-front remap (spec §9 Open Question resolution).
    pub fn live_bytes(&self) -> u64 {
        self.ext.next_free().saturating_sub(self.wasted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use srshm_common::region::SharedRegion;
    use tempfile::tempdir;

    fn make_ext(size: u64) -> ExtRegion {
        let dir = tempdir().unwrap();
        let region = SharedRegion::create(dir.path().join("ext.bin"), size).unwrap();
        std::mem::forget(dir);
        ExtRegion::new(region)
    }

    #[test]
    fn alloc_is_append_only_and_non_overlapping() {
        let mut ext = make_ext(4096);
        let mut alloc = ExtAllocator::new(&mut ext);
        let a = alloc.alloc(16).unwrap();
        let b = alloc.alloc(32).unwrap();
        assert_eq!(b, a + 16);
    }

    #[test]
    fn free_only_marks_wasted_does_not_reuse_space() {
        let mut ext = make_ext(4096);
        let mut alloc = ExtAllocator::new(&mut ext);
        let a = alloc.alloc(16).unwrap();
        alloc.free(a, 16);
        let b = alloc.alloc(16).unwrap();
        assert_ne!(a, b, "freed bytes are never handed back by the allocator");
        assert_eq!(alloc.wasted(), 16);
    }

    #[test]
    fn alloc_grows_region_when_out_of_room() {
        let mut ext = make_ext(32);
        let mut alloc = ExtAllocator::new(&mut ext);
        let before = alloc.ext.len();
        alloc.alloc(1024).unwrap();
        assert!(alloc.ext.len() > before);
    }

    #[test]
    fn alloc_str_round_trips_through_ext() {
        let mut ext = make_ext(4096);
        let offset = {
            let mut alloc = ExtAllocator::new(&mut ext);
            alloc.alloc_str("ietf-interfaces").unwrap()
        };
        assert_eq!(ext.read_str(offset).unwrap(), "ietf-interfaces");
    }
}
