//! Ext SHM: a variable-length heap addressed by byte offset from the Ext
//! base. Offset 0 is the absent sentinel (spec I1); the 8 bytes starting at
//! offset 0 hold the running `wasted` counter (spec I2) rather than being
//! part of the allocatable space.

use srshm_common::consts::EXT_HEADER_SIZE;
use srshm_common::error::{ShmError, ShmResult};
use srshm_common::region::SharedRegion;

/// The Ext SHM region, with the `wasted` counter carved out of its first
/// bytes.
pub struct ExtRegion {
    region: SharedRegion,
}

impl ExtRegion {
    /// Wrap an already-created/attached [`SharedRegion`] as an Ext heap.
    pub fn new(region: SharedRegion) -> Self {
        Self { region }
    }

    /// Total mapped size of the Ext region.
    pub fn len(&self) -> u64 {
        self.region.len() as u64
    }

    /// Whether the region holds no allocatable bytes beyond its header.
    pub fn is_empty(&self) -> bool {
        self.len() <= EXT_HEADER_SIZE
    }

    /// Bytes currently marked wasted (freed but not reclaimed — spec I2).
    pub fn wasted(&self) -> u64 {
        u64::from_le_bytes(self.region.as_bytes()[0..8].try_into().unwrap())
    }

    /// Add to the wasted counter. Callers only ever pass freed byte counts,
    /// so this never needs to handle a decrease.
    pub fn add_wasted(&mut self, delta: u64) {
        let w = self.wasted() + delta;
        self.region.as_bytes_mut()[0..8].copy_from_slice(&w.to_le_bytes());
    }

    /// Reset the wasted counter to zero. Only the defragmenter calls this,
    /// once it has produced a fully dense replacement buffer.
    pub fn reset_wasted(&mut self) {
        self.region.as_bytes_mut()[0..8].copy_from_slice(&0u64.to_le_bytes());
    }

    /// The bump allocator's next free offset (spec §4.4's append cursor).
    pub fn next_free(&self) -> u64 {
        let v = u64::from_le_bytes(self.region.as_bytes()[8..16].try_into().unwrap());
        if v == 0 { EXT_HEADER_SIZE } else { v }
    }

    /// Advance the bump allocator's next free offset.
    pub fn set_next_free(&mut self, offset: u64) {
        self.region.as_bytes_mut()[8..16].copy_from_slice(&offset.to_le_bytes());
    }

    /// Grow the region in place. Caller must hold `ext_remap_lock`.
    pub fn remap(&mut self, new_size: u64) -> ShmResult<()> {
        self.region.remap(new_size)
    }

    fn check_bounds(&self, offset: u64, len: u64) -> ShmResult<()> {
        if offset == 0 {
            return Err(ShmError::InvalidArgument {
                message: "offset 0 is the absent sentinel, not a valid allocation".into(),
            });
        }
        let end = offset.checked_add(len).ok_or_else(|| ShmError::Corruption {
            message: "offset + len overflowed u64".into(),
        })?;
        if end > self.len() {
            return Err(ShmError::Corruption {
                message: format!("offset range {offset}..{end} exceeds Ext size {}", self.len()),
            });
        }
        Ok(())
    }

    /// Read a NUL-terminated string starting at `offset`.
    pub fn read_str(&self, offset: u64) -> ShmResult<&str> {
        if offset == 0 {
            return Ok("");
        }
        let bytes = self.region.as_bytes();
        let start = offset as usize;
        let nul = bytes[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ShmError::Corruption {
                message: "unterminated string in Ext SHM".into(),
            })?;
        std::str::from_utf8(&bytes[start..start + nul]).map_err(|e| ShmError::Corruption {
            message: format!("non-utf8 string in Ext SHM: {e}"),
        })
    }

    /// Write `s` plus its terminating NUL at `offset`. Caller is responsible
    /// for having allocated `s.len() + 1` bytes there.
    pub fn write_str(&mut self, offset: u64, s: &str) -> ShmResult<()> {
        self.check_bounds(offset, s.len() as u64 + 1)?;
        let start = offset as usize;
        let bytes = self.region.as_bytes_mut();
        bytes[start..start + s.len()].copy_from_slice(s.as_bytes());
        bytes[start + s.len()] = 0;
        Ok(())
    }

    /// Read `count` `u64`s starting at `offset`.
    pub fn read_u64_array(&self, offset: u64, count: u32) -> ShmResult<Vec<u64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.check_bounds(offset, count as u64 * 8)?;
        let start = offset as usize;
        let bytes = &self.region.as_bytes()[start..start + count as usize * 8];
        Ok(bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect())
    }

    /// Write `values` as a packed `u64` array at `offset`.
    pub fn write_u64_array(&mut self, offset: u64, values: &[u64]) -> ShmResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.check_bounds(offset, values.len() as u64 * 8)?;
        let start = offset as usize;
        let bytes = self.region.as_bytes_mut();
        for (i, v) in values.iter().enumerate() {
            bytes[start + i * 8..start + i * 8 + 8].copy_from_slice(&v.to_le_bytes());
        }
        Ok(())
    }

    /// Read `count` `T` records starting at `offset`, copying them out.
    ///
    /// # Safety
    /// `T` must be `repr(C)`, `Copy`, and contain no padding that matters
    /// (every field we define this way is plain integers/bools), since the
    /// bytes come straight from another process's writes.
    pub fn read_records<T: Copy>(&self, offset: u64, count: u32) -> ShmResult<Vec<T>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let stride = std::mem::size_of::<T>() as u64;
        self.check_bounds(offset, stride * count as u64)?;
        let start = offset as usize;
        let src = self.region.as_bytes()[start..].as_ptr();
        let mut out: Vec<T> = Vec::with_capacity(count as usize);
        unsafe {
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr() as *mut u8, stride as usize * count as usize);
            out.set_len(count as usize);
        }
        Ok(out)
    }

    /// Write `items` as a packed `T` record array at `offset`.
    pub fn write_records<T: Copy>(&mut self, offset: u64, items: &[T]) -> ShmResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let stride = std::mem::size_of::<T>() as u64;
        self.check_bounds(offset, stride * items.len() as u64)?;
        let start = offset as usize;
        let dst = self.region.as_bytes_mut()[start..].as_mut_ptr();
        unsafe {
            std::ptr::copy_nonoverlapping(items.as_ptr() as *const u8, dst, stride as usize * items.len());
        }
        Ok(())
    }

    /// Raw byte slice, for the allocator and defragmenter.
    pub fn as_bytes(&self) -> &[u8] {
        self.region.as_bytes()
    }

    /// Raw mutable byte slice, for the allocator and defragmenter.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.region.as_bytes_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_ext(size: u64) -> ExtRegion {
        let dir = tempdir().unwrap();
        let region = SharedRegion::create(dir.path().join("ext.bin"), size).unwrap();
        std::mem::forget(dir); // keep backing dir alive for the mapping's lifetime in the test
        ExtRegion::new(region)
    }

    #[test]
    fn wasted_counter_round_trips() {
        let mut ext = make_ext(4096);
        assert_eq!(ext.wasted(), 0);
        ext.add_wasted(100);
        ext.add_wasted(50);
        assert_eq!(ext.wasted(), 150);
        ext.reset_wasted();
        assert_eq!(ext.wasted(), 0);
    }

    #[test]
    fn string_round_trip() {
        let mut ext = make_ext(4096);
        ext.write_str(64, "ietf-interfaces").unwrap();
        assert_eq!(ext.read_str(64).unwrap(), "ietf-interfaces");
    }

    #[test]
    fn offset_zero_is_rejected_for_writes() {
        let mut ext = make_ext(4096);
        assert!(ext.write_str(0, "x").is_err());
    }

    #[test]
    fn u64_array_round_trip() {
        let mut ext = make_ext(4096);
        ext.write_u64_array(128, &[10, 20, 30]).unwrap();
        assert_eq!(ext.read_u64_array(128, 3).unwrap(), vec![10, 20, 30]);
    }
}
