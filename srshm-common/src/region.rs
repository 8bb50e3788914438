//! The raw shared-memory region primitive: a named, file-backed mapping that
//! can be created, attached to by another process, grown in place, and torn
//! down. Nothing here knows about Main/Ext layout — that's `srshm-core`.

use memmap2::MmapMut;
use std::path::{Path, PathBuf};

use crate::error::ShmResult;
use crate::platform;

/// A single memory-mapped region backed by a file under the repo's runtime
/// directory.
pub struct SharedRegion {
    path: PathBuf,
    mmap: MmapMut,
}

impl SharedRegion {
    /// Create a new region at `path`, truncating any previous content, sized
    /// to `initial_size` bytes.
    pub fn create(path: impl Into<PathBuf>, initial_size: u64) -> ShmResult<Self> {
        let path = path.into();
        let mmap = platform::create_region_mmap(&path, initial_size)?;
        Ok(Self { path, mmap })
    }

    /// Attach to a region that some other process already created.
    pub fn attach(path: impl Into<PathBuf>) -> ShmResult<Self> {
        let path = path.into();
        let mmap = platform::attach_region_mmap(&path)?;
        Ok(Self { path, mmap })
    }

    /// Grow or shrink the region in place, replacing the mapping.
    ///
    /// The caller must hold whatever lock serializes remaps of this region
    /// (`ext_remap_lock` for Ext SHM, the writer hold on `main_shm.lock` for
    /// Main SHM) — this call itself does no locking.
    pub fn remap(&mut self, new_size: u64) -> ShmResult<()> {
        self.mmap = platform::remap_region_mmap(&self.path, new_size)?;
        Ok(())
    }

    /// Current mapped size in bytes.
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Whether the region is currently zero-sized.
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw immutable byte view of the whole region.
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Raw mutable byte view of the whole region.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }

    /// Immutable pointer to byte 0 of the region.
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Mutable pointer to byte 0 of the region.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    /// Remove the backing file. Only meaningful for teardown/tests — a
    /// running substrate never deletes its own regions.
    pub fn destroy(self) -> ShmResult<()> {
        platform::remove_region_file(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_attach_see_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.bin");

        let mut region = SharedRegion::create(&path, 4096).unwrap();
        region.as_bytes_mut()[0] = 0xAB;

        let attached = SharedRegion::attach(&path).unwrap();
        assert_eq!(attached.as_bytes()[0], 0xAB);
        assert_eq!(attached.len(), 4096);
    }

    #[test]
    fn remap_grows_in_place_and_preserves_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.bin");

        let mut region = SharedRegion::create(&path, 4096).unwrap();
        region.as_bytes_mut()[0..4].copy_from_slice(&[1, 2, 3, 4]);

        region.remap(8192).unwrap();
        assert_eq!(region.len(), 8192);
        assert_eq!(&region.as_bytes()[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn destroy_removes_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.bin");
        let region = SharedRegion::create(&path, 4096).unwrap();
        region.destroy().unwrap();
        assert!(!path.exists());
    }
}
