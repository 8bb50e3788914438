//! Linux-specific region mapping and process-liveness primitives.

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;

/// Create (or truncate-and-reopen) the backing file for a named region and
/// map `size` bytes of it.
pub fn create_region_mmap(path: &std::path::Path, size: u64) -> ShmResult<MmapMut> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(path)?;

    file.set_len(size)?;

    let mmap = unsafe { MmapOptions::new().len(size as usize).map_mut(&file)? };
    Ok(mmap)
}

/// Attach to a region that is expected to already exist, mapping its current
/// on-disk size.
pub fn attach_region_mmap(path: &std::path::Path) -> ShmResult<MmapMut> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(mmap)
}

/// Grow (or shrink) a region's backing file and remap it at its new size.
/// Callers must hold whatever lock protects the region from concurrent
/// remaps before calling this (spec's `ext_remap_lock`/Main SHM equivalent).
pub fn remap_region_mmap(path: &std::path::Path, new_size: u64) -> ShmResult<MmapMut> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    file.set_len(new_size)?;
    let mmap = unsafe { MmapOptions::new().len(new_size as usize).map_mut(&file)? };
    Ok(mmap)
}

/// Remove a region's backing file entirely. Only used by teardown and tests.
pub fn remove_region_file(path: &std::path::Path) -> ShmResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ShmError::System { source: e }),
    }
}

/// Check whether `pid` refers to a live process, using a null signal.
///
/// `ESRCH` means the process is gone; `EPERM` means it exists but we can't
/// signal it, which still counts as alive. Any other error is treated as
/// dead so a recovery sweep favors progress over precision.
pub fn is_process_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::Error::EPERM) => true,
        Err(_) => false,
    }
}

/// The calling process's own PID.
pub fn current_pid() -> i32 {
    getpid().as_raw()
}
