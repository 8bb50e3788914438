//! A process-shared reader/writer lock.
//!
//! This has no precedent in the example corpus (no pack repo embeds a
//! pthread-based lock in shared memory), so it is built from raw `libc`
//! primitives in the same style the teacher reaches for raw syscalls in
//! `platform::linux` — `PTHREAD_PROCESS_SHARED` + `PTHREAD_MUTEX_ROBUST` so
//! the lock's own bookkeeping survives a holder dying mid-mutation.
//!
//! This primitive only protects its own reader-count/writer-flag state. It
//! does *not* know what "recovery" means for the data the lock guards — that
//! is `srshm-core`'s `with_recovery` acquire path, layered on top.

use std::time::Duration;

use crate::error::{ShmError, ShmResult};

/// Raw process-shared reader/writer lock state, embedded directly in shared
/// memory so every attached process sees the same lock.
#[repr(C)]
pub struct RawRwLock {
    mutex: libc::pthread_mutex_t,
    readers_gone: libc::pthread_cond_t,
    writer_gone: libc::pthread_cond_t,
    reader_count: u32,
    writer_active: bool,
}

/// Why a lock's robust mutex reported a dead former owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerDeath {
    /// The mutex was consistent; no owner death was observed.
    Clean,
    /// The previous owner died holding the mutex; state was marked
    /// consistent again and the caller should treat this as a signal to run
    /// a recovery sweep.
    Recovered,
}

impl RawRwLock {
    /// Initialize a freshly-mapped, zeroed `RawRwLock` in place. Must be
    /// called exactly once, by whichever process created the region.
    ///
    /// # Safety
    /// `self` must point at memory that is part of a shared mapping and
    /// large enough to hold `RawRwLock`; it must not already be initialized.
    pub unsafe fn init_in_place(this: *mut RawRwLock) -> ShmResult<()> {
        unsafe {
            let mut mattr: libc::pthread_mutexattr_t = std::mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut mattr))?;
            check(libc::pthread_mutexattr_setpshared(
                &mut mattr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            check(libc::pthread_mutexattr_setrobust(
                &mut mattr,
                libc::PTHREAD_MUTEX_ROBUST,
            ))?;

            let mut cattr: libc::pthread_condattr_t = std::mem::zeroed();
            check(libc::pthread_condattr_init(&mut cattr))?;
            check(libc::pthread_condattr_setpshared(
                &mut cattr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;

            let mutex_ptr = std::ptr::addr_of_mut!((*this).mutex);
            check(libc::pthread_mutex_init(mutex_ptr, &mattr))?;

            let readers_gone_ptr = std::ptr::addr_of_mut!((*this).readers_gone);
            check(libc::pthread_cond_init(readers_gone_ptr, &cattr))?;

            let writer_gone_ptr = std::ptr::addr_of_mut!((*this).writer_gone);
            check(libc::pthread_cond_init(writer_gone_ptr, &cattr))?;

            std::ptr::addr_of_mut!((*this).reader_count).write(0);
            std::ptr::addr_of_mut!((*this).writer_active).write(false);

            libc::pthread_mutexattr_destroy(&mut mattr);
            libc::pthread_condattr_destroy(&mut cattr);
        }
        Ok(())
    }

    /// Try to acquire a shared (reader) hold, waiting up to `timeout`.
    ///
    /// Returns `Ok(Some(death))` on success, `Ok(None)` on timeout (the
    /// caller's `with_recovery` path is expected to escalate to an exclusive
    /// recovery sweep at that point), or `Err` on an unrecoverable mutex
    /// error.
    pub fn lock_shared(&mut self, timeout: Duration) -> ShmResult<Option<OwnerDeath>> {
        let deadline = deadline_from_now(timeout);
        let death = match self.timed_lock_mutex(&deadline)? {
            None => return Ok(None),
            Some(death) => death,
        };

        while self.writer_active {
            let cond_ptr = std::ptr::addr_of_mut!(self.writer_gone);
            if !self.timed_wait(cond_ptr, &deadline)? {
                unsafe { libc::pthread_mutex_unlock(&mut self.mutex) };
                return Ok(None);
            }
        }
        self.reader_count += 1;
        unsafe { libc::pthread_mutex_unlock(&mut self.mutex) };
        Ok(Some(death))
    }

    /// Release a shared hold acquired via `lock_shared`.
    pub fn unlock_shared(&mut self) -> ShmResult<()> {
        check(unsafe { libc::pthread_mutex_lock(&mut self.mutex) })?;
        debug_assert!(self.reader_count > 0);
        self.reader_count = self.reader_count.saturating_sub(1);
        if self.reader_count == 0 {
            unsafe { libc::pthread_cond_broadcast(&mut self.readers_gone) };
        }
        unsafe { libc::pthread_mutex_unlock(&mut self.mutex) };
        Ok(())
    }

    /// Try to acquire an exclusive (writer) hold, waiting up to `timeout`.
    pub fn lock_exclusive(&mut self, timeout: Duration) -> ShmResult<Option<OwnerDeath>> {
        let deadline = deadline_from_now(timeout);
        let death = match self.timed_lock_mutex(&deadline)? {
            None => return Ok(None),
            Some(death) => death,
        };

        while self.writer_active || self.reader_count > 0 {
            let cond_ptr = std::ptr::addr_of_mut!(self.readers_gone);
            if !self.timed_wait(cond_ptr, &deadline)? {
                unsafe { libc::pthread_mutex_unlock(&mut self.mutex) };
                return Ok(None);
            }
        }
        self.writer_active = true;
        unsafe { libc::pthread_mutex_unlock(&mut self.mutex) };
        Ok(Some(death))
    }

    /// Release an exclusive hold acquired via `lock_exclusive`.
    pub fn unlock_exclusive(&mut self) -> ShmResult<()> {
        check(unsafe { libc::pthread_mutex_lock(&mut self.mutex) })?;
        self.writer_active = false;
        unsafe {
            libc::pthread_cond_broadcast(&mut self.writer_gone);
        }
        unsafe { libc::pthread_mutex_unlock(&mut self.mutex) };
        Ok(())
    }

    /// Current reader count, for diagnostics and the recovery sweep.
    pub fn reader_count(&self) -> u32 {
        self.reader_count
    }

    /// Whether a writer currently holds the lock.
    pub fn is_write_locked(&self) -> bool {
        self.writer_active
    }

    /// Forcibly clear the lock state. Only used by the recovery sweep after
    /// it has determined every holder is dead.
    pub fn force_clear(&mut self) {
        self.reader_count = 0;
        self.writer_active = false;
    }

    fn timed_lock_mutex(&mut self, deadline: &libc::timespec) -> ShmResult<Option<OwnerDeath>> {
        let rc = unsafe { libc::pthread_mutex_timedlock(&mut self.mutex, deadline) };
        match rc {
            0 => Ok(Some(OwnerDeath::Clean)),
            libc::ETIMEDOUT => Ok(None),
            libc::EOWNERDEAD => {
                unsafe { libc::pthread_mutex_consistent(&mut self.mutex) };
                Ok(Some(OwnerDeath::Recovered))
            }
            code => Err(ShmError::System {
                source: std::io::Error::from_raw_os_error(code),
            }),
        }
    }

    fn timed_wait(
        &mut self,
        cond: *mut libc::pthread_cond_t,
        deadline: &libc::timespec,
    ) -> ShmResult<bool> {
        let rc = unsafe { libc::pthread_cond_timedwait(cond, &mut self.mutex, deadline) };
        match rc {
            0 => Ok(true),
            libc::ETIMEDOUT => Ok(false),
            libc::EOWNERDEAD => {
                unsafe { libc::pthread_mutex_consistent(&mut self.mutex) };
                Ok(true)
            }
            code => Err(ShmError::System {
                source: std::io::Error::from_raw_os_error(code),
            }),
        }
    }
}

fn check(rc: i32) -> ShmResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(ShmError::System {
            source: std::io::Error::from_raw_os_error(rc),
        })
    }
}

fn deadline_from_now(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    let mut sec = now.tv_sec + timeout.as_secs() as i64;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as i64;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_initialized() -> Box<RawRwLock> {
        let mut lock = Box::new(RawRwLock {
            mutex: unsafe { std::mem::zeroed() },
            readers_gone: unsafe { std::mem::zeroed() },
            writer_gone: unsafe { std::mem::zeroed() },
            reader_count: 0,
            writer_active: false,
        });
        unsafe { RawRwLock::init_in_place(&mut *lock as *mut RawRwLock).unwrap() };
        lock
    }

    #[test]
    fn shared_holds_are_concurrent() {
        let mut lock = new_initialized();
        assert!(
            lock.lock_shared(Duration::from_millis(100))
                .unwrap()
                .is_some()
        );
        assert!(
            lock.lock_shared(Duration::from_millis(100))
                .unwrap()
                .is_some()
        );
        assert_eq!(lock.reader_count(), 2);
        lock.unlock_shared().unwrap();
        lock.unlock_shared().unwrap();
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn exclusive_excludes_shared() {
        let mut lock = new_initialized();
        assert!(
            lock.lock_exclusive(Duration::from_millis(100))
                .unwrap()
                .is_some()
        );
        assert!(lock.is_write_locked());
        assert!(
            lock.lock_shared(Duration::from_millis(50))
                .unwrap()
                .is_none(),
            "shared acquire should time out while writer holds the lock"
        );
        lock.unlock_exclusive().unwrap();
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn force_clear_resets_state() {
        let mut lock = new_initialized();
        lock.lock_shared(Duration::from_millis(100)).unwrap();
        lock.force_clear();
        assert_eq!(lock.reader_count(), 0);
        assert!(!lock.is_write_locked());
    }
}
