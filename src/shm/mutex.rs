//! Process-shared, robust pthread mutex with optional scoped signal masking
//! (spec §4.D header item, §5 "Mutexes with scoped signal blocking").
//!
//! The mask to block, if any, is supplied by the caller on every `lock`
//! call and the prior mask is restored on release — never stored in the
//! shared object itself, so nested locks by the same thread compose (spec
//! §9).

use std::mem::MaybeUninit;

use crate::shm::domain::ShmError;

/// A signal set blocked for the duration of a critical section.
#[derive(Clone, Copy)]
pub struct SignalMask(libc::sigset_t);

impl SignalMask {
    pub fn of(signals: &[libc::c_int]) -> std::io::Result<Self> {
        unsafe {
            let mut set = MaybeUninit::<libc::sigset_t>::uninit();
            if libc::sigemptyset(set.as_mut_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let mut set = set.assume_init();
            for &sig in signals {
                if libc::sigaddset(&mut set, sig) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(SignalMask(set))
        }
    }
}

/// Initialize a process-shared, robust mutex in place. `ptr` must point at
/// zeroed memory that outlives every participant using it.
pub(crate) unsafe fn init(ptr: *mut libc::pthread_mutex_t) -> Result<(), ShmError> {
    let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
    let rc = libc::pthread_mutexattr_init(attr.as_mut_ptr());
    if rc != 0 {
        return Err(ShmError::Platform(rc));
    }
    let mut attr = attr.assume_init();

    let rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if rc != 0 {
        libc::pthread_mutexattr_destroy(&mut attr);
        return Err(ShmError::Platform(rc));
    }

    let rc = libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
    if rc != 0 {
        libc::pthread_mutexattr_destroy(&mut attr);
        return Err(ShmError::Platform(rc));
    }

    let rc = libc::pthread_mutex_init(ptr, &attr);
    libc::pthread_mutexattr_destroy(&mut attr);
    if rc != 0 {
        return Err(ShmError::Platform(rc));
    }
    Ok(())
}

pub(crate) unsafe fn destroy(ptr: *mut libc::pthread_mutex_t) {
    libc::pthread_mutex_destroy(ptr);
}

/// RAII guard: unlocks and restores the caller's prior signal mask on drop.
pub(crate) struct MutexGuard {
    ptr: *mut libc::pthread_mutex_t,
    prior_mask: Option<libc::sigset_t>,
    /// Set when this acquisition recovered the mutex from `EOWNERDEAD`; a
    /// prior holder died mid-critical-section (spec §5, robust mutexes).
    pub recovered: bool,
}

impl MutexGuard {
    pub(crate) fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.ptr
    }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        // Unlock before restoring the signal mask: until the unlock, this
        // thread is still the holder, so it must stay uninterruptible by
        // the blocked set for the critical section's entire duration,
        // including this teardown (spec §5).
        unsafe {
            libc::pthread_mutex_unlock(self.ptr);
            if let Some(mask) = self.prior_mask {
                libc::pthread_sigmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());
            }
        }
    }
}

/// Lock `ptr`, optionally blocking `mask` for the critical section's
/// duration. A mutex recovered from a dead owner is marked consistent
/// transparently; `MutexGuard::recovered` tells the caller this happened so
/// it can re-validate shared state if it must.
pub(crate) unsafe fn lock(
    ptr: *mut libc::pthread_mutex_t,
    mask: Option<&SignalMask>,
) -> Result<MutexGuard, ShmError> {
    let prior_mask = match mask {
        Some(SignalMask(set)) => {
            let mut old = MaybeUninit::<libc::sigset_t>::uninit();
            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, set, old.as_mut_ptr());
            if rc != 0 {
                return Err(ShmError::Platform(rc));
            }
            Some(old.assume_init())
        }
        None => None,
    };

    let rc = libc::pthread_mutex_lock(ptr);
    let recovered = match rc {
        0 => false,
        libc::EOWNERDEAD => {
            libc::pthread_mutex_consistent(ptr);
            true
        }
        other => {
            if let Some(mask) = prior_mask {
                libc::pthread_sigmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());
            }
            return Err(ShmError::Platform(other));
        }
    };

    Ok(MutexGuard {
        ptr,
        prior_mask,
        recovered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_mask_builds_from_empty_list() {
        let mask = SignalMask::of(&[]).unwrap();
        let _ = mask;
    }

    #[test]
    fn signal_mask_builds_with_sigusr1() {
        let mask = SignalMask::of(&[libc::SIGUSR1]).unwrap();
        let _ = mask;
    }
}
