//! Process-shared condition variable with a bounded-retry wrapper around
//! `pthread_cond_wait` for the platforms where it can observe a stale
//! per-waiter pointer left by a previous holder (spec §9; the MacOS-
//! specific zeroing workaround itself is omitted, since the targeted
//! platform here has robust process-shared condition variables).

use std::mem::MaybeUninit;
use std::time::Duration;

use crate::shm::domain::ShmError;
use crate::shm::mutex::MutexGuard;

const STALE_POINTER_RETRIES: u32 = 3;
const STALE_POINTER_RETRY_DELAY: Duration = Duration::from_millis(1);

pub(crate) unsafe fn init(ptr: *mut libc::pthread_cond_t) -> Result<(), ShmError> {
    let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
    let rc = libc::pthread_condattr_init(attr.as_mut_ptr());
    if rc != 0 {
        return Err(ShmError::Platform(rc));
    }
    let mut attr = attr.assume_init();

    let rc = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
    if rc != 0 {
        libc::pthread_condattr_destroy(&mut attr);
        return Err(ShmError::Platform(rc));
    }

    let rc = libc::pthread_cond_init(ptr, &attr);
    libc::pthread_condattr_destroy(&mut attr);
    if rc != 0 {
        return Err(ShmError::Platform(rc));
    }
    Ok(())
}

pub(crate) unsafe fn destroy(ptr: *mut libc::pthread_cond_t) {
    libc::pthread_cond_destroy(ptr);
}

/// Wait on `cond` under `guard`'s mutex. Retries a bounded number of times
/// on `EINVAL`, the symptom of the stale-waiter-pointer quirk spec §9
/// calls out, before surfacing it as a platform error.
pub(crate) unsafe fn wait(cond: *mut libc::pthread_cond_t, guard: &MutexGuard) -> Result<(), ShmError> {
    let mutex = guard.raw();
    let mut attempt = 0;
    loop {
        let rc = libc::pthread_cond_wait(cond, mutex);
        match rc {
            0 => return Ok(()),
            libc::EOWNERDEAD => return Ok(()),
            libc::EINVAL if attempt < STALE_POINTER_RETRIES => {
                attempt += 1;
                std::thread::sleep(STALE_POINTER_RETRY_DELAY);
                continue;
            }
            other => return Err(ShmError::Platform(other)),
        }
    }
}

pub(crate) unsafe fn signal(cond: *mut libc::pthread_cond_t) {
    libc::pthread_cond_signal(cond);
}

pub(crate) unsafe fn broadcast(cond: *mut libc::pthread_cond_t) {
    libc::pthread_cond_broadcast(cond);
}
