//! Named POSIX semaphores shared by every process that opens the same name.
//!
//! Used two ways by the ring buffer: initialized to 1 as a cross-process mutex
//! (see [`Semaphore::lock`]), and initialized to 0 as a binary "data ready" signal.

use nix::errno::Errno;
use std::ffi::CString;
use std::os::raw::c_int;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SemaphoreError {
    #[error("Semaphore call failed: {0}")]
    Os(#[from] Errno),
    #[error("Invalid semaphore name")]
    InvalidName,
    #[error("Semaphore operation timed out")]
    Timeout,
}

pub struct Semaphore {
    sem: *mut libc::sem_t,
    name: String,
}

impl Semaphore {
    /// Open the named semaphore, creating it with `initial_value` if no process has yet.
    pub fn ensure(name: &str, initial_value: u32) -> Result<Self, SemaphoreError> {
        let c_name = CString::new(name).map_err(|_| SemaphoreError::InvalidName)?;

        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                0o660 as libc::c_uint,
                initial_value as libc::c_uint,
            )
        };

        if sem == libc::SEM_FAILED {
            return Err(SemaphoreError::Os(Errno::last()));
        }

        Ok(Self {
            sem,
            name: name.to_string(),
        })
    }

    /// Open an existing named semaphore; fails with `ENOENT` if it was never created.
    pub fn open(name: &str) -> Result<Self, SemaphoreError> {
        let c_name = CString::new(name).map_err(|_| SemaphoreError::InvalidName)?;

        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };

        if sem == libc::SEM_FAILED {
            return Err(SemaphoreError::Os(Errno::last()));
        }

        Ok(Self {
            sem,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait up to `timeout` for the semaphore. Returns `Ok(false)` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, SemaphoreError> {
        let deadline = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            + timeout;

        // sem_timedwait takes an absolute CLOCK_REALTIME deadline.
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        ts.tv_sec = deadline.as_secs() as libc::time_t;
        ts.tv_nsec = deadline.subsec_nanos() as libc::c_long;

        loop {
            let ret = unsafe { libc::sem_timedwait(self.sem, &ts) };
            if ret == 0 {
                return Ok(true);
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::ETIMEDOUT => return Ok(false),
                errno => return Err(SemaphoreError::Os(errno)),
            }
        }
    }

    pub fn try_wait(&self) -> Result<bool, SemaphoreError> {
        let ret = unsafe { libc::sem_trywait(self.sem) };
        if ret == 0 {
            Ok(true)
        } else {
            let errno = Errno::last();
            if errno == Errno::EAGAIN {
                Ok(false)
            } else {
                Err(SemaphoreError::Os(errno))
            }
        }
    }

    pub fn post(&self) -> Result<(), SemaphoreError> {
        let ret = unsafe { libc::sem_post(self.sem) };
        if ret != 0 {
            return Err(SemaphoreError::Os(Errno::last()));
        }
        Ok(())
    }

    pub fn value(&self) -> Result<i32, SemaphoreError> {
        let mut val: c_int = 0;
        let ret = unsafe { libc::sem_getvalue(self.sem, &mut val) };
        if ret != 0 {
            return Err(SemaphoreError::Os(Errno::last()));
        }
        Ok(val)
    }

    /// Raise a binary signal: post only if nobody has posted since the last drain.
    ///
    /// Callers must hold the mutex that also guards [`Semaphore::drain`].
    pub fn raise(&self) -> Result<(), SemaphoreError> {
        if self.value()? <= 0 {
            self.post()?;
        }
        Ok(())
    }

    /// Consume every pending post without blocking.
    pub fn drain(&self) -> Result<(), SemaphoreError> {
        while self.try_wait()? {}
        Ok(())
    }

    /// Acquire the semaphore as a mutex, released when the guard drops.
    pub fn lock(&self, timeout: Duration) -> Result<SemaphoreGuard<'_>, SemaphoreError> {
        if self.wait_timeout(timeout)? {
            Ok(SemaphoreGuard { sem: self })
        } else {
            Err(SemaphoreError::Timeout)
        }
    }

    /// Remove the name from the system. Returns `Ok(false)` if it was already gone.
    pub fn unlink(name: &str) -> Result<bool, SemaphoreError> {
        let c_name = CString::new(name).map_err(|_| SemaphoreError::InvalidName)?;
        let ret = unsafe { libc::sem_unlink(c_name.as_ptr()) };
        if ret != 0 {
            let errno = Errno::last();
            if errno == Errno::ENOENT {
                return Ok(false);
            }
            return Err(SemaphoreError::Os(errno));
        }
        Ok(true)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.sem.post() {
            tracing::error!(semaphore = self.sem.name(), error = %e, "Failed to release lock");
        }
    }
}
