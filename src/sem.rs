//! Named POSIX semaphores
//!
//! The four handshake semaphores are plain counting semaphores created by the
//! server and opened by the client, mirroring the ownership split in
//! [`crate::shm`]. Waits report interruption and timeout as distinct
//! outcomes instead of folding them into errors, because the server loop
//! treats `EINTR` as "re-check the shutdown flag and keep waiting".

use std::ffi::CString;
use std::io;
use std::marker::PhantomData;
use std::time::Duration;

use crate::error::BridgeError;
use crate::shm::{Creator, Opener, ShmMode};

/// How a wait on a semaphore ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The semaphore was decremented.
    Acquired,
    /// A signal interrupted the wait; the count was not consumed.
    Interrupted,
    /// The deadline passed; the count was not consumed.
    TimedOut,
}

/// A named counting semaphore.
///
/// `M` encodes cleanup the same way it does for [`crate::shm::Shm`]:
/// `Creator` closes and unlinks on drop, `Opener` only closes.
pub struct Semaphore<M: ShmMode> {
    sem: *mut libc::sem_t,
    name: CString,
    _mode: PhantomData<M>,
}

// sem_t operations are process- and thread-safe by POSIX contract.
unsafe impl<M: ShmMode> Send for Semaphore<M> {}
unsafe impl<M: ShmMode> Sync for Semaphore<M> {}

fn setup_err(name: &str, source: io::Error) -> BridgeError {
    BridgeError::ResourceSetup {
        resource: format!("semaphore {name}"),
        source,
    }
}

fn c_name(name: &str) -> Result<CString, BridgeError> {
    CString::new(name).map_err(|_| setup_err(name, io::Error::from(io::ErrorKind::InvalidInput)))
}

impl Semaphore<Creator> {
    /// Create a new named semaphore with an initial count of zero.
    ///
    /// Fails with `EEXIST` if the name is already bound; callers that want
    /// stale-object recovery should [`unlink`](Semaphore::unlink) first.
    pub fn create(name: &str) -> Result<Self, BridgeError> {
        let c = c_name(name)?;
        let sem = unsafe {
            libc::sem_open(
                c.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o666 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(setup_err(name, io::Error::last_os_error()));
        }
        Ok(Self {
            sem,
            name: c,
            _mode: PhantomData,
        })
    }

    /// Remove a possibly stale name binding. Returns `true` if a semaphore
    /// was actually unlinked.
    pub fn unlink(name: &str) -> Result<bool, BridgeError> {
        let c = c_name(name)?;
        if unsafe { libc::sem_unlink(c.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Ok(false)
        } else {
            Err(setup_err(name, err))
        }
    }
}

impl Semaphore<Opener> {
    /// Open an existing named semaphore. Never creates.
    pub fn open(name: &str) -> Result<Self, BridgeError> {
        let c = c_name(name)?;
        let sem = unsafe { libc::sem_open(c.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(setup_err(name, io::Error::last_os_error()));
        }
        Ok(Self {
            sem,
            name: c,
            _mode: PhantomData,
        })
    }
}

impl<M: ShmMode> Semaphore<M> {
    /// The name this semaphore was created or opened with.
    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or("<non-utf8>")
    }

    fn op_err(&self) -> BridgeError {
        BridgeError::Semaphore {
            name: self.name().to_string(),
            source: io::Error::last_os_error(),
        }
    }

    /// Increment the count, waking one waiter if any.
    pub fn post(&self) -> Result<(), BridgeError> {
        if unsafe { libc::sem_post(self.sem) } == 0 {
            Ok(())
        } else {
            Err(self.op_err())
        }
    }

    /// Block until the count can be decremented or a signal arrives.
    pub fn wait(&self) -> Result<WaitOutcome, BridgeError> {
        if unsafe { libc::sem_wait(self.sem) } == 0 {
            return Ok(WaitOutcome::Acquired);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            Ok(WaitOutcome::Interrupted)
        } else {
            Err(BridgeError::Semaphore {
                name: self.name().to_string(),
                source: err,
            })
        }
    }

    /// Like [`wait`](Semaphore::wait) but bounded. A timed-out wait does not
    /// consume a count, so a later post is never silently swallowed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<WaitOutcome, BridgeError> {
        let deadline = deadline_from_now(timeout)?;
        if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
            return Ok(WaitOutcome::Acquired);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => Ok(WaitOutcome::Interrupted),
            Some(libc::ETIMEDOUT) => Ok(WaitOutcome::TimedOut),
            _ => Err(BridgeError::Semaphore {
                name: self.name().to_string(),
                source: err,
            }),
        }
    }

    /// Decrement the count if it is positive, without blocking.
    pub fn try_wait(&self) -> Result<bool, BridgeError> {
        if unsafe { libc::sem_trywait(self.sem) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EAGAIN) {
            Ok(false)
        } else {
            Err(BridgeError::Semaphore {
                name: self.name().to_string(),
                source: err,
            })
        }
    }
}

// sem_timedwait takes an absolute CLOCK_REALTIME deadline.
fn deadline_from_now(timeout: Duration) -> Result<libc::timespec, BridgeError> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(BridgeError::Io(io::Error::last_os_error()));
    }

    const NANOS_PER_SEC: i64 = 1_000_000_000;
    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    if nsec >= NANOS_PER_SEC {
        sec += 1;
        nsec -= NANOS_PER_SEC;
    }
    Ok(libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec as libc::c_long,
    })
}

impl<M: ShmMode> Drop for Semaphore<M> {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
            if M::UNLINK_ON_DROP {
                libc::sem_unlink(self.name.as_ptr());
            }
        }
    }
}
