//! POSIX shared memory with typestate-based cleanup
//!
//! A thin RAII wrapper over `shm_open`/`mmap`. The `Mode` type parameter
//! encodes which side of the protocol owns the name: the server maps the
//! region as [`Creator`] (unmaps and unlinks on drop), the client maps it as
//! [`Opener`] (unmaps only; the name belongs to the server).

use std::ffi::CString;
use std::io;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::{Deref, DerefMut};

use crate::error::BridgeError;

/// Cleanup behavior for a mapping, fixed at compile time.
pub trait ShmMode {
    const UNLINK_ON_DROP: bool;
}

/// Marker for the process that creates the shared memory object.
pub struct Creator;
impl ShmMode for Creator {
    const UNLINK_ON_DROP: bool = true;
}

/// Marker for a process that opens an object created elsewhere.
pub struct Opener;
impl ShmMode for Opener {
    const UNLINK_ON_DROP: bool = false;
}

/// Types that may live in memory shared between processes.
///
/// # Safety
///
/// Implementers must guarantee all of the following:
/// - the all-zeros bit pattern is a valid value (mappings start zero-filled);
/// - the layout is `#[repr(C)]`, stable across separately compiled processes;
/// - no pointers or references, since virtual addresses do not cross processes;
/// - the type is sound even if `Drop` never runs (a peer may be SIGKILLed).
pub unsafe trait SharedMemorySafe: Send + Sync {}

/// Mapped POSIX shared memory holding exactly one `T`.
pub struct Shm<T: SharedMemorySafe, M: ShmMode> {
    ptr: *mut T,
    name: CString,
    _mode: PhantomData<M>,
}

// The pointer targets shared memory, not thread-local state; T itself is
// required to be Send + Sync by the SharedMemorySafe bound.
unsafe impl<T: SharedMemorySafe, M: ShmMode> Send for Shm<T, M> {}
unsafe impl<T: SharedMemorySafe, M: ShmMode> Sync for Shm<T, M> {}

fn setup_err(name: &str, source: io::Error) -> BridgeError {
    BridgeError::ResourceSetup {
        resource: format!("shared memory {name}"),
        source,
    }
}

fn c_name(name: &str) -> Result<CString, BridgeError> {
    CString::new(name).map_err(|_| setup_err(name, io::Error::from(io::ErrorKind::InvalidInput)))
}

impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Create a new shared memory object named `name` and map it read-write.
    ///
    /// Fails with `EEXIST` if the name is already bound; callers that want
    /// stale-object recovery should [`unlink`](Shm::unlink) first.
    pub fn create(name: &str) -> Result<Self, BridgeError> {
        let c = c_name(name)?;

        let fd = unsafe {
            libc::shm_open(
                c.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o666 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(setup_err(name, io::Error::last_os_error()));
        }

        if unsafe { libc::ftruncate(fd, size_of::<T>() as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c.as_ptr());
            }
            return Err(setup_err(name, err));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size_of::<T>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c.as_ptr());
            }
            return Err(setup_err(name, err));
        }

        // The mapping persists independently of the descriptor.
        unsafe { libc::close(fd) };

        // ftruncate on a fresh object zero-fills, which SharedMemorySafe
        // guarantees is a valid T.
        Ok(Self {
            ptr: ptr as *mut T,
            name: c,
            _mode: PhantomData,
        })
    }

    /// Remove a possibly stale name binding. Returns `true` if an object was
    /// actually unlinked, `false` if the name was unbound.
    pub fn unlink(name: &str) -> Result<bool, BridgeError> {
        let c = c_name(name)?;
        if unsafe { libc::shm_unlink(c.as_ptr()) } == 0 {
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

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Open and map an existing shared memory object. Never creates.
    pub fn open(name: &str) -> Result<Self, BridgeError> {
        let c = c_name(name)?;

        let fd = unsafe { libc::shm_open(c.as_ptr(), libc::O_RDWR, 0 as libc::mode_t) };
        if fd < 0 {
            return Err(setup_err(name, io::Error::last_os_error()));
        }

        // Reject objects whose size does not match T: a mismatch means the
        // peer was built against a different layout.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(setup_err(name, err));
        }
        if stat.st_size != size_of::<T>() as libc::off_t {
            unsafe { libc::close(fd) };
            return Err(setup_err(
                name,
                io::Error::new(io::ErrorKind::InvalidData, "shared memory size mismatch"),
            ));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size_of::<T>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(setup_err(name, err));
        }

        unsafe { libc::close(fd) };

        Ok(Self {
            ptr: ptr as *mut T,
            name: c,
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, M: ShmMode> Shm<T, M> {
    /// The object name this mapping was created or opened with.
    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or("<non-utf8>")
    }
}

impl<T: SharedMemorySafe, M: ShmMode> Drop for Shm<T, M> {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, size_of::<T>());
            if M::UNLINK_ON_DROP {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

impl<T: SharedMemorySafe, M: ShmMode> Deref for Shm<T, M> {
    type Target = T;
    fn deref(&self) -> &T {
        // Valid for the lifetime of self: mmap succeeded and munmap only
        // happens in Drop.
        unsafe { &*self.ptr }
    }
}

impl<T: SharedMemorySafe, M: ShmMode> DerefMut for Shm<T, M> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.ptr }
    }
}
