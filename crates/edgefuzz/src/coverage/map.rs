//! The shared coverage bitmap.
//!
//! Backed by a SysV shared memory segment (`shmget`/`shmat`), the same
//! mechanism real AFL uses, so that an instrumented child attaching via
//! `shmat(id, ...)` after reading `__AFL_SHM_ID` from its environment sees
//! exactly the bytes this process zeroes and snapshots.

use std::ffi::c_void;
use std::ptr;

use nix::libc;

use crate::error::{EdgeFuzzError, Result};

/// Size of the coverage bitmap. Each byte is the saturating hit count of one
/// edge identifier.
pub const MAP_SIZE: usize = 65536;

/// Name of the environment variable the map's identifier is published under.
pub const SHM_ID_ENV: &str = "__AFL_SHM_ID";

/// A `MAP_SIZE`-byte region shared with exactly one live child at a time.
///
/// The segment is marked for removal (`IPC_RMID`) immediately after
/// creation: the kernel releases it once every attached process (us and,
/// transiently, the child) has detached, so the map is cleaned up even if
/// this process is killed before `Drop` runs.
pub struct SharedMap {
    shm_id: i32,
    ptr: *mut u8,
}

// SAFETY: `ptr` points at a shared memory segment, not process-local state;
// the segment outlives any single thread and all access goes through `&`/`&mut`
// slices with ordinary Rust aliasing rules enforced by the borrow checker.
unsafe impl Send for SharedMap {}

impl SharedMap {
    pub fn new() -> Result<Self> {
        // SAFETY: `shmget` with IPC_PRIVATE always allocates a fresh segment;
        // no aliasing concerns at this point since nothing is mapped yet.
        let shm_id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                MAP_SIZE,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if shm_id < 0 {
            return Err(EdgeFuzzError::Errno(nix::errno::Errno::last()));
        }

        // SAFETY: `shm_id` was just allocated above and is not yet attached
        // anywhere; attaching at a kernel-chosen address with read/write access.
        let ptr = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
        if ptr as isize == -1 {
            let errno = nix::errno::Errno::last();
            // SAFETY: best-effort removal of the segment we just failed to attach.
            unsafe { libc::shmctl(shm_id, libc::IPC_RMID, ptr::null_mut()) };
            return Err(EdgeFuzzError::Errno(errno));
        }

        // Mark for removal now: the segment disappears once every attached
        // process (us, and later the forked child) has detached, including
        // on abnormal exit of this process.
        // SAFETY: `shm_id` is valid and attached at this point.
        if unsafe { libc::shmctl(shm_id, libc::IPC_RMID, ptr::null_mut()) } < 0 {
            let errno = nix::errno::Errno::last();
            // SAFETY: undo the attach performed above before bailing out.
            unsafe { libc::shmdt(ptr) };
            return Err(EdgeFuzzError::Errno(errno));
        }

        let mut map = Self {
            shm_id,
            ptr: ptr.cast::<u8>(),
        };
        map.zero();
        Ok(map)
    }

    /// The decimal identifier published to the child via `__AFL_SHM_ID`.
    pub fn id(&self) -> i32 {
        self.shm_id
    }

    pub fn id_string(&self) -> String {
        self.shm_id.to_string()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `MAP_SIZE` bytes for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr, MAP_SIZE) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `ptr` is valid for `MAP_SIZE` bytes for the lifetime of `self`,
        // and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, MAP_SIZE) }
    }

    /// Zero the map. Must happen before every spawn, so one child's hits are
    /// never conflated with the previous child's leftover bytes.
    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }

    /// Copy the current contents out as an owned snapshot for a [`super::Trace`].
    pub fn snapshot(&self) -> Box<[u8]> {
        self.as_slice().into()
    }
}

impl std::fmt::Debug for SharedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMap")
            .field("shm_id", &self.shm_id)
            .field("size", &MAP_SIZE)
            .finish()
    }
}

impl Drop for SharedMap {
    fn drop(&mut self) {
        // SAFETY: `ptr` was returned by `shmat` in `new` and hasn't been freed yet.
        unsafe {
            libc::shmdt(self.ptr.cast::<c_void>());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_map_is_zeroed_and_right_size() {
        let map = SharedMap::new().expect("shared memory is available in test sandbox");
        assert_eq!(map.as_slice().len(), MAP_SIZE);
        assert!(map.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_clears_previously_written_bytes() {
        let mut map = SharedMap::new().expect("shared memory is available in test sandbox");
        map.as_mut_slice()[100] = 42;
        map.zero();
        assert!(map.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn snapshot_is_an_independent_copy() {
        let mut map = SharedMap::new().expect("shared memory is available in test sandbox");
        map.as_mut_slice()[0] = 7;
        let snap = map.snapshot();
        map.as_mut_slice()[0] = 9;
        assert_eq!(snap[0], 7);
    }

    #[test]
    fn id_string_round_trips_through_env_var_shape() {
        let map = SharedMap::new().expect("shared memory is available in test sandbox");
        let s = map.id_string();
        assert!(s.parse::<i32>().is_ok());
    }
}
