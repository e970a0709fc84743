// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest file descriptor table.
//!
//! The full fd translation layer is an external collaborator; this is the
//! interface the VM kernel consumes from it, with the direct passthrough
//! the monitor itself needs: guest fds map to host fds, I/O data moves
//! through the slot aliases with scatter lists so a buffer spanning
//! memory slots still becomes one host syscall.

use std::sync::Mutex;

use crate::{Gva, Machine};

const MAX_GUEST_FDS: usize = 1024;
const MAX_IOV: usize = 1024;

pub struct FdTable {
    map: Mutex<Vec<Option<i32>>>,
}

impl FdTable {
    pub fn new() -> FdTable {
        let mut map = vec![None; MAX_GUEST_FDS];
        // stdio passes straight through.
        map[0] = Some(0);
        map[1] = Some(1);
        map[2] = Some(2);
        FdTable { map: Mutex::new(map) }
    }

    fn get(&self, gfd: i32) -> Option<i32> {
        if gfd < 0 {
            return None;
        }
        *self.map.lock().unwrap().get(gfd as usize)?
    }

    fn alloc(&self, host_fd: i32) -> Option<i32> {
        let mut map = self.map.lock().unwrap();
        let slot = map.iter().position(|e| e.is_none())?;
        map[slot] = Some(host_fd);
        Some(slot as i32)
    }

    fn set(&self, gfd: i32, host_fd: i32) -> Option<i32> {
        let mut map = self.map.lock().unwrap();
        let slot = map.get_mut(gfd as usize)?;
        let old = slot.take();
        *slot = Some(host_fd);
        old
    }

    fn remove(&self, gfd: i32) -> Option<i32> {
        if gfd < 0 {
            return None;
        }
        self.map.lock().unwrap().get_mut(gfd as usize)?.take()
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct GuestIovec {
    base: Gva,
    len: u64,
}

fn errno() -> i64 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO) as i64
}

impl Machine {
    pub fn host_fd(&self, gfd: i32) -> Option<i32> {
        self.fdtab.get(gfd)
    }

    /// Gather the host-side scatter list for a guest buffer.
    fn guest_iovecs(&self, gva: Gva, len: u64, out: &mut Vec<libc::iovec>) -> Result<(), i64> {
        if len == 0 {
            return Ok(());
        }
        self.for_each_kma_chunk(gva, len, |ptr, chunk, _| {
            out.push(libc::iovec {
                iov_base: ptr as *mut libc::c_void,
                iov_len: chunk,
            });
            Ok(())
        })
    }

    pub fn guest_read(&self, gfd: i32, buf: Gva, count: u64) -> i64 {
        let host = match self.host_fd(gfd) {
            Some(h) => h,
            None => return -(libc::EBADF as i64),
        };
        let mut iov = Vec::new();
        if let Err(e) = self.guest_iovecs(buf, count, &mut iov) {
            return e;
        }
        // SAFETY: iovecs point into live slot aliases validated above.
        let rc = unsafe { libc::readv(host, iov.as_ptr(), iov.len() as i32) };
        if rc < 0 {
            -errno()
        } else {
            rc as i64
        }
    }

    pub fn guest_write(&self, gfd: i32, buf: Gva, count: u64) -> i64 {
        let host = match self.host_fd(gfd) {
            Some(h) => h,
            None => return -(libc::EBADF as i64),
        };
        let mut iov = Vec::new();
        if let Err(e) = self.guest_iovecs(buf, count, &mut iov) {
            return e;
        }
        // SAFETY: iovecs point into live slot aliases validated above.
        let rc = unsafe { libc::writev(host, iov.as_ptr(), iov.len() as i32) };
        if rc < 0 {
            -errno()
        } else {
            rc as i64
        }
    }

    pub fn guest_readv(&self, gfd: i32, iov_gva: Gva, iovcnt: i32) -> i64 {
        self.guest_rwv(gfd, iov_gva, iovcnt, false)
    }

    pub fn guest_writev(&self, gfd: i32, iov_gva: Gva, iovcnt: i32) -> i64 {
        self.guest_rwv(gfd, iov_gva, iovcnt, true)
    }

    fn guest_rwv(&self, gfd: i32, iov_gva: Gva, iovcnt: i32, write: bool) -> i64 {
        let host = match self.host_fd(gfd) {
            Some(h) => h,
            None => return -(libc::EBADF as i64),
        };
        if iovcnt < 0 || iovcnt as usize > MAX_IOV {
            return -(libc::EINVAL as i64);
        }
        let mut host_iov = Vec::new();
        for i in 0..iovcnt as u64 {
            let entry: GuestIovec = match self.read_obj(iov_gva + i * 16) {
                Ok(e) => e,
                Err(e) => return e,
            };
            if let Err(e) = self.guest_iovecs(entry.base, entry.len, &mut host_iov) {
                return e;
            }
            if host_iov.len() > MAX_IOV {
                return -(libc::EINVAL as i64);
            }
        }
        // SAFETY: iovecs point into live slot aliases validated above.
        let rc = unsafe {
            if write {
                libc::writev(host, host_iov.as_ptr(), host_iov.len() as i32)
            } else {
                libc::readv(host, host_iov.as_ptr(), host_iov.len() as i32)
            }
        };
        if rc < 0 {
            -errno()
        } else {
            rc as i64
        }
    }

    pub fn guest_openat(&self, host_dirfd: i32, path: Gva, flags: i32, mode: u32) -> i64 {
        let path = match self.read_cstr(path, libc::PATH_MAX as usize) {
            Ok(p) => p,
            Err(e) => return e,
        };
        let cpath = match std::ffi::CString::new(path) {
            Ok(c) => c,
            Err(_) => return -(libc::EINVAL as i64),
        };
        // SAFETY: openat with a NUL-terminated path.
        let host = unsafe { libc::openat(host_dirfd, cpath.as_ptr(), flags, mode) };
        if host < 0 {
            return -errno();
        }
        match self.fdtab.alloc(host) {
            Some(gfd) => gfd as i64,
            None => {
                // SAFETY: fd we just opened.
                unsafe { libc::close(host) };
                -(libc::EMFILE as i64)
            }
        }
    }

    pub fn guest_close(&self, gfd: i32) -> i64 {
        match self.fdtab.remove(gfd) {
            // The monitor shares stdio with the guest; dropping the
            // mapping must not close our own fds.
            Some(host) if host > 2 => {
                // SAFETY: host fd owned by the table.
                if unsafe { libc::close(host) } < 0 {
                    -errno()
                } else {
                    0
                }
            }
            Some(_) => 0,
            None => -(libc::EBADF as i64),
        }
    }

    pub fn guest_lseek(&self, gfd: i32, offset: i64, whence: i32) -> i64 {
        let host = match self.host_fd(gfd) {
            Some(h) => h,
            None => return -(libc::EBADF as i64),
        };
        // SAFETY: plain lseek(2).
        let rc = unsafe { libc::lseek(host, offset, whence) };
        if rc < 0 {
            -errno()
        } else {
            rc
        }
    }

    pub fn guest_dup(&self, gfd: i32) -> i64 {
        let host = match self.host_fd(gfd) {
            Some(h) => h,
            None => return -(libc::EBADF as i64),
        };
        // SAFETY: plain dup(2).
        let new_host = unsafe { libc::dup(host) };
        if new_host < 0 {
            return -errno();
        }
        match self.fdtab.alloc(new_host) {
            Some(new_gfd) => new_gfd as i64,
            None => {
                // SAFETY: fd we just duplicated.
                unsafe { libc::close(new_host) };
                -(libc::EMFILE as i64)
            }
        }
    }

    pub fn guest_dup2(&self, old_gfd: i32, new_gfd: i32) -> i64 {
        if new_gfd < 0 || new_gfd as usize >= MAX_GUEST_FDS {
            return -(libc::EBADF as i64);
        }
        let host = match self.host_fd(old_gfd) {
            Some(h) => h,
            None => return -(libc::EBADF as i64),
        };
        if old_gfd == new_gfd {
            return new_gfd as i64;
        }
        // SAFETY: plain dup(2).
        let new_host = unsafe { libc::dup(host) };
        if new_host < 0 {
            return -errno();
        }
        if let Some(prev) = self.fdtab.set(new_gfd, new_host) {
            if prev > 2 {
                // SAFETY: host fd previously owned by the table.
                unsafe { libc::close(prev) };
            }
        }
        new_gfd as i64
    }

    pub fn guest_fstat(&self, gfd: i32, statbuf: Gva) -> i64 {
        let host = match self.host_fd(gfd) {
            Some(h) => h,
            None => return -(libc::EBADF as i64),
        };
        // SAFETY: out-param is a local, copied to the guest below; the
        // x86_64 stat layout is shared between host and guest.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(host, &mut st) };
        if rc < 0 {
            return -errno();
        }
        match self.write_obj(statbuf, &st) {
            Ok(()) => 0,
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_is_preseeded() {
        let tab = FdTable::new();
        assert_eq!(tab.get(0), Some(0));
        assert_eq!(tab.get(1), Some(1));
        assert_eq!(tab.get(2), Some(2));
        assert_eq!(tab.get(3), None);
        assert_eq!(tab.get(-1), None);
    }

    #[test]
    fn alloc_takes_lowest_free_slot() {
        let tab = FdTable::new();
        assert_eq!(tab.alloc(42), Some(3));
        assert_eq!(tab.alloc(43), Some(4));
        assert_eq!(tab.remove(3), Some(42));
        assert_eq!(tab.alloc(44), Some(3));
    }

    #[test]
    fn set_returns_evicted_mapping() {
        let tab = FdTable::new();
        assert_eq!(tab.set(5, 99), None);
        assert_eq!(tab.get(5), Some(99));
        assert_eq!(tab.set(5, 100), Some(99));
    }
}
