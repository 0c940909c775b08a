use std::ffi::CString;
use std::io::Error as OsError;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::virtual_mem::page_size;

/// An fd-backed shared memory object.
///
/// Home regions, epoch tables, and the cache slab pool are all `PhysicalMem`
/// so that any byte can be mapped at a fixed virtual address, aliased at
/// several addresses, and attached by other processes under a deterministic
/// name. The creating rank owns the object and unlinks it on drop.
pub(crate) struct PhysicalMem {
    fd: libc::c_int,
    name: CString,
    size: usize,
    owner: bool,
}

unsafe impl Send for PhysicalMem {}
unsafe impl Sync for PhysicalMem {}

impl PhysicalMem {
    pub(crate) fn create(name: &str, size: usize) -> PhysicalMem {
        let cname = CString::new(name).expect("shared memory name contains a nul byte");
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd == -1 {
            panic!(
                "shm_open({}) failed: {}",
                name,
                OsError::last_os_error()
            );
        }
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } == -1 {
            panic!(
                "ftruncate({}, {}) failed: {}",
                name,
                size,
                OsError::last_os_error()
            );
        }
        trace!(name, size, "created shared memory object");
        PhysicalMem {
            fd,
            name: cname,
            size,
            owner: true,
        }
    }

    /// Attach an object created by a peer, waiting for it to appear and to be
    /// grown to `size`. A missing peer segment after the timeout is fatal.
    pub(crate) fn open(name: &str, size: usize) -> PhysicalMem {
        let cname = CString::new(name).expect("shared memory name contains a nul byte");
        let deadline = Instant::now() + Duration::from_secs(30);
        let fd = loop {
            let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o600) };
            if fd != -1 {
                break fd;
            }
            let err = OsError::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) || Instant::now() > deadline {
                panic!("shm_open({}) failed: {}", name, err);
            }
            std::thread::yield_now();
        };
        // wait until the creator has grown it
        loop {
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut st) } == -1 {
                panic!("fstat({}) failed: {}", name, OsError::last_os_error());
            }
            if st.st_size as usize >= size {
                break;
            }
            if Instant::now() > deadline {
                panic!("peer shared memory object {} never reached {} bytes", name, size);
            }
            std::thread::yield_now();
        }
        PhysicalMem {
            fd,
            name: cname,
            size,
            owner: false,
        }
    }

    /// Attach a peer object whose final size is learned from the object
    /// itself (windows are sized by their creating rank).
    pub(crate) fn open_auto(name: &str) -> PhysicalMem {
        let mut pm = PhysicalMem::open(name, 1);
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(pm.fd, &mut st) } == -1 {
            panic!("fstat({}) failed: {}", name, OsError::last_os_error());
        }
        pm.size = st.st_size as usize;
        pm
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Map `[pm_offset, pm_offset + len)` of the object at exactly `addr`,
    /// replacing whatever reservation is there.
    pub(crate) fn map_fixed(&self, addr: usize, pm_offset: usize, len: usize) {
        debug_assert!(addr % page_size() == 0);
        debug_assert!(pm_offset % page_size() == 0);
        debug_assert!(pm_offset + len <= self.size);
        let p = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.fd,
                pm_offset as libc::off_t,
            )
        };
        if p == libc::MAP_FAILED {
            panic!(
                "mmap(fixed {:#x}, {} @ {}) failed: {}",
                addr,
                len,
                pm_offset,
                OsError::last_os_error()
            );
        }
    }

    /// Map `[pm_offset, pm_offset + len)` anywhere, for transports that only
    /// need to copy in and out of a peer segment.
    pub(crate) fn map_anywhere(&self, pm_offset: usize, len: usize) -> MappedSeg {
        debug_assert!(pm_offset % page_size() == 0);
        debug_assert!(pm_offset + len <= self.size);
        let p = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                pm_offset as libc::off_t,
            )
        };
        if p == libc::MAP_FAILED {
            panic!(
                "mmap({} @ {}) failed: {}",
                len,
                pm_offset,
                OsError::last_os_error()
            );
        }
        MappedSeg {
            addr: p as usize,
            len,
        }
    }
}

impl Drop for PhysicalMem {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

impl std::fmt::Debug for PhysicalMem {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "PhysicalMem({:?}, {} bytes{})",
            self.name,
            self.size,
            if self.owner { ", owner" } else { "" }
        )
    }
}

/// An attached window of a `PhysicalMem`, unmapped on drop.
#[derive(Debug)]
pub(crate) struct MappedSeg {
    addr: usize,
    len: usize,
}

unsafe impl Send for MappedSeg {}
unsafe impl Sync for MappedSeg {}

impl MappedSeg {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// View the mapping as an array of shared atomics (epoch tables).
    pub(crate) fn atomic_slice(&self) -> &[AtomicU64] {
        debug_assert!(self.addr % std::mem::align_of::<AtomicU64>() == 0);
        unsafe {
            std::slice::from_raw_parts(
                self.addr as *const AtomicU64,
                self.len / std::mem::size_of::<AtomicU64>(),
            )
        }
    }
}

impl Drop for MappedSeg {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.addr as *mut libc::c_void, self.len) } == -1 {
            panic!(
                "munmap({:#x}, {}) failed: {}",
                self.addr,
                self.len,
                OsError::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_mem::Mmap;

    fn unique_name(tag: &str) -> String {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        format!(
            "/tessera_test_{}_{}_{}",
            std::process::id(),
            tag,
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn fixed_mappings_alias_the_same_pages() {
        let pagesize = page_size();
        let pm = PhysicalMem::create(&unique_name("alias"), 2 * pagesize);

        let a = Mmap::reserve(pagesize, pagesize);
        let b = Mmap::reserve(pagesize, pagesize);
        pm.map_fixed(a.addr(), 0, pagesize);
        pm.map_fixed(b.addr(), 0, pagesize);

        unsafe {
            *(a.addr() as *mut u64) = 0xdead_beef;
            assert_eq!(*(b.addr() as *const u64), 0xdead_beef);
        }

        // restore the reservations so Mmap::drop has something to unmap
        crate::virtual_mem::reprotect_none(a.addr(), pagesize);
        crate::virtual_mem::reprotect_none(b.addr(), pagesize);
    }

    #[test]
    fn peer_attach_sees_writes() {
        let pagesize = page_size();
        let name = unique_name("peer");
        let pm = PhysicalMem::create(&name, pagesize);
        let peer = PhysicalMem::open(&name, pagesize);

        let mine = pm.map_anywhere(0, pagesize);
        let theirs = peer.map_anywhere(0, pagesize);
        unsafe {
            std::ptr::write_volatile(mine.as_ptr(), 42u8);
            assert_eq!(std::ptr::read_volatile(theirs.as_ptr()), 42u8);
        }
    }

    #[test]
    fn fresh_object_is_zeroed() {
        let pagesize = page_size();
        let pm = PhysicalMem::create(&unique_name("zero"), pagesize);
        let seg = pm.map_anywhere(0, pagesize);
        let bytes = unsafe { std::slice::from_raw_parts(seg.as_ptr(), pagesize) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
