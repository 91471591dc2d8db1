use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

// Prefaulting a pool touches every page up front. Only Linux-like systems can
// ask for that in the mapping call itself; elsewhere the request is ignored.
#[cfg(any(target_os = "linux", target_os = "android"))]
const PREFAULT: libc::c_int = libc::MAP_POPULATE;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const PREFAULT: libc::c_int = 0;

// Skip swap accounting so a large heap limit can be reserved without being
// charged for pages no segment has touched.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const OVERCOMMIT: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const OVERCOMMIT: libc::c_int = 0;

/// Page size, queried once.
pub fn page_size() -> usize {
    static CACHED: AtomicUsize = AtomicUsize::new(0);

    let cached = CACHED.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    #[allow(clippy::cast_sign_loss)]
    let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
    CACHED.store(queried, Ordering::Relaxed);
    queried
}

const fn mapping_flags(prefault: bool, overcommit: bool) -> libc::c_int {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANON;
    if prefault {
        flags |= PREFAULT;
    }
    if overcommit {
        flags |= OVERCOMMIT;
    }
    flags
}

/// One `mmap`ed range backing a segment pool or an image buffer.
pub struct RegionInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl RegionInner {
    /// Reserves a pool's worth of zeroed pages.
    ///
    /// # Safety
    ///
    /// `len` must be a non-zero multiple of the page size.
    pub unsafe fn map_anon(len: usize, prefault: bool, overcommit: bool) -> io::Result<Self> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = mapping_flags(prefault, overcommit);
        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

// Releasing a pool hands its pages back to the kernel at once.
impl Drop for RegionInner {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

// The mapping is plain memory; the heap above it does its own locking.
unsafe impl Send for RegionInner {}
unsafe impl Sync for RegionInner {}
