use std::io::{self, Error};
#[cfg(not(miri))]
use std::mem;
#[cfg(not(miri))]
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

#[cfg(not(miri))]
fn system_info() -> SYSTEM_INFO {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// Alignment of every reservation, usually 64KB. Pools are sized in
/// multiples of it.
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    let reported = 0;
    #[cfg(not(miri))]
    let reported = system_info().dwAllocationGranularity as usize;
    match reported {
        0 => 65536,
        granularity => granularity,
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    let reported = 0;
    #[cfg(not(miri))]
    let reported = system_info().dwPageSize as usize;
    match reported {
        0 => 4096,
        size => size,
    }
}

/// One committed range backing a segment pool or an image buffer.
pub struct RegionInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl RegionInner {
    /// Reserves a pool's worth of zeroed pages, committed immediately.
    ///
    /// `prefault` and `overcommit` are ignored: committed memory is always
    /// charged and pages fault in on first touch.
    pub unsafe fn map_anon(len: usize, _prefault: bool, _overcommit: bool) -> io::Result<Self> {
        #[cfg(miri)]
        {
            use std::alloc::{alloc_zeroed, Layout};
            let layout = Layout::from_size_align(len, allocation_granularity())
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(Self {
                ptr: ptr.cast::<std::ffi::c_void>(),
                len,
            })
        }
        #[cfg(not(miri))]
        {
            let ptr =
                unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            Ok(Self { ptr, len })
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    if let Ok(layout) = Layout::from_size_align(self.len, allocation_granularity()) {
                        dealloc(self.ptr.cast::<u8>(), layout);
                    }
                }
                #[cfg(not(miri))]
                {
                    // Size 0 releases the whole reservation.
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}

// The mapping is plain memory; the heap above it does its own locking.
unsafe impl Send for RegionInner {}
unsafe impl Sync for RegionInner {}
