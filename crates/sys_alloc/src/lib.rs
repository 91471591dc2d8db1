//! OS virtual memory reservations.
//!
//! `objmem` never asks the process allocator for heap space. Segment pools and
//! image buffers are carved out of [`Region`]s obtained here, so that releasing a
//! pool returns its pages straight to the operating system.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the granularity at which regions are reserved.
///
/// On Windows this is the allocation granularity (typically 64KB). On Unix it
/// is the page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Rounds `len` up to a multiple of [`allocation_granularity`].
///
/// Returns `None` if the rounded length overflows `usize`.
#[must_use]
pub fn round_to_granularity(len: usize) -> Option<usize> {
    let granularity = allocation_granularity();
    len.checked_add(granularity - 1)
        .map(|n| n & !(granularity - 1))
}

/// A reserved, readable and writable range of virtual memory.
///
/// The range is zero-filled when created and is released when the handle is
/// dropped.
pub struct Region {
    inner: os::RegionInner,
}

impl Region {
    /// Returns a pointer to the start of the region.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the region in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the region has zero length. Never the case for a
    /// region produced by [`RegionOptions::reserve`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns `true` if `addr` falls inside this region.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr() as usize;
        addr >= start && addr < start + self.len()
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// Builder for a [`Region`].
#[derive(Debug, Clone)]
pub struct RegionOptions {
    len: usize,
    prefault: bool,
    overcommit: bool,
}

impl RegionOptions {
    /// Creates options with length 0. A length must be set before reserving.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            prefault: false,
            overcommit: false,
        }
    }

    /// Sets the length in bytes. It is rounded up to the allocation
    /// granularity when the region is reserved.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Touch every page up front (`MAP_POPULATE` on Linux).
    #[must_use]
    pub const fn prefault(mut self, prefault: bool) -> Self {
        self.prefault = prefault;
        self
    }

    /// Do not reserve swap for the region (`MAP_NORESERVE`). Used for buffers
    /// sized to a hard maximum of which only a prefix is normally written.
    #[must_use]
    pub const fn overcommit(mut self, overcommit: bool) -> Self {
        self.overcommit = overcommit;
        self
    }

    /// Reserves the region.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero or overflowing length, or the OS error
    /// if the mapping fails.
    pub fn reserve(&self) -> io::Result<Region> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "region length must be greater than 0",
            ));
        }
        let len = round_to_granularity(self.len).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "region length overflows")
        })?;

        // SAFETY: a fresh anonymous mapping aliases nothing.
        let inner = unsafe { os::RegionInner::map_anon(len, self.prefault, self.overcommit)? };
        Ok(Region { inner })
    }
}

impl Default for RegionOptions {
    fn default() -> Self {
        Self::new()
    }
}
