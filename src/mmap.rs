//! Anonymous memory mappings backing bitmaps, card tables and stacks.

use core::fmt;

use memmap2::MmapMut;

use crate::{
    error::{AccountingError, AccountingResult},
    util::align_up,
};

/// Zero-initialised, page granular, read-write anonymous mapping.
///
/// A `MemMap` is owned by exactly one accounting structure and unmapped when it is dropped.
pub struct MemMap {
    map: MmapMut,
    begin: *mut u8,
    name: String,
}

unsafe impl Send for MemMap {}
unsafe impl Sync for MemMap {}

impl MemMap {
    /// Reserves `size` bytes rounded up to whole pages. Zero sized requests still get one page so
    /// that `begin` is always a valid, aligned pointer.
    pub fn map_anonymous(name: &str, size: usize) -> AccountingResult<Self> {
        let len = align_up(size.max(1), page_size());
        match MmapMut::map_anon(len) {
            Ok(mut map) => {
                let begin = map.as_mut_ptr();
                log::trace!("mapped {} bytes for {} at {:p}", len, name, begin);
                Ok(Self {
                    map,
                    begin,
                    name: name.to_owned(),
                })
            }
            Err(source) => {
                log::error!("failed to map {} bytes for {}: {}", len, name, source);
                Err(AccountingError::map_failed(name, len, source))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.begin
    }

    #[inline]
    pub fn end(&self) -> *mut u8 {
        unsafe { self.begin.add(self.map.len()) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Zeroes the whole mapping and returns its physical pages to the OS where the platform can
    /// do both in one step. The address range stays reserved.
    pub fn madvise_dontneed(&mut self) {
        dontneed(self.begin, self.map.len());
    }
}

impl fmt::Debug for MemMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{:p}-{:p}]", self.name, self.begin(), self.end())
    }
}

#[cfg(unix)]
mod _unix {
    pub fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn dontneed(page: *mut u8, size: usize) {
        // Private anonymous pages read back as zero after MADV_DONTNEED.
        let result = unsafe { libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED) };
        if result == -1 {
            log::warn!(
                "madvise failed: {}, zeroing instead",
                std::io::Error::last_os_error()
            );
            unsafe { core::ptr::write_bytes(page, 0, size) };
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn dontneed(page: *mut u8, size: usize) {
        // MADV_DONTNEED does not guarantee zero pages here, clear them ourselves first.
        unsafe {
            core::ptr::write_bytes(page, 0, size);
            libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
        }
    }
}

#[cfg(windows)]
mod _win {
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};

    pub fn page_size() -> usize {
        unsafe {
            let mut info: SYSTEM_INFO = core::mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        }
    }

    pub fn dontneed(page: *mut u8, size: usize) {
        unsafe { core::ptr::write_bytes(page, 0, size) };
    }
}

#[cfg(unix)]
pub use _unix::page_size;
#[cfg(windows)]
pub use _win::page_size;

#[cfg(unix)]
use _unix::dontneed;
#[cfg(windows)]
use _win::dontneed;
