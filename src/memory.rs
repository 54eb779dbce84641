//! Output region allocation for the CLI.
//!
//! The rewriter core consumes opaque `(base, size)` regions; this module
//! owns the memory behind them. On Windows regions come from `VirtualAlloc`
//! so code regions are actually executable; elsewhere they are plain heap
//! buffers, enough to run the pipeline and inspect the result.

use crate::error::Result;

#[cfg(target_os = "windows")]
use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    PAGE_READWRITE,
};

/// An owned output region handed to a [`crate::Session`].
pub struct OwnedRegion {
    base: *mut u8,
    size: usize,
    #[cfg(not(target_os = "windows"))]
    _backing: Box<[u8]>,
}

impl OwnedRegion {
    /// Allocate an executable region (RWX on Windows).
    #[cfg(target_os = "windows")]
    pub fn alloc_code(size: usize) -> Result<Self> {
        let ptr = unsafe {
            VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE)
        };
        if ptr.is_null() {
            return Err(windows::core::Error::from_win32().into());
        }
        Ok(Self {
            base: ptr as *mut u8,
            size,
        })
    }

    /// Allocate a readable/writable region.
    #[cfg(target_os = "windows")]
    pub fn alloc_data(size: usize) -> Result<Self> {
        let ptr = unsafe { VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(windows::core::Error::from_win32().into());
        }
        Ok(Self {
            base: ptr as *mut u8,
            size,
        })
    }

    #[cfg(not(target_os = "windows"))]
    pub fn alloc_code(size: usize) -> Result<Self> {
        Self::alloc_heap(size)
    }

    #[cfg(not(target_os = "windows"))]
    pub fn alloc_data(size: usize) -> Result<Self> {
        Self::alloc_heap(size)
    }

    #[cfg(not(target_os = "windows"))]
    fn alloc_heap(size: usize) -> Result<Self> {
        let mut backing = vec![0u8; size].into_boxed_slice();
        let base = backing.as_mut_ptr();
        Ok(Self {
            base,
            size,
            _backing: backing,
        })
    }

    pub fn base(&self) -> u64 {
        self.base as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// View the region contents, e.g. to dump an emitted image.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.size) }
    }
}

#[cfg(target_os = "windows")]
impl Drop for OwnedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = VirtualFree(self.base as *mut _, 0, MEM_RELEASE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_write() {
        let region = OwnedRegion::alloc_data(0x1000).unwrap();
        assert_eq!(region.size(), 0x1000);
        unsafe {
            *(region.base() as *mut u8) = 0xC3;
        }
        assert_eq!(region.as_slice()[0], 0xC3);
    }
}
