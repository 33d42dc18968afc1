use std::ptr::NonNull;

use crate::backend::{BufferAllocator, RawBlock};
use crate::types::{BufferError, Result};

/// Anonymous page mappings (mmap / VirtualAlloc).
///
/// Every buffer gets its own mapping, so releasing it returns the pages to
/// the system immediately. Pages are zero-filled on first touch.
#[derive(Debug, Default, Clone, Copy)]
pub struct MappedAllocator;

impl MappedAllocator {
    pub fn new() -> Self {
        Self
    }

    /// Map `size` bytes of anonymous read/write memory
    #[cfg(unix)]
    fn map_anonymous(size: usize) -> Result<NonNull<u8>> {
        use libc::{mmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == MAP_FAILED {
            return Err(BufferError::OutOfMemory { size });
        }

        NonNull::new(ptr as *mut u8).ok_or(BufferError::OutOfMemory { size })
    }

    #[cfg(windows)]
    fn map_anonymous(size: usize) -> Result<NonNull<u8>> {
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

        let ptr = unsafe {
            VirtualAlloc(
                std::ptr::null_mut(),
                size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };

        NonNull::new(ptr as *mut u8).ok_or(BufferError::OutOfMemory { size })
    }

    #[cfg(unix)]
    fn unmap(ptr: NonNull<u8>, size: usize) {
        unsafe {
            libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
        }
    }

    #[cfg(windows)]
    fn unmap(ptr: NonNull<u8>, _size: usize) {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_RELEASE;

        unsafe {
            VirtualFree(ptr.as_ptr() as *mut winapi::ctypes::c_void, 0, MEM_RELEASE);
        }
    }
}

impl BufferAllocator for MappedAllocator {
    fn name(&self) -> &'static str {
        "mapped"
    }

    fn allocate(&self, size: usize) -> Result<RawBlock> {
        if size == 0 {
            return Err(BufferError::ZeroSizeAllocation);
        }
        let ptr = Self::map_anonymous(size)?;

        // SAFETY: the mapping spans `size` bytes
        Ok(unsafe { RawBlock::from_raw_parts(ptr, size) })
    }

    fn reallocate(&self, block: &mut RawBlock, new_size: usize) -> Result<()> {
        if new_size == 0 {
            return Err(BufferError::ZeroSizeAllocation);
        }
        let mut fresh = self.allocate(new_size)?;
        let keep = block.len().min(new_size);
        fresh.as_mut_slice()[..keep].copy_from_slice(&block.as_slice()[..keep]);

        let old = std::mem::replace(block, fresh);
        self.release(old);
        Ok(())
    }

    fn release(&self, block: RawBlock) {
        Self::unmap(block.non_null(), block.len());
    }
}
