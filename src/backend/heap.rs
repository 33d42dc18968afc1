use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::backend::{BufferAllocator, RawBlock};
use crate::types::{BufferError, Result};

/// Alignment of every heap block, enough for any scalar element type
pub(crate) const HEAP_ALIGN: usize = 16;

/// Heap-backed allocation through the global allocator
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl HeapAllocator {
    pub fn new() -> Self {
        Self
    }

    fn layout(size: usize) -> Result<Layout> {
        Layout::from_size_align(size, HEAP_ALIGN).map_err(|_| BufferError::OutOfMemory { size })
    }
}

impl BufferAllocator for HeapAllocator {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn allocate(&self, size: usize) -> Result<RawBlock> {
        if size == 0 {
            return Err(BufferError::ZeroSizeAllocation);
        }
        let layout = Self::layout(size)?;

        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(BufferError::OutOfMemory { size })?;

        // SAFETY: freshly allocated for `size` bytes
        Ok(unsafe { RawBlock::from_raw_parts(ptr, size) })
    }

    fn reallocate(&self, block: &mut RawBlock, new_size: usize) -> Result<()> {
        if new_size == 0 {
            return Err(BufferError::ZeroSizeAllocation);
        }
        let old_size = block.len();
        let old_layout = Self::layout(old_size)?;
        Self::layout(new_size)?;

        // SAFETY: the block came from this allocator with `old_layout`
        let ptr = unsafe { alloc::realloc(block.as_ptr(), old_layout, new_size) };
        let ptr = NonNull::new(ptr).ok_or(BufferError::OutOfMemory { size: new_size })?;

        if new_size > old_size {
            // Keep the zeroed-memory guarantee for the grown tail
            unsafe { ptr.as_ptr().add(old_size).write_bytes(0, new_size - old_size) };
        }

        *block = unsafe { RawBlock::from_raw_parts(ptr, new_size) };
        Ok(())
    }

    fn release(&self, block: RawBlock) {
        if let Ok(layout) = Self::layout(block.len()) {
            // SAFETY: the block came from this allocator with this layout
            unsafe { alloc::dealloc(block.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_zeroed_and_aligned() {
        let heap = HeapAllocator::new();
        let block = heap.allocate(100).unwrap();

        assert_eq!(block.len(), 100);
        assert_eq!(block.as_ptr() as usize % HEAP_ALIGN, 0);
        assert!(block.as_slice().iter().all(|&b| b == 0));

        heap.release(block);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            HeapAllocator.allocate(0),
            Err(BufferError::ZeroSizeAllocation)
        ));
    }

    #[test]
    fn test_reallocate_preserves_prefix() {
        let heap = HeapAllocator::new();
        let mut block = heap.allocate(8).unwrap();
        block.as_mut_slice().copy_from_slice(b"abcdefgh");

        heap.reallocate(&mut block, 4096).unwrap();
        assert_eq!(&block.as_slice()[..8], b"abcdefgh");
        assert!(block.as_slice()[8..].iter().all(|&b| b == 0));

        heap.reallocate(&mut block, 3).unwrap();
        assert_eq!(block.as_slice(), b"abc");

        heap.release(block);
    }
}
