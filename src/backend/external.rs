use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::ptr::NonNull;

use crate::backend::{BufferAllocator, HeapAllocator, RawBlock};
use crate::types::Result;

type FreeFn = Box<dyn Fn(NonNull<u8>, usize) + Send + Sync>;

/// Externally supplied buffers released through a caller-provided function.
///
/// Only blocks handed over with [`BufferAllocator::adopt`] go through the free
/// function. Anything allocated later for the same buffer (after a restore
/// or a resize) comes from the heap and goes back to it.
pub struct ExternalAllocator {
    /// Custom release for adopted blocks
    free: FreeFn,

    /// Addresses of adopted blocks still alive
    adopted: Mutex<HashSet<usize>>,

    /// Allocator for anything this strategy has to create itself
    fallback: HeapAllocator,
}

impl ExternalAllocator {
    /// Adopt buffers released by `free(ptr, len)`
    pub fn new<F>(free: F) -> Self
    where
        F: Fn(NonNull<u8>, usize) + Send + Sync + 'static,
    {
        Self {
            free: Box::new(free),
            adopted: Mutex::new(HashSet::new()),
            fallback: HeapAllocator,
        }
    }

    /// Adopt buffers that were leaked from a `Box<[u8]>`
    pub fn boxed_slice() -> Self {
        Self::new(|ptr, len| {
            // SAFETY: only blocks created by `Box::into_raw` are adopted here
            unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    ptr.as_ptr(),
                    len,
                )));
            }
        })
    }

    /// Number of adopted blocks not yet released
    pub fn adopted_count(&self) -> usize {
        self.adopted.lock().len()
    }

    fn take_adopted(&self, block: &RawBlock) -> bool {
        self.adopted.lock().remove(&(block.as_ptr() as usize))
    }
}

impl BufferAllocator for ExternalAllocator {
    fn name(&self) -> &'static str {
        "external"
    }

    fn allocate(&self, size: usize) -> Result<RawBlock> {
        self.fallback.allocate(size)
    }

    fn reallocate(&self, block: &mut RawBlock, new_size: usize) -> Result<()> {
        if !self.adopted.lock().contains(&(block.as_ptr() as usize)) {
            return self.fallback.reallocate(block, new_size);
        }

        // Adopted memory cannot be resized in place: move it to the heap
        let mut fresh = self.fallback.allocate(new_size)?;
        let keep = block.len().min(new_size);
        fresh.as_mut_slice()[..keep].copy_from_slice(&block.as_slice()[..keep]);

        let old = std::mem::replace(block, fresh);
        self.release(old);
        Ok(())
    }

    fn release(&self, block: RawBlock) {
        if self.take_adopted(&block) {
            (self.free)(block.non_null(), block.len());
        } else {
            self.fallback.release(block);
        }
    }

    fn adopt(&self, block: &RawBlock) {
        self.adopted.lock().insert(block.as_ptr() as usize);
    }
}

impl fmt::Debug for ExternalAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalAllocator")
            .field("adopted", &self.adopted.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn leak(data: Vec<u8>) -> RawBlock {
        let len = data.len();
        let ptr = Box::into_raw(data.into_boxed_slice()) as *mut u8;
        unsafe { RawBlock::from_raw_parts(NonNull::new(ptr).unwrap(), len) }
    }

    #[test]
    fn test_adopted_block_uses_custom_free() {
        let freed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&freed);
        let external = ExternalAllocator::new(move |ptr, len| {
            counter.fetch_add(len, Ordering::SeqCst);
            unsafe {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    ptr.as_ptr(),
                    len,
                )));
            }
        });

        let block = leak(vec![7; 32]);
        external.adopt(&block);
        assert_eq!(external.adopted_count(), 1);

        external.release(block);
        assert_eq!(freed.load(Ordering::SeqCst), 32);
        assert_eq!(external.adopted_count(), 0);

        // Heap fallback never reaches the custom free
        let own = external.allocate(8).unwrap();
        external.release(own);
        assert_eq!(freed.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_reallocate_moves_adopted_block_to_heap() {
        let external = ExternalAllocator::boxed_slice();
        let mut block = leak(b"spill".to_vec());
        external.adopt(&block);

        external.reallocate(&mut block, 8).unwrap();
        assert_eq!(&block.as_slice()[..5], b"spill");
        assert_eq!(external.adopted_count(), 0);

        external.release(block);
    }
}
