//! # Spillable Buffer
//!
//! Managed in-memory buffers that can be spilled to disk and brought back
//! transparently.
//!
//! ## Features
//!
//! - **Single Worker**: every operation is queued on one thread, so eviction
//!   decisions always see a coherent view of all buffers
//! - **Scoped Locks**: a locked buffer is resident and never moves
//! - **Pluggable Policies**: always, never, byte barrier, or free-memory valve
//! - **Pluggable Allocators**: heap, page mappings, or caller-supplied memory
//!
//! ## Example
//!
//! ```rust
//! use spillable_buffer::{BufferManager, ManagerConfig, ManagerHandleExt};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = BufferManager::new(ManagerConfig::default())?;
//!
//! // Allocate a buffer and fill it
//! let handle = manager.new_handle()?;
//! handle.allocate(5)?;
//! {
//!     let mut lock = handle.lock()?;
//!     unsafe { lock.as_mut_slice() }.copy_from_slice(b"hello");
//! }
//!
//! // Spill it to disk; the next lock reads it back
//! manager.dump(handle.id()).wait()?;
//! assert_eq!(handle.const_lock()?.as_slice(), b"hello");
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod handle;
pub mod manager;
pub mod policy;
pub mod profiling;
pub mod types;

pub use backend::{BufferAllocator, ExternalAllocator, HeapAllocator, MappedAllocator};
pub use handle::{BufferHandle, BufferLock, ConstBufferLock, ManagerHandleExt};
pub use manager::{
    BufferInfo, BufferManager, BufferStats, Completion, ManagerEvent, StreamInfo,
};
pub use policy::{AlwaysDump, BarrierDump, DumpPolicy, NeverDump, ValveDump};
pub use types::{BufferError, BufferId, ByteSize, LoadingMode, ManagerConfig, Result};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::FixedMemoryProbe;
    use std::sync::Arc;

    fn manager() -> Arc<BufferManager> {
        BufferManager::new(ManagerConfig::default()).unwrap()
    }

    fn is_loaded(handle: &BufferHandle) -> bool {
        handle
            .manager()
            .info(handle.id())
            .wait()
            .unwrap()
            .loaded
    }

    fn write_byte(handle: &BufferHandle, byte: u8) {
        let mut lock = handle.lock().unwrap();
        let slice = unsafe { lock.as_mut_slice() };
        slice[0] = byte;
    }

    #[test]
    fn test_write_pattern_and_read_back() {
        let manager = manager();
        let handle = manager.new_handle().unwrap();
        handle.allocate(100_000).unwrap();

        {
            let mut lock = handle.lock().unwrap();
            for (i, byte) in unsafe { lock.as_mut_slice() }.iter_mut().enumerate() {
                *byte = (i % 256) as u8;
            }
        }
        {
            let lock = handle.const_lock().unwrap();
            let other = handle.lock().unwrap();
            assert_eq!(handle.lock_count(), 2);
            assert!(lock
                .as_slice()
                .iter()
                .enumerate()
                .all(|(i, byte)| *byte == (i % 256) as u8));
            assert_eq!(other.len(), 100_000);
        }
        assert_eq!(handle.lock_count(), 0);
    }

    #[test]
    fn test_swap_exchanges_content_and_allocator() {
        let manager = manager();
        let p1: Arc<dyn BufferAllocator> = Arc::new(HeapAllocator::new());
        let p2: Arc<dyn BufferAllocator> = Arc::new(MappedAllocator::new());

        let a = manager.new_handle().unwrap();
        let b = manager.new_handle().unwrap();
        a.allocate_with(4, Arc::clone(&p1)).unwrap();
        b.allocate_with(8, Arc::clone(&p2)).unwrap();
        {
            let mut lock = a.lock().unwrap();
            unsafe { lock.as_mut_slice() }.copy_from_slice(&0x1234_5678i32.to_ne_bytes());
        }
        {
            let mut lock = b.lock().unwrap();
            unsafe { lock.as_mut_slice() }
                .copy_from_slice(&0x0102_0304_0506_0708i64.to_ne_bytes());
        }

        a.swap(&b).unwrap();

        assert_eq!(a.size(), 8);
        assert_eq!(b.size(), 4);
        assert_eq!(
            a.const_lock().unwrap().as_slice(),
            &0x0102_0304_0506_0708i64.to_ne_bytes()
        );
        assert_eq!(
            b.const_lock().unwrap().as_slice(),
            &0x1234_5678i32.to_ne_bytes()
        );

        let infos = manager.buffer_infos().wait().unwrap();
        assert!(Arc::ptr_eq(&infos[&a.id()].allocator, &p2));
        assert!(Arc::ptr_eq(&infos[&b.id()].allocator, &p1));
    }

    #[test]
    fn test_dump_writes_raw_bytes() {
        let manager = manager();
        let handle = manager.new_handle().unwrap();
        handle.allocate(1).unwrap();
        write_byte(&handle, b'!');

        assert!(manager.dump(handle.id()).wait().unwrap());
        assert_eq!(manager.stats().wait().unwrap().total_dumped, 1);

        let infos = manager.buffer_infos().wait().unwrap();
        let info = &infos[&handle.id()];
        assert!(!info.loaded);
        let file = info.backing_file.as_ref().unwrap();
        assert!(file.starts_with(manager.scratch_dir()));
        assert_eq!(std::fs::read(file).unwrap(), b"!");

        assert!(manager.restore(handle.id()).wait().unwrap());
        assert_eq!(manager.stats().wait().unwrap().total_dumped, 0);
        assert_eq!(handle.const_lock().unwrap().as_slice(), b"!");
    }

    #[test]
    fn test_barrier_dump_keeps_one_resident() {
        let manager = manager();
        let barrier = BarrierDump::new();
        assert!(barrier.set_param("barrier", "1B"));
        manager.set_policy(Arc::new(barrier)).wait().unwrap();

        let first = manager.new_handle().unwrap();
        first.allocate(1).unwrap();
        assert!(is_loaded(&first));

        let second = manager.new_handle().unwrap();
        second.allocate(1).unwrap();
        assert!(is_loaded(&first) ^ is_loaded(&second));
        assert_eq!(manager.stats().wait().unwrap().total_dumped, 1);
    }

    #[test]
    fn test_barrier_dump_lock_swaps_residents() {
        let manager = manager();
        manager
            .set_policy(Arc::new(BarrierDump::with_barrier(1)))
            .wait()
            .unwrap();

        let first = manager.new_handle().unwrap();
        let second = manager.new_handle().unwrap();
        first.allocate(1).unwrap();
        second.allocate(1).unwrap();
        assert!(!is_loaded(&first));

        // Locking the dumped one makes room by evicting the other
        let lock = first.const_lock().unwrap();
        assert!(is_loaded(&first));
        assert!(!is_loaded(&second));
        drop(lock);
        assert!(is_loaded(&first));
    }

    #[test]
    fn test_valve_dump_reacts_on_lock() {
        let manager = manager();
        let probe = Arc::new(FixedMemoryProbe::new(1024 * 1024));
        let valve = ValveDump::with_probe(probe.clone());
        assert!(valve.set_param("min_free_mem", "2B"));
        assert!(valve.set_param("hysteresis_offset", "1B"));
        manager.set_policy(Arc::new(valve)).wait().unwrap();

        let handle = manager.new_handle().unwrap();
        handle.allocate(1).unwrap();
        assert!(is_loaded(&handle));
        assert_eq!(manager.profiler().stats().total_dumps, 0);

        probe.set(0);
        let events = manager.subscribe();
        {
            let lock = handle.lock().unwrap();
            assert!(!lock.get_buffer().is_null());
            let seen: Vec<ManagerEvent> = events.try_iter().collect();
            assert_eq!(
                seen,
                vec![
                    ManagerEvent::Dumped(handle.id()),
                    ManagerEvent::Restored(handle.id())
                ]
            );
        }
        // Still short on memory once unpinned
        assert!(!is_loaded(&handle));
    }

    #[test]
    fn test_always_dump_round_trip() {
        let manager = manager();
        manager
            .set_policy(Arc::new(AlwaysDump::new()))
            .wait()
            .unwrap();

        let handle = manager.new_handle().unwrap();
        handle.allocate(1).unwrap();
        assert!(!is_loaded(&handle));

        {
            let _lock = handle.lock().unwrap();
            assert!(is_loaded(&handle));
        }
        assert!(!is_loaded(&handle));
    }

    #[test]
    fn test_always_dump_keeps_content() {
        let manager = manager();
        manager
            .set_policy(Arc::new(AlwaysDump::new()))
            .wait()
            .unwrap();

        let handle = manager.new_handle().unwrap();
        handle.allocate(3).unwrap();
        {
            let mut lock = handle.lock().unwrap();
            unsafe { lock.as_mut_slice() }.copy_from_slice(b"abc");
        }
        // Reallocation alone does not dump
        handle.reallocate(4).unwrap();
        assert!(is_loaded(&handle));

        assert_eq!(handle.const_lock().unwrap().as_slice(), b"abc\0");
        assert!(!is_loaded(&handle));
    }

    #[test]
    fn test_never_dump_keeps_everything() {
        let manager = manager();
        let handles: Vec<BufferHandle> = (0..4)
            .map(|_| {
                let handle = manager.new_handle().unwrap();
                handle.allocate(1024).unwrap();
                drop(handle.lock().unwrap());
                handle
            })
            .collect();

        assert!(handles.iter().all(is_loaded));
        let stats = manager.stats().wait().unwrap();
        assert_eq!(stats.total_managed, 4 * 1024);
        assert_eq!(stats.total_dumped, 0);
    }

    #[test]
    fn test_destroy_then_lock_is_null() {
        let manager = manager();
        let handle = manager.new_handle().unwrap();
        handle.allocate(16).unwrap();
        handle.destroy().unwrap();

        assert!(handle.is_empty());
        assert!(handle.lock().unwrap().get_buffer().is_null());
    }

    #[test]
    fn test_corrupted_dump_surfaces_on_lock() {
        let manager = manager();
        let handle = manager.new_handle().unwrap();
        handle.allocate(8).unwrap();
        manager.dump(handle.id()).wait().unwrap();

        let info = manager.info(handle.id()).wait().unwrap();
        std::fs::remove_file(info.backing_file.unwrap()).unwrap();

        assert!(matches!(
            handle.lock(),
            Err(BufferError::CorruptedDump { expected: 8, .. })
        ));
        assert_eq!(handle.lock_count(), 0);
    }

    #[test]
    fn test_adopt_file_lazy_and_direct() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.raw");
        std::fs::write(&path, b"payload").unwrap();

        let manager = manager();
        assert_eq!(manager.loading_mode().wait().unwrap(), LoadingMode::Lazy);

        let lazy = manager.new_handle().unwrap();
        lazy.adopt_file(&path, 7).unwrap();
        assert!(!is_loaded(&lazy));
        assert_eq!(lazy.size(), 7);
        assert_eq!(lazy.const_lock().unwrap().as_slice(), b"payload");

        manager.set_loading_mode(LoadingMode::Direct).wait().unwrap();
        let direct = manager.new_handle().unwrap();
        direct.adopt_file(&path, 7).unwrap();
        assert!(is_loaded(&direct));

        // Never deleted, even once both are dumped and destroyed
        manager.dump(direct.id()).wait().unwrap();
        direct.destroy().unwrap();
        lazy.destroy().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_policy_params_tuned_live() {
        let manager = manager();
        manager
            .set_policy(Arc::new(BarrierDump::new()))
            .wait()
            .unwrap();

        let a = manager.new_handle().unwrap();
        let b = manager.new_handle().unwrap();
        a.allocate(10).unwrap();
        b.allocate(10).unwrap();
        assert!(is_loaded(&a) && is_loaded(&b));

        let policy = manager.policy();
        assert_eq!(policy.name(), "barrier_dump");
        assert!(policy.set_param("barrier", "10 B"));
        assert!(!policy.set_param("barrier", "-1B"));

        // The new barrier applies from the next event on
        drop(b.const_lock().unwrap());
        assert!(!is_loaded(&a));
        assert!(is_loaded(&b));
    }

    #[test]
    fn test_report_mentions_every_buffer() {
        let manager = manager();
        let a = manager.new_handle().unwrap();
        let b = manager.new_handle().unwrap();
        a.allocate(1).unwrap();
        b.allocate_with(2, Arc::new(MappedAllocator::new())).unwrap();

        let report = manager.report().wait().unwrap();
        assert!(report.contains(&a.id().to_string()));
        assert!(report.contains(&b.id().to_string()));
        assert!(report.contains("mapped"));
    }

    #[test]
    fn test_handles_across_threads() {
        let manager = manager();
        let handle = manager.new_handle().unwrap();
        handle.allocate(64).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let lock = handle.const_lock().unwrap();
                        assert_eq!(lock.len(), 64);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(handle.lock_count(), 0);
        let stats = manager.profiler().stats();
        assert_eq!(stats.total_locks, 400);
        assert_eq!(stats.outstanding_locks(), 0);
    }
}
