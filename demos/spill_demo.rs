//! Example demonstrating spilling buffers to disk under a byte barrier
//!
//! This example:
//! 1. Starts a manager that keeps at most 64 KiB resident
//! 2. Fills several buffers with a recognizable pattern
//! 3. Shows which buffers were spilled to the scratch directory
//! 4. Locks every buffer again and verifies its content
//! 5. Streams one dumped buffer without restoring it
//! 6. Prints profiling metrics
//!
//! Usage: cargo run --example spill_demo --release

use spillable_buffer::{BarrierDump, BufferManager, DumpPolicy, ManagerConfig, ManagerHandleExt};
use std::io::Read;
use std::sync::Arc;

const BUFFER_SIZE: usize = 32 * 1024;
const BUFFER_COUNT: usize = 6;

fn main() {
    println!("=== Spill Demo ===\n");

    let manager = BufferManager::new(ManagerConfig::default()).expect("Failed to start manager");
    println!("📂 Scratch directory: {}\n", manager.scratch_dir().display());

    let barrier = BarrierDump::new();
    assert!(barrier.set_param("barrier", "64KiB"), "barrier parameter rejected");
    manager
        .set_policy(Arc::new(barrier))
        .wait()
        .expect("Failed to install policy");
    println!("✅ Barrier policy installed (64 KiB resident)\n");

    let mut handles = Vec::new();
    for n in 0..BUFFER_COUNT {
        let handle = manager.new_handle().expect("Failed to register buffer");
        handle.allocate(BUFFER_SIZE).expect("Failed to allocate");
        {
            let mut lock = handle.lock().expect("Failed to lock");
            unsafe { lock.as_mut_slice() }.fill(n as u8);
        }
        handles.push(handle);
    }

    println!("📦 Buffers after filling:");
    for handle in &handles {
        let info = manager.info(handle.id()).wait().expect("Failed to query");
        match &info.backing_file {
            Some(file) => println!("   {} → dumped to {}", handle.id(), file.display()),
            None => println!("   {} → resident at {:#x}", handle.id(), info.address),
        }
    }

    let stats = manager.stats().wait().expect("Failed to query stats");
    println!(
        "\n   managed: {} bytes, dumped: {} bytes\n",
        stats.total_managed, stats.total_dumped
    );

    println!("🔍 Verifying content:");
    for (n, handle) in handles.iter().enumerate() {
        let lock = handle.const_lock().expect("Failed to lock");
        let ok = lock.as_slice().iter().all(|b| *b == n as u8);
        println!("   {} → {}", handle.id(), if ok { "✅ intact" } else { "❌ CORRUPTED" });
    }

    if let Some(handle) = handles.iter().find(|h| {
        manager
            .info(h.id())
            .wait()
            .map(|info| !info.loaded)
            .unwrap_or(false)
    }) {
        let mut info = manager.stream_info(handle.id()).wait().expect("Failed to stream");
        let mut bytes = Vec::new();
        info.stream.read_to_end(&mut bytes).expect("Failed to read stream");
        println!(
            "\n📤 Streamed {} bytes of {} straight from disk (still dumped: {})",
            bytes.len(),
            handle.id(),
            info.backing_file.is_some()
        );
    }

    let profile = manager.profiler().stats();
    println!("\n📊 Profiling:");
    println!("   dumps:    {} ({} bytes)", profile.total_dumps, profile.total_bytes_dumped);
    println!("   restores: {} ({} bytes)", profile.total_restores, profile.total_bytes_restored);
    println!("   policy evictions: {}", profile.policy_evictions);

    println!("\n{}", manager.report().wait().expect("Failed to build report"));
}
