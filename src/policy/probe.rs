//! Free system memory probes used by the valve policy.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of the "free system memory" figure
pub trait MemoryProbe: Send + Sync + fmt::Debug {
    /// Bytes currently available to the process
    fn free_memory(&self) -> u64;
}

/// Reads the operating system's available memory.
///
/// Linux: available physical pages plus the page cache (`Cached:` in
/// `/proc/meminfo`), since cached pages are reclaimable. Windows: available
/// physical memory. Elsewhere: `u64::MAX`, i.e. never under pressure.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemoryProbe;

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
fn cached_bytes() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .map(|text| parse_meminfo_field(&text, "Cached"))
        .unwrap_or(0)
}

/// Extract one `Name:   1234 kB` line from meminfo-formatted text, in bytes
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo_field(text: &str, field: &str) -> u64 {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim() == field)
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

impl MemoryProbe for SystemMemoryProbe {
    #[cfg(target_os = "linux")]
    fn free_memory(&self) -> u64 {
        let (pages, page_size) =
            unsafe { (libc::sysconf(libc::_SC_AVPHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
        if pages < 0 || page_size < 0 {
            return u64::MAX;
        }
        (pages as u64)
            .saturating_mul(page_size as u64)
            .saturating_add(cached_bytes())
    }

    #[cfg(windows)]
    fn free_memory(&self) -> u64 {
        use winapi::um::sysinfoapi::{GlobalMemoryStatusEx, MEMORYSTATUSEX};

        let mut status: MEMORYSTATUSEX = unsafe { std::mem::zeroed() };
        status.dwLength = std::mem::size_of::<MEMORYSTATUSEX>() as u32;
        if unsafe { GlobalMemoryStatusEx(&mut status) } == 0 {
            return u64::MAX;
        }
        status.ullAvailPhys
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    fn free_memory(&self) -> u64 {
        u64::MAX
    }
}

/// A free-memory figure set by hand
#[derive(Debug)]
pub struct FixedMemoryProbe {
    free: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(free: u64) -> Self {
        Self {
            free: AtomicU64::new(free),
        }
    }

    pub fn set(&self, free: u64) {
        self.free.store(free, Ordering::Release);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn free_memory(&self) -> u64 {
        self.free.load(Ordering::Acquire)
    }
}
