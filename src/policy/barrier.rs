use std::sync::atomic::{AtomicU64, Ordering};

use crate::policy::{
    eviction_candidates, loaded_bytes, DumpPolicy, EventKind, PolicyEvent, RecordView,
};
use crate::types::{BufferId, ByteSize};

/// Keeps the resident total at or below a fixed number of bytes.
///
/// Whenever the loaded total exceeds `barrier`, the least recently used
/// unlocked buffers are dumped until it fits again or nothing is left to dump.
/// The buffer that triggered an allocation, adoption, resize or lock is never
/// chosen itself.
#[derive(Debug)]
pub struct BarrierDump {
    barrier: AtomicU64,
}

impl BarrierDump {
    pub const NAME: &'static str = "barrier_dump";
    pub const PARAM_BARRIER: &'static str = "barrier";

    /// Default barrier: 500 MiB
    pub const DEFAULT_BARRIER: u64 = 500 * 1024 * 1024;

    pub fn new() -> Self {
        Self::with_barrier(Self::DEFAULT_BARRIER)
    }

    pub fn with_barrier(bytes: u64) -> Self {
        Self {
            barrier: AtomicU64::new(bytes),
        }
    }

    pub fn barrier(&self) -> u64 {
        self.barrier.load(Ordering::Acquire)
    }

    pub fn set_barrier(&self, bytes: u64) {
        self.barrier.store(bytes, Ordering::Release);
    }
}

impl Default for BarrierDump {
    fn default() -> Self {
        Self::new()
    }
}

impl DumpPolicy for BarrierDump {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_event(&self, event: &PolicyEvent, records: &[RecordView]) -> Vec<BufferId> {
        let mut loaded = loaded_bytes(records);
        let exclude = match event.kind {
            EventKind::Allocate | EventKind::SetBuffer | EventKind::Reallocate => event.subject,
            EventKind::Lock => {
                // The subject is about to come back if it is currently dumped
                if let Some(subject) = records.iter().find(|r| Some(r.id) == event.subject) {
                    if !subject.loaded {
                        loaded += subject.size;
                    }
                }
                event.subject
            }
            EventKind::Unlock | EventKind::Refresh => None,
            EventKind::Destroy => return Vec::new(),
        };

        let barrier = self.barrier();
        let mut victims = Vec::new();
        for candidate in eviction_candidates(records, exclude) {
            if loaded <= barrier {
                break;
            }
            loaded -= candidate.size;
            victims.push(candidate.id);
        }
        victims
    }

    fn param_names(&self) -> Vec<&'static str> {
        vec![Self::PARAM_BARRIER]
    }

    fn get_param(&self, name: &str) -> Option<String> {
        (name == Self::PARAM_BARRIER).then(|| ByteSize(self.barrier()).to_string())
    }

    fn set_param(&self, name: &str, value: &str) -> bool {
        if name != Self::PARAM_BARRIER {
            return false;
        }
        match ByteSize::parse_param(name, value) {
            Ok(size) => {
                self.set_barrier(size.bytes());
                true
            }
            Err(_) => false,
        }
    }
}
