use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::policy::{
    eviction_candidates, DumpPolicy, EventKind, MemoryProbe, PolicyEvent, RecordView,
    SystemMemoryProbe,
};
use crate::types::{BufferId, ByteSize};

/// Opens when free system memory runs low.
///
/// When the probe reports less than `min_free_mem`, least recently used
/// unlocked buffers are dumped until `min_free_mem + hysteresis_offset` would
/// be free again, counting each dumped buffer's size as reclaimed.
///
/// The probe is only read when a buffer operation reaches the policy; a drop
/// in free memory with no buffer traffic goes unnoticed until the next one.
pub struct ValveDump {
    min_free_mem: AtomicU64,
    hysteresis_offset: AtomicU64,
    probe: Arc<dyn MemoryProbe>,
}

impl ValveDump {
    pub const NAME: &'static str = "valve_dump";
    pub const PARAM_MIN_FREE_MEM: &'static str = "min_free_mem";
    pub const PARAM_HYSTERESIS_OFFSET: &'static str = "hysteresis_offset";

    /// Default threshold: 1 GiB
    pub const DEFAULT_MIN_FREE_MEM: u64 = 1024 * 1024 * 1024;

    /// Default hysteresis: none
    pub const DEFAULT_HYSTERESIS_OFFSET: u64 = 0;

    /// Valve reading the operating system's free memory
    pub fn new() -> Self {
        Self::with_probe(Arc::new(SystemMemoryProbe::new()))
    }

    pub fn with_probe(probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            min_free_mem: AtomicU64::new(Self::DEFAULT_MIN_FREE_MEM),
            hysteresis_offset: AtomicU64::new(Self::DEFAULT_HYSTERESIS_OFFSET),
            probe,
        }
    }

    pub fn min_free_mem(&self) -> u64 {
        self.min_free_mem.load(Ordering::Acquire)
    }

    pub fn hysteresis_offset(&self) -> u64 {
        self.hysteresis_offset.load(Ordering::Acquire)
    }

    fn param(&self, name: &str) -> Option<&AtomicU64> {
        match name {
            Self::PARAM_MIN_FREE_MEM => Some(&self.min_free_mem),
            Self::PARAM_HYSTERESIS_OFFSET => Some(&self.hysteresis_offset),
            _ => None,
        }
    }
}

impl Default for ValveDump {
    fn default() -> Self {
        Self::new()
    }
}

impl DumpPolicy for ValveDump {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_event(&self, event: &PolicyEvent, records: &[RecordView]) -> Vec<BufferId> {
        let exclude = match event.kind {
            EventKind::Allocate | EventKind::SetBuffer | EventKind::Reallocate => event.subject,
            EventKind::Lock | EventKind::Unlock | EventKind::Refresh => None,
            EventKind::Destroy => return Vec::new(),
        };

        let free = self.probe.free_memory();
        let min_free = self.min_free_mem();
        if free >= min_free {
            return Vec::new();
        }

        let target = min_free.saturating_add(self.hysteresis_offset());
        let mut estimate = free;
        let mut victims = Vec::new();
        for candidate in eviction_candidates(records, exclude) {
            if estimate >= target {
                break;
            }
            estimate = estimate.saturating_add(candidate.size);
            victims.push(candidate.id);
        }
        victims
    }

    fn param_names(&self) -> Vec<&'static str> {
        vec![Self::PARAM_MIN_FREE_MEM, Self::PARAM_HYSTERESIS_OFFSET]
    }

    fn get_param(&self, name: &str) -> Option<String> {
        self.param(name)
            .map(|value| ByteSize(value.load(Ordering::Acquire)).to_string())
    }

    fn set_param(&self, name: &str, value: &str) -> bool {
        let Some(slot) = self.param(name) else {
            return false;
        };
        match ByteSize::parse_param(name, value) {
            Ok(size) => {
                slot.store(size.bytes(), Ordering::Release);
                true
            }
            Err(_) => false,
        }
    }
}

impl fmt::Debug for ValveDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValveDump")
            .field("min_free_mem", &self.min_free_mem())
            .field("hysteresis_offset", &self.hysteresis_offset())
            .field("probe", &self.probe)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::test_support::*;
    use crate::policy::FixedMemoryProbe;

    fn valve(free: u64) -> (Arc<FixedMemoryProbe>, ValveDump) {
        let probe = Arc::new(FixedMemoryProbe::new(free));
        let valve = ValveDump::with_probe(probe.clone());
        assert!(valve.set_param("min_free_mem", "2B"));
        assert!(valve.set_param("hysteresis_offset", "1B"));
        (probe, valve)
    }

    #[test]
    fn test_params() {
        let valve = ValveDump::new();
        assert_eq!(valve.param_names().len(), 2);
        assert!(!valve.set_param("min_free_memes", "nope"));
        assert!(!valve.set_param("hysteric_offset", "nope"));
        assert!(!valve.set_param("min_free_mem", "-1B"));
        assert!(!valve.set_param("hysteresis_offset", "-1B"));
        assert!(valve.set_param("min_free_mem", "2B"));
        assert!(valve.set_param("hysteresis_offset", "1B"));
        assert_eq!(valve.get_param("min_free_mem").as_deref(), Some("2 B"));
        assert_eq!(valve.get_param("hysteresis_offset").as_deref(), Some("1 B"));
        assert_eq!(valve.get_param("nope"), None);
    }

    #[test]
    fn test_enough_free_memory() {
        let (_probe, valve) = valve(5);
        let records = [view(0, 1, true, 0, 0)];

        assert!(valve
            .on_event(&event(EventKind::Lock, Some(0)), &records)
            .is_empty());
    }

    #[test]
    fn test_low_memory_dumps_until_hysteresis() {
        let (probe, valve) = valve(5);
        let records = [
            view(0, 1, true, 0, 2),
            view(1, 1, true, 0, 0),
            view(2, 1, true, 0, 1),
            view(3, 1, true, 0, 3),
        ];

        // 1 free, target 3: two buffers of one byte each
        probe.set(1);
        assert_eq!(
            valve.on_event(&event(EventKind::Unlock, Some(3)), &records),
            vec![id(1), id(2)]
        );
    }

    #[test]
    fn test_lock_subject_is_eligible() {
        let (probe, valve) = valve(1024 * 1024);
        let records = [view(0, 1, true, 0, 0)];

        probe.set(0);
        assert_eq!(
            valve.on_event(&event(EventKind::Lock, Some(0)), &records),
            vec![id(0)]
        );
        // But an allocation never evicts its own buffer
        assert!(valve
            .on_event(&event(EventKind::Allocate, Some(0)), &records)
            .is_empty());
    }
}
