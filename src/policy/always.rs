use crate::policy::{eviction_candidates, DumpPolicy, EventKind, PolicyEvent, RecordView};
use crate::types::BufferId;

/// Dumps a buffer as soon as nobody holds it.
///
/// Reacts to allocation, adoption and unlock of the subject. Installing the
/// policy dumps every resident buffer. Reallocation is left alone: the buffer
/// goes out on its next unlock.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysDump;

impl AlwaysDump {
    pub const NAME: &'static str = "always_dump";

    pub fn new() -> Self {
        Self
    }
}

impl DumpPolicy for AlwaysDump {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_event(&self, event: &PolicyEvent, records: &[RecordView]) -> Vec<BufferId> {
        match event.kind {
            EventKind::Allocate | EventKind::SetBuffer | EventKind::Unlock => event
                .subject
                .and_then(|id| records.iter().find(|r| r.id == id))
                .filter(|r| r.is_dumpable())
                .map(|r| vec![r.id])
                .unwrap_or_default(),
            EventKind::Refresh => eviction_candidates(records, None)
                .into_iter()
                .map(|r| r.id)
                .collect(),
            EventKind::Reallocate | EventKind::Lock | EventKind::Destroy => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::test_support::*;

    #[test]
    fn test_dumps_subject_after_allocation_and_unlock() {
        let always = AlwaysDump::new();
        let records = [view(0, 1, true, 0, 0), view(1, 1, true, 0, 1)];

        assert_eq!(
            always.on_event(&event(EventKind::Allocate, Some(1)), &records),
            vec![id(1)]
        );
        assert_eq!(
            always.on_event(&event(EventKind::Unlock, Some(0)), &records),
            vec![id(0)]
        );
        assert!(always
            .on_event(&event(EventKind::Reallocate, Some(0)), &records)
            .is_empty());
        assert!(always
            .on_event(&event(EventKind::Lock, Some(0)), &records)
            .is_empty());
    }

    #[test]
    fn test_still_locked_subject_is_kept() {
        let always = AlwaysDump::new();
        let records = [view(0, 1, true, 1, 0)];

        assert!(always
            .on_event(&event(EventKind::Unlock, Some(0)), &records)
            .is_empty());
    }

    #[test]
    fn test_refresh_dumps_everything_resident() {
        let always = AlwaysDump::new();
        let records = [
            view(0, 1, true, 0, 3),
            view(1, 1, false, 0, 0),
            view(2, 1, true, 0, 1),
        ];

        assert_eq!(
            always.on_event(&event(EventKind::Refresh, None), &records),
            vec![id(2), id(0)]
        );
    }

    #[test]
    fn test_no_params() {
        let always = AlwaysDump::new();
        assert!(always.param_names().is_empty());
        assert!(!always.set_param("", ""));
        assert_eq!(always.get_param(""), None);
    }
}
