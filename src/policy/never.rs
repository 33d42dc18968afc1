use crate::policy::{DumpPolicy, PolicyEvent, RecordView};
use crate::types::BufferId;

/// Keeps every buffer resident. The default policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverDump;

impl NeverDump {
    pub const NAME: &'static str = "never_dump";

    pub fn new() -> Self {
        Self
    }
}

impl DumpPolicy for NeverDump {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_event(&self, _event: &PolicyEvent, _records: &[RecordView]) -> Vec<BufferId> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::test_support::*;
    use crate::policy::EventKind;

    #[test]
    fn test_never_dumps() {
        let never = NeverDump::new();
        let records = [view(0, 1, true, 0, 0), view(1, 1 << 30, true, 0, 1)];

        for kind in [EventKind::Allocate, EventKind::Unlock, EventKind::Refresh] {
            assert!(never.on_event(&event(kind, Some(0)), &records).is_empty());
        }
    }

    #[test]
    fn test_no_params() {
        let never = NeverDump::new();
        assert!(never.param_names().is_empty());
        assert!(!never.set_param("", ""));
        assert_eq!(never.get_param(""), None);
    }
}
