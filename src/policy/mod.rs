//! Eviction ("dump") policies.
//!
//! The manager consults the active policy on its worker after every mutating
//! operation. The policy sees a view of every record and answers with the
//! buffers it wants dumped. The manager never dumps a locked buffer, whatever
//! the policy asks for.

use std::fmt;
use std::sync::Arc;

use crate::types::BufferId;

pub mod always;
pub mod barrier;
pub mod never;
pub mod probe;
pub mod valve;

pub use always::AlwaysDump;
pub use barrier::BarrierDump;
pub use never::NeverDump;
pub use probe::{FixedMemoryProbe, MemoryProbe, SystemMemoryProbe};
pub use valve::ValveDump;

/// What just happened to the subject buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Allocate,
    SetBuffer,
    Reallocate,
    /// Consulted before the lock is taken and before any restore
    Lock,
    Unlock,
    Destroy,
    /// The policy was just installed; re-evaluate everything
    Refresh,
}

/// A notification passed to [`DumpPolicy::on_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyEvent {
    pub kind: EventKind,
    /// Buffer the event is about (None for `Refresh`)
    pub subject: Option<BufferId>,
}

/// Read-only view of one record, as seen by a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordView {
    pub id: BufferId,
    pub size: u64,
    pub loaded: bool,
    pub lock_count: i64,
    pub last_access: u64,
}

impl RecordView {
    /// Loaded, non-empty and not pinned
    pub fn is_dumpable(&self) -> bool {
        self.loaded && self.lock_count == 0 && self.size > 0
    }
}

/// Pluggable strategy deciding which resident buffers to dump and when
pub trait DumpPolicy: Send + Sync + fmt::Debug {
    /// Stable registry name
    fn name(&self) -> &'static str;

    /// React to an event; returns the buffers to dump, in order
    fn on_event(&self, event: &PolicyEvent, records: &[RecordView]) -> Vec<BufferId>;

    fn param_names(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn get_param(&self, _name: &str) -> Option<String> {
        None
    }

    /// Returns false for unknown names and unparseable or out-of-range values
    fn set_param(&self, _name: &str, _value: &str) -> bool {
        false
    }
}

/// Sum of the sizes of every resident buffer
pub fn loaded_bytes(records: &[RecordView]) -> u64 {
    records.iter().filter(|r| r.loaded).map(|r| r.size).sum()
}

/// Dumpable records in eviction order: least recently used first, ties broken by id
pub fn eviction_candidates(records: &[RecordView], exclude: Option<BufferId>) -> Vec<RecordView> {
    let mut candidates: Vec<RecordView> = records
        .iter()
        .filter(|r| r.is_dumpable() && Some(r.id) != exclude)
        .copied()
        .collect();
    candidates.sort_by_key(|r| (r.last_access, r.id));
    candidates
}

/// Names accepted by [`create`]
pub fn names() -> Vec<&'static str> {
    vec![
        AlwaysDump::NAME,
        BarrierDump::NAME,
        NeverDump::NAME,
        ValveDump::NAME,
    ]
}

/// Build a default-configured policy from its registry name
pub fn create(name: &str) -> Option<Arc<dyn DumpPolicy>> {
    let policy: Arc<dyn DumpPolicy> = match name {
        AlwaysDump::NAME => Arc::new(AlwaysDump::new()),
        BarrierDump::NAME => Arc::new(BarrierDump::new()),
        NeverDump::NAME => Arc::new(NeverDump::new()),
        ValveDump::NAME => Arc::new(ValveDump::new()),
        _ => return None,
    };
    Some(policy)
}
