//! Transfer slots.
//!
//! Slots use typestate to enforce valid transitions at compile time:
//! - `Slot` → `PendingSlot` via `fill()` (handle configured, context bound)
//! - `PendingSlot` → `Completion` via `perform()` (runs on the transfer task)
//!   or `fault()` (provider failed, nothing sent); a cancelled or panicked
//!   transfer hands back the bare `Slot` instead
//! - `Completion` → `Slot` via `dispatch()` once the response handler is done
//! - `Slot` → retired: the handle is handed back to the transport
//! - retired → anything: NOT POSSIBLE (the handle is gone)
//!
//! The [`SlotLedger`] mirrors these states at runtime so the driver can check
//! its invariants and callers can inspect a finished run.

mod ledger;
mod lifecycle;

pub use ledger::{SlotLedger, SlotState};
pub use lifecycle::{Completion, PendingSlot, Slot, Transferred};

/// Position of a slot in the pipeline's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct SlotId(usize);

impl SlotId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
