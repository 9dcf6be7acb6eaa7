//! Runtime record of every slot's state.
//!
//! Retirement is permanent: a retired slot never comes back, and retiring it
//! twice is a bug in the driver.

use super::SlotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Handle idle, waiting for the provider.
    Empty,
    /// Handle configured, not yet submitted.
    Pending,
    /// Submitted, awaiting completion.
    InFlight,
    /// Permanently removed from the pool.
    Retired,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Retired => "retired",
        }
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SlotLedger {
    states: Vec<SlotState>,
    transfers: Vec<u64>,
    in_flight: usize,
    peak_in_flight: usize,
    retired: usize,
}

impl SlotLedger {
    pub fn new(num_slots: usize) -> Self {
        Self {
            states: vec![SlotState::Empty; num_slots],
            transfers: vec![0; num_slots],
            in_flight: 0,
            peak_in_flight: 0,
            retired: 0,
        }
    }

    pub fn num_slots(&self) -> usize {
        self.states.len()
    }

    pub fn state(&self, slot: SlotId) -> Option<SlotState> {
        self.states.get(slot.index()).copied()
    }

    /// Transfers submitted on this slot so far.
    pub fn transfers(&self, slot: SlotId) -> u64 {
        self.transfers.get(slot.index()).copied().unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

    pub fn retired(&self) -> usize {
        self.retired
    }

    /// Slots not yet retired.
    pub fn active(&self) -> usize {
        self.num_slots() - self.retired
    }

    pub fn all_retired(&self) -> bool {
        self.retired == self.num_slots()
    }

    /// Retired slots that never carried a transfer.
    pub fn retired_unused(&self) -> usize {
        self.states
            .iter()
            .zip(&self.transfers)
            .filter(|(state, transfers)| **state == SlotState::Retired && **transfers == 0)
            .count()
    }

    pub(crate) fn mark_pending(&mut self, slot: SlotId) -> bool {
        self.transition(slot, &[SlotState::Empty], SlotState::Pending)
    }

    pub(crate) fn mark_in_flight(&mut self, slot: SlotId) -> bool {
        if !self.transition(slot, &[SlotState::Pending], SlotState::InFlight) {
            return false;
        }
        self.in_flight += 1;
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight);
        self.transfers[slot.index()] += 1;
        debug_assert!(self.in_flight <= self.num_slots());
        true
    }

    /// Back to empty after a completion (from `InFlight`) or a provider
    /// answer that submitted nothing (from `Pending`).
    pub(crate) fn mark_empty(&mut self, slot: SlotId) -> bool {
        let was_in_flight = self.state(slot) == Some(SlotState::InFlight);
        if !self.transition(
            slot,
            &[SlotState::Pending, SlotState::InFlight],
            SlotState::Empty,
        ) {
            return false;
        }
        if was_in_flight {
            self.in_flight -= 1;
        }
        true
    }

    pub(crate) fn retire(&mut self, slot: SlotId) -> bool {
        let was_in_flight = self.state(slot) == Some(SlotState::InFlight);
        if !self.transition(
            slot,
            &[SlotState::Empty, SlotState::Pending, SlotState::InFlight],
            SlotState::Retired,
        ) {
            return false;
        }
        if was_in_flight {
            self.in_flight -= 1;
        }
        self.retired += 1;
        true
    }

    /// Retire every slot that is still active. Used on abort, when aborted
    /// transfer tasks take their slots down with them.
    pub(crate) fn retire_remaining(&mut self) -> usize {
        let remaining: Vec<SlotId> = self
            .states
            .iter()
            .enumerate()
            .filter(|(_, state)| **state != SlotState::Retired)
            .map(|(index, _)| SlotId::new(index))
            .collect();
        for slot in &remaining {
            self.retire(*slot);
        }
        remaining.len()
    }

    fn transition(&mut self, slot: SlotId, from: &[SlotState], to: SlotState) -> bool {
        let Some(current) = self.states.get_mut(slot.index()) else {
            tracing::error!(%slot, "Bug: transition on unknown slot");
            debug_assert!(false, "illegal slot transition on unknown slot {}", slot);
            return false;
        };

        if !from.contains(current) {
            tracing::error!(%slot, from = %current, to = %to, "Bug: illegal slot transition");
            debug_assert!(false, "illegal slot transition {} -> {} on {}", current, to, slot);
            return false;
        }

        tracing::trace!(%slot, from = %current, to = %to, "Slot transition");
        *current = to;
        true
    }
}
