// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Forwarding-plane slot bookkeeping.
//!
//! Each flow entry carries a [`KSyncIndexEntry`] tracking the slot it
//! owns in the forwarding-plane table:
//!
//! ```text
//!   UNASSIGNED --request--> PENDING_WRITE --ack--> INDEX_SET
//!        ^                     |    ^                  |
//!        +----hard error-------+    +----request----+  | evicted
//!                                                   |  v
//!                                                  EVICTED
//!
//!   any --retire--> RETIRED
//! ```
//!
//! Every write carries a transaction id. Acknowledgments for anything
//! but the latest transaction are stale. Every handler is defined for
//! every state; an event that does not apply leaves the entry alone
//! and reports as much to the caller.
//!
//! The [`SlotMap`] is the process-wide view of which flow owns which
//! slot. It is the only authority used to route eviction events to a
//! flow.

use super::flow_entry::FlowHandle;
use std::collections::BTreeMap;
use vrflow_api::FlowError;
use vrflow_api::KSyncState;

/// The result of applying a write acknowledgment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckOutcome {
    /// A slot request completed; the entry now owns the slot.
    Claimed,
    /// An update of the already-owned slot completed.
    Updated,
    /// The acknowledgment is for a transaction the entry no longer
    /// cares about.
    Stale,
}

#[derive(Clone, Debug)]
pub struct KSyncIndexEntry {
    state: KSyncState,
    index: Option<u32>,
    evict_count: u32,
    txn: u32,
    retries: u32,
}

impl Default for KSyncIndexEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl KSyncIndexEntry {
    pub fn new() -> Self {
        Self {
            state: KSyncState::Unassigned,
            index: None,
            evict_count: 0,
            txn: 0,
            retries: 0,
        }
    }

    pub fn state(&self) -> KSyncState {
        self.state
    }

    /// The slot currently owned, set only in `INDEX_SET`.
    pub fn index(&self) -> Option<u32> {
        self.index
    }

    pub fn evict_count(&self) -> u32 {
        self.evict_count
    }

    pub fn txn(&self) -> u32 {
        self.txn
    }

    /// Transient failures seen since the last successful write.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn next_txn(&mut self) -> u32 {
        self.txn = self.txn.wrapping_add(1);
        self.txn
    }

    /// Begin a slot request, returning the transaction id the write
    /// must carry.
    ///
    /// Issuing a new request while one is pending supersedes it.
    pub fn request_slot(&mut self) -> Result<u32, FlowError> {
        match self.state {
            KSyncState::Unassigned
            | KSyncState::Evicted
            | KSyncState::PendingWrite => {
                self.state = KSyncState::PendingWrite;
                self.index = None;
                Ok(self.next_txn())
            }

            KSyncState::IndexSet | KSyncState::Retired => {
                Err(FlowError::BadState(format!(
                    "slot request in state {}",
                    self.state
                )))
            }
        }
    }

    /// Begin rewriting the owned slot, returning the transaction id
    /// and the slot.
    pub fn request_update(&mut self) -> Result<(u32, u32), FlowError> {
        match (self.state, self.index) {
            (KSyncState::IndexSet, Some(slot)) => Ok((self.next_txn(), slot)),

            (state, _) => {
                Err(FlowError::BadState(format!("update in state {state}")))
            }
        }
    }

    /// Apply the acknowledgment of write `txn`, which landed in
    /// `slot`.
    pub fn on_write_ack(&mut self, txn: u32, slot: u32) -> AckOutcome {
        if txn != self.txn {
            return AckOutcome::Stale;
        }

        match self.state {
            KSyncState::PendingWrite => {
                self.state = KSyncState::IndexSet;
                self.index = Some(slot);
                self.retries = 0;
                AckOutcome::Claimed
            }

            KSyncState::IndexSet if self.index == Some(slot) => {
                self.retries = 0;
                AckOutcome::Updated
            }

            KSyncState::IndexSet
            | KSyncState::Unassigned
            | KSyncState::Evicted
            | KSyncState::Retired => AckOutcome::Stale,
        }
    }

    /// Apply a transient failure of write `txn`. Returns `true` if the
    /// write should be reissued.
    pub fn on_transient(&mut self, txn: u32) -> bool {
        if txn != self.txn {
            return false;
        }

        match self.state {
            KSyncState::PendingWrite | KSyncState::IndexSet => {
                self.retries += 1;
                true
            }

            KSyncState::Unassigned
            | KSyncState::Evicted
            | KSyncState::Retired => false,
        }
    }

    /// Apply a hard failure of write `txn`. Returns `true` if the
    /// failure applies to this entry, which must then be demoted.
    ///
    /// A failed slot request leaves the entry without a slot; a failed
    /// update leaves the previous programming in place.
    pub fn on_hard_failure(&mut self, txn: u32) -> bool {
        if txn != self.txn {
            return false;
        }

        match self.state {
            KSyncState::PendingWrite => {
                self.state = KSyncState::Unassigned;
                self.index = None;
                true
            }

            KSyncState::IndexSet => true,

            KSyncState::Unassigned
            | KSyncState::Evicted
            | KSyncState::Retired => false,
        }
    }

    /// The forwarding plane gave `slot` to another flow. Returns
    /// `true` if this entry owned it.
    pub fn on_evicted(&mut self, slot: u32) -> bool {
        match self.state {
            KSyncState::IndexSet if self.index == Some(slot) => {
                self.state = KSyncState::Evicted;
                self.index = None;
                self.evict_count += 1;
                true
            }

            KSyncState::IndexSet
            | KSyncState::Unassigned
            | KSyncState::PendingWrite
            | KSyncState::Evicted
            | KSyncState::Retired => false,
        }
    }

    /// Take ownership of a slot the forwarding plane already holds,
    /// without writing it.
    pub fn adopt(&mut self, slot: u32) -> Result<(), FlowError> {
        match self.state {
            KSyncState::Unassigned | KSyncState::Evicted => {
                self.state = KSyncState::IndexSet;
                self.index = Some(slot);
                Ok(())
            }

            KSyncState::PendingWrite
            | KSyncState::IndexSet
            | KSyncState::Retired => Err(FlowError::BadState(format!(
                "adopt slot {slot} in state {}",
                self.state
            ))),
        }
    }

    /// Retire the entry. Returns the slot that must be deleted from
    /// the forwarding plane, if the entry owned one.
    ///
    /// A write still in flight is not deleted here; its
    /// acknowledgment will be stale.
    pub fn retire(&mut self) -> Option<u32> {
        let slot = match self.state {
            KSyncState::IndexSet => self.index,
            KSyncState::Unassigned
            | KSyncState::PendingWrite
            | KSyncState::Evicted
            | KSyncState::Retired => None,
        };

        self.state = KSyncState::Retired;
        self.index = None;
        // Any acknowledgment still in flight must compare stale.
        self.next_txn();
        slot
    }

    pub fn check(&self) -> Result<(), String> {
        match (self.state, self.index) {
            (KSyncState::IndexSet, Some(_)) => Ok(()),
            (KSyncState::IndexSet, None) => {
                Err("INDEX_SET without a slot".to_string())
            }
            (state, Some(slot)) => Err(format!("{state} holding slot {slot}")),
            (_, None) => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotState {
    Owned(FlowHandle),
    /// A delete was sent and has not been acknowledged.
    Deleting,
}

/// Slot ownership, by slot index.
#[derive(Debug, Default)]
pub struct SlotMap {
    slots: BTreeMap<u32, SlotState>,
}

impl SlotMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `handle` as the owner of `slot`. Returns the previous
    /// owner if it was some other flow, which has lost the slot.
    pub fn claim(&mut self, slot: u32, handle: FlowHandle) -> Option<FlowHandle> {
        match self.slots.insert(slot, SlotState::Owned(handle)) {
            Some(SlotState::Owned(prev)) if prev != handle => Some(prev),
            _ => None,
        }
    }

    pub fn owner(&self, slot: u32) -> Option<FlowHandle> {
        match self.slots.get(&slot) {
            Some(SlotState::Owned(h)) => Some(*h),
            _ => None,
        }
    }

    pub fn is_deleting(&self, slot: u32) -> bool {
        matches!(self.slots.get(&slot), Some(SlotState::Deleting))
    }

    /// Forget `slot` if `handle` owns it.
    pub fn release(&mut self, slot: u32, handle: FlowHandle) -> bool {
        if self.owner(slot) == Some(handle) {
            self.slots.remove(&slot);
            return true;
        }
        false
    }

    /// Mark a slot owned by `handle` as being deleted. Returns `false`
    /// if `handle` does not own it, in which case no delete may be
    /// sent.
    pub fn begin_delete(&mut self, slot: u32, handle: FlowHandle) -> bool {
        if self.owner(slot) == Some(handle) {
            self.slots.insert(slot, SlotState::Deleting);
            return true;
        }
        false
    }

    /// Mark an unowned slot as being deleted.
    pub fn begin_orphan_delete(&mut self, slot: u32) -> bool {
        if self.slots.contains_key(&slot) {
            return false;
        }
        self.slots.insert(slot, SlotState::Deleting);
        true
    }

    /// A delete of `slot` was acknowledged. A slot claimed since the
    /// delete was sent is left with its new owner.
    pub fn delete_acked(&mut self, slot: u32) -> bool {
        if self.is_deleting(slot) {
            self.slots.remove(&slot);
            return true;
        }
        false
    }

    /// The slots owned by `handle`.
    pub fn owned_by(&self, handle: FlowHandle) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|(_, s)| **s == SlotState::Owned(handle))
            .map(|(slot, _)| *slot)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &SlotState)> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::flow_entry::FlowRef;

    fn handle(idx: u32) -> FlowHandle {
        FlowHandle { part: 0, flow: FlowRef { idx, generation: 1 } }
    }

    #[test]
    fn claim_and_evict() {
        let mut ks = KSyncIndexEntry::new();
        let txn = ks.request_slot().unwrap();
        assert_eq!(ks.state(), KSyncState::PendingWrite);
        assert_eq!(ks.on_write_ack(txn, 7), AckOutcome::Claimed);
        assert_eq!(ks.index(), Some(7));
        assert!(ks.check().is_ok());

        // Eviction of some other slot is not ours.
        assert!(!ks.on_evicted(8));
        assert!(ks.on_evicted(7));
        assert_eq!(ks.state(), KSyncState::Evicted);
        assert_eq!(ks.evict_count(), 1);
        assert_eq!(ks.index(), None);

        // A second notification for the same slot is a no-op.
        assert!(!ks.on_evicted(7));
        assert_eq!(ks.evict_count(), 1);

        let txn = ks.request_slot().unwrap();
        assert_eq!(ks.on_write_ack(txn, 3), AckOutcome::Claimed);
        assert_eq!(ks.index(), Some(3));
        assert_eq!(ks.evict_count(), 1);
    }

    #[test]
    fn superseded_request_is_stale() {
        let mut ks = KSyncIndexEntry::new();
        let first = ks.request_slot().unwrap();
        let second = ks.request_slot().unwrap();
        assert_eq!(ks.on_write_ack(first, 4), AckOutcome::Stale);
        assert_eq!(ks.state(), KSyncState::PendingWrite);
        assert_eq!(ks.on_write_ack(second, 5), AckOutcome::Claimed);
        assert_eq!(ks.index(), Some(5));
    }

    #[test]
    fn retire_before_ack() {
        let mut ks = KSyncIndexEntry::new();
        assert_eq!(ks.retire(), None);

        let mut ks = KSyncIndexEntry::new();
        let txn = ks.request_slot().unwrap();
        assert_eq!(ks.retire(), None);
        assert_eq!(ks.on_write_ack(txn, 2), AckOutcome::Stale);
        assert!(!ks.on_transient(txn));
        assert!(!ks.on_hard_failure(txn));
        assert!(!ks.on_evicted(2));
        assert!(ks.request_slot().is_err());
        assert!(ks.check().is_ok());
    }

    #[test]
    fn retire_owned_returns_slot() {
        let mut ks = KSyncIndexEntry::new();
        let txn = ks.request_slot().unwrap();
        ks.on_write_ack(txn, 9);
        assert_eq!(ks.retire(), Some(9));
        assert_eq!(ks.state(), KSyncState::Retired);
        assert_eq!(ks.retire(), None);
    }

    #[test]
    fn failures() {
        let mut ks = KSyncIndexEntry::new();
        let txn = ks.request_slot().unwrap();
        assert!(ks.on_transient(txn));
        assert_eq!(ks.retries(), 1);
        assert_eq!(ks.state(), KSyncState::PendingWrite);

        assert!(ks.on_hard_failure(txn));
        assert_eq!(ks.state(), KSyncState::Unassigned);
        assert!(!ks.on_hard_failure(txn + 1));
    }

    #[test]
    fn update_keeps_slot() {
        let mut ks = KSyncIndexEntry::new();
        assert!(ks.request_update().is_err());
        let txn = ks.request_slot().unwrap();
        ks.on_write_ack(txn, 6);
        let (txn, slot) = ks.request_update().unwrap();
        assert_eq!(slot, 6);
        assert_eq!(ks.on_write_ack(txn, 6), AckOutcome::Updated);
        assert_eq!(ks.state(), KSyncState::IndexSet);
    }

    #[test]
    fn adopt_held_slot() {
        let mut ks = KSyncIndexEntry::new();
        ks.adopt(12).unwrap();
        assert_eq!(ks.state(), KSyncState::IndexSet);
        assert_eq!(ks.index(), Some(12));
        assert!(ks.adopt(13).is_err());
    }

    #[test]
    fn late_delete_ack_keeps_new_owner() {
        let mut slots = SlotMap::new();
        let (a, b) = (handle(1), handle(2));
        assert_eq!(slots.claim(5, a), None);
        assert!(slots.begin_delete(5, a));
        assert!(!slots.begin_delete(5, b));

        // The slot is reused before the delete is acknowledged.
        assert_eq!(slots.claim(5, b), None);
        assert!(!slots.delete_acked(5));
        assert_eq!(slots.owner(5), Some(b));
    }

    #[test]
    fn claim_reports_previous_owner() {
        let mut slots = SlotMap::new();
        let (a, b) = (handle(1), handle(2));
        slots.claim(5, a);
        assert_eq!(slots.claim(5, a), None);
        assert_eq!(slots.claim(5, b), Some(a));
        assert_eq!(slots.owned_by(b), vec![5]);
        assert!(!slots.release(5, a));
        assert!(slots.release(5, b));
        assert!(slots.is_empty());
        assert!(slots.begin_orphan_delete(5));
        assert!(!slots.begin_orphan_delete(5));
        assert!(slots.delete_acked(5));
    }
}
