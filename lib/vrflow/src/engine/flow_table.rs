// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The flow table implementation.
//!
//! One table backs each partition of the flow cache. Entries live in
//! an arena and refer to each other by [`FlowRef`]; a removed entry
//! bumps its arena slot's generation, so any reference still held
//! elsewhere (an in-flight forwarding-plane event, a reverse link
//! that was missed) fails to resolve instead of aliasing whatever
//! takes the arena slot next.

use super::flow_entry::FlowEntry;
use super::flow_entry::FlowHandle;
use super::flow_entry::FlowRef;
use core::ops::Bound;
use std::collections::BTreeMap;
use vrflow_api::FlowEntryDump;
use vrflow_api::FlowError;
use vrflow_api::FlowKey;

type Result<T> = core::result::Result<T, FlowError>;

#[derive(Debug)]
struct ArenaSlot {
    generation: u32,
    entry: Option<FlowEntry>,
}

#[derive(Debug)]
pub struct FlowTable {
    part: u16,
    arena: Vec<ArenaSlot>,
    free: Vec<u32>,
    map: BTreeMap<FlowKey, FlowRef>,
    /// Where the next aging batch starts.
    cursor: Option<FlowKey>,
}

impl FlowTable {
    pub fn new(part: u16) -> Self {
        Self {
            part,
            arena: Vec::new(),
            free: Vec::new(),
            map: BTreeMap::new(),
            cursor: None,
        }
    }

    pub fn part(&self) -> u16 {
        self.part
    }

    pub fn handle(&self, flow: FlowRef) -> FlowHandle {
        FlowHandle { part: self.part, flow }
    }

    /// Add a new entry to the flow table.
    ///
    /// # Errors
    ///
    /// If an entry already exists for this key, an error is returned
    /// and no modification is made to the table.
    pub fn insert(&mut self, entry: FlowEntry) -> Result<FlowRef> {
        let key = *entry.key();
        if self.map.contains_key(&key) {
            return Err(FlowError::FlowExists(key.to_string()));
        }

        let flow = match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.arena[idx as usize];
                slot.entry = Some(entry);
                FlowRef { idx, generation: slot.generation }
            }

            None => {
                let idx = u32::try_from(self.arena.len())
                    .map_err(|_| FlowError::MaxCapacity(u64::from(u32::MAX)))?;
                self.arena.push(ArenaSlot { generation: 0, entry: Some(entry) });
                FlowRef { idx, generation: 0 }
            }
        };

        self.map.insert(key, flow);
        Ok(flow)
    }

    pub fn get(&self, flow: FlowRef) -> Option<&FlowEntry> {
        let slot = self.arena.get(flow.idx as usize)?;
        if slot.generation != flow.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, flow: FlowRef) -> Option<&mut FlowEntry> {
        let slot = self.arena.get_mut(flow.idx as usize)?;
        if slot.generation != flow.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub fn find(&self, key: &FlowKey) -> Option<FlowRef> {
        self.map.get(key).copied()
    }

    /// Remove an entry. Its reverse link, if any, is left for the
    /// caller to clear first.
    pub fn remove(&mut self, flow: FlowRef) -> Option<FlowEntry> {
        let slot = self.arena.get_mut(flow.idx as usize)?;
        if slot.generation != flow.generation {
            return None;
        }

        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(flow.idx);
        self.map.remove(entry.key());
        Some(entry)
    }

    /// Pair two entries.
    pub fn link(&mut self, a: FlowRef, b: FlowRef) -> Result<()> {
        if a == b {
            return Err(FlowError::Consistency(
                "flow linked to itself".to_string(),
            ));
        }

        if self.get(a).is_none() || self.get(b).is_none() {
            return Err(FlowError::Consistency(
                "link of a missing entry".to_string(),
            ));
        }

        if let Some(e) = self.get_mut(a) {
            e.reverse = Some(b);
        }
        if let Some(e) = self.get_mut(b) {
            e.reverse = Some(a);
        }
        Ok(())
    }

    /// Break the pairing of `flow`, returning its former partner.
    pub fn unlink(&mut self, flow: FlowRef) -> Option<FlowRef> {
        let partner = self.get_mut(flow)?.reverse.take()?;
        if let Some(p) = self.get_mut(partner) {
            if p.reverse == Some(flow) {
                p.reverse = None;
            }
        }
        Some(partner)
    }

    /// The entry's partner, if the link resolves.
    pub fn partner(&self, flow: FlowRef) -> Option<FlowRef> {
        let partner = self.get(flow)?.reverse?;
        self.get(partner).map(|_| partner)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FlowRef, &FlowEntry)> {
        self.map.values().filter_map(|r| self.get(*r).map(|e| (*r, e)))
    }

    pub fn refs(&self) -> Vec<FlowRef> {
        self.map.values().copied().collect()
    }

    /// Take the next batch of up to `max` entries, resuming where the
    /// previous batch stopped. Returns the batch and whether it ran
    /// to the end of the table.
    pub fn next_batch(&mut self, max: usize) -> (Vec<FlowRef>, bool) {
        let start = match self.cursor {
            Some(key) => Bound::Included(key),
            None => Bound::Unbounded,
        };

        let mut iter = self.map.range((start, Bound::Unbounded));
        let batch: Vec<FlowRef> =
            iter.by_ref().take(max).map(|(_, r)| *r).collect();
        self.cursor = iter.next().map(|(k, _)| *k);
        let wrapped = self.cursor.is_none();
        (batch, wrapped)
    }

    /// Start the next batch from the beginning of the table.
    pub fn rewind(&mut self) {
        self.cursor = None;
    }

    pub fn num_flows(&self) -> u32 {
        self.map.len() as u32
    }

    pub fn clear(&mut self) {
        self.arena.clear();
        self.free.clear();
        self.map.clear();
        self.cursor = None;
    }

    /// Dump one entry along with its partner's key.
    pub fn dump_entry(&self, flow: FlowRef) -> Option<FlowEntryDump> {
        let entry = self.get(flow)?;
        let reverse = self.partner(flow).and_then(|r| self.get(r)).map(|r| *r.key());
        Some(entry.dump(reverse))
    }

    pub fn dump(&self) -> Vec<FlowEntryDump> {
        self.iter().filter_map(|(r, _)| self.dump_entry(r)).collect()
    }

    /// Check the structural invariants of one entry and its pairing.
    pub fn check(&self, flow: FlowRef) -> core::result::Result<(), String> {
        let Some(entry) = self.get(flow) else {
            return Err(format!("dangling reference {flow:?}"));
        };

        entry.check()?;

        if let Some(partner) = entry.reverse {
            if partner == flow {
                return Err(format!("{}: reverse is itself", entry.key()));
            }

            match self.get(partner) {
                None => {
                    return Err(format!("{}: reverse dangles", entry.key()));
                }

                Some(p) if p.reverse != Some(flow) => {
                    return Err(format!(
                        "{}: reverse {} is one-way",
                        entry.key(),
                        p.key()
                    ));
                }

                Some(_) => (),
            }
        }

        Ok(())
    }
}
