// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A forwarding plane living entirely in memory.
//!
//! Requests are applied as they arrive unless auto-ack is turned
//! off, in which case they queue until a test releases them. Every
//! outcome is delivered on the engine's event channel, exactly as a
//! real forwarding plane would.

use crossbeam_channel::Sender;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use vrflow::ddi::sync::KMutex;
use vrflow::engine::fwd_plane::FlowWriteReq;
use vrflow::engine::fwd_plane::FwdEntryInfo;
use vrflow::engine::fwd_plane::FwdEvent;
use vrflow::engine::fwd_plane::FwdFlowStats;
use vrflow::engine::fwd_plane::FwdPlane;
use vrflow::engine::fwd_plane::FwdReq;
use vrflow::engine::fwd_plane::TcpFlowFlags;
use vrflow_api::FlowKey;

#[derive(Clone, Debug)]
pub struct SimSlot {
    pub key: FlowKey,
    pub held: bool,
    pub stats: FwdFlowStats,
    /// The last write that landed in this slot.
    pub write: Option<FlowWriteReq>,
}

#[derive(Debug)]
struct SimInner {
    auto_ack: bool,
    slots: BTreeMap<u32, SimSlot>,
    pending: VecDeque<FwdReq>,
    /// Errno values to fail the next writes with, in order.
    errors: VecDeque<i32>,
    writes: Vec<FlowWriteReq>,
    deletes: Vec<u32>,
}

pub struct SimFwdPlane {
    events: Sender<FwdEvent>,
    inner: KMutex<SimInner>,
}

impl SimFwdPlane {
    pub fn new(events: Sender<FwdEvent>) -> Self {
        Self {
            events,
            inner: KMutex::new(SimInner {
                auto_ack: true,
                slots: BTreeMap::new(),
                pending: VecDeque::new(),
                errors: VecDeque::new(),
                writes: Vec::new(),
                deletes: Vec::new(),
            }),
        }
    }

    fn emit(&self, ev: FwdEvent) {
        // The receiver lives as long as the engine does.
        let _ = self.events.send(ev);
    }

    /// Deliver an arbitrary event, as if raised by the forwarding
    /// plane.
    pub fn inject(&self, ev: FwdEvent) {
        self.emit(ev);
    }

    /// Queue requests rather than applying them.
    pub fn set_auto_ack(&self, on: bool) {
        self.inner.lock().auto_ack = on;
    }

    /// Fail the next `n` writes with `errno`.
    pub fn fail_next(&self, errno: i32, n: usize) {
        let mut inner = self.inner.lock();
        inner.errors.extend(std::iter::repeat_n(errno, n));
    }

    pub fn num_pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Apply the oldest queued request. Returns `false` if none was
    /// queued.
    pub fn release_one(&self) -> bool {
        let req = self.inner.lock().pending.pop_front();
        match req {
            Some(req) => {
                self.apply(req);
                true
            }
            None => false,
        }
    }

    /// Apply every queued request. Returns the number applied.
    pub fn release_all(&self) -> usize {
        let mut n = 0;
        while self.release_one() {
            n += 1;
        }
        n
    }

    /// Drop every queued request without answering it.
    pub fn discard_pending(&self) -> Vec<FwdReq> {
        self.inner.lock().pending.drain(..).collect()
    }

    /// Hand `slot` to some other flow.
    pub fn evict(&self, slot: u32) {
        self.inner.lock().slots.remove(&slot);
        self.emit(FwdEvent::Evicted { slot });
    }

    /// Add an entry the forwarding plane allocated on its own.
    pub fn add_held(&self, slot: u32, key: FlowKey) {
        self.inner.lock().slots.insert(
            slot,
            SimSlot { key, held: true, stats: FwdFlowStats::default(), write: None },
        );
    }

    /// Add an entry nobody asked for, and which is not held.
    pub fn add_stray(&self, slot: u32, key: FlowKey) {
        self.inner.lock().slots.insert(
            slot,
            SimSlot { key, held: false, stats: FwdFlowStats::default(), write: None },
        );
    }

    pub fn set_stats(&self, slot: u32, stats: FwdFlowStats) {
        if let Some(s) = self.inner.lock().slots.get_mut(&slot) {
            s.stats = stats;
        }
    }

    /// Count `packets` more packets of `bytes` bytes each in `slot`.
    pub fn add_traffic(&self, slot: u32, packets: u32, bytes: u32) {
        if let Some(s) = self.inner.lock().slots.get_mut(&slot) {
            s.stats.packets = s.stats.packets.wrapping_add(packets);
            s.stats.bytes = s.stats.bytes.wrapping_add(packets * bytes);
        }
    }

    pub fn set_tcp_flags(&self, slot: u32, flags: TcpFlowFlags) {
        if let Some(s) = self.inner.lock().slots.get_mut(&slot) {
            s.stats.tcp_flags = flags;
        }
    }

    pub fn slot(&self, slot: u32) -> Option<SimSlot> {
        self.inner.lock().slots.get(&slot).cloned()
    }

    pub fn num_slots(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Every write sent so far, answered or not.
    pub fn writes(&self) -> Vec<FlowWriteReq> {
        self.inner.lock().writes.clone()
    }

    pub fn writes_for(&self, key: &FlowKey) -> Vec<FlowWriteReq> {
        self.inner
            .lock()
            .writes
            .iter()
            .filter(|w| w.key == *key)
            .cloned()
            .collect()
    }

    pub fn num_writes(&self) -> usize {
        self.inner.lock().writes.len()
    }

    /// Every slot delete sent so far.
    pub fn deletes(&self) -> Vec<u32> {
        self.inner.lock().deletes.clone()
    }

    fn apply(&self, req: FwdReq) {
        match req {
            FwdReq::Write(w) => self.apply_write(w),
            FwdReq::Delete { slot } => {
                self.inner.lock().slots.remove(&slot);
                self.emit(FwdEvent::DeleteAck { slot });
            }
        }
    }

    fn apply_write(&self, w: FlowWriteReq) {
        let mut inner = self.inner.lock();
        if let Some(errno) = inner.errors.pop_front() {
            drop(inner);
            self.emit(FwdEvent::WriteErr { token: w.token, errno });
            return;
        }

        let slot = match w.slot {
            Some(slot) => slot,
            None => (0..).find(|s| !inner.slots.contains_key(s)).unwrap_or(u32::MAX),
        };

        // Taking a slot from another key evicts that key.
        let evicted = inner.slots.get(&slot).is_some_and(|s| s.key != w.key);
        let stats = match inner.slots.get(&slot) {
            Some(s) if !evicted => s.stats,
            _ => FwdFlowStats::default(),
        };

        let token = w.token;
        inner.slots.insert(
            slot,
            SimSlot { key: w.key, held: false, stats, write: Some(w) },
        );
        drop(inner);

        if evicted {
            self.emit(FwdEvent::Evicted { slot });
        }
        self.emit(FwdEvent::WriteAck { token, slot });
    }
}

impl FwdPlane for SimFwdPlane {
    fn send(&self, req: FwdReq) {
        let mut inner = self.inner.lock();
        match &req {
            FwdReq::Write(w) => inner.writes.push(w.clone()),
            FwdReq::Delete { slot } => inner.deletes.push(*slot),
        }

        if !inner.auto_ack {
            inner.pending.push_back(req);
            return;
        }
        drop(inner);
        self.apply(req);
    }

    fn stats(&self, slot: u32) -> Option<FwdFlowStats> {
        self.inner.lock().slots.get(&slot).map(|s| s.stats)
    }

    fn scan(&self) -> Vec<FwdEntryInfo> {
        self.inner
            .lock()
            .slots
            .iter()
            .map(|(slot, s)| FwdEntryInfo { slot: *slot, key: s.key, held: s.held })
            .collect()
    }
}
