// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Aging and audit.
//!
//! Aging walks each partition in bounded batches, resuming where the
//! previous batch stopped. A partition lock is held for one batch at
//! a time, never for a whole table. Each pair is judged once, at its
//! forward entry; an entry whose partner is gone is judged on its
//! own.
//!
//! Audit reconciles the forwarding plane's view of its table with
//! the slot map. A slot nobody owns is given a grace period, since
//! the write that claims it may still be waiting to be acknowledged.
//! After that, a held slot is taken over by a short entry and any
//! other slot is deleted.

use super::flow_entry::FlowEntry;
use super::flow_entry::FlowRef;
use super::flow_table::FlowTable;
use super::fwd_plane::TcpFlowFlags;
use super::proto::FlowProto;
use super::stat::bump;
use crate::ddi::time::Moment;
use crate::ddi::time::Ttl;
use crate::provider::LogLevel;
use core::sync::atomic::Ordering;
use core::time::Duration;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use vrflow_api::AgentCfg;
use vrflow_api::ShortReason;
use vrflow_api::VrfId;

/// The flow count the cadence is scaled for.
pub const MAX_FLOWS: u64 = 256 * 1024;
pub const DEFAULT_AGE_MS: u64 = 180_000;
pub const MIN_INTERVAL_MS: u64 = 100;
pub const DEFAULT_INTERVAL_MS: u64 = 1_000;
pub const MIN_FLOWS_PER_PASS: u64 = 100;

/// How often aging runs, and how much of the table each pass visits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Cadence {
    pub interval_ms: u64,
    pub flows_per_pass: u64,
}

/// Scale the sweep so that `total` flows are all visited about once
/// per `age_ms`.
pub fn cadence(total: u64, age_ms: u64) -> Cadence {
    let age_ms = age_ms.max(1);
    let multiplier = (MAX_FLOWS.saturating_mul(age_ms) / DEFAULT_AGE_MS)
        .saturating_mul(MIN_INTERVAL_MS)
        / age_ms;

    let interval_ms = if total == 0 {
        DEFAULT_INTERVAL_MS
    } else {
        (age_ms.saturating_mul(multiplier) / total)
            .clamp(MIN_INTERVAL_MS, DEFAULT_INTERVAL_MS)
    };

    Cadence {
        interval_ms,
        flows_per_pass: (interval_ms.saturating_mul(total) / age_ms)
            .max(MIN_FLOWS_PER_PASS),
    }
}

#[derive(Debug, Default)]
pub struct AgingState {
    last_pass: Option<Moment>,
    /// Partitions whose sweep reached the end of the table since the
    /// last consistency check.
    wrapped: BTreeSet<u16>,
    /// Unowned slots, and when audit first saw them.
    audit_seen: BTreeMap<u32, Moment>,
}

/// Why a pair aged out.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AgeReason {
    Idle,
    Short,
    TcpClosed,
    TcpSynTimeout,
}

/// Refresh an entry's counters from the forwarding plane. Returns the
/// TCP state last seen for its slot.
fn refresh(
    proto: &FlowProto,
    ft: &mut FlowTable,
    flow: FlowRef,
    now: Moment,
) -> TcpFlowFlags {
    let Some(e) = ft.get_mut(flow) else {
        return TcpFlowFlags::empty();
    };

    if let Some(stats) = e.flow_handle().and_then(|slot| proto.fwd.stats(slot)) {
        e.counters.update(&stats, now);
    }
    e.counters.tcp_flags
}

fn age_reason(
    cfg: &AgentCfg,
    e: &FlowEntry,
    partner: Option<&FlowEntry>,
    tcp: TcpFlowFlags,
    now: Moment,
) -> Option<AgeReason> {
    let setup = e.counters.setup;

    if e.is_short()
        && cfg.delete_short_flows
        && Ttl::new_millis(cfg.short_flow_age_ms).is_expired(setup, now)
    {
        return Some(AgeReason::Short);
    }

    if tcp.intersects(TcpFlowFlags::RST | TcpFlowFlags::HALF_CLOSE) {
        return Some(AgeReason::TcpClosed);
    }

    let syn = TcpFlowFlags::SYN | TcpFlowFlags::SYN_R;
    let established = TcpFlowFlags::ESTABLISHED | TcpFlowFlags::ESTABLISHED_R;
    if tcp.intersects(syn)
        && !tcp.intersects(established)
        && Ttl::new_millis(cfg.tcp_syn_age_ms).is_expired(setup, now)
    {
        return Some(AgeReason::TcpSynTimeout);
    }

    let last_active = match partner {
        Some(p) => e.counters.last_active.max(p.counters.last_active),
        None => e.counters.last_active,
    };
    if Ttl::new_millis(cfg.flow_age_ms).is_expired(last_active, now) {
        return Some(AgeReason::Idle);
    }

    None
}

impl FlowProto {
    pub fn aging_cadence(&self) -> Cadence {
        cadence(self.num_flows(), self.cfg.read().flow_age_ms)
    }

    /// Run one aging pass, visiting one batch of each partition.
    /// Returns the number of entries aged out.
    pub fn age_flows(&self, now: Moment) -> usize {
        let cfg = self.cfg();
        let per_pass = self.aging_cadence().flows_per_pass;
        let parts = self.parts.len().max(1) as u64;
        let batch = usize::try_from(per_pass.div_ceil(parts)).unwrap_or(usize::MAX);

        let mut aged = 0;
        let mut wrapped = Vec::new();
        for m in &self.parts {
            let mut ft = m.lock();
            let (flows, done) = ft.next_batch(batch);
            for flow in flows {
                aged += self.age_one(&cfg, &mut ft, flow, now);
            }
            if done {
                wrapped.push(ft.part());
            }
        }

        let mut state = self.aging.lock();
        state.wrapped.extend(wrapped);
        let full_cycle = state.wrapped.len() >= self.parts.len();
        if full_cycle {
            state.wrapped.clear();
        }
        drop(state);

        if full_cycle {
            self.check_all();
        }
        aged
    }

    /// Sweep every partition to the end. Returns the number of
    /// entries aged out.
    pub fn age_all(&self, now: Moment) -> usize {
        let cfg = self.cfg();
        let mut aged = 0;
        for m in &self.parts {
            m.lock().rewind();
            loop {
                let mut ft = m.lock();
                let (flows, done) = ft.next_batch(MIN_FLOWS_PER_PASS as usize);
                for flow in flows {
                    aged += self.age_one(&cfg, &mut ft, flow, now);
                }
                if done {
                    break;
                }
            }
        }
        aged
    }

    fn age_one(
        &self,
        cfg: &AgentCfg,
        ft: &mut FlowTable,
        flow: FlowRef,
        now: Moment,
    ) -> usize {
        let partner = ft.partner(flow);
        let is_reverse = ft.get(flow).is_some_and(FlowEntry::is_reverse);

        // A pair is judged at its forward entry.
        if is_reverse && partner.is_some() {
            return 0;
        }

        let mut tcp = refresh(self, ft, flow, now);
        if let Some(p) = partner {
            tcp |= refresh(self, ft, p, now);
        }

        let Some(e) = ft.get(flow) else {
            return 0;
        };
        let Some(reason) = age_reason(cfg, e, partner.and_then(|p| ft.get(p)), tcp, now)
        else {
            return 0;
        };

        let key = *e.key();
        let packets = e.counters.packets;
        if reason != AgeReason::Idle {
            self.log.log(LogLevel::Note, &format!("aging {key}: {reason:?}"));
        }
        self.flow_aged_probe(&key, packets);

        let n = if partner.is_some() { 2 } else { 1 };
        self.retire_pair(ft, flow);
        self.stats.aged.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    /// Reconcile the forwarding plane's table with the slot map.
    /// Returns the number of held slots taken over.
    pub fn audit(&self, now: Moment) -> usize {
        let grace = Ttl::new_millis(self.cfg.read().audit_grace_ms);
        let scan = self.fwd.scan();
        let mut adopted = 0;
        let mut unowned = BTreeSet::new();

        for info in scan {
            {
                let slots = self.slots.lock();
                if slots.owner(info.slot).is_some() || slots.is_deleting(info.slot) {
                    continue;
                }
            }
            unowned.insert(info.slot);

            let first_seen = *self
                .aging
                .lock()
                .audit_seen
                .entry(info.slot)
                .or_insert(now);
            if !grace.is_expired(first_seen, now) {
                continue;
            }

            if info.held {
                if self.adopt_held(info.slot, &info.key) {
                    adopted += 1;
                    unowned.remove(&info.slot);
                }
            } else {
                self.orphan_delete(info.slot);
                unowned.remove(&info.slot);
            }
        }

        self.aging.lock().audit_seen.retain(|slot, _| unowned.contains(slot));
        adopted
    }

    /// Take over a held slot with a short entry. The key may already
    /// have an entry whose write has yet to land; that write will
    /// claim the slot instead.
    fn adopt_held(&self, slot: u32, key: &vrflow_api::FlowKey) -> bool {
        let part = self.owner_part(key);
        let Some(m) = self.parts.get(usize::from(part)) else {
            return false;
        };

        let mut ft = m.lock();
        if ft.find(key).is_some() {
            return false;
        }

        let mut e = FlowEntry::new(*key, VrfId::default(), Moment::now());
        e.make_short(ShortReason::AuditEntry);
        if e.ksync.adopt(slot).is_err() {
            return false;
        }

        let Ok(flow) = ft.insert(e) else {
            return false;
        };

        self.total.fetch_add(1, Ordering::Relaxed);
        if let Some(prev) = self.slots.lock().claim(slot, ft.handle(flow)) {
            self.log.log(
                LogLevel::Error,
                &format!("audit took slot {slot} still owned by {prev:?}"),
            );
        }

        bump(&self.stats.created);
        bump(&self.stats.audit_flows);
        self.stats.short(ShortReason::AuditEntry);
        self.log.log(
            LogLevel::Note,
            &format!("audit took over held slot {slot} for {key}"),
        );

        // Rewrite the placeholder as a drop entry.
        self.reprogram(&mut ft, flow);
        true
    }

    /// Run whatever aging and audit work is due. Returns how long to
    /// wait before calling again.
    pub fn aging_tick(&self, now: Moment) -> Duration {
        let cadence = self.aging_cadence();
        let due = {
            let mut state = self.aging.lock();
            let due = state.last_pass.is_none_or(|last| {
                Ttl::new_millis(cadence.interval_ms).is_expired(last, now)
            });
            if due {
                state.last_pass = Some(now);
            }
            due
        };

        if due {
            self.age_flows(now);
            self.audit(now);
        }
        Duration::from_millis(cadence.interval_ms)
    }
}
