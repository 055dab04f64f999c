// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The flow cache.
//!
//! The cache is split into partitions, each a [`FlowTable`] behind
//! its own lock. Both entries of a pair live in the partition chosen
//! by a symmetric hash of the forward key, so a pair is only ever
//! mutated under one lock. The hash ignores the context nexthop and
//! sorts the endpoints, which puts an untranslated reverse key in the
//! same partition as its forward key. A translated reverse key may
//! hash elsewhere; it is recorded in the redirect map instead.
//!
//! Lock order is partition, then any of the leaf locks (slot map,
//! ECMP registry, link-local pool, VM counts, redirect map). No two
//! partition locks are ever held at once.

use super::aging::AgingState;
use super::classify::EntryPlan;
use super::classify::PairPlan;
use super::classify::PktCtx;
use super::classify::PolicyDecision;
use super::classify::Verdict;
use super::ecmp::EcmpKey;
use super::ecmp::EcmpRegistry;
use super::ecmp::select_component;
use super::flow_entry::EcmpSel;
use super::flow_entry::FlowEntry;
use super::flow_entry::FlowHandle;
use super::flow_entry::FlowRef;
use super::flow_table::FlowTable;
use super::fwd_plane::FlowAction;
use super::fwd_plane::FlowWriteReq;
use super::fwd_plane::FwdEvent;
use super::fwd_plane::FwdPlane;
use super::fwd_plane::FwdReq;
use super::fwd_plane::ReqToken;
use super::fwd_plane::WriteErrorKind;
use super::fwd_plane::classify_errno;
use super::ksync::AckOutcome;
use super::ksync::SlotMap;
use super::ksync::SlotState;
use super::nat::NatResolver;
use super::nexthop::NextHop;
use super::nexthop::NhEncoding;
use super::route::NetView;
use super::route::RouteEvent;
use super::rpf;
use super::rpf::RpfQuery;
use super::stat::FlowStats;
use super::stat::bump;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KRwLock;
use crate::ddi::time::Moment;
use crate::provider::LogLevel;
use crate::provider::LogProvider;
use crate::provider::Providers;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use core::time::Duration;
use crossbeam_channel::Receiver;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use vrflow_api::AgentCfg;
use vrflow_api::DumpFlowsReq;
use vrflow_api::DumpFlowsResp;
use vrflow_api::DumpSlotsResp;
use vrflow_api::FlowEntryDump;
use vrflow_api::FlowError;
use vrflow_api::FlowFlags;
use vrflow_api::FlowKey;
use vrflow_api::FlowStatsResp;
use vrflow_api::IfId;
use vrflow_api::KSyncState;
use vrflow_api::ShortReason;
use vrflow_api::SlotDump;
use vrflow_api::VnId;

/// The number of times creation of a pair is retried after losing a
/// race with a concurrent creation.
const MAX_CREATE_ATTEMPTS: usize = 4;

/// The outcome of processing one packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PktResult {
    /// The key matched a live entry.
    Hit(FlowHandle),
    /// A new pair was built. A pair whose two keys coincide has no
    /// reverse entry.
    Created {
        fwd: FlowHandle,
        rev: Option<FlowHandle>,
        short: Option<ShortReason>,
    },
}

enum Install {
    Done(PktResult),
    Hit(FlowHandle),
    /// Another creation touched one of the keys; start over.
    Raced,
    /// The forward key is a miss, but the reverse key is owned by a
    /// pair in another partition.
    RevElsewhere(u16),
}

pub struct FlowProto {
    pub(crate) cfg: KRwLock<AgentCfg>,
    pub(crate) parts: Vec<KMutex<FlowTable>>,
    /// Keys living outside the partition their hash picks.
    redirect: KRwLock<BTreeMap<FlowKey, u16>>,
    pub(crate) slots: KMutex<SlotMap>,
    pub(crate) ecmp: KMutex<EcmpRegistry>,
    pub(crate) nat: NatResolver,
    /// Counted entries, per VM.
    pub(crate) vm_flows: KMutex<BTreeMap<IfId, u32>>,
    pub(crate) total: AtomicU64,
    pub(crate) net: Arc<dyn NetView>,
    pub(crate) fwd: Arc<dyn FwdPlane>,
    events: Receiver<FwdEvent>,
    pub(crate) log: Box<dyn LogProvider>,
    pub(crate) stats: FlowStats,
    pub(crate) aging: KMutex<AgingState>,
}

/// Build the write that programs `e`.
fn write_req(
    e: &FlowEntry,
    token: ReqToken,
    slot: Option<u32>,
    reverse_slot: Option<u32>,
) -> FlowWriteReq {
    let action = if e.is_short() {
        FlowAction::Drop
    } else if e.nat().is_some() {
        FlowAction::Nat
    } else {
        FlowAction::Forward
    };

    FlowWriteReq {
        token,
        slot,
        key: *e.key(),
        action,
        nat: e.nat().copied(),
        rpf_nh: e.rpf.nh,
        nh: if e.is_short() { NhEncoding::Drop } else { e.nh },
        ecmp_fields: e.ecmp_fields,
        flags: e.flags(),
        reverse_slot,
    }
}

fn ip_bytes(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    }
}

impl FlowProto {
    pub fn new(
        cfg: AgentCfg,
        net: Arc<dyn NetView>,
        fwd: Arc<dyn FwdPlane>,
        events: Receiver<FwdEvent>,
        providers: Providers,
    ) -> Result<Self, FlowError> {
        crate::cfg::validate(&cfg)
            .map_err(|e| FlowError::InvalidCfg(e.to_string()))?;

        let parts = (0..cfg.partitions)
            .map(|p| KMutex::new(FlowTable::new(p)))
            .collect();

        Ok(Self {
            nat: NatResolver::new(cfg.linklocal_port_range),
            cfg: KRwLock::new(cfg),
            parts,
            redirect: KRwLock::new(BTreeMap::new()),
            slots: KMutex::new(SlotMap::new()),
            ecmp: KMutex::new(EcmpRegistry::new()),
            vm_flows: KMutex::new(BTreeMap::new()),
            total: AtomicU64::new(0),
            net,
            fwd,
            events,
            log: providers.log,
            stats: FlowStats::default(),
            aging: KMutex::new(AgingState::default()),
        })
    }

    pub fn num_partitions(&self) -> u16 {
        self.parts.len() as u16
    }

    /// The number of entries held, across all partitions.
    pub fn num_flows(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn cfg(&self) -> AgentCfg {
        self.cfg.read().clone()
    }

    /// Replace the configuration. Only decisions made from now on see
    /// the new values.
    pub fn set_cfg(&self, cfg: AgentCfg) -> Result<(), FlowError> {
        crate::cfg::validate(&cfg)
            .map_err(|e| FlowError::InvalidCfg(e.to_string()))?;

        if usize::from(cfg.partitions) != self.parts.len() {
            return Err(FlowError::InvalidCfg(format!(
                "partitions cannot change at runtime ({} -> {})",
                self.parts.len(),
                cfg.partitions
            )));
        }

        let mut cur = self.cfg.write();
        self.nat.set_range(cfg.linklocal_port_range);
        *cur = cfg;
        Ok(())
    }

    /// The partition a pair created from `key` lives in.
    pub fn hash_part(&self, key: &FlowKey) -> u16 {
        let a = (key.src, key.sport);
        let b = (key.dst, key.dport);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

        let mut h = crc32fast::Hasher::new();
        for (ip, port) in [lo, hi] {
            h.update(&ip_bytes(&ip));
            h.update(&port.to_be_bytes());
        }
        h.update(&[key.proto.0]);
        (h.finalize() % self.parts.len() as u32) as u16
    }

    /// The partition an entry for `key` lives in, if it exists.
    pub fn owner_part(&self, key: &FlowKey) -> u16 {
        match self.redirect.read().get(key) {
            Some(part) => *part,
            None => self.hash_part(key),
        }
    }

    fn part(&self, part: u16) -> Option<&KMutex<FlowTable>> {
        self.parts.get(usize::from(part))
    }

    /// Process a packet: find its live entry, or build a new pair.
    pub fn process_packet(&self, pkt: &PktCtx) -> Result<PktResult, FlowError> {
        let mut pkt = *pkt;
        pkt.key.canonicalize();
        let key = pkt.key;

        for _ in 0..MAX_CREATE_ATTEMPTS {
            if let Some(hit) = self.lookup_live(&key) {
                return Ok(PktResult::Hit(hit));
            }

            let plan = {
                let cfg = self.cfg.read();
                self.build_plan(&pkt, &cfg)
            };

            let part = self.hash_part(&key);
            let rev_part = self.owner_part(&plan.rev.key);

            match self.install(part, &plan) {
                Install::Done(res) => {
                    if plan.rev.key != key && self.owner_part(&plan.rev.key) != rev_part {
                        self.evict_shadowed(rev_part, &plan.rev.key, part);
                    }
                    return Ok(res);
                }
                Install::Hit(handle) => {
                    self.release_plan(&plan);
                    return Ok(PktResult::Hit(handle));
                }
                Install::Raced => self.release_plan(&plan),
                Install::RevElsewhere(home) => {
                    self.release_plan(&plan);
                    let Some(m) = self.part(home) else {
                        continue;
                    };
                    let mut ft = m.lock();
                    match ft.find(&plan.rev.key) {
                        Some(flow) => self.displace(&mut ft, flow),
                        None => {
                            let mut redirect = self.redirect.write();
                            if redirect.get(&plan.rev.key) == Some(&home) {
                                redirect.remove(&plan.rev.key);
                            }
                        }
                    }
                }
            }
        }

        Err(FlowError::BadState(format!("creation of {key} kept racing")))
    }

    /// Find the live entry for `key`, retiring a stale one.
    fn lookup_live(&self, key: &FlowKey) -> Option<FlowHandle> {
        let mut ft = self.part(self.owner_part(key))?.lock();
        let flow = ft.find(key)?;
        let live = match ft.get_mut(flow) {
            Some(e) if e.is_live() => {
                e.counters.hits += 1;
                true
            }
            Some(_) => false,
            None => return None,
        };

        if live {
            return Some(ft.handle(flow));
        }

        self.retire_pair(&mut ft, flow);
        None
    }

    /// A pair created in `part` took over `key`, but an entry for it
    /// may still be held in `home`. Displace it.
    fn evict_shadowed(&self, home: u16, key: &FlowKey, part: u16) {
        if home == part {
            return;
        }
        if let Some(m) = self.part(home) {
            let mut ft = m.lock();
            if let Some(flow) = ft.find(key) {
                self.displace(&mut ft, flow);
            }
        }
    }

    fn install(&self, part: u16, plan: &PairPlan) -> Install {
        let Some(m) = self.part(part) else {
            return Install::Raced;
        };

        let fkey = plan.fwd.key;
        let rkey = plan.rev.key;
        let same = fkey == rkey;
        let mut ft = m.lock();

        let elsewhere = |k: &FlowKey| {
            self.redirect.read().get(k).copied().filter(|p| *p != part)
        };
        if elsewhere(&fkey).is_some() {
            return Install::Raced;
        }

        if let Some(flow) = ft.find(&fkey) {
            if ft.get(flow).is_some_and(FlowEntry::is_live) {
                return Install::Hit(ft.handle(flow));
            }
            self.retire_pair(&mut ft, flow);
        }

        if !same {
            if let Some(home) = elsewhere(&rkey) {
                return Install::RevElsewhere(home);
            }
        }

        if !same {
            if let Some(flow) = ft.find(&rkey) {
                self.displace(&mut ft, flow);
            }
        }

        let now = Moment::now();
        let fwd_entry = self.entry_from_plan(&plan.fwd, plan, plan.linklocal_port, now);
        let Ok(fwd) = ft.insert(fwd_entry) else {
            return Install::Raced;
        };
        self.total.fetch_add(1, Ordering::Relaxed);

        let rev = if same {
            None
        } else {
            let rev_entry = self.entry_from_plan(&plan.rev, plan, None, now);
            match ft.insert(rev_entry) {
                Ok(rev) => {
                    self.total.fetch_add(1, Ordering::Relaxed);
                    Some(rev)
                }
                Err(_) => {
                    // The plan's reservations are released by the
                    // caller.
                    if let Some(e) = ft.get_mut(fwd) {
                        e.counted = false;
                        e.linklocal_port = None;
                    }
                    self.retire_entry(&mut ft, fwd);
                    return Install::Raced;
                }
            }
        };

        if let Some(rev) = rev {
            if let Err(e) = ft.link(fwd, rev) {
                self.log.log(LogLevel::Error, &format!("link {fkey}: {e}"));
            }

            if plan.fwd.nat.is_some() && self.hash_part(&rkey) != part {
                self.redirect.write().insert(rkey, part);
            }
        }

        let created = if rev.is_some() { 2 } else { 1 };
        for _ in 0..created {
            bump(&self.stats.created);
            if let Some(reason) = plan.short {
                self.stats.short(reason);
            }
        }
        self.flow_create_probe(&fkey, plan.short);

        // The reverse direction is programmed first so that the
        // forward write can carry its slot.
        match rev {
            Some(rev) => {
                if let Some(e) = ft.get_mut(fwd) {
                    e.await_partner = true;
                }
                self.request_slot_locked(&mut ft, rev);
            }
            None => self.request_slot_locked(&mut ft, fwd),
        }

        Install::Done(PktResult::Created {
            fwd: ft.handle(fwd),
            rev: rev.map(|r| ft.handle(r)),
            short: plan.short,
        })
    }

    fn entry_from_plan(
        &self,
        ep: &EntryPlan,
        plan: &PairPlan,
        linklocal_port: Option<u16>,
        now: Moment,
    ) -> FlowEntry {
        let mut e = FlowEntry::new(ep.key, ep.vrf, now);
        e.set_flags(ep.flags);
        e.set_nat(ep.nat);
        e.rpf = ep.rpf;
        e.dst_nh = ep.dst_nh;
        e.nh = ep.nh;
        e.ecmp_fields = ep.ecmp_fields;
        e.ecmp = ep.ecmp;
        e.vm = ep.vm;
        e.vn = ep.vn;
        e.src_mac = ep.src_mac;
        e.fwd_rule = ep.fwd_rule;
        e.sg_rule = ep.sg_rule;
        e.linklocal_port = linklocal_port;
        e.counted = ep.vm.is_some_and(|vm| plan.counted.iter().any(|(v, _)| *v == vm));

        if let Some(reason) = plan.short {
            e.make_short(reason);
        }
        e
    }

    /// Replace an entry whose key a new pair needs. A live partner
    /// loses its reverse and becomes short.
    fn displace(&self, ft: &mut FlowTable, flow: FlowRef) {
        if let Some(partner) = ft.unlink(flow) {
            self.demote(ft, partner, ShortReason::ReverseFlowChange);
        }
        self.retire_entry(ft, flow);
    }

    /// Remove an entry, releasing everything it holds.
    pub(crate) fn retire_entry(&self, ft: &mut FlowTable, flow: FlowRef) -> Option<FlowEntry> {
        let handle = ft.handle(flow);
        let part = ft.part();
        let mut e = ft.remove(flow)?;
        self.total.fetch_sub(1, Ordering::Relaxed);

        if let Some(slot) = e.ksync.retire() {
            if self.slots.lock().begin_delete(slot, handle) {
                self.fwd.send(FwdReq::Delete { slot });
            }
        }
        self.ksync_probe(&e, None);

        if let (Some(port), Some(vm)) = (e.linklocal_port.take(), e.vm) {
            self.nat.release_port(vm, port);
        }
        self.uncount(&mut e);

        let mut redirect = self.redirect.write();
        if redirect.get(e.key()) == Some(&part) {
            redirect.remove(e.key());
        }
        drop(redirect);

        bump(&self.stats.deleted);
        Some(e)
    }

    /// Remove an entry along with its partner.
    pub(crate) fn retire_pair(&self, ft: &mut FlowTable, flow: FlowRef) {
        let partner = ft.unlink(flow);
        self.retire_entry(ft, flow);
        if let Some(partner) = partner {
            self.retire_entry(ft, partner);
        }
    }

    pub(crate) fn uncount(&self, e: &mut FlowEntry) {
        if !e.counted {
            return;
        }
        e.counted = false;
        if let Some(vm) = e.vm {
            self.release_counts(&[(vm, 1)]);
        }
    }

    /// Demote one entry to short. Returns whether it changed.
    pub(crate) fn demote(
        &self,
        ft: &mut FlowTable,
        flow: FlowRef,
        reason: ShortReason,
    ) -> bool {
        let Some(e) = ft.get_mut(flow) else {
            return false;
        };
        if !e.make_short(reason) {
            return false;
        }

        self.uncount(e);
        self.stats.short(reason);
        self.flow_short_probe(e.key(), reason);
        self.reprogram(ft, flow);
        true
    }

    /// Demote an entry, and its partner with it.
    pub(crate) fn demote_pair(
        &self,
        ft: &mut FlowTable,
        flow: FlowRef,
        reason: ShortReason,
    ) {
        self.demote(ft, flow, reason);
        if let Some(partner) = ft.partner(flow) {
            self.demote(ft, partner, ShortReason::ReverseFlowChange);
        }
    }

    // ================================================================
    // Forwarding-plane programming
    // ================================================================

    fn reverse_slot(ft: &FlowTable, flow: FlowRef) -> Option<u32> {
        ft.partner(flow).and_then(|p| ft.get(p)).and_then(FlowEntry::flow_handle)
    }

    pub(crate) fn request_slot_locked(&self, ft: &mut FlowTable, flow: FlowRef) {
        let handle = ft.handle(flow);
        let reverse_slot = Self::reverse_slot(ft, flow);
        let Some(e) = ft.get_mut(flow) else {
            return;
        };

        match e.ksync.request_slot() {
            Ok(txn) => {
                e.stale_write = false;
                let token = ReqToken { handle, txn, update: false };
                let req = write_req(e, token, e.slot_hint, reverse_slot);
                self.ksync_probe(e, None);
                self.fwd.send(FwdReq::Write(req));
            }

            Err(err) => self.log.log(
                LogLevel::Warn,
                &format!("slot request for {}: {err}", e.key()),
            ),
        }
    }

    fn update_locked(&self, ft: &mut FlowTable, flow: FlowRef) {
        let handle = ft.handle(flow);
        let reverse_slot = Self::reverse_slot(ft, flow);
        let Some(e) = ft.get_mut(flow) else {
            return;
        };

        match e.ksync.request_update() {
            Ok((txn, slot)) => {
                e.stale_write = false;
                let token = ReqToken { handle, txn, update: true };
                let req = write_req(e, token, Some(slot), reverse_slot);
                self.fwd.send(FwdReq::Write(req));
            }

            Err(err) => self.log.log(
                LogLevel::Warn,
                &format!("update of {}: {err}", e.key()),
            ),
        }
    }

    /// Push the entry's current state to the forwarding plane, in
    /// whatever way its slot state allows.
    pub(crate) fn reprogram(&self, ft: &mut FlowTable, flow: FlowRef) {
        let Some(e) = ft.get_mut(flow) else {
            return;
        };
        if e.install_failed {
            return;
        }

        match e.ksync.state() {
            KSyncState::IndexSet => self.update_locked(ft, flow),
            KSyncState::PendingWrite => e.stale_write = true,
            KSyncState::Unassigned if !e.await_partner => {
                self.request_slot_locked(ft, flow)
            }
            KSyncState::Unassigned
            | KSyncState::Evicted
            | KSyncState::Retired => (),
        }
    }

    /// Ask for a slot for an entry that has none, optionally naming
    /// the slot.
    pub fn request_slot(
        &self,
        key: &FlowKey,
        slot: Option<u32>,
    ) -> Result<(), FlowError> {
        let m = self
            .part(self.owner_part(key))
            .ok_or_else(|| FlowError::FlowNotFound(key.to_string()))?;
        let mut ft = m.lock();
        let flow = ft
            .find(key)
            .ok_or_else(|| FlowError::FlowNotFound(key.to_string()))?;

        let paired = ft.partner(flow).is_some();
        let Some(e) = ft.get_mut(flow) else {
            return Err(FlowError::FlowNotFound(key.to_string()));
        };

        match e.ksync.state() {
            KSyncState::Unassigned | KSyncState::Evicted => (),
            state => {
                return Err(FlowError::BadState(format!(
                    "slot request for {key} in state {state}"
                )));
            }
        }

        e.slot_hint = slot;
        e.await_partner = false;
        e.install_failed = false;
        if !paired && e.make_short(ShortReason::NoReverseFlow) {
            self.uncount(e);
            self.stats.short(ShortReason::NoReverseFlow);
        }

        self.request_slot_locked(&mut ft, flow);
        Ok(())
    }

    // ================================================================
    // Forwarding-plane events
    // ================================================================

    /// Wait up to `timeout` for the next forwarding-plane event.
    pub fn next_fwd_event(&self, timeout: Duration) -> Option<FwdEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Handle every event queued so far, including those raised while
    /// handling them. Returns the number handled.
    pub fn process_fwd_events(&self) -> usize {
        let mut n = 0;
        while let Ok(ev) = self.events.try_recv() {
            self.handle_fwd_event(ev);
            n += 1;
        }
        n
    }

    pub fn handle_fwd_event(&self, ev: FwdEvent) {
        match ev {
            FwdEvent::WriteAck { token, slot } => self.on_write_ack(token, slot),
            FwdEvent::WriteErr { token, errno } => self.on_write_err(token, errno),
            FwdEvent::DeleteAck { slot } => {
                if !self.slots.lock().delete_acked(slot) {
                    bump(&self.stats.stale_events);
                }
            }
            FwdEvent::Evicted { slot } => self.on_evicted(slot),
        }
    }

    pub(crate) fn orphan_delete(&self, slot: u32) {
        if self.slots.lock().begin_orphan_delete(slot) {
            bump(&self.stats.orphan_deletes);
            self.fwd.send(FwdReq::Delete { slot });
        }
    }

    fn on_write_ack(&self, token: ReqToken, slot: u32) {
        let Some(m) = self.part(token.handle.part) else {
            bump(&self.stats.stale_events);
            return;
        };

        let flow = token.handle.flow;
        let mut ft = m.lock();
        let outcome = match ft.get_mut(flow) {
            Some(e) => e.ksync.on_write_ack(token.txn, slot),
            None => AckOutcome::Stale,
        };

        match outcome {
            AckOutcome::Stale => {
                drop(ft);
                bump(&self.stats.stale_events);
                // A slot written for a request nobody wants any more.
                if !token.update {
                    self.orphan_delete(slot);
                }
            }

            AckOutcome::Updated => {
                let stale = ft
                    .get_mut(flow)
                    .is_some_and(|e| core::mem::take(&mut e.stale_write));
                if stale {
                    self.reprogram(&mut ft, flow);
                }
            }

            AckOutcome::Claimed => {
                let prev = self.slots.lock().claim(slot, token.handle);
                let stale = match ft.get_mut(flow) {
                    Some(e) => {
                        e.counters.reset_raw();
                        e.slot_hint = None;
                        self.ksync_probe(e, Some(slot));
                        core::mem::take(&mut e.stale_write)
                    }
                    None => false,
                };

                if stale {
                    self.reprogram(&mut ft, flow);
                }

                if let Some(partner) = ft.partner(flow) {
                    let awaiting = ft
                        .get_mut(partner)
                        .is_some_and(|p| core::mem::take(&mut p.await_partner));
                    if awaiting {
                        self.request_slot_locked(&mut ft, partner);
                    } else {
                        self.reprogram(&mut ft, partner);
                    }
                }

                drop(ft);
                if let Some(prev) = prev {
                    self.implicit_evict(prev, slot);
                }
            }
        }
    }

    fn on_write_err(&self, token: ReqToken, errno: i32) {
        let Some(m) = self.part(token.handle.part) else {
            bump(&self.stats.stale_events);
            return;
        };

        let flow = token.handle.flow;
        let mut ft = m.lock();
        let Some(e) = ft.get_mut(flow) else {
            bump(&self.stats.stale_events);
            return;
        };

        match classify_errno(errno) {
            WriteErrorKind::Transient => {
                if !e.ksync.on_transient(token.txn) {
                    bump(&self.stats.stale_events);
                    return;
                }

                bump(&self.stats.transient_retries);
                if token.update {
                    self.update_locked(&mut ft, flow);
                } else {
                    self.request_slot_locked(&mut ft, flow);
                }
            }

            WriteErrorKind::Hard => {
                if !e.ksync.on_hard_failure(token.txn) {
                    bump(&self.stats.stale_events);
                    return;
                }

                e.install_failed = true;
                bump(&self.stats.hard_failures);
                self.log.log(
                    LogLevel::Warn,
                    &format!(
                        "forwarding plane rejected {} (errno {errno})",
                        e.key()
                    ),
                );

                let partner = ft.partner(flow);
                if let Some(p) = partner.and_then(|p| ft.get_mut(p)) {
                    p.await_partner = false;
                }

                self.demote_pair(&mut ft, flow, ShortReason::FailedVrouterInstall);

                // A partner that was already short still needs its
                // drop entry written.
                if let Some(p) = partner {
                    let unassigned = ft
                        .get(p)
                        .is_some_and(|p| p.ksync.state() == KSyncState::Unassigned);
                    if unassigned {
                        self.reprogram(&mut ft, p);
                    }
                }
            }
        }
    }

    fn on_evicted(&self, slot: u32) {
        let Some(owner) = self.slots.lock().owner(slot) else {
            bump(&self.stats.stale_events);
            return;
        };

        let Some(m) = self.part(owner.part) else {
            return;
        };

        let mut ft = m.lock();
        let evicted = self.evict_locked(&mut ft, owner.flow, slot);
        self.slots.lock().release(slot, owner);
        if !evicted {
            bump(&self.stats.stale_events);
        }
    }

    /// A write claimed a slot the map still had under another flow.
    fn implicit_evict(&self, prev: FlowHandle, slot: u32) {
        if let Some(m) = self.part(prev.part) {
            let mut ft = m.lock();
            self.evict_locked(&mut ft, prev.flow, slot);
        }
    }

    fn evict_locked(&self, ft: &mut FlowTable, flow: FlowRef, slot: u32) -> bool {
        let Some(e) = ft.get_mut(flow) else {
            return false;
        };
        if !e.ksync.on_evicted(slot) {
            return false;
        }

        self.uncount(e);
        bump(&self.stats.evicted);
        self.log.log(
            LogLevel::Note,
            &format!("{} evicted from slot {slot}", e.key()),
        );
        self.flow_evict_probe(e.key(), slot, e.evict_count());

        if let Some(partner) = ft.unlink(flow) {
            if let Some(p) = ft.get_mut(partner) {
                p.await_partner = false;
            }
            if !self.demote(ft, partner, ShortReason::NoReverseFlow) {
                // Already short; it still loses its reverse slot.
                self.reprogram(ft, partner);
            }
        }
        true
    }

    // ================================================================
    // Change propagation
    // ================================================================

    /// Apply a routing change to the ECMP registry and revalidate
    /// every flow against the new routing state.
    pub fn route_changed(&self, ev: &RouteEvent) {
        {
            let mut ecmp = self.ecmp.lock();
            match ev {
                RouteEvent::Unicast { route } => {
                    ecmp.withdraw_stale(route.key(), route.nh);
                    let composite = self
                        .net
                        .nexthop(route.nh)
                        .is_some_and(|nh| nh.is_composite());
                    if composite {
                        let ek = EcmpKey { route: route.key(), nh: route.nh };
                        if let Err(e) = ecmp.configure(ek, route.hash_fields) {
                            self.log.log(
                                LogLevel::Warn,
                                &format!("ECMP field sync failed: {e}"),
                            );
                        }
                    }
                }

                RouteEvent::UnicastDel { key, .. } => ecmp.withdraw_route(*key),

                RouteEvent::Bridge { .. }
                | RouteEvent::BridgeDel { .. }
                | RouteEvent::Composite { .. } => (),
            }
        }

        for m in &self.parts {
            let mut ft = m.lock();
            for flow in ft.refs() {
                self.revalidate(&mut ft, flow);
            }
        }
    }

    /// Why the entry's destination can no longer be reached, if it
    /// can't.
    fn dst_gone(&self, e: &FlowEntry) -> Option<ShortReason> {
        let nh = e.dst_nh?;
        if nh == self.net.vhost_nh() {
            return None;
        }

        match self.net.nexthop(nh) {
            None | Some(NextHop::Discard) => return Some(ShortReason::NoDstRoute),

            Some(NextHop::Interface { intf, .. }) => {
                let up = self.net.interface(intf).is_some_and(|i| i.active);
                if !up {
                    return Some(ShortReason::UnavailableInterface);
                }
            }

            Some(
                NextHop::Arp { .. }
                | NextHop::Tunnel { .. }
                | NextHop::Mirror { .. }
                | NextHop::Composite { .. }
                | NextHop::Vrf { .. }
                | NextHop::Receive { .. }
                | NextHop::Resolve
                | NextHop::Pbb { .. },
            ) => (),
        }

        if e.is_reverse() || e.flags().intersects(FlowFlags::LINKLOCAL | FlowFlags::L2) {
            return None;
        }

        let (vrf, addr) = match e.nat() {
            Some(n) => (n.vrf, n.dst),
            None => (e.vrf, e.key().dst),
        };
        if self.net.route(vrf, addr).is_none() {
            return Some(ShortReason::NoDstRoute);
        }
        None
    }

    /// Has the route to the entry's destination moved to another
    /// nexthop? The reverse key is derived from that nexthop, so such
    /// a pair must be rebuilt rather than patched.
    fn dst_moved(&self, e: &FlowEntry) -> bool {
        if e.is_reverse()
            || e.flags().intersects(FlowFlags::LINKLOCAL | FlowFlags::L2)
        {
            return false;
        }

        let (vrf, addr) = match e.nat() {
            Some(n) => (n.vrf, n.dst),
            None => (e.vrf, e.key().dst),
        };
        match (self.net.route(vrf, addr), e.dst_nh) {
            (Some(route), Some(nh)) => route.nh != nh,
            _ => false,
        }
    }

    fn revalidate(&self, ft: &mut FlowTable, flow: FlowRef) {
        let net = &*self.net;
        let Some(e) = ft.get(flow) else {
            return;
        };
        if e.is_short()
            || e.flags().contains(FlowFlags::MULTICAST)
            || matches!(e.ksync.state(), KSyncState::Retired | KSyncState::Evicted)
        {
            return;
        }

        let key = *e.key();
        let pinned = e.is_reverse() && e.flags().contains(FlowFlags::LINKLOCAL);
        let rpf = if pinned {
            Ok(e.rpf)
        } else {
            let q = RpfQuery {
                vrf: e.vrf,
                src: key.src,
                src_mac: e.src_mac,
                l2: e.flags().contains(FlowFlags::L2),
            };
            let enabled = rpf::rpf_enabled(net, e.vn);
            rpf::resolve_source(net, &q).map(|src| rpf::rpf_data(Some(src), enabled))
        };

        let rpf = match rpf {
            Ok(rpf) => rpf,
            Err(reason) => {
                self.demote_pair(ft, flow, reason);
                return;
            }
        };

        if let Some(reason) = self.dst_gone(e) {
            self.demote_pair(ft, flow, reason);
            return;
        }

        if self.dst_moved(e) {
            self.retire_pair(ft, flow);
            return;
        }

        let ecmp = e.ecmp.map(|sel| {
            let fields = self.ecmp.lock().composite_mask(sel.nh);
            let members = net.nexthop(sel.nh).map(|nh| nh.members().len()).unwrap_or(0);
            (sel.nh, fields, select_component(&key, fields, members))
        });

        let partner = ft.partner(flow);
        let mut changed = false;
        let mut src_moved = None;
        if let Some(e) = ft.get_mut(flow) {
            if e.rpf != rpf {
                if e.rpf.src_nh != rpf.src_nh {
                    src_moved = rpf.src_nh;
                }
                e.rpf = rpf;
                changed = true;
            }

            if let Some((nh, fields, component)) = ecmp {
                let sel = EcmpSel { nh, component };
                if e.ecmp_fields != fields || e.ecmp != Some(sel) {
                    e.ecmp_fields = fields;
                    e.ecmp = Some(sel);
                    e.nh = NhEncoding::Ecmp { nh, component };
                    changed = true;
                }
            }
        }

        if changed {
            self.reprogram(ft, flow);
        }

        // The partner forwards toward this entry's source.
        if let (Some(src_nh), Some(p)) = (src_moved, partner) {
            let Some(pkey) = ft.get(p).map(|pe| *pe.key()) else {
                return;
            };
            let (enc, sel, fields) = self.encode_nh(src_nh, &pkey);
            if let Some(pe) = ft.get_mut(p) {
                pe.dst_nh = Some(src_nh);
                pe.nh = enc;
                pe.ecmp = sel;
                pe.ecmp_fields = fields;
                let mut flags = pe.flags();
                flags.set(FlowFlags::ECMP, sel.is_some());
                pe.set_flags(flags);
            }
            self.reprogram(ft, p);
        }
    }

    /// Apply the current RPF setting of `vn` to every flow in it.
    pub fn vn_changed(&self, vn: VnId) {
        let enabled = rpf::rpf_enabled(&*self.net, Some(vn));
        for m in &self.parts {
            let mut ft = m.lock();
            for flow in ft.refs() {
                let changed = match ft.get_mut(flow) {
                    Some(e) if e.vn == Some(vn) => rpf::apply_enable(&mut e.rpf, enabled),
                    _ => false,
                };
                if changed {
                    self.reprogram(&mut ft, flow);
                }
            }
        }
    }

    /// Re-examine the flows of a VM interface after it changed. Flows
    /// of an interface that is gone or inactive become short; flows
    /// whose translation no longer matches the interface's bindings
    /// are rebuilt on their next packet.
    pub fn interface_changed(&self, id: IfId) {
        let net = &*self.net;
        let cfg = self.cfg.read().clone();
        let intf = net.interface(id).filter(|i| i.active);

        for m in &self.parts {
            let mut ft = m.lock();
            for flow in ft.refs() {
                let Some(e) = ft.get(flow) else {
                    continue;
                };
                if e.vm != Some(id) {
                    continue;
                }

                let Some(intf) = &intf else {
                    self.demote_pair(&mut ft, flow, ShortReason::UnavailableInterface);
                    continue;
                };

                if e.is_reverse() || e.is_short() {
                    continue;
                }

                let key = *e.key();
                let stale = if e.flags().contains(FlowFlags::INGRESS) {
                    e.nat().is_some()
                        && !intf.fips.iter().any(|f| f.addr == key.dst && f.vrf == e.vrf)
                } else {
                    let now = self.nat.resolve_egress(net, &cfg, &key, intf);
                    let want = now.map(|t| (t.data.src, t.data.dst, t.data.dport, t.data.vrf));
                    let have = e.nat().map(|n| (n.src, n.dst, n.dport, n.vrf));
                    want != have
                };

                if stale {
                    let partner = ft.partner(flow);
                    for f in [Some(flow), partner].into_iter().flatten() {
                        if let Some(e) = ft.get_mut(f) {
                            e.dirty = true;
                        }
                    }
                }
            }
        }
    }

    /// Apply a new policy decision to an existing pair.
    pub fn update_policy(
        &self,
        key: &FlowKey,
        decision: PolicyDecision,
    ) -> Result<(), FlowError> {
        let m = self
            .part(self.owner_part(key))
            .ok_or_else(|| FlowError::FlowNotFound(key.to_string()))?;
        let mut ft = m.lock();
        let flow = ft
            .find(key)
            .ok_or_else(|| FlowError::FlowNotFound(key.to_string()))?;

        if decision.verdict == Verdict::Deny {
            self.demote_pair(&mut ft, flow, ShortReason::PolicyDeny);
            return Ok(());
        }

        let partner = ft.partner(flow);
        for f in [Some(flow), partner].into_iter().flatten() {
            if let Some(e) = ft.get_mut(f) {
                e.fwd_rule = decision.fwd_rule;
                e.sg_rule = decision.sg_rule;
            }
        }
        Ok(())
    }

    // ================================================================
    // Deletion and introspection
    // ================================================================

    /// Delete the pair `key` belongs to.
    pub fn delete(&self, key: &FlowKey) -> Result<(), FlowError> {
        let m = self
            .part(self.owner_part(key))
            .ok_or_else(|| FlowError::FlowNotFound(key.to_string()))?;
        let mut ft = m.lock();
        let flow = ft
            .find(key)
            .ok_or_else(|| FlowError::FlowNotFound(key.to_string()))?;
        self.retire_pair(&mut ft, flow);
        Ok(())
    }

    pub fn delete_all(&self) {
        for m in &self.parts {
            let mut ft = m.lock();
            for flow in ft.refs() {
                if ft.get(flow).is_some() {
                    self.retire_pair(&mut ft, flow);
                }
            }
        }
    }

    pub fn get_flow(&self, key: &FlowKey) -> Result<FlowEntryDump, FlowError> {
        self.lookup(key)
            .ok_or_else(|| FlowError::FlowNotFound(key.to_string()))
    }

    /// Find the entry for `key`, whatever its state.
    pub fn lookup(&self, key: &FlowKey) -> Option<FlowEntryDump> {
        let ft = self.part(self.owner_part(key))?.lock();
        ft.find(key).and_then(|flow| ft.dump_entry(flow))
    }

    /// A copy of the entry for `key`.
    #[cfg(any(feature = "test-help", test))]
    pub fn entry(&self, key: &FlowKey) -> Option<FlowEntry> {
        let ft = self.part(self.owner_part(key))?.lock();
        ft.find(key).and_then(|flow| ft.get(flow)).cloned()
    }

    pub fn dump_flows(&self, req: &DumpFlowsReq) -> DumpFlowsResp {
        let mut flows = Vec::new();
        for m in &self.parts {
            let ft = m.lock();
            flows.extend(
                ft.dump()
                    .into_iter()
                    .filter(|f| !req.short_only || f.short_reason.is_some()),
            );
        }
        flows.sort_by(|a, b| a.key.cmp(&b.key));

        DumpFlowsResp {
            limit: self.cfg.read().max_system_flows,
            num_flows: flows.len() as u32,
            flows,
        }
    }

    pub fn dump_slots(&self) -> DumpSlotsResp {
        let snapshot: Vec<(u32, SlotState)> =
            self.slots.lock().iter().map(|(s, st)| (*s, *st)).collect();

        let slots = snapshot
            .into_iter()
            .map(|(slot, state)| match state {
                SlotState::Owned(h) => {
                    let key = self
                        .part(h.part)
                        .and_then(|m| m.lock().get(h.flow).map(|e| *e.key()));
                    SlotDump { slot, key, deleting: false }
                }
                SlotState::Deleting => SlotDump { slot, key: None, deleting: true },
            })
            .collect();

        DumpSlotsResp { slots }
    }

    pub fn stats(&self) -> FlowStatsResp {
        self.stats.snapshot(self.num_flows())
    }

    /// Check the structural invariants of every entry, retiring any
    /// pair that violates them. Returns the number retired.
    pub fn check_all(&self) -> usize {
        let mut retired = 0;
        for m in &self.parts {
            let mut ft = m.lock();
            for flow in ft.refs() {
                if ft.get(flow).is_none() {
                    continue;
                }
                if let Err(msg) = ft.check(flow) {
                    self.log.log(
                        LogLevel::Error,
                        &format!("consistency violation, retiring: {msg}"),
                    );
                    bump(&self.stats.consistency_retires);
                    self.retire_pair(&mut ft, flow);
                    retired += 1;
                }
            }
        }
        retired
    }

    // ================================================================
    // Probes
    // ================================================================

    fn flow_create_probe(&self, key: &FlowKey, short: Option<ShortReason>) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "usdt")] {
                let key_s = key.to_string();
                let short_s = short.map(|r| r.as_str()).unwrap_or("");
                crate::vrflow_provider::flow__create!(|| (key_s, short_s));
            } else {
                let (_, _) = (key, short);
            }
        }
    }

    fn flow_short_probe(&self, key: &FlowKey, reason: ShortReason) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "usdt")] {
                let key_s = key.to_string();
                crate::vrflow_provider::flow__short!(|| (key_s, reason.as_str()));
            } else {
                let (_, _) = (key, reason);
            }
        }
    }

    fn flow_evict_probe(&self, key: &FlowKey, slot: u32, evict_count: u32) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "usdt")] {
                let key_s = key.to_string();
                crate::vrflow_provider::flow__evict!(|| (key_s, slot, evict_count));
            } else {
                let (_, _, _) = (key, slot, evict_count);
            }
        }
    }

    pub(crate) fn flow_aged_probe(&self, key: &FlowKey, packets: u64) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "usdt")] {
                let key_s = key.to_string();
                crate::vrflow_provider::flow__aged!(|| (key_s, packets));
            } else {
                let (_, _) = (key, packets);
            }
        }
    }

    fn ksync_probe(&self, e: &FlowEntry, slot: Option<u32>) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "usdt")] {
                let key_s = e.key().to_string();
                let state_s = e.ksync.state().to_string();
                let slot = slot.unwrap_or(vrflow_api::FLOW_HANDLE_INVALID);
                crate::vrflow_provider::ksync__transition!(
                    || (key_s, state_s, slot)
                );
            } else {
                let (_, _) = (e, slot);
            }
        }
    }
}
