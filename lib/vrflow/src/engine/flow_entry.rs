// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The flow entry: one direction of a tracked conversation.

use super::fwd_plane::BYTES_WIDTH;
use super::fwd_plane::FwdFlowStats;
use super::fwd_plane::PACKETS_WIDTH;
use super::fwd_plane::TcpFlowFlags;
use super::fwd_plane::counter_delta;
use super::ksync::KSyncIndexEntry;
use super::nexthop::NhEncoding;
use crate::ddi::time::Moment;
use std::net::IpAddr;
use vrflow_api::FLOW_HANDLE_INVALID;
use vrflow_api::FlowEntryDump;
use vrflow_api::FlowFlags;
use vrflow_api::FlowKey;
use vrflow_api::HashFields;
use vrflow_api::IfId;
use vrflow_api::KSyncState;
use vrflow_api::MacAddr;
use vrflow_api::NatDump;
use vrflow_api::NhId;
use vrflow_api::RuleRef;
use vrflow_api::ShortReason;
use vrflow_api::VnId;
use vrflow_api::VrfId;

/// A reference to an entry in one partition's arena. The generation
/// makes a reference to a since-reused arena slot dangle detectably
/// instead of silently aliasing a new entry.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FlowRef {
    pub(crate) idx: u32,
    pub(crate) generation: u32,
}

/// A process-wide reference to an entry: its partition plus its
/// arena reference.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FlowHandle {
    pub part: u16,
    pub flow: FlowRef,
}

/// The rewritten key fields of a translated flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NatData {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub sport: u16,
    pub dport: u16,
    /// The forwarding table the translated packet continues in.
    pub vrf: VrfId,
}

/// Reverse-path state.
///
/// `src_nh` is the resolved source binding and survives RPF being
/// disabled; `nh` is the enforcement reference handed to the
/// forwarding plane and is absent while RPF is off.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RpfData {
    pub src_nh: Option<NhId>,
    pub nh: Option<NhId>,
    pub enabled: bool,
    /// The source binding came from the bridge table.
    pub l2_fallback: bool,
}

/// The ECMP group a flow was hashed into.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EcmpSel {
    pub nh: NhId,
    pub component: u16,
}

/// Agent-side traffic accounting, refreshed from the forwarding plane
/// by the aging sweep.
#[derive(Clone, Copy, Debug)]
pub struct FlowCounters {
    pub hits: u64,
    pub bytes: u64,
    pub packets: u64,
    pub setup: Moment,
    pub last_active: Moment,
    pub tcp_flags: TcpFlowFlags,
    /// The raw forwarding-plane counters at the last sweep.
    pub(crate) raw_bytes: u64,
    pub(crate) raw_packets: u64,
}

impl FlowCounters {
    fn new(now: Moment) -> Self {
        Self {
            hits: 0,
            bytes: 0,
            packets: 0,
            setup: now,
            last_active: now,
            tcp_flags: TcpFlowFlags::empty(),
            raw_bytes: 0,
            raw_packets: 0,
        }
    }

    /// Fold in a counter reading. Returns `true` if the flow saw
    /// traffic since the previous reading.
    pub(crate) fn update(&mut self, stats: &FwdFlowStats, now: Moment) -> bool {
        let bytes = stats.total_bytes();
        let packets = stats.total_packets();
        let dbytes = counter_delta(self.raw_bytes, bytes, BYTES_WIDTH);
        let dpackets = counter_delta(self.raw_packets, packets, PACKETS_WIDTH);
        self.raw_bytes = bytes;
        self.raw_packets = packets;
        self.tcp_flags = stats.tcp_flags;

        if dbytes == 0 && dpackets == 0 {
            return false;
        }

        self.bytes += dbytes;
        self.packets += dpackets;
        self.last_active = now;
        true
    }

    /// A new slot starts counting from zero.
    pub(crate) fn reset_raw(&mut self) {
        self.raw_bytes = 0;
        self.raw_packets = 0;
    }
}

/// Per-direction flow state.
#[derive(Clone, Debug)]
pub struct FlowEntry {
    key: FlowKey,
    pub(crate) reverse: Option<FlowRef>,
    pub(crate) ksync: KSyncIndexEntry,
    flags: FlowFlags,
    short_reason: Option<ShortReason>,
    nat: Option<NatData>,
    pub(crate) rpf: RpfData,
    pub(crate) ecmp_fields: HashFields,
    pub(crate) ecmp: Option<EcmpSel>,
    pub(crate) dst_nh: Option<NhId>,
    /// Where the forwarding plane sends the flow's packets.
    pub(crate) nh: NhEncoding,
    pub(crate) linklocal_port: Option<u16>,
    pub(crate) fwd_rule: RuleRef,
    pub(crate) sg_rule: RuleRef,
    /// The local VM this entry is accounted against.
    pub(crate) vm: Option<IfId>,
    pub(crate) vn: Option<VnId>,
    pub(crate) vrf: VrfId,
    pub(crate) src_mac: Option<MacAddr>,
    /// Counted against its VM's flow ceiling.
    pub(crate) counted: bool,
    /// Built before a binding it depends on changed; the next packet
    /// for the key rebuilds the pair.
    pub(crate) dirty: bool,
    /// The slot to ask for on the next slot request.
    pub(crate) slot_hint: Option<u32>,
    /// The entry changed while its write was in flight and must be
    /// rewritten once the slot is known.
    pub(crate) stale_write: bool,
    /// The slot request waits for the partner's write to land.
    pub(crate) await_partner: bool,
    /// The forwarding plane rejected the entry; it is never written
    /// again.
    pub(crate) install_failed: bool,
    pub(crate) counters: FlowCounters,
}

impl FlowEntry {
    pub(crate) fn new(key: FlowKey, vrf: VrfId, now: Moment) -> Self {
        Self {
            key,
            reverse: None,
            ksync: KSyncIndexEntry::new(),
            flags: FlowFlags::empty(),
            short_reason: None,
            nat: None,
            rpf: RpfData::default(),
            ecmp_fields: HashFields::empty(),
            ecmp: None,
            dst_nh: None,
            nh: NhEncoding::Drop,
            linklocal_port: None,
            fwd_rule: RuleRef::default(),
            sg_rule: RuleRef::default(),
            vm: None,
            vn: None,
            vrf,
            src_mac: None,
            counted: false,
            dirty: false,
            slot_hint: None,
            stale_write: false,
            await_partner: false,
            install_failed: false,
            counters: FlowCounters::new(now),
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn flags(&self) -> FlowFlags {
        self.flags
    }

    pub(crate) fn set_flags(&mut self, flags: FlowFlags) {
        // SHORT and NAT follow their data and are never set directly.
        let derived = FlowFlags::SHORT | FlowFlags::NAT;
        self.flags = (self.flags & derived) | (flags - derived);
    }

    pub fn is_short(&self) -> bool {
        self.short_reason.is_some()
    }

    pub fn short_reason(&self) -> Option<ShortReason> {
        self.short_reason
    }

    /// Demote to a short flow. The first reason sticks; returns
    /// whether the entry changed.
    pub(crate) fn make_short(&mut self, reason: ShortReason) -> bool {
        if self.short_reason.is_some() {
            return false;
        }
        self.short_reason = Some(reason);
        self.flags |= FlowFlags::SHORT;
        true
    }

    pub fn nat(&self) -> Option<&NatData> {
        self.nat.as_ref()
    }

    pub(crate) fn set_nat(&mut self, nat: Option<NatData>) {
        self.flags.set(FlowFlags::NAT, nat.is_some());
        self.nat = nat;
    }

    pub fn is_reverse(&self) -> bool {
        self.flags.contains(FlowFlags::REVERSE)
    }

    pub fn rpf(&self) -> &RpfData {
        &self.rpf
    }

    pub fn ksync(&self) -> &KSyncIndexEntry {
        &self.ksync
    }

    /// The forwarding-plane slot this entry currently owns.
    pub fn flow_handle(&self) -> Option<u32> {
        self.ksync.index()
    }

    pub fn evict_count(&self) -> u32 {
        self.ksync.evict_count()
    }

    pub fn ecmp_fields(&self) -> HashFields {
        self.ecmp_fields
    }

    pub fn linklocal_port(&self) -> Option<u16> {
        self.linklocal_port
    }

    pub fn fwd_rule(&self) -> RuleRef {
        self.fwd_rule
    }

    pub fn sg_rule(&self) -> RuleRef {
        self.sg_rule
    }

    pub fn vm(&self) -> Option<IfId> {
        self.vm
    }

    pub fn vn(&self) -> Option<VnId> {
        self.vn
    }

    pub fn counters(&self) -> &FlowCounters {
        &self.counters
    }

    pub fn has_reverse(&self) -> bool {
        self.reverse.is_some()
    }

    /// Is this entry still part of a usable flow pair, or the
    /// remnant of one that was broken apart?
    pub(crate) fn is_live(&self) -> bool {
        !self.dirty
            && !matches!(
                self.ksync.state(),
                KSyncState::Evicted | KSyncState::Retired
            )
            && (self.reverse.is_some() || self.is_short())
    }

    /// Check the entry-local invariants.
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.is_short() != self.flags.contains(FlowFlags::SHORT) {
            return Err(format!("{}: SHORT flag disagrees with reason", self.key));
        }

        if self.nat.is_some() != self.flags.contains(FlowFlags::NAT) {
            return Err(format!("{}: NAT flag disagrees with data", self.key));
        }

        if self.reverse.is_none()
            && !self.is_short()
            && self.ksync.state() == KSyncState::IndexSet
            && !self.flags.contains(FlowFlags::MULTICAST)
        {
            return Err(format!("{}: active entry without reverse", self.key));
        }

        self.ksync.check().map_err(|e| format!("{}: {e}", self.key))
    }

    pub(crate) fn dump(&self, reverse: Option<FlowKey>) -> FlowEntryDump {
        FlowEntryDump {
            key: self.key,
            flow_handle: self.flow_handle().unwrap_or(FLOW_HANDLE_INVALID),
            ksync_state: self.ksync.state(),
            evict_count: self.ksync.evict_count(),
            flags: self.flags,
            short_reason: self.short_reason,
            reverse,
            nat: self.nat.map(|n| NatDump {
                src: n.src,
                dst: n.dst,
                sport: n.sport,
                dport: n.dport,
            }),
            rpf_nh: self.rpf.nh,
            src_nh: self.rpf.src_nh,
            enable_rpf: self.rpf.enabled,
            ecmp_fields: self.ecmp_fields,
            linklocal_port: self.linklocal_port,
            fwd_rule: self.fwd_rule,
            sg_rule: self.sg_rule,
            vm: self.vm,
            vn: self.vn,
            hits: self.counters.hits,
            bytes: self.counters.bytes,
            packets: self.counters.packets,
        }
    }
}
