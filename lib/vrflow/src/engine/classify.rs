// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The classification pipeline: the decision for a new flow pair.
//!
//! Classification runs once per flow pair, on the first packet of a
//! key that misses the cache. It produces a [`PairPlan`] describing
//! both directions; installing the plan into the cache is left to
//! [`FlowProto`]. No partition lock is held while a plan is built.
//!
//! A pair that cannot be forwarded is still built, as a short pair,
//! so that the forwarding plane drops its packets without asking the
//! agent again. The first reason found sticks; the checks run in the
//! order below.
//!
//! 1. The originating interface must exist and be active.
//! 2. Multicast and broadcast destinations build a multicast pair
//!    that skips the remaining checks.
//! 3. The translation, if any, is resolved.
//! 4. The source must resolve for RPF.
//! 5. The destination must resolve to a usable nexthop.
//! 6. The policy decision must allow the packet.
//! 7. The two directions must have distinct keys.
//! 8. The per-VM and agent-wide flow ceilings must have room.
//! 9. A link-local flow must get a source port.

use super::ecmp::EcmpKey;
use super::ecmp::select_component;
use super::flow_entry::EcmpSel;
use super::flow_entry::NatData;
use super::flow_entry::RpfData;
use super::nat::NatKind;
use super::nat::NatTranslation;
use super::nexthop::NextHop;
use super::nexthop::NhEncoding;
use super::proto::FlowProto;
use super::route::Interface;
use super::route::NetView;
use super::route::RouteInfo;
use super::rpf;
use super::rpf::RpfQuery;
use std::net::IpAddr;
use vrflow_api::AgentCfg;
use vrflow_api::FlowFlags;
use vrflow_api::FlowKey;
use vrflow_api::HashFields;
use vrflow_api::IfId;
use vrflow_api::MacAddr;
use vrflow_api::NhId;
use vrflow_api::PolicyState;
use vrflow_api::RuleRef;
use vrflow_api::ShortReason;
use vrflow_api::VnId;
use vrflow_api::VrfId;

/// Where a packet entered the agent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ingress {
    /// From a local VM interface.
    Vm(IfId),
    /// From the fabric, through an overlay tunnel.
    Fabric,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Allow,
    Deny,
}

/// The outcome of ACL and security-group evaluation, made by the
/// policy layer before the packet reaches the flow cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PolicyDecision {
    pub verdict: Verdict,
    pub fwd_rule: RuleRef,
    pub sg_rule: RuleRef,
}

impl PolicyDecision {
    /// Allowed with no ACL in place.
    pub fn implicit_allow() -> Self {
        let rule = RuleRef::State(PolicyState::ImplicitAllow);
        Self { verdict: Verdict::Allow, fwd_rule: rule, sg_rule: rule }
    }

    /// Denied with an ACL in place but no rule matching.
    pub fn implicit_deny() -> Self {
        let rule = RuleRef::State(PolicyState::ImplicitDeny);
        Self { verdict: Verdict::Deny, fwd_rule: rule, sg_rule: rule }
    }

    pub fn allow(fwd_rule: RuleRef, sg_rule: RuleRef) -> Self {
        Self { verdict: Verdict::Allow, fwd_rule, sg_rule }
    }

    pub fn deny(fwd_rule: RuleRef, sg_rule: RuleRef) -> Self {
        Self { verdict: Verdict::Deny, fwd_rule, sg_rule }
    }
}

/// What the flow cache needs to know about a packet.
#[derive(Clone, Copy, Debug)]
pub struct PktCtx {
    pub key: FlowKey,
    pub ingress: Ingress,
    /// The forwarding table the packet arrived in.
    pub vrf: VrfId,
    pub src_mac: Option<MacAddr>,
    pub dst_mac: Option<MacAddr>,
    /// The packet is bridged rather than routed.
    pub l2: bool,
    pub decision: PolicyDecision,
}

/// The decided state of one direction of a new pair.
#[derive(Clone, Debug)]
pub(crate) struct EntryPlan {
    pub key: FlowKey,
    pub vrf: VrfId,
    pub flags: FlowFlags,
    pub nat: Option<NatData>,
    pub rpf: RpfData,
    pub dst_nh: Option<NhId>,
    pub nh: NhEncoding,
    pub ecmp_fields: HashFields,
    pub ecmp: Option<EcmpSel>,
    pub vm: Option<IfId>,
    pub vn: Option<VnId>,
    pub src_mac: Option<MacAddr>,
    pub fwd_rule: RuleRef,
    pub sg_rule: RuleRef,
}

/// The decision for a new pair, along with the resources reserved
/// for it.
#[derive(Clone, Debug)]
pub(crate) struct PairPlan {
    pub fwd: EntryPlan,
    pub rev: EntryPlan,
    pub short: Option<ShortReason>,
    /// VMs whose flow counts were reserved, with the number of
    /// entries reserved against each.
    pub counted: Vec<(IfId, u32)>,
    pub linklocal_port: Option<u16>,
}

impl PairPlan {
    fn demote(&mut self, reason: ShortReason) {
        if self.short.is_none() {
            self.short = Some(reason);
        }
    }
}

/// A resolved destination.
struct DstRes {
    nh: NhId,
    enc: NhEncoding,
    local: Option<Interface>,
    ecmp: Option<EcmpSel>,
    ecmp_fields: HashFields,
}

/// Is `dst` a multicast or broadcast address in `vrf`?
fn is_multicast_dst(net: &dyn NetView, vrf: VrfId, dst: IpAddr) -> bool {
    match dst {
        IpAddr::V4(ip) if ip.is_broadcast() || ip.is_multicast() => {
            return true;
        }
        IpAddr::V6(ip) if ip.is_multicast() => return true,
        _ => (),
    }

    net.route(vrf, dst).is_some_and(|r| r.is_subnet_broadcast(dst))
}

/// The reverse key of `fwd` after translation `nat`, as seen
/// arriving through `nh`.
pub(crate) fn reverse_key(fwd: &FlowKey, nat: Option<&NatData>, nh: NhId) -> FlowKey {
    match nat {
        None => fwd.reversed(nh),
        Some(nat) => FlowKey::new(
            nh,
            nat.dst,
            nat.src,
            fwd.proto,
            nat.dport,
            nat.sport,
        ),
    }
}

impl FlowProto {
    /// Build the plan for a new pair from `pkt`.
    pub(crate) fn build_plan(&self, pkt: &PktCtx, cfg: &AgentCfg) -> PairPlan {
        let net = &*self.net;
        let key = pkt.key;
        let src_intf = match pkt.ingress {
            Ingress::Vm(id) => net.interface(id),
            Ingress::Fabric => None,
        };

        let mut plan = PairPlan {
            fwd: self.blank_plan(key, pkt.vrf, pkt),
            rev: self.blank_plan(key.reversed(key.nh), pkt.vrf, pkt),
            short: None,
            counted: Vec::new(),
            linklocal_port: None,
        };
        plan.rev.flags |= FlowFlags::REVERSE;
        plan.rev.src_mac = pkt.dst_mac;

        if pkt.ingress == Ingress::Fabric {
            plan.fwd.flags |= FlowFlags::INGRESS;
        }
        if pkt.l2 {
            plan.fwd.flags |= FlowFlags::L2;
            plan.rev.flags |= FlowFlags::L2;
        }

        if let Ingress::Vm(id) = pkt.ingress {
            plan.fwd.vm = Some(id);
            match &src_intf {
                Some(intf) if intf.active => {
                    plan.fwd.vn = Some(intf.vn);
                    plan.rev.vn = Some(intf.vn);
                }
                _ => plan.demote(ShortReason::UnavailableInterface),
            }
        }

        if is_multicast_dst(net, pkt.vrf, key.dst) {
            self.plan_multicast(&mut plan, pkt);
            return plan;
        }

        // Translation.
        let mut nat: Option<NatTranslation> = None;
        let mut dst_intf: Option<Interface> = None;
        match (&src_intf, pkt.ingress) {
            (Some(intf), Ingress::Vm(_)) if !pkt.l2 => {
                nat = self.nat.resolve_egress(net, cfg, &key, intf);
            }

            (_, Ingress::Fabric) if !pkt.l2 => {
                if let Some((intf, t)) = self.nat.resolve_ingress(net, pkt.vrf, &key) {
                    nat = Some(t);
                    dst_intf = Some(intf);
                }
            }

            _ => (),
        }

        // Forward source.
        let fwd_q = RpfQuery { vrf: pkt.vrf, src: key.src, src_mac: pkt.src_mac, l2: pkt.l2 };
        let enabled = rpf::rpf_enabled(net, plan.fwd.vn);
        plan.fwd.rpf = match rpf::resolve_source(net, &fwd_q) {
            Ok(src) => rpf::rpf_data(Some(src), enabled),
            Err(reason) => {
                plan.demote(reason);
                rpf::rpf_data(None, enabled)
            }
        };

        // Destination.
        let linklocal = nat.as_ref().is_some_and(|t| t.is_linklocal());
        let dst = if linklocal {
            let vhost = net.vhost_nh();
            Ok(DstRes {
                nh: vhost,
                enc: NhEncoding::Local,
                local: None,
                ecmp: None,
                ecmp_fields: HashFields::empty(),
            })
        } else {
            let (vrf, addr) = match &nat {
                Some(t) => (t.data.vrf, t.data.dst),
                None => (pkt.vrf, key.dst),
            };
            self.resolve_dst(&key, vrf, addr, pkt)
        };

        let dst = match dst {
            Ok(dst) => Some(dst),
            Err(reason) => {
                plan.demote(reason);
                None
            }
        };

        let rev_nh = dst.as_ref().map(|d| d.nh).unwrap_or(key.nh);
        if let Some(dst) = &dst {
            plan.fwd.dst_nh = Some(dst.nh);
            plan.fwd.nh = dst.enc;
            plan.fwd.ecmp = dst.ecmp;
            plan.fwd.ecmp_fields = dst.ecmp_fields;
            if dst.ecmp.is_some() {
                plan.fwd.flags |= FlowFlags::ECMP;
            }
            if dst_intf.is_none() {
                dst_intf = dst.local.clone();
            }
        }

        if let Some(intf) = &dst_intf {
            if !intf.active {
                plan.demote(ShortReason::UnavailableInterface);
            }
            plan.rev.vm = Some(intf.id);
            plan.rev.vn = Some(intf.vn);
            if plan.fwd.vn.is_none() {
                plan.fwd.vn = Some(intf.vn);
            }
            if src_intf.is_some() {
                plan.fwd.flags |= FlowFlags::LOCAL;
                plan.rev.flags |= FlowFlags::LOCAL;
            }
        } else if src_intf.is_some() && !linklocal {
            // Return traffic for a VM's flow arrives from the fabric.
            plan.rev.flags |= FlowFlags::INGRESS;
        }

        // Fabric-originated flows are accounted to the local VM they
        // reach.
        if plan.fwd.vm.is_none() {
            plan.fwd.vm = plan.rev.vm;
        }
        if plan.rev.vm.is_none() {
            plan.rev.vm = plan.fwd.vm;
        }

        // Reverse key and translation.
        let fwd_nat = nat.map(|t| t.data);
        let rev_key = reverse_key(&key, fwd_nat.as_ref(), rev_nh);
        plan.rev.key = rev_key;
        plan.rev.vrf = fwd_nat.map(|n| n.vrf).unwrap_or(pkt.vrf);
        if let Some(t) = &nat {
            plan.fwd.nat = Some(t.data);
            plan.rev.nat = Some(NatData {
                src: key.dst,
                dst: key.src,
                sport: key.dport,
                dport: key.sport,
                vrf: pkt.vrf,
            });
            if t.kind == NatKind::FloatingIpIngress {
                plan.rev.nat = plan.rev.nat.map(|n| NatData {
                    src: t.fip.map(|f| f.addr).unwrap_or(key.dst),
                    ..n
                });
            }
        }

        // Reverse source and destination.
        let rev_enabled = rpf::rpf_enabled(net, plan.rev.vn);
        if linklocal {
            let vhost = net.vhost_nh();
            plan.rev.rpf = rpf::rpf_data(
                Some(rpf::RpfSource { nh: vhost, l2_fallback: false }),
                rev_enabled,
            );
            plan.fwd.flags |= FlowFlags::LINKLOCAL;
            plan.rev.flags |= FlowFlags::LINKLOCAL;
            let rule = RuleRef::State(PolicyState::LinkLocalFlow);
            for e in [&mut plan.fwd, &mut plan.rev] {
                e.fwd_rule = rule;
                e.sg_rule = rule;
            }
        } else if dst.is_some() {
            let rev_q = RpfQuery {
                vrf: plan.rev.vrf,
                src: rev_key.src,
                src_mac: pkt.dst_mac,
                l2: pkt.l2,
            };
            plan.rev.rpf = match rpf::resolve_source(net, &rev_q) {
                Ok(src) => rpf::rpf_data(Some(src), rev_enabled),
                Err(reason) => {
                    plan.demote(reason);
                    rpf::rpf_data(None, rev_enabled)
                }
            };
        }

        if let Some(src_nh) = plan.fwd.rpf.src_nh {
            let (enc, ecmp, fields) = self.encode_nh(src_nh, &rev_key);
            plan.rev.dst_nh = Some(src_nh);
            plan.rev.nh = enc;
            plan.rev.ecmp = ecmp;
            plan.rev.ecmp_fields = fields;
            if ecmp.is_some() {
                plan.rev.flags |= FlowFlags::ECMP;
            }
        }

        if pkt.decision.verdict == Verdict::Deny {
            plan.demote(ShortReason::PolicyDeny);
        }

        if plan.fwd.key == plan.rev.key {
            plan.demote(ShortReason::SameFlowRflowKey);
        }

        if plan.short.is_none() && !self.reserve_flows(&mut plan, cfg) {
            plan.demote(ShortReason::FlowLimit);
        }

        if linklocal {
            self.plan_linklocal_port(&mut plan, cfg);
        }

        plan
    }

    fn blank_plan(&self, key: FlowKey, vrf: VrfId, pkt: &PktCtx) -> EntryPlan {
        EntryPlan {
            key,
            vrf,
            flags: FlowFlags::empty(),
            nat: None,
            rpf: RpfData::default(),
            dst_nh: None,
            nh: NhEncoding::Drop,
            ecmp_fields: HashFields::empty(),
            ecmp: None,
            vm: None,
            vn: None,
            src_mac: pkt.src_mac,
            fwd_rule: pkt.decision.fwd_rule,
            sg_rule: pkt.decision.sg_rule,
        }
    }

    fn plan_multicast(&self, plan: &mut PairPlan, pkt: &PktCtx) {
        let net = &*self.net;
        let route = net.route(pkt.vrf, pkt.key.dst);
        let (nh, enc) = match route {
            Some(r) => {
                let enc = net
                    .nexthop(r.nh)
                    .map(|nh| nh.encode(r.nh, 0))
                    .unwrap_or(NhEncoding::Local);
                (r.nh, enc)
            }
            None => (pkt.key.nh, NhEncoding::Local),
        };

        plan.fwd.dst_nh = Some(nh);
        plan.fwd.nh = enc;
        plan.rev.key = pkt.key.reversed(nh);
        plan.rev.vn = plan.fwd.vn;
        plan.rev.vm = plan.fwd.vm;

        let rule = RuleRef::State(PolicyState::MulticastFlow);
        for e in [&mut plan.fwd, &mut plan.rev] {
            e.flags |= FlowFlags::MULTICAST;
            e.fwd_rule = rule;
            e.sg_rule = rule;
        }

        if pkt.decision.verdict == Verdict::Deny {
            plan.demote(ShortReason::PolicyDeny);
        }
        if plan.fwd.key == plan.rev.key {
            plan.demote(ShortReason::SameFlowRflowKey);
        }
    }

    /// Resolve the destination of a forward flow.
    fn resolve_dst(
        &self,
        key: &FlowKey,
        vrf: VrfId,
        addr: IpAddr,
        pkt: &PktCtx,
    ) -> Result<DstRes, ShortReason> {
        let net = &*self.net;
        let (nh_id, route) = if pkt.l2 {
            let mac = pkt.dst_mac.ok_or(ShortReason::NoDstRoute)?;
            (net.bridge(vrf, mac).ok_or(ShortReason::NoDstRoute)?, None)
        } else {
            let route = net.route(vrf, addr).ok_or(ShortReason::NoDstRoute)?;
            (route.nh, Some(route))
        };

        let nh = net.nexthop(nh_id).ok_or(ShortReason::NoDstRoute)?;
        let local = match &nh {
            NextHop::Discard => return Err(ShortReason::NoDstRoute),

            NextHop::Interface { intf, .. } => {
                Some(net.interface(*intf).ok_or(ShortReason::UnavailableInterface)?)
            }

            NextHop::Arp { .. }
            | NextHop::Tunnel { .. }
            | NextHop::Mirror { .. }
            | NextHop::Composite { .. }
            | NextHop::Vrf { .. }
            | NextHop::Receive { .. }
            | NextHop::Resolve
            | NextHop::Pbb { .. } => None,
        };

        if let (NextHop::Composite { members }, Some(route)) = (&nh, route) {
            let fields = self.negotiate_fields(&route);
            let component = select_component(key, fields, members.len());
            return Ok(DstRes {
                nh: nh_id,
                enc: nh.encode(nh_id, component),
                local,
                ecmp: Some(EcmpSel { nh: nh_id, component }),
                ecmp_fields: fields,
            });
        }

        let (enc, ecmp, ecmp_fields) = self.encode_nh(nh_id, key);
        Ok(DstRes { nh: nh_id, enc, local, ecmp, ecmp_fields })
    }

    /// Sync the route's configured hash fields and return the mask
    /// negotiated for its composite nexthop.
    pub(crate) fn negotiate_fields(&self, route: &RouteInfo) -> HashFields {
        let mut ecmp = self.ecmp.lock();
        let ek = EcmpKey { route: route.key(), nh: route.nh };
        if let Err(e) = ecmp.configure(ek, route.hash_fields) {
            self.log.log(
                crate::provider::LogLevel::Warn,
                &format!("ECMP field sync failed: {e}"),
            );
        }
        ecmp.composite_mask(route.nh)
    }

    /// Encode a nexthop that is not the flow's routed destination.
    pub(crate) fn encode_nh(
        &self,
        nh: NhId,
        key: &FlowKey,
    ) -> (NhEncoding, Option<EcmpSel>, HashFields) {
        match self.net.nexthop(nh) {
            Some(NextHop::Composite { members }) => {
                let fields = self.ecmp.lock().composite_mask(nh);
                let component = select_component(key, fields, members.len());
                (
                    NhEncoding::Ecmp { nh, component },
                    Some(EcmpSel { nh, component }),
                    fields,
                )
            }

            Some(other) => (other.encode(nh, 0), None, HashFields::empty()),
            None => (NhEncoding::Drop, None, HashFields::empty()),
        }
    }

    /// Reserve flow-count room for the pair. Returns `false`, with
    /// nothing reserved, if a ceiling would be exceeded.
    fn reserve_flows(&self, plan: &mut PairPlan, cfg: &AgentCfg) -> bool {
        if cfg.max_system_flows != 0
            && self.num_flows() + 2 > u64::from(cfg.max_system_flows)
        {
            return false;
        }

        let mut wanted: Vec<(IfId, u32)> = Vec::new();
        for vm in [plan.fwd.vm, plan.rev.vm].into_iter().flatten() {
            match wanted.iter_mut().find(|(v, _)| *v == vm) {
                Some((_, n)) => *n += 1,
                None => wanted.push((vm, 1)),
            }
        }

        let mut counts = self.vm_flows.lock();
        if cfg.max_vm_flows != 0 {
            for (vm, n) in &wanted {
                let cur = counts.get(vm).copied().unwrap_or(0);
                if cur + n > cfg.max_vm_flows {
                    return false;
                }
            }
        }

        for (vm, n) in &wanted {
            *counts.entry(*vm).or_default() += n;
        }
        plan.counted = wanted;
        true
    }

    fn plan_linklocal_port(&self, plan: &mut PairPlan, cfg: &AgentCfg) {
        let port = match (plan.short, plan.fwd.vm) {
            (None, Some(vm)) => self.nat.alloc_port(vm, cfg),
            _ => None,
        };

        match port {
            Some(port) => {
                plan.linklocal_port = Some(port);
                plan.fwd.flags |= FlowFlags::LINKLOCAL_BIND_LOCAL_PORT;
                plan.rev.flags |= FlowFlags::LINKLOCAL_BIND_LOCAL_PORT;
                if let Some(nat) = plan.fwd.nat.as_mut() {
                    nat.sport = port;
                }
                plan.rev.key.dport = port;
            }

            None => {
                // The short pair keeps the VM's own source port.
                if plan.short.is_none() {
                    self.release_counts(&plan.counted);
                    plan.counted.clear();
                }
                plan.demote(ShortReason::LinkLocalSrcNat);
            }
        }
    }

    /// Give back the resources a plan reserved.
    pub(crate) fn release_plan(&self, plan: &PairPlan) {
        self.release_counts(&plan.counted);
        if let (Some(port), Some(vm)) = (plan.linklocal_port, plan.fwd.vm) {
            self.nat.release_port(vm, port);
        }
    }

    pub(crate) fn release_counts(&self, counted: &[(IfId, u32)]) {
        let mut counts = self.vm_flows.lock();
        for (vm, n) in counted {
            if let Some(cur) = counts.get_mut(vm) {
                *cur = cur.saturating_sub(*n);
                if *cur == 0 {
                    counts.remove(vm);
                }
            }
        }
    }
}
