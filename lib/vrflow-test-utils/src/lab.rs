// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A small overlay network to run the flow engine against.
//!
//! Two VMs, A and B, share virtual network `VN` and its VRF. A
//! remote host sits behind a tunnel, an ECMP prefix is spread over
//! two tunnels, and the agent fronts a metadata service at the usual
//! link-local address. VM A also owns a floating IP in a second
//! network with a default route.

use crate::sim::SimFwdPlane;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::Arc;
use vrflow::engine::FlowProto;
use vrflow::engine::Ingress;
use vrflow::engine::PktCtx;
use vrflow::engine::PktResult;
use vrflow::engine::PolicyDecision;
use vrflow::engine::flow_entry::FlowEntry;
use vrflow::engine::fwd_plane::event_channel;
use vrflow::engine::nexthop::NextHop;
use vrflow::engine::nexthop::TunnelEncap;
use vrflow::engine::route::FloatingIp;
use vrflow::engine::route::Interface;
use vrflow::engine::route::NetView;
use vrflow::engine::route::RouteDb;
use vrflow::engine::route::RouteKind;
use vrflow::engine::route::VnInfo;
use vrflow::print::print_flows;
use vrflow::print::print_slots;
use vrflow::provider::PrintlnLog;
use vrflow::provider::Providers;
use vrflow_api::AgentCfg;
use vrflow_api::DumpFlowsReq;
use vrflow_api::DumpFlowsResp;
use vrflow_api::FabricEndpoint;
use vrflow_api::FlowKey;
use vrflow_api::HashFields;
use vrflow_api::IfId;
use vrflow_api::LinkLocalService;
use vrflow_api::MacAddr;
use vrflow_api::NhId;
use vrflow_api::Protocol;
use vrflow_api::VnId;
use vrflow_api::VrfId;

pub const VHOST_NH: NhId = NhId(1);
/// The nexthop of the subnet route; it only catches broadcast.
pub const SUBNET_NH: NhId = NhId(2);
pub const VN: VnId = VnId(1);
pub const VRF: VrfId = VrfId(1);
pub const FIP_VN: VnId = VnId(2);
pub const FIP_VRF: VrfId = VrfId(2);

pub const VM_A: IfId = IfId(1);
pub const VM_A_NH: NhId = NhId(10);
pub const VM_B: IfId = IfId(2);
pub const VM_B_NH: NhId = NhId(11);

pub const REMOTE_NH: NhId = NhId(20);
pub const REMOTE2_NH: NhId = NhId(21);
pub const ECMP_NH: NhId = NhId(30);
pub const INTERNET_NH: NhId = NhId(40);

pub const SUBNET: &str = "10.0.0.0/24";
pub const VM_A_IP: &str = "10.0.0.1";
pub const VM_B_IP: &str = "10.0.0.2";
pub const REMOTE_IP: &str = "10.0.0.100";
pub const ECMP_PREFIX: &str = "10.1.0.0/24";
pub const FIP_ADDR: &str = "192.0.2.10";
pub const ROUTER_ID: &str = "172.16.0.1";
pub const METADATA_VIP: &str = "169.254.169.254";
pub const METADATA_PORT: u16 = 80;
pub const METADATA_SERVER: &str = "172.16.0.9";
pub const METADATA_SERVER_PORT: u16 = 8775;

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn net(s: &str) -> IpNetwork {
    s.parse().unwrap()
}

pub fn mac(last: u8) -> MacAddr {
    MacAddr::from([0x02, 0x08, 0x20, 0x00, 0x00, last])
}

pub fn vm_a_mac() -> MacAddr {
    mac(1)
}

pub fn vm_b_mac() -> MacAddr {
    mac(2)
}

pub fn remote_mac() -> MacAddr {
    mac(100)
}

pub fn tcp_key(nh: NhId, src: &str, dst: &str, sport: u16, dport: u16) -> FlowKey {
    FlowKey::new(nh, ip(src), ip(dst), Protocol::TCP, sport, dport)
}

pub fn udp_key(nh: NhId, src: &str, dst: &str, sport: u16, dport: u16) -> FlowKey {
    FlowKey::new(nh, ip(src), ip(dst), Protocol::UDP, sport, dport)
}

pub fn icmp_key(nh: NhId, src: &str, dst: &str) -> FlowKey {
    FlowKey::new(nh, ip(src), ip(dst), Protocol::ICMP, 0, 0)
}

/// The configuration the lab is usually run with.
pub fn lab_cfg() -> AgentCfg {
    AgentCfg {
        router_id: Some(ip(ROUTER_ID)),
        linklocal_services: vec![LinkLocalService {
            name: "metadata".to_string(),
            vip: ip(METADATA_VIP),
            vport: METADATA_PORT,
            fabric: vec![FabricEndpoint {
                ip: ip(METADATA_SERVER),
                port: METADATA_SERVER_PORT,
            }],
        }],
        ..Default::default()
    }
}

pub fn vm_intf(id: IfId, nh: NhId, addr: &str, mac: MacAddr) -> Interface {
    Interface {
        id,
        vn: VN,
        vrf: VRF,
        nh,
        mac,
        ip: ip(addr),
        mdata_ip: None,
        fips: Vec::new(),
        active: true,
    }
}

/// Plug a VM into the network: its interface, host route and bridge
/// entry.
pub fn add_vm(db: &RouteDb, intf: Interface) {
    let host = IpNetwork::new(intf.ip, 32).unwrap();
    db.add_route(intf.vrf, host, intf.nh, RouteKind::Normal, None);
    db.add_bridge(intf.vrf, intf.mac, intf.nh);
    db.set_interface(intf);
}

fn tunnel(dst: &str) -> NextHop {
    NextHop::Tunnel { dst: ip(dst), encap: TunnelEncap::MplsUdp }
}

pub fn build_topology(db: &RouteDb) {
    db.set_vn(VnInfo { id: VN, vrf: VRF, enable_rpf: true });
    db.set_vn(VnInfo { id: FIP_VN, vrf: FIP_VRF, enable_rpf: true });

    db.set_nexthop(SUBNET_NH, NextHop::Discard);
    db.add_route(VRF, net(SUBNET), SUBNET_NH, RouteKind::Subnet, None);

    let mut a = vm_intf(VM_A, VM_A_NH, VM_A_IP, vm_a_mac());
    a.fips.push(FloatingIp { addr: ip(FIP_ADDR), vn: FIP_VN, vrf: FIP_VRF });
    add_vm(db, a);
    add_vm(db, vm_intf(VM_B, VM_B_NH, VM_B_IP, vm_b_mac()));

    db.set_nexthop(REMOTE_NH, tunnel("172.16.0.2"));
    db.set_nexthop(REMOTE2_NH, tunnel("172.16.0.3"));
    db.add_route(VRF, net("10.0.0.100/32"), REMOTE_NH, RouteKind::Normal, None);
    db.add_bridge(VRF, remote_mac(), REMOTE_NH);

    db.set_nexthop(ECMP_NH, NextHop::Composite { members: vec![REMOTE_NH, REMOTE2_NH] });
    db.add_route(
        VRF,
        net(ECMP_PREFIX),
        ECMP_NH,
        RouteKind::Normal,
        Some(HashFields::all()),
    );

    db.set_nexthop(INTERNET_NH, tunnel("172.16.0.254"));
    db.add_route(FIP_VRF, net("0.0.0.0/0"), INTERNET_NH, RouteKind::Normal, None);
}

/// The engine, wired to a simulated forwarding plane and the lab
/// topology.
pub struct Lab {
    pub proto: Arc<FlowProto>,
    pub fwd: Arc<SimFwdPlane>,
    pub db: Arc<RouteDb>,
}

impl Lab {
    pub fn new() -> Self {
        Self::with_cfg(lab_cfg())
    }

    pub fn with_cfg(cfg: AgentCfg) -> Self {
        let (tx, rx) = event_channel();
        let fwd = Arc::new(SimFwdPlane::new(tx));
        let db = Arc::new(RouteDb::new(VHOST_NH));
        build_topology(&db);

        let proto = FlowProto::new(
            cfg,
            db.clone(),
            fwd.clone(),
            rx,
            Providers { log: Box::new(PrintlnLog) },
        )
        .unwrap();

        Self { proto: Arc::new(proto), fwd, db }
    }

    /// Handle every forwarding-plane event raised so far.
    pub fn pump(&self) -> usize {
        self.proto.process_fwd_events()
    }

    /// Release queued requests and handle their events until both run
    /// dry.
    pub fn settle(&self) {
        while self.fwd.release_all() + self.pump() > 0 {}
    }

    pub fn intf(&self, id: IfId) -> Interface {
        self.db.interface(id).unwrap()
    }

    /// A packet from a local VM.
    pub fn from_vm(
        &self,
        id: IfId,
        proto: Protocol,
        dst: &str,
        sport: u16,
        dport: u16,
    ) -> PktCtx {
        let intf = self.intf(id);
        PktCtx {
            key: FlowKey::new(intf.nh, intf.ip, ip(dst), proto, sport, dport),
            ingress: Ingress::Vm(id),
            vrf: intf.vrf,
            src_mac: Some(intf.mac),
            dst_mac: None,
            l2: false,
            decision: PolicyDecision::implicit_allow(),
        }
    }

    /// A bridged packet from a local VM to `dst_mac`.
    pub fn l2_from_vm(&self, id: IfId, dst: &str, dst_mac: MacAddr) -> PktCtx {
        PktCtx {
            dst_mac: Some(dst_mac),
            l2: true,
            ..self.from_vm(id, Protocol::UDP, dst, 5000, 6000)
        }
    }

    /// A packet from the fabric, arriving in `vrf` through `nh`.
    pub fn from_fabric(&self, nh: NhId, vrf: VrfId, key: (&str, &str)) -> PktCtx {
        PktCtx {
            key: tcp_key(nh, key.0, key.1, 40000, 22),
            ingress: Ingress::Fabric,
            vrf,
            src_mac: None,
            dst_mac: None,
            l2: false,
            decision: PolicyDecision::implicit_allow(),
        }
    }

    /// Process a packet and let the forwarding plane answer.
    pub fn process(&self, pkt: &PktCtx) -> PktResult {
        let res = self.proto.process_packet(pkt).unwrap();
        self.pump();
        res
    }

    pub fn entry(&self, key: &FlowKey) -> FlowEntry {
        match self.proto.entry(key) {
            Some(e) => e,
            None => {
                self.print_flows();
                panic!("no entry for {key}");
            }
        }
    }

    /// The key of the entry paired with `key`.
    pub fn reverse_of(&self, key: &FlowKey) -> FlowKey {
        match self.proto.lookup(key).and_then(|d| d.reverse) {
            Some(r) => r,
            None => {
                self.print_flows();
                panic!("{key} has no reverse");
            }
        }
    }

    pub fn slot_of(&self, key: &FlowKey) -> u32 {
        match self.entry(key).flow_handle() {
            Some(slot) => slot,
            None => {
                self.print_flows();
                panic!("{key} owns no slot");
            }
        }
    }

    pub fn dump(&self) -> DumpFlowsResp {
        self.proto.dump_flows(&DumpFlowsReq::default())
    }

    pub fn print_flows(&self) {
        print_flows(&self.dump()).unwrap();
        print_slots(&self.proto.dump_slots()).unwrap();
    }

    /// Every reverse reference must be returned by its target.
    pub fn assert_symmetric(&self) {
        for f in &self.dump().flows {
            let Some(r) = f.reverse else {
                continue;
            };
            let back = self.proto.lookup(&r).and_then(|d| d.reverse);
            if r == f.key || back != Some(f.key) {
                self.print_flows();
                panic!("{} -> {r} is not returned ({back:?})", f.key);
            }
        }
    }

    /// No slot may be owned by two entries, and every entry's slot
    /// must be recorded as its own.
    pub fn assert_single_ownership(&self) {
        let slots = self.proto.dump_slots();
        for f in &self.dump().flows {
            let Some(slot) = self.proto.entry(&f.key).and_then(|e| e.flow_handle()) else {
                continue;
            };
            let owner = slots.slots.iter().find(|s| s.slot == slot).and_then(|s| s.key);
            if owner != Some(f.key) {
                self.print_flows();
                panic!("{} holds slot {slot} owned by {owner:?}", f.key);
            }
        }
    }
}

impl Default for Lab {
    fn default() -> Self {
        Self::new()
    }
}
