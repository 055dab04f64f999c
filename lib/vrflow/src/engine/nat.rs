// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Address translation for floating-IP and link-local flows.
//!
//! The resolver only decides the rewrite of the forward direction.
//! The reverse direction always undoes it: its translation restores
//! the forward key, so it is derived by the classifier rather than
//! resolved here.

use super::flow_entry::NatData;
use super::route::FloatingIp;
use super::route::Interface;
use super::route::NetView;
use crate::ddi::sync::KMutex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::IpAddr;
use vrflow_api::AgentCfg;
use vrflow_api::FabricEndpoint;
use vrflow_api::FlowKey;
use vrflow_api::IfId;
use vrflow_api::PortRange;
use vrflow_api::VrfId;

/// The VRF link-local traffic leaves the agent in.
pub const FABRIC_VRF: VrfId = VrfId(0);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NatKind {
    /// A VM's traffic leaving through one of its floating IPs.
    FloatingIpEgress,
    /// Fabric traffic addressed to a local floating IP.
    FloatingIpIngress,
    LinkLocal,
}

/// The rewrite of a forward flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NatTranslation {
    pub kind: NatKind,
    pub data: NatData,
    /// The floating IP used, if any.
    pub fip: Option<FloatingIp>,
    /// The link-local server chosen, if any.
    pub server: Option<FabricEndpoint>,
}

impl NatTranslation {
    pub fn is_linklocal(&self) -> bool {
        self.kind == NatKind::LinkLocal
    }
}

/// Agent-wide pool of link-local source ports.
///
/// Ports are handed out under two independent ceilings: flows per
/// originating VM and flows agent-wide. A ceiling of zero is
/// unlimited.
#[derive(Debug)]
pub struct LinkLocalPool {
    range: PortRange,
    in_use: BTreeSet<u16>,
    next: u16,
    per_vm: BTreeMap<IfId, u32>,
}

impl LinkLocalPool {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            in_use: BTreeSet::new(),
            next: range.start,
            per_vm: BTreeMap::new(),
        }
    }

    /// Replace the port range. Ports already handed out stay valid
    /// until released.
    pub fn set_range(&mut self, range: PortRange) {
        if self.range != range {
            self.range = range;
            self.next = range.start;
        }
    }

    /// Allocate a port for a new flow from `vm`.
    pub fn alloc(
        &mut self,
        vm: IfId,
        vm_max: u32,
        system_max: u32,
    ) -> Option<u16> {
        let vm_flows = self.vm_flows(vm);
        if vm_max != 0 && vm_flows >= vm_max {
            return None;
        }

        if system_max != 0 && self.in_use.len() >= system_max as usize {
            return None;
        }

        let port = self.next_free()?;
        self.in_use.insert(port);
        *self.per_vm.entry(vm).or_default() += 1;
        self.next = if port == self.range.end { self.range.start } else { port + 1 };
        Some(port)
    }

    fn next_free(&self) -> Option<u16> {
        if self.range.is_empty() {
            return None;
        }

        let after = (self.next..=self.range.end).find(|p| !self.in_use.contains(p));
        after.or_else(|| {
            (self.range.start..self.next).find(|p| !self.in_use.contains(p))
        })
    }

    /// Return `port`, held by a flow from `vm`, to the pool.
    pub fn release(&mut self, vm: IfId, port: u16) -> bool {
        if !self.in_use.remove(&port) {
            return false;
        }

        if let Some(n) = self.per_vm.get_mut(&vm) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.per_vm.remove(&vm);
            }
        }
        true
    }

    pub fn vm_flows(&self, vm: IfId) -> u32 {
        self.per_vm.get(&vm).copied().unwrap_or(0)
    }

    pub fn num_in_use(&self) -> usize {
        self.in_use.len()
    }
}

pub struct NatResolver {
    pool: KMutex<LinkLocalPool>,
}

impl NatResolver {
    pub fn new(range: PortRange) -> Self {
        Self { pool: KMutex::new(LinkLocalPool::new(range)) }
    }

    pub fn set_range(&self, range: PortRange) {
        self.pool.lock().set_range(range);
    }

    /// Resolve the translation for a packet from local VM `intf`.
    pub fn resolve_egress(
        &self,
        net: &dyn NetView,
        cfg: &AgentCfg,
        key: &FlowKey,
        intf: &Interface,
    ) -> Option<NatTranslation> {
        if let Some(svc) = cfg.linklocal_service(key.dst, key.dport) {
            let server = select_server(key, &svc.fabric)?;
            let router_id = cfg.router_id.unwrap_or(intf.ip);
            // A server hosted on the agent itself sees the VM by its
            // metadata address.
            let src = if Some(server.ip) == cfg.router_id {
                intf.mdata_ip.unwrap_or(router_id)
            } else {
                router_id
            };

            return Some(NatTranslation {
                kind: NatKind::LinkLocal,
                data: NatData {
                    src,
                    dst: server.ip,
                    sport: key.sport,
                    dport: server.port,
                    vrf: FABRIC_VRF,
                },
                fip: None,
                server: Some(server),
            });
        }

        let fip = select_fip(net, key.dst, intf)?;
        Some(NatTranslation {
            kind: NatKind::FloatingIpEgress,
            data: NatData {
                src: fip.addr,
                dst: key.dst,
                sport: key.sport,
                dport: key.dport,
                vrf: fip.vrf,
            },
            fip: Some(fip),
            server: None,
        })
    }

    /// Resolve the translation for a fabric packet arriving in `vrf`.
    pub fn resolve_ingress(
        &self,
        net: &dyn NetView,
        vrf: VrfId,
        key: &FlowKey,
    ) -> Option<(Interface, NatTranslation)> {
        let (owner, fip) = net.fip_owner(vrf, key.dst)?;
        let intf = net.interface(owner)?;
        let data = NatData {
            src: key.src,
            dst: intf.ip,
            sport: key.sport,
            dport: key.dport,
            vrf: intf.vrf,
        };

        let nat = NatTranslation {
            kind: NatKind::FloatingIpIngress,
            data,
            fip: Some(fip),
            server: None,
        };
        Some((intf, nat))
    }

    /// Allocate a link-local source port for a flow from `vm`.
    pub fn alloc_port(&self, vm: IfId, cfg: &AgentCfg) -> Option<u16> {
        self.pool.lock().alloc(
            vm,
            cfg.linklocal_vm_flows,
            cfg.linklocal_system_flows,
        )
    }

    pub fn release_port(&self, vm: IfId, port: u16) -> bool {
        self.pool.lock().release(vm, port)
    }

    pub fn linklocal_vm_flows(&self, vm: IfId) -> u32 {
        self.pool.lock().vm_flows(vm)
    }

    pub fn linklocal_flows(&self) -> usize {
        self.pool.lock().num_in_use()
    }
}

/// Pick a server for `key`, spreading flows by hash.
fn select_server(
    key: &FlowKey,
    servers: &[FabricEndpoint],
) -> Option<FabricEndpoint> {
    if servers.is_empty() {
        return None;
    }

    let mut h = crc32fast::Hasher::new();
    for ip in [key.src, key.dst] {
        match ip {
            IpAddr::V4(ip) => h.update(&ip.octets()),
            IpAddr::V6(ip) => h.update(&ip.octets()),
        }
    }
    h.update(&[key.proto.0]);
    h.update(&key.sport.to_be_bytes());
    h.update(&key.dport.to_be_bytes());
    let idx = h.finalize() as usize % servers.len();
    Some(servers[idx])
}

/// Choose the floating IP, if any, a VM's packet to `dst` leaves
/// through.
///
/// A floating IP is used when its VRF has a more specific route to
/// `dst` than the interface's own VRF. On a tie, a floating IP in the
/// interface's own network still wins; one from another network
/// loses to the native route.
fn select_fip(
    net: &dyn NetView,
    dst: IpAddr,
    intf: &Interface,
) -> Option<FloatingIp> {
    let native = net.route(intf.vrf, dst).map(|r| r.prefix.prefix());

    let best = intf
        .fips
        .iter()
        .filter_map(|fip| {
            let plen = net.route(fip.vrf, dst)?.prefix.prefix();
            Some((plen, fip.vn == intf.vn, *fip))
        })
        .max_by_key(|(plen, same_vn, _)| (*plen, *same_vn))?;

    let (plen, same_vn, fip) = best;
    match native {
        None => Some(fip),
        Some(native) if plen > native => Some(fip),
        Some(native) if plen == native && same_vn => Some(fip),
        Some(_) => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::route::RouteDb;
    use crate::engine::route::RouteKind;
    use vrflow_api::MacAddr;
    use vrflow_api::NhId;
    use vrflow_api::Protocol;
    use vrflow_api::VnId;

    #[test]
    fn pool_ceilings_are_independent() {
        let mut pool = LinkLocalPool::new(PortRange { start: 100, end: 199 });
        let (a, b) = (IfId(1), IfId(2));

        assert_eq!(pool.alloc(a, 2, 3), Some(100));
        assert_eq!(pool.alloc(a, 2, 3), Some(101));
        // Per-VM ceiling.
        assert_eq!(pool.alloc(a, 2, 3), None);
        assert_eq!(pool.alloc(b, 2, 3), Some(102));
        // Agent-wide ceiling.
        assert_eq!(pool.alloc(b, 2, 3), None);

        assert!(pool.release(a, 100));
        assert!(!pool.release(a, 100));
        assert_eq!(pool.vm_flows(a), 1);
        assert_eq!(pool.alloc(b, 2, 3), Some(103));
        assert_eq!(pool.num_in_use(), 3);
    }

    #[test]
    fn pool_wraps_and_exhausts() {
        let mut pool = LinkLocalPool::new(PortRange { start: 10, end: 11 });
        let vm = IfId(1);
        assert_eq!(pool.alloc(vm, 0, 0), Some(10));
        assert_eq!(pool.alloc(vm, 0, 0), Some(11));
        assert_eq!(pool.alloc(vm, 0, 0), None);
        pool.release(vm, 10);
        assert_eq!(pool.alloc(vm, 0, 0), Some(10));
    }

    fn intf(fips: Vec<FloatingIp>) -> Interface {
        Interface {
            id: IfId(1),
            vn: VnId(1),
            vrf: VrfId(1),
            nh: NhId(10),
            mac: MacAddr::ZERO,
            ip: "10.0.0.5".parse().unwrap(),
            mdata_ip: None,
            fips,
            active: true,
        }
    }

    #[test]
    fn fip_needs_better_route() {
        let db = RouteDb::new(NhId(1));
        let dst: IpAddr = "198.51.100.7".parse().unwrap();
        let fip = FloatingIp {
            addr: "192.0.2.10".parse().unwrap(),
            vn: VnId(2),
            vrf: VrfId(2),
        };
        let i = intf(vec![fip]);

        assert_eq!(select_fip(&db, dst, &i), None);

        db.add_route(VrfId(2), "0.0.0.0/0".parse().unwrap(), NhId(20), RouteKind::Normal, None);
        assert_eq!(select_fip(&db, dst, &i), Some(fip));

        db.add_route(VrfId(1), "0.0.0.0/0".parse().unwrap(), NhId(21), RouteKind::Normal, None);
        assert_eq!(select_fip(&db, dst, &i), None);

        let same = FloatingIp { vn: VnId(1), ..fip };
        assert_eq!(select_fip(&db, dst, &intf(vec![same])), Some(same));
    }

    #[test]
    fn linklocal_translation() {
        let db = RouteDb::new(NhId(1));
        let mut cfg = AgentCfg::default();
        cfg.router_id = Some("172.16.0.1".parse().unwrap());
        cfg.linklocal_services.push(vrflow_api::LinkLocalService {
            name: "metadata".to_string(),
            vip: "169.254.169.254".parse().unwrap(),
            vport: 80,
            fabric: vec![FabricEndpoint {
                ip: "172.16.0.9".parse().unwrap(),
                port: 8775,
            }],
        });

        let nat = NatResolver::new(PortRange::default());
        let key = FlowKey::new(
            NhId(10),
            "10.0.0.5".parse().unwrap(),
            "169.254.169.254".parse().unwrap(),
            Protocol::TCP,
            33000,
            80,
        );
        let t = nat.resolve_egress(&db, &cfg, &key, &intf(vec![])).unwrap();
        assert!(t.is_linklocal());
        assert_eq!(t.data.src, cfg.router_id.unwrap());
        assert_eq!(t.data.dst, "172.16.0.9".parse::<IpAddr>().unwrap());
        assert_eq!(t.data.dport, 8775);
        assert_eq!(t.data.vrf, FABRIC_VRF);
    }
}
