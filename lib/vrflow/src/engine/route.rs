// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The view of routes, interfaces and virtual networks that the flow
//! layer consumes.
//!
//! Route resolution itself belongs to the routing layer; the flow
//! layer only asks questions through [`NetView`]. [`RouteDb`] is a
//! simple in-memory implementation for embedders that already have
//! resolved state to hand over, and for tests.

use super::nexthop::NextHop;
use crate::ddi::sync::KRwLock;
use ipnetwork::IpNetwork;
use std::collections::BTreeMap;
use std::net::IpAddr;
use vrflow_api::HashFields;
use vrflow_api::IfId;
use vrflow_api::MacAddr;
use vrflow_api::NhId;
use vrflow_api::VnId;
use vrflow_api::VrfId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteKind {
    /// An ordinary route.
    Normal,
    /// The subnet route of a virtual network. It exists to catch
    /// subnet broadcast and unresolved hosts; it never identifies a
    /// particular source.
    Subnet,
}

/// The result of a unicast route lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RouteInfo {
    pub vrf: VrfId,
    pub prefix: IpNetwork,
    pub nh: NhId,
    pub kind: RouteKind,
    /// The ECMP hash fields configured on the route, if any.
    pub hash_fields: Option<HashFields>,
}

impl RouteInfo {
    pub fn key(&self) -> RouteKey {
        RouteKey::new(self.vrf, self.prefix)
    }

    /// Is `addr` the broadcast address of this subnet route?
    pub fn is_subnet_broadcast(&self, addr: IpAddr) -> bool {
        match (self.kind, self.prefix, addr) {
            (RouteKind::Subnet, IpNetwork::V4(net), IpAddr::V4(ip)) => {
                net.prefix() < 32 && net.broadcast() == ip
            }
            _ => false,
        }
    }
}

/// Identifies one route.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RouteKey {
    pub vrf: VrfId,
    pub addr: IpAddr,
    pub plen: u8,
}

impl RouteKey {
    pub fn new(vrf: VrfId, prefix: IpNetwork) -> Self {
        Self { vrf, addr: prefix.network(), plen: prefix.prefix() }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FloatingIp {
    pub addr: IpAddr,
    pub vn: VnId,
    pub vrf: VrfId,
}

/// A VM interface.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Interface {
    pub id: IfId,
    pub vn: VnId,
    pub vrf: VrfId,
    /// The interface nexthop; flows originating from the VM carry it
    /// in their key.
    pub nh: NhId,
    pub mac: MacAddr,
    pub ip: IpAddr,
    /// The address the VM is known by to services hosted on the
    /// agent itself.
    pub mdata_ip: Option<IpAddr>,
    pub fips: Vec<FloatingIp>,
    pub active: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VnInfo {
    pub id: VnId,
    pub vrf: VrfId,
    pub enable_rpf: bool,
}

/// Route and bridge table changes delivered by the routing layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteEvent {
    /// A unicast route was added, or an existing one changed.
    Unicast { route: RouteInfo },
    UnicastDel { key: RouteKey, nh: NhId },
    Bridge { vrf: VrfId, mac: MacAddr, nh: NhId },
    BridgeDel { vrf: VrfId, mac: MacAddr },
    /// The member list of a composite nexthop changed.
    Composite { nh: NhId },
}

/// Read access to resolved routing state.
pub trait NetView: Send + Sync {
    fn interface(&self, id: IfId) -> Option<Interface>;

    fn vn(&self, id: VnId) -> Option<VnInfo>;

    /// Longest-prefix match for `addr` in `vrf`.
    fn route(&self, vrf: VrfId, addr: IpAddr) -> Option<RouteInfo>;

    /// Bridge (L2) route lookup.
    fn bridge(&self, vrf: VrfId, mac: MacAddr) -> Option<NhId>;

    fn nexthop(&self, id: NhId) -> Option<NextHop>;

    /// The local interface owning floating IP `addr` in `vrf`.
    fn fip_owner(&self, vrf: VrfId, addr: IpAddr) -> Option<(IfId, FloatingIp)>;

    /// The nexthop that packets from the fabric to the agent host
    /// arrive through.
    fn vhost_nh(&self) -> NhId;
}

#[derive(Default)]
struct RouteDbInner {
    routes: BTreeMap<VrfId, Vec<RouteInfo>>,
    bridges: BTreeMap<(VrfId, MacAddr), NhId>,
    nexthops: BTreeMap<NhId, NextHop>,
    intfs: BTreeMap<IfId, Interface>,
    vns: BTreeMap<VnId, VnInfo>,
}

/// An in-memory [`NetView`].
pub struct RouteDb {
    vhost_nh: NhId,
    inner: KRwLock<RouteDbInner>,
}

impl RouteDb {
    pub fn new(vhost_nh: NhId) -> Self {
        let db = Self { vhost_nh, inner: KRwLock::new(RouteDbInner::default()) };
        db.set_nexthop(vhost_nh, NextHop::Receive { vrf: VrfId(0) });
        db
    }

    pub fn set_nexthop(&self, id: NhId, nh: NextHop) {
        self.inner.write().nexthops.insert(id, nh);
    }

    pub fn del_nexthop(&self, id: NhId) -> Option<NextHop> {
        self.inner.write().nexthops.remove(&id)
    }

    /// Add or replace the route for `prefix`.
    pub fn add_route(
        &self,
        vrf: VrfId,
        prefix: IpNetwork,
        nh: NhId,
        kind: RouteKind,
        hash_fields: Option<HashFields>,
    ) -> RouteEvent {
        let route = RouteInfo { vrf, prefix, nh, kind, hash_fields };
        let mut inner = self.inner.write();
        let routes = inner.routes.entry(vrf).or_default();
        routes.retain(|r| r.prefix != prefix);
        routes.push(route);
        RouteEvent::Unicast { route }
    }

    pub fn del_route(
        &self,
        vrf: VrfId,
        prefix: IpNetwork,
    ) -> Option<RouteEvent> {
        let mut inner = self.inner.write();
        let routes = inner.routes.get_mut(&vrf)?;
        let pos = routes.iter().position(|r| r.prefix == prefix)?;
        let route = routes.remove(pos);
        Some(RouteEvent::UnicastDel { key: route.key(), nh: route.nh })
    }

    pub fn add_bridge(&self, vrf: VrfId, mac: MacAddr, nh: NhId) -> RouteEvent {
        self.inner.write().bridges.insert((vrf, mac), nh);
        RouteEvent::Bridge { vrf, mac, nh }
    }

    pub fn del_bridge(&self, vrf: VrfId, mac: MacAddr) -> Option<RouteEvent> {
        self.inner
            .write()
            .bridges
            .remove(&(vrf, mac))
            .map(|_| RouteEvent::BridgeDel { vrf, mac })
    }

    pub fn set_interface(&self, intf: Interface) {
        let mut inner = self.inner.write();
        inner.nexthops.insert(
            intf.nh,
            NextHop::Interface { intf: intf.id, mac: intf.mac },
        );
        inner.intfs.insert(intf.id, intf);
    }

    pub fn del_interface(&self, id: IfId) -> Option<Interface> {
        self.inner.write().intfs.remove(&id)
    }

    pub fn set_vn(&self, vn: VnInfo) {
        self.inner.write().vns.insert(vn.id, vn);
    }

    /// Toggle RPF on a network. Returns `false` if the network is
    /// unknown.
    pub fn set_rpf(&self, id: VnId, enable: bool) -> bool {
        match self.inner.write().vns.get_mut(&id) {
            Some(vn) => {
                vn.enable_rpf = enable;
                true
            }
            None => false,
        }
    }
}

impl NetView for RouteDb {
    fn interface(&self, id: IfId) -> Option<Interface> {
        self.inner.read().intfs.get(&id).cloned()
    }

    fn vn(&self, id: VnId) -> Option<VnInfo> {
        self.inner.read().vns.get(&id).copied()
    }

    fn route(&self, vrf: VrfId, addr: IpAddr) -> Option<RouteInfo> {
        let inner = self.inner.read();
        inner
            .routes
            .get(&vrf)?
            .iter()
            .filter(|r| r.prefix.contains(addr))
            .max_by_key(|r| r.prefix.prefix())
            .copied()
    }

    fn bridge(&self, vrf: VrfId, mac: MacAddr) -> Option<NhId> {
        self.inner.read().bridges.get(&(vrf, mac)).copied()
    }

    fn nexthop(&self, id: NhId) -> Option<NextHop> {
        self.inner.read().nexthops.get(&id).cloned()
    }

    fn fip_owner(&self, vrf: VrfId, addr: IpAddr) -> Option<(IfId, FloatingIp)> {
        let inner = self.inner.read();
        inner.intfs.values().find_map(|intf| {
            intf.fips
                .iter()
                .find(|fip| fip.vrf == vrf && fip.addr == addr)
                .map(|fip| (intf.id, *fip))
        })
    }

    fn vhost_nh(&self) -> NhId {
        self.vhost_nh
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let db = RouteDb::new(NhId(1));
        let vrf = VrfId(2);
        db.add_route(
            vrf,
            "10.0.0.0/24".parse().unwrap(),
            NhId(10),
            RouteKind::Subnet,
            None,
        );
        db.add_route(
            vrf,
            "10.0.0.5/32".parse().unwrap(),
            NhId(11),
            RouteKind::Normal,
            None,
        );

        let r = db.route(vrf, "10.0.0.5".parse().unwrap()).unwrap();
        assert_eq!(r.nh, NhId(11));
        let r = db.route(vrf, "10.0.0.6".parse().unwrap()).unwrap();
        assert_eq!(r.nh, NhId(10));
        assert!(r.is_subnet_broadcast("10.0.0.255".parse().unwrap()));
        assert!(!r.is_subnet_broadcast("10.0.0.6".parse().unwrap()));
        assert!(db.route(VrfId(3), "10.0.0.5".parse().unwrap()).is_none());

        db.del_route(vrf, "10.0.0.5/32".parse().unwrap()).unwrap();
        let r = db.route(vrf, "10.0.0.5".parse().unwrap()).unwrap();
        assert_eq!(r.nh, NhId(10));
    }
}
