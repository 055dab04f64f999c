// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Nexthops, as consumed from the routing layer.

use core::fmt;
use core::fmt::Display;
use std::net::IpAddr;
use vrflow_api::IfId;
use vrflow_api::MacAddr;
use vrflow_api::NhId;
use vrflow_api::VrfId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TunnelEncap {
    MplsGre,
    MplsUdp,
    Vxlan,
}

/// Where a route sends traffic.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NextHop {
    /// A directly attached host resolved through ARP.
    Arp { ip: IpAddr, mac: MacAddr },
    /// A local VM interface.
    Interface { intf: IfId, mac: MacAddr },
    /// A remote compute node reached through an overlay tunnel.
    Tunnel { dst: IpAddr, encap: TunnelEncap },
    Mirror { dst: IpAddr },
    /// An ECMP group.
    Composite { members: Vec<NhId> },
    /// Continue the lookup in another forwarding table.
    Vrf { vrf: VrfId },
    /// Deliver to the agent host itself.
    Receive { vrf: VrfId },
    /// The route is known but its nexthop is not yet resolved.
    Resolve,
    Discard,
    /// Provider backbone bridging.
    Pbb { dst_mac: MacAddr, isid: u32, child: NhId },
}

/// The forwarding-plane view of a nexthop carried in a flow write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NhEncoding {
    Unicast(NhId),
    Ecmp { nh: NhId, component: u16 },
    Local,
    Drop,
}

impl NextHop {
    /// Can this nexthop be the source binding a return packet is
    /// validated against?
    pub fn rpf_usable(&self) -> bool {
        match self {
            Self::Arp { .. }
            | Self::Interface { .. }
            | Self::Tunnel { .. }
            | Self::Composite { .. }
            | Self::Pbb { .. } => true,

            Self::Mirror { .. }
            | Self::Vrf { .. }
            | Self::Receive { .. }
            | Self::Resolve
            | Self::Discard => false,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Composite { .. })
    }

    /// The local interface this nexthop delivers to, if any.
    pub fn local_interface(&self) -> Option<IfId> {
        match self {
            Self::Interface { intf, .. } => Some(*intf),
            Self::Arp { .. }
            | Self::Tunnel { .. }
            | Self::Mirror { .. }
            | Self::Composite { .. }
            | Self::Vrf { .. }
            | Self::Receive { .. }
            | Self::Resolve
            | Self::Discard
            | Self::Pbb { .. } => None,
        }
    }

    pub fn members(&self) -> &[NhId] {
        match self {
            Self::Composite { members } => members,
            _ => &[],
        }
    }

    /// Does this nexthop hold a reference to `nh`?
    ///
    /// Used to find the flows that must be revisited when `nh`
    /// changes or goes away.
    pub fn depends_on(&self, nh: NhId) -> bool {
        match self {
            Self::Composite { members } => members.contains(&nh),
            Self::Pbb { child, .. } => *child == nh,
            Self::Arp { .. }
            | Self::Interface { .. }
            | Self::Tunnel { .. }
            | Self::Mirror { .. }
            | Self::Vrf { .. }
            | Self::Receive { .. }
            | Self::Resolve
            | Self::Discard => false,
        }
    }

    /// Encode this nexthop for a flow write. `component` picks the
    /// ECMP member for composite nexthops.
    pub fn encode(&self, id: NhId, component: u16) -> NhEncoding {
        match self {
            Self::Arp { .. }
            | Self::Interface { .. }
            | Self::Tunnel { .. }
            | Self::Mirror { .. }
            | Self::Vrf { .. }
            | Self::Pbb { .. } => NhEncoding::Unicast(id),
            Self::Composite { .. } => NhEncoding::Ecmp { nh: id, component },
            Self::Receive { .. } => NhEncoding::Local,
            Self::Resolve | Self::Discard => NhEncoding::Drop,
        }
    }
}

impl Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Arp { ip, .. } => write!(f, "ARP({ip})"),
            Self::Interface { intf, .. } => write!(f, "INTF({intf})"),
            Self::Tunnel { dst, encap } => write!(f, "TUNNEL({dst},{encap:?})"),
            Self::Mirror { dst } => write!(f, "MIRROR({dst})"),
            Self::Composite { members } => {
                write!(f, "COMPOSITE({})", members.len())
            }
            Self::Vrf { vrf } => write!(f, "VRF({vrf})"),
            Self::Receive { vrf } => write!(f, "RECEIVE({vrf})"),
            Self::Resolve => write!(f, "RESOLVE"),
            Self::Discard => write!(f, "DISCARD"),
            Self::Pbb { isid, .. } => write!(f, "PBB({isid})"),
        }
    }
}
