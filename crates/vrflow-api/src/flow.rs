// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow identity and the decision state exposed about a flow.

use super::net::NhId;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use std::net::IpAddr;
use uuid::Uuid;

/// The wire value for "no forwarding-plane slot".
pub const FLOW_HANDLE_INVALID: u32 = 0xFFFF_FFFF;

/// An IP protocol number.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Protocol(pub u8);

impl Protocol {
    pub const ICMP: Self = Self(1);
    pub const TCP: Self = Self(6);
    pub const UDP: Self = Self(17);
    pub const ICMPV6: Self = Self(58);

    /// Does this protocol carry ports that take part in flow
    /// identity?
    pub fn has_ports(&self) -> bool {
        *self == Self::TCP || *self == Self::UDP
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::ICMP => write!(f, "ICMP"),
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::ICMPV6 => write!(f, "ICMPv6"),
            Self(n) => write!(f, "PROTO{n}"),
        }
    }
}

/// The identity of one direction of a flow.
///
/// The `nh` field is the nexthop that determined the packet's origin
/// context; it disambiguates overlapping private address spaces
/// across virtual networks. Two packets with equal keys belong to the
/// same flow.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct FlowKey {
    pub nh: NhId,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: Protocol,
    pub sport: u16,
    pub dport: u16,
}

impl FlowKey {
    /// Create a key, dropping the ports of protocols that don't
    /// carry them.
    pub fn new(
        nh: NhId,
        src: IpAddr,
        dst: IpAddr,
        proto: Protocol,
        sport: u16,
        dport: u16,
    ) -> Self {
        let mut key = Self { nh, src, dst, proto, sport, dport };
        key.canonicalize();
        key
    }

    /// Zero the ports when the protocol doesn't use them.
    pub fn canonicalize(&mut self) {
        if !self.proto.has_ports() {
            self.sport = 0;
            self.dport = 0;
        }
    }

    /// Return the key of the opposite direction, as seen arriving
    /// through `nh`.
    pub fn reversed(&self, nh: NhId) -> Self {
        Self {
            nh,
            src: self.dst,
            dst: self.src,
            proto: self.proto,
            sport: self.dport,
            dport: self.sport,
        }
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}",
            self.nh, self.proto, self.src, self.sport, self.dst, self.dport,
        )
    }
}

/// Why a flow was demoted to a short flow.
///
/// The display strings are stable; they are what introspection and
/// log consumers match on.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[repr(u16)]
pub enum ShortReason {
    Unknown = 0,
    UnavailableInterface,
    Ipv4FwdDisabled,
    UnavailableVrf,
    NoSrcRoute,
    NoDstRoute,
    AuditEntry,
    VrfChange,
    NoReverseFlow,
    ReverseFlowChange,
    NatChange,
    FlowLimit,
    LinkLocalSrcNat,
    FailedVrouterInstall,
    InvalidL2Flow,
    FlowOnTsn,
    NoMirrorEntry,
    SameFlowRflowKey,
    PortMapDrop,
    NoSrcRouteL2Rpf,
    PolicyDeny,
}

impl ShortReason {
    pub const COUNT: usize = Self::PolicyDeny as usize + 1;

    pub const ALL: [ShortReason; Self::COUNT] = [
        Self::Unknown,
        Self::UnavailableInterface,
        Self::Ipv4FwdDisabled,
        Self::UnavailableVrf,
        Self::NoSrcRoute,
        Self::NoDstRoute,
        Self::AuditEntry,
        Self::VrfChange,
        Self::NoReverseFlow,
        Self::ReverseFlowChange,
        Self::NatChange,
        Self::FlowLimit,
        Self::LinkLocalSrcNat,
        Self::FailedVrouterInstall,
        Self::InvalidL2Flow,
        Self::FlowOnTsn,
        Self::NoMirrorEntry,
        Self::SameFlowRflowKey,
        Self::PortMapDrop,
        Self::NoSrcRouteL2Rpf,
        Self::PolicyDeny,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::UnavailableInterface => "UNAVIALABLE_INTERFACE",
            Self::Ipv4FwdDisabled => "IPV4_FWD_DIS",
            Self::UnavailableVrf => "UNAVIALABLE_VRF",
            Self::NoSrcRoute => "NO_SRC_ROUTE",
            Self::NoDstRoute => "NO_DST_ROUTE",
            Self::AuditEntry => "AUDIT_ENTRY",
            Self::VrfChange => "VRF_CHANGE",
            Self::NoReverseFlow => "NO_REVERSE_FLOW",
            Self::ReverseFlowChange => "REVERSE_FLOW_CHANGE",
            Self::NatChange => "NAT_CHANGE",
            Self::FlowLimit => "FLOW_LIMIT",
            Self::LinkLocalSrcNat => "LINKLOCAL_SRC_NAT",
            Self::FailedVrouterInstall => "FAILED_VROUTER_INSTALL",
            Self::InvalidL2Flow => "INVALID_L2_FLOW",
            Self::FlowOnTsn => "FLOW_ON_TSN",
            Self::NoMirrorEntry => "NO_MIRROR_ENTRY",
            Self::SameFlowRflowKey => "SAME_FLOW_RFLOW_KEY",
            Self::PortMapDrop => "PORT_MAP_DROP",
            Self::NoSrcRouteL2Rpf => "NO_SRC_ROUTE_L2RPF",
            Self::PolicyDeny => "POLICY_DENY",
        }
    }
}

impl Display for ShortReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The policy states that stand in for a rule UUID when no rule
/// authorized the flow.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum PolicyState {
    NotEvaluated,
    /// No ACL existed.
    ImplicitAllow,
    /// An ACL existed but no rule in it matched.
    ImplicitDeny,
    DefaultGwIcmpOrDns,
    LinkLocalFlow,
    MulticastFlow,
    NonIpFlow,
    BgpRouterServiceFlow,
}

impl PolicyState {
    const ALL: [PolicyState; 8] = [
        Self::NotEvaluated,
        Self::ImplicitAllow,
        Self::ImplicitDeny,
        Self::DefaultGwIcmpOrDns,
        Self::LinkLocalFlow,
        Self::MulticastFlow,
        Self::NonIpFlow,
        Self::BgpRouterServiceFlow,
    ];

    /// The reserved UUID reported for this state.
    pub const fn uuid(self) -> Uuid {
        let n = match self {
            Self::NotEvaluated => 0,
            Self::ImplicitAllow => 1,
            Self::ImplicitDeny => 2,
            Self::DefaultGwIcmpOrDns => 3,
            Self::LinkLocalFlow => 4,
            Self::MulticastFlow => 5,
            Self::NonIpFlow => 6,
            Self::BgpRouterServiceFlow => 7,
        };
        Uuid::from_u128(n)
    }
}

/// What authorized a flow: a real ACL/SG rule, or one of the
/// [`PolicyState`] sentinels.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum RuleRef {
    Rule(Uuid),
    State(PolicyState),
}

impl Default for RuleRef {
    fn default() -> Self {
        Self::State(PolicyState::NotEvaluated)
    }
}

impl RuleRef {
    /// Build a reference from a UUID reported by the policy layer.
    ///
    /// A reserved UUID is folded into its sentinel so that a sentinel
    /// never compares equal to a real rule.
    pub fn from_uuid(uuid: Uuid) -> Self {
        match PolicyState::ALL.iter().find(|s| s.uuid() == uuid) {
            Some(state) => Self::State(*state),
            None => Self::Rule(uuid),
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            Self::Rule(uuid) => *uuid,
            Self::State(state) => state.uuid(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, Self::State(_))
    }
}

impl Display for RuleRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Rule(uuid) => write!(f, "{uuid}"),
            Self::State(state) => write!(f, "{state:?}"),
        }
    }
}

bitflags! {
    /// Per-flow flags.
    #[derive(
        Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
    )]
    pub struct FlowFlags: u32 {
        const SHORT = 1 << 0;
        const NAT = 1 << 1;
        /// Set on the entry for the opposite direction of the
        /// original packet.
        const REVERSE = 1 << 2;
        const MULTICAST = 1 << 3;
        const LINKLOCAL = 1 << 4;
        const LINKLOCAL_BIND_LOCAL_PORT = 1 << 5;
        /// Both ends are local VM interfaces.
        const LOCAL = 1 << 6;
        const ECMP = 1 << 7;
        /// The original packet arrived from the fabric.
        const INGRESS = 1 << 8;
        const L2 = 1 << 9;
    }
}

/// The forwarding-plane slot state of a flow.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum KSyncState {
    Unassigned,
    PendingWrite,
    IndexSet,
    Evicted,
    Retired,
}

impl Display for KSyncState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Unassigned => "UNASSIGNED",
            Self::PendingWrite => "PENDING_WRITE",
            Self::IndexSet => "INDEX_SET",
            Self::Evicted => "EVICTED",
            Self::Retired => "RETIRED",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn portless_protocols_drop_ports() {
        let key = FlowKey::new(
            NhId(3),
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            Protocol::ICMP,
            1234,
            5678,
        );
        assert_eq!((key.sport, key.dport), (0, 0));

        let key = FlowKey::new(
            NhId(3),
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            Protocol::UDP,
            1234,
            53,
        );
        assert_eq!((key.sport, key.dport), (1234, 53));

        let rkey = key.reversed(NhId(9));
        assert_eq!(rkey.src, key.dst);
        assert_eq!((rkey.sport, rkey.dport), (53, 1234));
        assert_eq!(rkey.nh, NhId(9));
    }

    #[test]
    fn sentinels_never_equal_rules() {
        let allow = RuleRef::State(PolicyState::ImplicitAllow);
        assert_eq!(RuleRef::from_uuid(allow.uuid()), allow);
        assert!(RuleRef::from_uuid(allow.uuid()).is_sentinel());

        let rule = RuleRef::from_uuid(Uuid::from_u128(0xdead_beef_0001));
        assert!(!rule.is_sentinel());
        assert_ne!(rule, allow);
        assert_ne!(
            RuleRef::State(PolicyState::LinkLocalFlow),
            RuleRef::State(PolicyState::MulticastFlow)
        );
    }

    #[test]
    fn short_reason_strings() {
        assert_eq!(ShortReason::ALL.len(), ShortReason::COUNT);
        for (i, r) in ShortReason::ALL.iter().enumerate() {
            assert_eq!(*r as usize, i);
        }
        assert_eq!(
            ShortReason::UnavailableInterface.to_string(),
            "UNAVIALABLE_INTERFACE"
        );
        assert_eq!(
            ShortReason::NoSrcRouteL2Rpf.to_string(),
            "NO_SRC_ROUTE_L2RPF"
        );
    }
}
