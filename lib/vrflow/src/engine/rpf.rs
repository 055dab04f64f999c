// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Reverse-path nexthop selection.
//!
//! The forwarding plane validates that a flow's packets arrive
//! through the nexthop the agent would use to reach their source.
//! Which table is authoritative for that nexthop depends on the flow:
//!
//! * Routed (L3) flows use the unicast route for the source address.
//!   A subnet route, or a route whose nexthop cannot identify a
//!   source, falls back to the bridge route for the source MAC.
//! * Bridged (L2) flows use the bridge route for the source MAC. When
//!   that is an ECMP group the host route picks the member.
//!
//! A network with RPF disabled still resolves the source binding;
//! only the enforcement nexthop handed to the forwarding plane is
//! withheld.

use super::flow_entry::RpfData;
use super::route::NetView;
use super::route::RouteKind;
use std::net::IpAddr;
use vrflow_api::MacAddr;
use vrflow_api::NhId;
use vrflow_api::ShortReason;
use vrflow_api::VnId;
use vrflow_api::VrfId;

/// What RPF is resolved from.
#[derive(Clone, Copy, Debug)]
pub struct RpfQuery {
    pub vrf: VrfId,
    pub src: IpAddr,
    pub src_mac: Option<MacAddr>,
    pub l2: bool,
}

/// A resolved source binding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RpfSource {
    pub nh: NhId,
    pub l2_fallback: bool,
}

/// Resolve the nexthop `q.src` is reachable through.
pub fn resolve_source(
    net: &dyn NetView,
    q: &RpfQuery,
) -> Result<RpfSource, ShortReason> {
    if q.l2 { resolve_l2(net, q) } else { resolve_l3(net, q) }
}

fn resolve_l3(
    net: &dyn NetView,
    q: &RpfQuery,
) -> Result<RpfSource, ShortReason> {
    let route = net.route(q.vrf, q.src).ok_or(ShortReason::NoSrcRoute)?;
    let nh = net.nexthop(route.nh);

    match nh {
        Some(nh) if route.kind == RouteKind::Normal && nh.rpf_usable() => {
            if nh.is_composite() {
                // An ECMP source is pinned to the member its MAC is
                // learned on, when known.
                if let Some(bnh) = q.src_mac.and_then(|m| net.bridge(q.vrf, m)) {
                    return Ok(RpfSource { nh: bnh, l2_fallback: true });
                }
            }

            Ok(RpfSource { nh: route.nh, l2_fallback: false })
        }

        _ => bridge_fallback(net, q),
    }
}

fn bridge_fallback(
    net: &dyn NetView,
    q: &RpfQuery,
) -> Result<RpfSource, ShortReason> {
    let Some(mac) = q.src_mac else {
        return Err(ShortReason::NoSrcRoute);
    };

    match net.bridge(q.vrf, mac) {
        Some(nh) => Ok(RpfSource { nh, l2_fallback: true }),
        None => Err(ShortReason::NoSrcRouteL2Rpf),
    }
}

fn resolve_l2(
    net: &dyn NetView,
    q: &RpfQuery,
) -> Result<RpfSource, ShortReason> {
    let mac = q.src_mac.ok_or(ShortReason::NoSrcRoute)?;
    let bnh = net.bridge(q.vrf, mac).ok_or(ShortReason::NoSrcRoute)?;

    let composite = net.nexthop(bnh).is_some_and(|nh| nh.is_composite());
    if composite {
        if let Some(route) = net.route(q.vrf, q.src) {
            let usable = net
                .nexthop(route.nh)
                .is_some_and(|nh| nh.rpf_usable() && !nh.is_composite());
            if route.kind == RouteKind::Normal && usable {
                return Ok(RpfSource { nh: route.nh, l2_fallback: false });
            }
        }
    }

    Ok(RpfSource { nh: bnh, l2_fallback: false })
}

/// Is RPF enabled on `vn`? Networks the view doesn't know keep the
/// default of enforcing.
pub fn rpf_enabled(net: &dyn NetView, vn: Option<VnId>) -> bool {
    vn.and_then(|vn| net.vn(vn)).is_none_or(|vn| vn.enable_rpf)
}

/// Build RPF state from a resolved source.
pub fn rpf_data(src: Option<RpfSource>, enabled: bool) -> RpfData {
    let src_nh = src.map(|s| s.nh);
    RpfData {
        src_nh,
        nh: if enabled { src_nh } else { None },
        enabled,
        l2_fallback: src.is_some_and(|s| s.l2_fallback),
    }
}

/// Resolve the nexthop the forwarding plane must check `q.src`
/// against, or `None` if RPF is disabled.
pub fn resolve_rpf_nexthop(
    net: &dyn NetView,
    q: &RpfQuery,
    enabled: bool,
) -> Result<Option<NhId>, ShortReason> {
    let src = resolve_source(net, q)?;
    Ok(rpf_data(Some(src), enabled).nh)
}

/// Apply the network's RPF setting to existing state. Returns `true`
/// if anything changed.
pub fn apply_enable(rpf: &mut RpfData, enabled: bool) -> bool {
    let next = RpfData {
        nh: if enabled { rpf.src_nh } else { None },
        enabled,
        ..*rpf
    };

    let changed = next != *rpf;
    *rpf = next;
    changed
}
