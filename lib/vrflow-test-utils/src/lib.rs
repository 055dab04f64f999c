// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

pub mod lab;
pub mod sim;

// Let's make our lives easier and pub use a bunch of stuff.
pub use lab::*;
pub use libc::EAGAIN;
pub use libc::EBUSY;
pub use libc::EINVAL;
pub use libc::ENOSPC;
pub use sim::SimFwdPlane;
pub use sim::SimSlot;
pub use uuid::Uuid;
pub use vrflow::ddi::time::Moment;
pub use vrflow::engine::FlowProto;
pub use vrflow::engine::FlowWorkers;
pub use vrflow::engine::Ingress;
pub use vrflow::engine::PktCtx;
pub use vrflow::engine::PktResult;
pub use vrflow::engine::PolicyDecision;
pub use vrflow::engine::Verdict;
pub use vrflow::engine::flow_entry::FlowEntry;
pub use vrflow::engine::fwd_plane::FlowAction;
pub use vrflow::engine::fwd_plane::FwdEvent;
pub use vrflow::engine::fwd_plane::FwdFlowStats;
pub use vrflow::engine::fwd_plane::TcpFlowFlags;
pub use vrflow::engine::nexthop::NextHop;
pub use vrflow::engine::nexthop::NhEncoding;
pub use vrflow::engine::route::Interface;
pub use vrflow::engine::route::NetView;
pub use vrflow::engine::route::RouteDb;
pub use vrflow::engine::route::RouteKind;
pub use vrflow_api::AgentCfg;
pub use vrflow_api::FlowFlags;
pub use vrflow_api::FlowKey;
pub use vrflow_api::HashFields;
pub use vrflow_api::IfId;
pub use vrflow_api::KSyncState;
pub use vrflow_api::NhId;
pub use vrflow_api::PolicyState;
pub use vrflow_api::Protocol;
pub use vrflow_api::RuleRef;
pub use vrflow_api::ShortReason;
pub use vrflow_api::VnId;
pub use vrflow_api::VrfId;

/// Check a condition, printing the flow table if it doesn't hold.
#[macro_export]
macro_rules! chk {
    ($lab:expr, $check:expr) => {
        if !$check {
            $lab.print_flows();
            panic!("assertion failed: {}", stringify!($check));
        }
    };
}

/// Assert that the entry for `$key` is short with `$reason`.
#[macro_export]
macro_rules! assert_short {
    ($lab:expr, $key:expr, $reason:expr) => {
        let e = $lab.entry(&$key);
        if e.short_reason() != Some($reason) {
            $lab.print_flows();
            panic!(
                "expected {} short with {}, got {:?}",
                $key,
                $reason,
                e.short_reason()
            );
        }
    };
}

/// Assert that the entry for `$key` is not short and owns a slot.
#[macro_export]
macro_rules! assert_active {
    ($lab:expr, $key:expr) => {
        let e = $lab.entry(&$key);
        if e.is_short() || e.ksync().state() != $crate::KSyncState::IndexSet {
            $lab.print_flows();
            panic!(
                "expected {} active, got {:?} in {}",
                $key,
                e.short_reason(),
                e.ksync().state()
            );
        }
    };
}

/// Assert the number of entries the engine holds.
#[macro_export]
macro_rules! assert_num_flows {
    ($lab:expr, $n:expr) => {
        let num = $lab.proto.num_flows();
        if num != $n {
            $lab.print_flows();
            panic!("expected {} flows, found {}", $n, num);
        }
    };
}
