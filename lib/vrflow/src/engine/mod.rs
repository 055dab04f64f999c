// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The flow-cache engine.
pub mod aging;
pub mod classify;
pub mod ecmp;
pub mod flow_entry;
pub mod flow_table;
pub mod fwd_plane;
pub mod ioctl;
pub mod ksync;
pub mod nat;
pub mod nexthop;
pub mod proto;
pub mod route;
pub mod rpf;
pub mod stat;
pub mod worker;

pub use classify::Ingress;
pub use classify::PktCtx;
pub use classify::PolicyDecision;
pub use classify::Verdict;
pub use proto::FlowProto;
pub use proto::PktResult;
pub use worker::FlowWorkers;
