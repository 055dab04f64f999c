// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The flow cache of a virtual-router agent.
//!
//! Each packet that misses the forwarding plane's flow table is
//! classified here into a pair of flow entries, one per direction,
//! which are then programmed into forwarding-plane slots. The cache
//! tracks slot ownership through evictions and reuse, keeps entries
//! in step with routing, policy and translation changes, and ages
//! idle pairs out.

#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub use vrflow_api as api;

pub mod cfg;
pub mod ddi;
pub mod engine;
pub mod print;
pub mod provider;

// ================================================================
// DTrace USDT Provider
//
// Allowing us to use USDT to trace the flow-cache probes when running
// in std/test.
// ================================================================
#[cfg(feature = "usdt")]
#[usdt::provider]
mod vrflow_provider {
    fn flow__create(key: &str, short: &str) {}
    fn flow__short(key: &str, reason: &str) {}
    fn flow__evict(key: &str, slot: u32, evict_count: u32) {}
    fn flow__aged(key: &str, packets: u64) {}
    fn ksync__transition(key: &str, state: &str, slot: u32) {}
}
