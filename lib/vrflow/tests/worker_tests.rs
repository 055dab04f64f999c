// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The worker pool, run against the simulated forwarding plane.

use common::*;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use vrflow_test_utils as common;

// If we are running `cargo test`, then make sure to
// register the USDT probes before running any tests.
#[cfg(test)]
#[ctor::ctor]
fn register_usdt() {
    usdt::register_probes().unwrap();
}

fn wait_for(workers: &FlowWorkers, n: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while workers.processed() < n {
        assert!(Instant::now() < deadline, "workers stalled at {}", workers.processed());
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn workers_create_pairs() {
    let lab = Lab::new();
    let workers = FlowWorkers::start(lab.proto.clone()).unwrap();

    let pkts: Vec<PktCtx> = (1000..1032)
        .map(|sport| lab.from_vm(VM_A, Protocol::TCP, REMOTE_IP, sport, 80))
        .collect();
    for pkt in &pkts {
        workers.dispatch(*pkt).unwrap();
    }
    wait_for(&workers, pkts.len() as u64);
    workers.shutdown();

    assert_num_flows!(lab, 64);
    for pkt in &pkts {
        assert_active!(lab, pkt.key);
        assert_active!(lab, lab.reverse_of(&pkt.key));
    }
    lab.assert_symmetric();
    lab.assert_single_ownership();
}

#[test]
fn repeated_packets_share_one_pair() {
    let lab = Lab::new();
    let workers = FlowWorkers::start(lab.proto.clone()).unwrap();
    let pkt = lab.from_vm(VM_A, Protocol::UDP, REMOTE_IP, 5000, 53);

    for _ in 0..16 {
        workers.dispatch(pkt).unwrap();
    }
    wait_for(&workers, 16);
    workers.shutdown();

    assert_num_flows!(lab, 2);
    assert_eq!(lab.proto.stats().created, 2);
    assert_eq!(lab.entry(&pkt.key).counters().hits, 15);
}

#[test]
fn engine_outlives_pool() {
    let lab = Lab::new();
    let workers = FlowWorkers::start(lab.proto.clone()).unwrap();
    assert_eq!(workers.proto().num_partitions(), lab.proto.num_partitions());
    workers.shutdown();

    // The engine keeps working without the pool.
    let pkt = lab.from_vm(VM_A, Protocol::TCP, REMOTE_IP, 1000, 80);
    lab.process(&pkt);
    assert_active!(lab, pkt.key);
}
