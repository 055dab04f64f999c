// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Introspection commands, driven through their encoded form.

use common::*;
use serde::Serialize;
use serde::de::DeserializeOwned;
use vrflow::engine::ioctl::handle_cmd;
use vrflow_api::API_VERSION;
use vrflow_api::DeleteFlowReq;
use vrflow_api::DumpFlowsReq;
use vrflow_api::DumpFlowsResp;
use vrflow_api::DumpSlotsResp;
use vrflow_api::FlowCmd;
use vrflow_api::FlowCmdIoctl;
use vrflow_api::FlowEntryDump;
use vrflow_api::FlowError;
use vrflow_api::FlowStatsResp;
use vrflow_api::GetFlowReq;
use vrflow_api::NoResp;
use vrflow_test_utils as common;

// If we are running `cargo test`, then make sure to
// register the USDT probes before running any tests.
#[cfg(test)]
#[ctor::ctor]
fn register_usdt() {
    usdt::register_probes().unwrap();
}

fn run<R: Serialize, T: DeserializeOwned>(
    lab: &Lab,
    cmd: FlowCmd,
    req: Option<&R>,
) -> Result<T, FlowError> {
    let ioctl = FlowCmdIoctl::new(cmd, req).unwrap();
    let resp = handle_cmd(&lab.proto, &ioctl);
    lab.pump();
    FlowCmdIoctl::decode_resp(&resp)
}

/// A lab holding one full pair and one short pair.
fn populated() -> (Lab, FlowKey, FlowKey) {
    let lab = Lab::new();
    let live = lab.from_vm(VM_A, Protocol::TCP, REMOTE_IP, 1000, 80);
    let dead = lab.from_vm(VM_A, Protocol::TCP, "10.0.0.77", 1000, 80);
    lab.process(&live);
    lab.process(&dead);
    (lab, live.key, dead.key)
}

#[test]
fn dump_flows() {
    let (lab, live, dead) = populated();

    let resp: DumpFlowsResp =
        run(&lab, FlowCmd::DumpFlows, Some(&DumpFlowsReq::default())).unwrap();
    assert_eq!(resp.num_flows, 4);
    assert_eq!(resp.flows.len(), 4);
    assert_eq!(resp.limit, lab.proto.cfg().max_system_flows);
    assert!(resp.flows.iter().any(|f| f.key == live));
    assert!(resp.flows.iter().any(|f| f.key == dead));

    // No body at all is the same as the default request.
    let bare: DumpFlowsResp =
        run(&lab, FlowCmd::DumpFlows, None::<&()>).unwrap();
    assert_eq!(bare.flows, resp.flows);

    let short: DumpFlowsResp = run(
        &lab,
        FlowCmd::DumpFlows,
        Some(&DumpFlowsReq { short_only: true }),
    )
    .unwrap();
    assert_eq!(short.flows.len(), 2);
    assert!(short.flows.iter().all(|f| f.short_reason.is_some()));
    assert!(short.flows.iter().any(|f| f.key == dead));
}

#[test]
fn get_flow() {
    let (lab, live, dead) = populated();

    let dump: FlowEntryDump =
        run(&lab, FlowCmd::GetFlow, Some(&GetFlowReq { key: live })).unwrap();
    assert_eq!(dump.key, live);
    assert_eq!(dump.ksync_state, KSyncState::IndexSet);
    assert_eq!(dump.flow_handle, lab.slot_of(&live));
    assert_eq!(dump.reverse, Some(lab.reverse_of(&live)));
    assert_eq!(dump.short_reason, None);
    assert_eq!(dump.vm, Some(VM_A));

    let dump: FlowEntryDump =
        run(&lab, FlowCmd::GetFlow, Some(&GetFlowReq { key: dead })).unwrap();
    assert_eq!(dump.short_reason, Some(ShortReason::NoDstRoute));

    let missing = tcp_key(VM_A_NH, VM_A_IP, REMOTE_IP, 9, 9);
    let res: Result<FlowEntryDump, _> =
        run(&lab, FlowCmd::GetFlow, Some(&GetFlowReq { key: missing }));
    assert!(matches!(res, Err(FlowError::FlowNotFound(_))));
}

#[test]
fn get_flow_requires_body() {
    let (lab, _, _) = populated();
    let res: Result<FlowEntryDump, _> =
        run(&lab, FlowCmd::GetFlow, None::<&()>);
    assert_eq!(res.unwrap_err(), FlowError::NoRequestBody);
}

#[test]
fn delete_and_clear() {
    let (lab, live, dead) = populated();
    let rkey = lab.reverse_of(&live);

    // Deleting by the reverse key removes the whole pair.
    let _: NoResp =
        run(&lab, FlowCmd::DeleteFlow, Some(&DeleteFlowReq { key: rkey }))
            .unwrap();
    assert!(lab.proto.lookup(&live).is_none());
    assert!(lab.proto.lookup(&rkey).is_none());
    assert_num_flows!(lab, 2);

    let res: Result<NoResp, _> =
        run(&lab, FlowCmd::DeleteFlow, Some(&DeleteFlowReq { key: live }));
    assert!(matches!(res, Err(FlowError::FlowNotFound(_))));

    let _: NoResp = run(&lab, FlowCmd::ClearFlows, None::<&()>).unwrap();
    assert!(lab.proto.lookup(&dead).is_none());
    assert_num_flows!(lab, 0);
    assert_eq!(lab.fwd.num_slots(), 0);
}

#[test]
fn flow_stats() {
    let (lab, _, dead) = populated();

    let stats: FlowStatsResp =
        run(&lab, FlowCmd::FlowStats, None::<&()>).unwrap();
    assert_eq!(stats.active_flows, 4);
    assert_eq!(stats.created, 4);
    assert_eq!(stats.deleted, 0);
    assert_eq!(stats, lab.proto.stats());
    assert!(
        stats
            .short
            .iter()
            .any(|(r, n)| *r == ShortReason::NoDstRoute && *n >= 1)
    );

    lab.proto.delete(&dead).unwrap();
    lab.pump();
    let stats: FlowStatsResp =
        run(&lab, FlowCmd::FlowStats, None::<&()>).unwrap();
    assert_eq!(stats.active_flows, 2);
    assert_eq!(stats.deleted, 2);
}

#[test]
fn dump_slots() {
    let (lab, live, _) = populated();

    let resp: DumpSlotsResp =
        run(&lab, FlowCmd::DumpSlots, None::<&()>).unwrap();
    assert_eq!(resp.slots.len(), 4);
    assert!(resp.slots.iter().all(|s| !s.deleting));

    let slot = lab.slot_of(&live);
    let owned = resp.slots.iter().find(|s| s.slot == slot).unwrap();
    assert_eq!(owned.key, Some(live));
}

#[test]
fn bad_api_version() {
    let lab = Lab::new();
    let mut ioctl = FlowCmdIoctl::new(FlowCmd::FlowStats, None::<&()>).unwrap();
    ioctl.api_version = API_VERSION + 1;

    let res: Result<FlowStatsResp, _> =
        FlowCmdIoctl::decode_resp(&handle_cmd(&lab.proto, &ioctl));
    assert_eq!(
        res.unwrap_err(),
        FlowError::BadApiVersion { user: API_VERSION + 1, engine: API_VERSION }
    );
}

#[test]
fn bad_cmd() {
    let lab = Lab::new();
    let mut ioctl = FlowCmdIoctl::new(FlowCmd::FlowStats, None::<&()>).unwrap();
    ioctl.cmd = 99;

    let res: Result<FlowStatsResp, _> =
        FlowCmdIoctl::decode_resp(&handle_cmd(&lab.proto, &ioctl));
    assert_eq!(res.unwrap_err(), FlowError::BadCmd(99));
}

#[test]
fn malformed_request() {
    let lab = Lab::new();
    let mut ioctl = FlowCmdIoctl::new(FlowCmd::GetFlow, None::<&()>).unwrap();
    ioctl.req_bytes = vec![0xff];

    let res: Result<FlowEntryDump, _> =
        FlowCmdIoctl::decode_resp(&handle_cmd(&lab.proto, &ioctl));
    assert!(matches!(res, Err(FlowError::DeserCmdReq(_))));
}
