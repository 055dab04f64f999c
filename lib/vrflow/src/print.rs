// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print command responses in a human-friendly manner.
//!
//! Used by integration tests to show the flow table when an
//! assertion fails.

use std::io::Write;
use tabwriter::TabWriter;
use vrflow_api::DumpFlowsResp;
use vrflow_api::DumpSlotsResp;
use vrflow_api::FLOW_HANDLE_INVALID;
use vrflow_api::FlowEntryDump;
use vrflow_api::FlowStatsResp;

/// Print a [`DumpFlowsResp`].
pub fn print_flows(resp: &DumpFlowsResp) -> std::io::Result<()> {
    print_flows_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpFlowsResp`] into a given writer.
pub fn print_flows_into(
    writer: &mut impl Write,
    resp: &DumpFlowsResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "Flows: {}/{}", resp.num_flows, resp.limit)?;
    write_hr(&mut t)?;
    print_flow_header(&mut t)?;
    for flow in &resp.flows {
        print_flow(&mut t, flow)?;
    }
    t.flush()
}

pub fn print_flow_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "KEY\tSLOT\tSTATE\tEVICTS\tFLAGS\tSHORT\tREVERSE\tNAT\tRPF NH")
}

pub fn print_flow(
    t: &mut impl Write,
    flow: &FlowEntryDump,
) -> std::io::Result<()> {
    let slot = if flow.flow_handle == FLOW_HANDLE_INVALID {
        "--".to_string()
    } else {
        flow.flow_handle.to_string()
    };
    let short = flow.short_reason.map(|r| r.to_string()).unwrap_or_else(|| "--".into());
    let reverse = flow.reverse.map(|k| k.to_string()).unwrap_or_else(|| "--".into());
    let nat = flow
        .nat
        .map(|n| format!("{}:{} -> {}:{}", n.src, n.sport, n.dst, n.dport))
        .unwrap_or_else(|| "--".into());
    let rpf = flow.rpf_nh.map(|nh| nh.to_string()).unwrap_or_else(|| "--".into());

    writeln!(
        t,
        "{}\t{slot}\t{}\t{}\t{:?}\t{short}\t{reverse}\t{nat}\t{rpf}",
        flow.key, flow.ksync_state, flow.evict_count, flow.flags,
    )
}

/// Print a [`DumpSlotsResp`].
pub fn print_slots(resp: &DumpSlotsResp) -> std::io::Result<()> {
    print_slots_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpSlotsResp`] into a given writer.
pub fn print_slots_into(
    writer: &mut impl Write,
    resp: &DumpSlotsResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "SLOT\tOWNER\tDELETING")?;
    for s in &resp.slots {
        let owner = s.key.map(|k| k.to_string()).unwrap_or_else(|| "--".into());
        writeln!(t, "{}\t{owner}\t{}", s.slot, s.deleting)?;
    }
    t.flush()
}

/// Print a [`FlowStatsResp`].
pub fn print_stats(resp: &FlowStatsResp) -> std::io::Result<()> {
    print_stats_into(&mut std::io::stdout(), resp)
}

/// Print a [`FlowStatsResp`] into a given writer.
pub fn print_stats_into(
    writer: &mut impl Write,
    resp: &FlowStatsResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "active\t{}", resp.active_flows)?;
    writeln!(t, "created\t{}", resp.created)?;
    writeln!(t, "deleted\t{}", resp.deleted)?;
    writeln!(t, "aged\t{}", resp.aged)?;
    writeln!(t, "evicted\t{}", resp.evicted)?;
    writeln!(t, "transient retries\t{}", resp.transient_retries)?;
    writeln!(t, "hard failures\t{}", resp.hard_failures)?;
    writeln!(t, "audit flows\t{}", resp.audit_flows)?;
    writeln!(t, "orphan deletes\t{}", resp.orphan_deletes)?;
    writeln!(t, "stale events\t{}", resp.stale_events)?;
    writeln!(t, "consistency retires\t{}", resp.consistency_retires)?;
    if !resp.short.is_empty() {
        write_hr(&mut t)?;
        for (reason, n) in &resp.short {
            writeln!(t, "{reason}\t{n}")?;
        }
    }
    t.flush()
}

/// Print a horizontal rule into a given writer.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}
