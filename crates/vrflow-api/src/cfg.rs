// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Agent-wide configuration consumed by the flow layer.

use serde::Deserialize;
use serde::Serialize;
use std::net::IpAddr;

pub const DEF_PARTITIONS: u16 = 4;
pub const DEF_LINKLOCAL_VM_FLOWS: u32 = 1024;
pub const DEF_LINKLOCAL_SYSTEM_FLOWS: u32 = 2048;
pub const DEF_FLOW_AGE_MS: u64 = 180_000;
pub const DEF_SHORT_FLOW_AGE_MS: u64 = 5_000;
pub const DEF_TCP_SYN_AGE_MS: u64 = 10_000;
pub const DEF_AUDIT_GRACE_MS: u64 = 5_000;

/// An inclusive port range.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn len(&self) -> u32 {
        if self.end < self.start {
            0
        } else {
            u32::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self { start: 49152, end: 65535 }
    }
}

/// A fabric-reachable server backing a link-local service.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FabricEndpoint {
    pub ip: IpAddr,
    pub port: u16,
}

/// A virtual-only service address rewritten to real fabric servers.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LinkLocalService {
    pub name: String,
    pub vip: IpAddr,
    pub vport: u16,
    pub fabric: Vec<FabricEndpoint>,
}

/// Agent-wide flow configuration.
///
/// A ceiling of zero means "no limit".
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct AgentCfg {
    /// Number of flow partitions, and therefore packet workers.
    pub partitions: u16,
    /// Maximum non-short flows attributed to one VM interface.
    pub max_vm_flows: u32,
    /// Maximum flows held by the agent.
    pub max_system_flows: u32,
    /// Maximum simultaneous link-local flows per VM.
    pub linklocal_vm_flows: u32,
    /// Maximum simultaneous link-local flows agent-wide.
    pub linklocal_system_flows: u32,
    /// Source ports handed out to link-local flows.
    pub linklocal_port_range: PortRange,
    /// Idle interval after which a flow pair ages out.
    pub flow_age_ms: u64,
    pub short_flow_age_ms: u64,
    pub tcp_syn_age_ms: u64,
    pub delete_short_flows: bool,
    /// How long a held forwarding-plane entry may stay unclaimed
    /// before audit takes it over.
    pub audit_grace_ms: u64,
    /// The agent's fabric address, used as the link-local NAT
    /// source.
    pub router_id: Option<IpAddr>,
    pub linklocal_services: Vec<LinkLocalService>,
}

impl Default for AgentCfg {
    fn default() -> Self {
        Self {
            partitions: DEF_PARTITIONS,
            max_vm_flows: 0,
            max_system_flows: 0,
            linklocal_vm_flows: DEF_LINKLOCAL_VM_FLOWS,
            linklocal_system_flows: DEF_LINKLOCAL_SYSTEM_FLOWS,
            linklocal_port_range: PortRange::default(),
            flow_age_ms: DEF_FLOW_AGE_MS,
            short_flow_age_ms: DEF_SHORT_FLOW_AGE_MS,
            tcp_syn_age_ms: DEF_TCP_SYN_AGE_MS,
            delete_short_flows: true,
            audit_grace_ms: DEF_AUDIT_GRACE_MS,
            router_id: None,
            linklocal_services: Vec::new(),
        }
    }
}

impl AgentCfg {
    /// Find the link-local service bound to `vip:vport`.
    pub fn linklocal_service(
        &self,
        vip: IpAddr,
        vport: u16,
    ) -> Option<&LinkLocalService> {
        self.linklocal_services
            .iter()
            .find(|s| s.vip == vip && s.vport == vport)
    }
}
