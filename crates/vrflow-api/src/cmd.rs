// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::API_VERSION;
use super::ecmp::HashFields;
use super::flow::FlowFlags;
use super::flow::FlowKey;
use super::flow::KSyncState;
use super::flow::RuleRef;
use super::flow::ShortReason;
use super::net::IfId;
use super::net::NhId;
use super::net::VnId;
use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::net::IpAddr;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum FlowCmd {
    DumpFlows = 1,   // dump every flow entry
    GetFlow = 2,     // detail for one flow key
    DeleteFlow = 10, // delete one flow pair
    ClearFlows = 11, // delete every flow pair
    FlowStats = 20,  // engine counters
    DumpSlots = 21,  // forwarding-plane slot ownership
}

impl TryFrom<u32> for FlowCmd {
    type Error = ();

    fn try_from(num: u32) -> Result<Self, Self::Error> {
        match num {
            1 => Ok(Self::DumpFlows),
            2 => Ok(Self::GetFlow),
            10 => Ok(Self::DeleteFlow),
            11 => Ok(Self::ClearFlows),
            20 => Ok(Self::FlowStats),
            21 => Ok(Self::DumpSlots),
            _ => Err(()),
        }
    }
}

/// The envelope carrying one introspection command.
///
/// The command's request body is postcard-encoded into `req_bytes`;
/// the reply is always a postcard-encoded `Result<Resp, FlowError>`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FlowCmdIoctl {
    pub api_version: u64,
    pub cmd: u32,
    pub req_bytes: Vec<u8>,
}

impl FlowCmdIoctl {
    pub fn new<R: Serialize>(
        cmd: FlowCmd,
        req: Option<&R>,
    ) -> Result<Self, FlowError> {
        let req_bytes = match req {
            Some(req) => postcard::to_allocvec(req)
                .map_err(|e| FlowError::SerCmdReq(e.to_string()))?,
            None => Vec::new(),
        };

        Ok(Self { api_version: API_VERSION, cmd: cmd as u32, req_bytes })
    }

    /// Is this the expected API version?
    pub fn check_version(&self) -> bool {
        self.api_version == API_VERSION
    }

    /// Decode the reply to a command.
    pub fn decode_resp<T: DeserializeOwned>(
        bytes: &[u8],
    ) -> Result<T, FlowError> {
        match postcard::from_bytes::<Result<T, FlowError>>(bytes) {
            Ok(resp) => resp,
            Err(e) => Err(FlowError::DeserCmdResp(e.to_string())),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FlowError {
    BadApiVersion {
        user: u64,
        engine: u64,
    },
    BadCmd(u32),
    BadState(String),
    /// A flow entry violated one of its structural invariants and
    /// was retired.
    Consistency(String),
    DeserCmdReq(String),
    DeserCmdResp(String),
    FlowExists(String),
    FlowNotFound(String),
    InvalidCfg(String),
    MaxCapacity(u64),

    /// The command expects a request body but none was given.
    NoRequestBody,

    SerCmdReq(String),
    SerCmdResp(String),
    System {
        errno: i32,
        msg: String,
    },
    UnknownInterface(IfId),
    UnknownVn(VnId),
}

impl FlowError {
    /// Convert to an errno value.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::BadApiVersion { .. } => libc::EPROTO,
            Self::BadCmd(_) => libc::ENOTSUP,
            Self::BadState(_) => libc::EINVAL,
            Self::Consistency(_) => libc::EFAULT,
            Self::DeserCmdReq(_) => libc::ENOMSG,
            Self::DeserCmdResp(_) => libc::ENOMSG,
            Self::FlowExists(_) => libc::EEXIST,
            Self::FlowNotFound(_) => libc::ENOENT,
            Self::InvalidCfg(_) => libc::EINVAL,
            Self::MaxCapacity(_) => libc::ENFILE,
            Self::NoRequestBody => libc::EINVAL,
            Self::SerCmdReq(_) => libc::ENOMSG,
            Self::SerCmdResp(_) => libc::ENOMSG,
            Self::System { errno, .. } => *errno,
            Self::UnknownInterface(_) => libc::ENOENT,
            Self::UnknownVn(_) => libc::ENOENT,
        }
    }
}

impl Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadApiVersion { user, engine } => {
                write!(f, "API version mismatch: user {user} engine {engine}")
            }
            Self::BadCmd(cmd) => write!(f, "unknown command: {cmd}"),
            Self::BadState(msg) => write!(f, "bad state: {msg}"),
            Self::Consistency(msg) => write!(f, "consistency violation: {msg}"),
            Self::DeserCmdReq(msg) => write!(f, "bad request: {msg}"),
            Self::DeserCmdResp(msg) => write!(f, "bad response: {msg}"),
            Self::FlowExists(key) => write!(f, "flow exists: {key}"),
            Self::FlowNotFound(key) => write!(f, "flow not found: {key}"),
            Self::InvalidCfg(msg) => write!(f, "invalid config: {msg}"),
            Self::MaxCapacity(limit) => write!(f, "at capacity: {limit}"),
            Self::NoRequestBody => write!(f, "missing request body"),
            Self::SerCmdReq(msg) => write!(f, "request encode: {msg}"),
            Self::SerCmdResp(msg) => write!(f, "response encode: {msg}"),
            Self::System { errno, msg } => write!(f, "{msg} (errno {errno})"),
            Self::UnknownInterface(id) => write!(f, "unknown interface: {id}"),
            Self::UnknownVn(id) => write!(f, "unknown network: {id}"),
        }
    }
}

impl std::error::Error for FlowError {}

/// A marker trait indicating a success response type that is returned
/// from a command and may be passed across the API boundary.
pub trait CmdOk: Debug + Serialize {}

impl CmdOk for () {}

/// Indicates no meaningful response value on success.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct NoResp {
    pub unused: u64,
}

impl CmdOk for NoResp {}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NatDump {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub sport: u16,
    pub dport: u16,
}

/// The externally visible detail of one flow entry.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FlowEntryDump {
    pub key: FlowKey,
    /// The owned slot, or [`crate::FLOW_HANDLE_INVALID`].
    pub flow_handle: u32,
    pub ksync_state: KSyncState,
    pub evict_count: u32,
    pub flags: FlowFlags,
    pub short_reason: Option<ShortReason>,
    pub reverse: Option<FlowKey>,
    pub nat: Option<NatDump>,
    pub rpf_nh: Option<NhId>,
    pub src_nh: Option<NhId>,
    pub enable_rpf: bool,
    pub ecmp_fields: HashFields,
    pub linklocal_port: Option<u16>,
    pub fwd_rule: RuleRef,
    pub sg_rule: RuleRef,
    pub vm: Option<IfId>,
    pub vn: Option<VnId>,
    pub hits: u64,
    pub bytes: u64,
    pub packets: u64,
}

impl CmdOk for FlowEntryDump {}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DumpFlowsReq {
    /// Only report short flows.
    pub short_only: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DumpFlowsResp {
    pub limit: u32,
    pub num_flows: u32,
    pub flows: Vec<FlowEntryDump>,
}

impl CmdOk for DumpFlowsResp {}

#[derive(Debug, Deserialize, Serialize)]
pub struct GetFlowReq {
    pub key: FlowKey,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DeleteFlowReq {
    pub key: FlowKey,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowStatsResp {
    pub active_flows: u64,
    pub created: u64,
    pub deleted: u64,
    pub aged: u64,
    pub evicted: u64,
    pub transient_retries: u64,
    pub hard_failures: u64,
    pub audit_flows: u64,
    pub orphan_deletes: u64,
    pub stale_events: u64,
    pub consistency_retires: u64,
    /// Short flows created, by reason. Reasons never seen are omitted.
    pub short: Vec<(ShortReason, u64)>,
}

impl CmdOk for FlowStatsResp {}

#[derive(Debug, Deserialize, Serialize)]
pub struct SlotDump {
    pub slot: u32,
    pub key: Option<FlowKey>,
    /// A delete for this slot has been sent but not acknowledged.
    pub deleting: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DumpSlotsResp {
    pub slots: Vec<SlotDump>,
}

impl CmdOk for DumpSlotsResp {}
