// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Introspection command dispatch.

use super::proto::FlowProto;
use serde::de::DeserializeOwned;
use vrflow_api::API_VERSION;
use vrflow_api::CmdOk;
use vrflow_api::DeleteFlowReq;
use vrflow_api::DumpFlowsReq;
use vrflow_api::FlowCmd;
use vrflow_api::FlowCmdIoctl;
use vrflow_api::FlowError;
use vrflow_api::GetFlowReq;
use vrflow_api::NoResp;

struct IoctlEnvelope<'a> {
    ioctl: &'a FlowCmdIoctl,
}

impl IoctlEnvelope<'_> {
    fn copy_in_req<T: DeserializeOwned>(&self) -> Result<T, FlowError> {
        if self.ioctl.req_bytes.is_empty() {
            return Err(FlowError::NoRequestBody);
        }

        postcard::from_bytes(&self.ioctl.req_bytes)
            .map_err(|e| FlowError::DeserCmdReq(e.to_string()))
    }
}

/// Serialize a handler's result as the command's reply.
fn hdlr_resp<T: CmdOk>(resp: Result<T, FlowError>) -> Vec<u8> {
    let encoded = match &resp {
        Ok(v) => postcard::to_allocvec(&Ok::<&T, FlowError>(v)),
        Err(e) => postcard::to_allocvec(&Err::<(), &FlowError>(e)),
    };

    encoded.unwrap_or_else(|e| {
        let err = FlowError::SerCmdResp(e.to_string());
        postcard::to_allocvec(&Err::<(), FlowError>(err)).unwrap_or_default()
    })
}

/// Run one introspection command, returning the encoded reply.
pub fn handle_cmd(proto: &FlowProto, ioctl: &FlowCmdIoctl) -> Vec<u8> {
    if !ioctl.check_version() {
        return hdlr_resp::<()>(Err(FlowError::BadApiVersion {
            user: ioctl.api_version,
            engine: API_VERSION,
        }));
    }

    let env = IoctlEnvelope { ioctl };
    let Ok(cmd) = FlowCmd::try_from(ioctl.cmd) else {
        return hdlr_resp::<()>(Err(FlowError::BadCmd(ioctl.cmd)));
    };

    match cmd {
        FlowCmd::DumpFlows => {
            // An absent body asks for everything.
            let req = match env.copy_in_req::<DumpFlowsReq>() {
                Err(FlowError::NoRequestBody) => Ok(DumpFlowsReq::default()),
                res => res,
            };
            hdlr_resp(req.map(|req| proto.dump_flows(&req)))
        }

        FlowCmd::GetFlow => {
            let resp = env
                .copy_in_req::<GetFlowReq>()
                .and_then(|req| proto.get_flow(&req.key));
            hdlr_resp(resp)
        }

        FlowCmd::DeleteFlow => {
            let resp = env
                .copy_in_req::<DeleteFlowReq>()
                .and_then(|req| proto.delete(&req.key))
                .map(|_| NoResp::default());
            hdlr_resp(resp)
        }

        FlowCmd::ClearFlows => {
            proto.delete_all();
            hdlr_resp(Ok(NoResp::default()))
        }

        FlowCmd::FlowStats => hdlr_resp(Ok(proto.stats())),

        FlowCmd::DumpSlots => hdlr_resp(Ok(proto.dump_slots())),
    }
}
