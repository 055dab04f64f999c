// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The request/response contract with the forwarding plane.
//!
//! Requests are fire-and-forget. Their outcome, along with eviction
//! notices the forwarding plane raises on its own, comes back as
//! [`FwdEvent`]s on a channel drained by the engine.

use super::flow_entry::FlowHandle;
use super::flow_entry::NatData;
use super::nexthop::NhEncoding;
use bitflags::bitflags;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use vrflow_api::FlowFlags;
use vrflow_api::FlowKey;
use vrflow_api::HashFields;
use vrflow_api::NhId;

/// Identifies the write an event answers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReqToken {
    pub handle: FlowHandle,
    pub txn: u32,
    /// The write reprograms a slot the flow already owns.
    pub update: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlowAction {
    Forward,
    Nat,
    Drop,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FlowWriteReq {
    pub token: ReqToken,
    /// The slot to write, or `None` to let the forwarding plane pick
    /// a free one.
    pub slot: Option<u32>,
    pub key: FlowKey,
    pub action: FlowAction,
    pub nat: Option<NatData>,
    pub rpf_nh: Option<NhId>,
    pub nh: NhEncoding,
    pub ecmp_fields: HashFields,
    pub flags: FlowFlags,
    pub reverse_slot: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FwdReq {
    Write(FlowWriteReq),
    Delete { slot: u32 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FwdEvent {
    WriteAck { token: ReqToken, slot: u32 },
    WriteErr { token: ReqToken, errno: i32 },
    DeleteAck { slot: u32 },
    /// `slot` now belongs to some other flow.
    Evicted { slot: u32 },
}

bitflags! {
    /// TCP state the forwarding plane tracks per slot.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct TcpFlowFlags: u16 {
        const SYN = 1 << 0;
        const SYN_R = 1 << 1;
        const ESTABLISHED = 1 << 2;
        const ESTABLISHED_R = 1 << 3;
        const FIN = 1 << 4;
        const FIN_R = 1 << 5;
        const RST = 1 << 6;
        const HALF_CLOSE = 1 << 7;
    }
}

/// Per-slot counters.
///
/// Bytes are a 48-bit counter split into a 32-bit word and a 16-bit
/// overflow word; packets are 40 bits, split 32/8.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FwdFlowStats {
    pub bytes: u32,
    pub bytes_oflow: u16,
    pub packets: u32,
    pub packets_oflow: u8,
    pub tcp_flags: TcpFlowFlags,
}

pub const BYTES_WIDTH: u32 = 48;
pub const PACKETS_WIDTH: u32 = 40;

impl FwdFlowStats {
    pub fn total_bytes(&self) -> u64 {
        (u64::from(self.bytes_oflow) << 32) | u64::from(self.bytes)
    }

    pub fn total_packets(&self) -> u64 {
        (u64::from(self.packets_oflow) << 32) | u64::from(self.packets)
    }
}

/// The increase from `old` to `new` of a counter `width` bits wide,
/// allowing for one wrap.
pub fn counter_delta(old: u64, new: u64, width: u32) -> u64 {
    let mask = (1u64 << width) - 1;
    new.wrapping_sub(old) & mask
}

/// One entry seen by an audit scan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FwdEntryInfo {
    pub slot: u32,
    pub key: FlowKey,
    /// Allocated by the forwarding plane itself, with no write from
    /// the agent.
    pub held: bool,
}

/// The forwarding plane as seen by the engine.
pub trait FwdPlane: Send + Sync {
    /// Queue a request. The outcome arrives as a [`FwdEvent`].
    fn send(&self, req: FwdReq);

    /// Read the counters of `slot`.
    fn stats(&self, slot: u32) -> Option<FwdFlowStats>;

    /// List every occupied slot.
    fn scan(&self) -> Vec<FwdEntryInfo>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteErrorKind {
    /// The forwarding plane was temporarily unable to take the write.
    Transient,
    /// The write was rejected and must not be retried.
    Hard,
}

pub fn classify_errno(errno: i32) -> WriteErrorKind {
    match errno {
        libc::EAGAIN | libc::EBUSY | libc::ENOMEM | libc::EINTR => {
            WriteErrorKind::Transient
        }
        _ => WriteErrorKind::Hard,
    }
}

/// Create the channel the forwarding plane delivers events on.
pub fn event_channel() -> (Sender<FwdEvent>, Receiver<FwdEvent>) {
    crossbeam_channel::unbounded()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_classes() {
        assert_eq!(classify_errno(libc::EAGAIN), WriteErrorKind::Transient);
        assert_eq!(classify_errno(libc::EBUSY), WriteErrorKind::Transient);
        assert_eq!(classify_errno(libc::ENOSPC), WriteErrorKind::Hard);
        assert_eq!(classify_errno(libc::EINVAL), WriteErrorKind::Hard);
    }

    #[test]
    fn wrapped_counters() {
        let stats = FwdFlowStats {
            bytes: 5,
            bytes_oflow: 1,
            packets: 1,
            packets_oflow: 0,
            tcp_flags: TcpFlowFlags::empty(),
        };
        assert_eq!(stats.total_bytes(), (1 << 32) + 5);

        let max = (1u64 << BYTES_WIDTH) - 1;
        assert_eq!(counter_delta(max - 1, 3, BYTES_WIDTH), 5);
        assert_eq!(counter_delta(10, 10, BYTES_WIDTH), 0);
        assert_eq!(counter_delta(10, 15, PACKETS_WIDTH), 5);
    }
}
