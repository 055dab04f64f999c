// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

bitflags! {
    /// The 5-tuple fields that take part in ECMP hashing.
    #[derive(
        Clone,
        Copy,
        Debug,
        Default,
        Deserialize,
        Eq,
        Hash,
        Ord,
        PartialEq,
        PartialOrd,
        Serialize,
    )]
    pub struct HashFields: u8 {
        const SOURCE_IP = 1 << 0;
        const DESTINATION_IP = 1 << 1;
        const IP_PROTOCOL = 1 << 2;
        const SOURCE_PORT = 1 << 3;
        const DESTINATION_PORT = 1 << 4;
    }
}

impl HashFields {
    /// Each individual field, in bit order.
    pub const FIELDS: [HashFields; 5] = [
        Self::SOURCE_IP,
        Self::DESTINATION_IP,
        Self::IP_PROTOCOL,
        Self::SOURCE_PORT,
        Self::DESTINATION_PORT,
    ];

    /// The position of a single field in [`Self::FIELDS`].
    pub fn index(self) -> Option<usize> {
        Self::FIELDS.iter().position(|f| *f == self)
    }
}

impl Display for HashFields {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }

        let names = [
            (Self::SOURCE_IP, "sip"),
            (Self::DESTINATION_IP, "dip"),
            (Self::IP_PROTOCOL, "proto"),
            (Self::SOURCE_PORT, "sport"),
            (Self::DESTINATION_PORT, "dport"),
        ];
        let mut first = true;
        for (field, name) in names {
            if self.contains(field) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}
