// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Identifiers for the objects the flow layer consumes from the
//! routing and configuration layers.

use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
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
        pub struct $name(pub u32);

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }

        impl From<u32> for $name {
            fn from(val: u32) -> Self {
                Self(val)
            }
        }
    };
}

id_type!(
    /// A nexthop identifier, stable for the lifetime of the nexthop.
    NhId,
    "nh"
);
id_type!(
    /// A VM interface identifier.
    IfId,
    "if"
);
id_type!(
    /// A virtual network identifier.
    VnId,
    "vn"
);
id_type!(
    /// A forwarding table (VRF) identifier.
    VrfId,
    "vrf"
);

/// A MAC address.
#[derive(
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct MacAddr {
    inner: [u8; 6],
}

impl MacAddr {
    pub const BROADCAST: Self = Self { inner: [0xFF; 6] };
    pub const ZERO: Self = Self { inner: [0x00; 6] };

    pub const fn from_const(bytes: [u8; 6]) -> Self {
        Self { inner: bytes }
    }

    #[inline]
    pub fn bytes(&self) -> [u8; 6] {
        self.inner
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(bytes: [u8; 6]) -> Self {
        Self { inner: bytes }
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut n = 0;

        for octet in s.split(':') {
            if n == bytes.len() {
                return Err(format!("too many octets: {s}"));
            }

            bytes[n] = u8::from_str_radix(octet, 16)
                .map_err(|_| format!("bad octet: {octet}"))?;
            n += 1;
        }

        if n != bytes.len() {
            return Err(format!("incorrect number of bytes: {n}"));
        }

        Ok(MacAddr { inner: bytes })
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = &self.inner;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

// There's no reason to view the MAC address as its raw array, so
// just present it in a human-friendly manner.
impl Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MacAddr {{ inner: {self} }}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mac_parse() {
        let mac: MacAddr = "a8:40:25:ff:00:01".parse().unwrap();
        assert_eq!(mac.bytes(), [0xA8, 0x40, 0x25, 0xFF, 0x00, 0x01]);
        assert_eq!(mac.to_string(), "A8:40:25:FF:00:01");
        assert!("a8:40:25:ff:00".parse::<MacAddr>().is_err());
        assert!("a8:40:25:ff:00:01:02".parse::<MacAddr>().is_err());
        assert!("zz:40:25:ff:00:01".parse::<MacAddr>().is_err());
    }
}
