// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod cfg;
pub mod cmd;
pub mod ecmp;
pub mod flow;
pub mod net;

pub use cfg::*;
pub use cmd::*;
pub use ecmp::*;
pub use flow::*;
pub use net::*;

/// The overall version of the API. Anytime an API is added, removed,
/// or modified, this number should increment. The engine refuses any
/// introspection request carrying a different value.
pub const API_VERSION: u64 = 3;
