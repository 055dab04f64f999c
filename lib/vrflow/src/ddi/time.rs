// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Moments in time.

use core::ops::Add;
use core::time::Duration;
use std::time::Instant;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;

/// A moment in time, measured against a monotonic clock.
///
/// Aging and audit take the current moment as an argument rather
/// than reading the clock themselves, which lets callers drive them
/// with synthetic time.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Moment {
    inner: Instant,
}

impl Moment {
    pub fn now() -> Self {
        Self { inner: Instant::now() }
    }

    /// The milliseconds elapsed from `earlier` to `self`, or zero if
    /// `earlier` is in the future.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        let delta = self.inner.saturating_duration_since(earlier.inner);
        u64::try_from(delta.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Add<Duration> for Moment {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self { inner: self.inner + rhs }
    }
}

/// A duration measured in milliseconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ttl(u64);

impl Ttl {
    pub const fn new_millis(millis: u64) -> Self {
        Ttl(millis)
    }

    pub const fn new_seconds(seconds: u64) -> Self {
        Ttl(seconds * MILLIS)
    }

    pub fn as_milliseconds(&self) -> u64 {
        self.0
    }

    /// Has `ttl` elapsed between `since` and `now`?
    pub fn is_expired(&self, since: Moment, now: Moment) -> bool {
        now.delta_as_millis(since) >= self.0
    }
}
