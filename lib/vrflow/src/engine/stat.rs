// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Engine-wide counters.

use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use vrflow_api::FlowStatsResp;
use vrflow_api::ShortReason;

#[derive(Debug)]
pub struct FlowStats {
    pub created: AtomicU64,
    pub deleted: AtomicU64,
    pub aged: AtomicU64,
    pub evicted: AtomicU64,
    pub transient_retries: AtomicU64,
    pub hard_failures: AtomicU64,
    pub audit_flows: AtomicU64,
    pub orphan_deletes: AtomicU64,
    pub stale_events: AtomicU64,
    pub consistency_retires: AtomicU64,
    short: [AtomicU64; ShortReason::COUNT],
}

impl Default for FlowStats {
    fn default() -> Self {
        Self {
            created: 0.into(),
            deleted: 0.into(),
            aged: 0.into(),
            evicted: 0.into(),
            transient_retries: 0.into(),
            hard_failures: 0.into(),
            audit_flows: 0.into(),
            orphan_deletes: 0.into(),
            stale_events: 0.into(),
            consistency_retires: 0.into(),
            short: core::array::from_fn(|_| 0.into()),
        }
    }
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl FlowStats {
    pub fn short(&self, reason: ShortReason) {
        bump(&self.short[reason as usize]);
    }

    pub fn short_count(&self, reason: ShortReason) -> u64 {
        self.short[reason as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, active_flows: u64) -> FlowStatsResp {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let short = ShortReason::ALL
            .iter()
            .map(|r| (*r, self.short_count(*r)))
            .filter(|(_, n)| *n > 0)
            .collect();

        FlowStatsResp {
            active_flows,
            created: load(&self.created),
            deleted: load(&self.deleted),
            aged: load(&self.aged),
            evicted: load(&self.evicted),
            transient_retries: load(&self.transient_retries),
            hard_failures: load(&self.hard_failures),
            audit_flows: load(&self.audit_flows),
            orphan_deletes: load(&self.orphan_deletes),
            stale_events: load(&self.stale_events),
            consistency_retires: load(&self.consistency_retires),
            short,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_omits_unseen_reasons() {
        let stats = FlowStats::default();
        stats.short(ShortReason::FlowLimit);
        stats.short(ShortReason::FlowLimit);
        bump(&stats.created);

        let snap = stats.snapshot(4);
        assert_eq!(snap.active_flows, 4);
        assert_eq!(snap.created, 1);
        assert_eq!(snap.short, vec![(ShortReason::FlowLimit, 2)]);
    }
}
