// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ECMP hash-field negotiation.
//!
//! Every path of a composite nexthop may ask for a set of 5-tuple
//! fields to take part in ECMP hashing. The registry keeps one
//! reference count per (route, composite nexthop, field). A field is
//! in effect for a record when its count is non-zero; a record with
//! no explicit requirement hashes on every field.
//!
//! Acquire and release are the only mutators. A route changing its
//! configured fields is applied as a delta: new fields are acquired
//! before stale ones are released, so a field still needed by another
//! path never transiently drops to zero.

use super::route::RouteKey;
use std::collections::BTreeMap;
use vrflow_api::FlowError;
use vrflow_api::FlowKey;
use vrflow_api::HashFields;
use vrflow_api::NhId;

/// Identifies one record: a route reaching a composite nexthop.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct EcmpKey {
    pub route: RouteKey,
    pub nh: NhId,
}

#[derive(Clone, Debug, Default)]
struct FieldRecord {
    refs: [u32; HashFields::FIELDS.len()],
    /// The fields the route itself asked for.
    configured: HashFields,
}

impl FieldRecord {
    fn acquired(&self) -> HashFields {
        let mut fields = HashFields::empty();
        for (i, field) in HashFields::FIELDS.iter().enumerate() {
            if self.refs[i] > 0 {
                fields |= *field;
            }
        }
        fields
    }

    fn is_idle(&self) -> bool {
        self.refs.iter().all(|r| *r == 0) && self.configured.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct EcmpRegistry {
    records: BTreeMap<EcmpKey, FieldRecord>,
}

impl EcmpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference on every field in `fields`.
    pub fn acquire(&mut self, key: EcmpKey, fields: HashFields) {
        let rec = self.records.entry(key).or_default();
        for (i, field) in HashFields::FIELDS.iter().enumerate() {
            if fields.contains(*field) {
                rec.refs[i] += 1;
            }
        }
    }

    /// Drop a reference on every field in `fields`.
    ///
    /// # Errors
    ///
    /// Releasing a field with no outstanding reference is a caller
    /// bug; the record is left untouched and an error is returned.
    pub fn release(
        &mut self,
        key: EcmpKey,
        fields: HashFields,
    ) -> Result<(), FlowError> {
        let Some(rec) = self.records.get_mut(&key) else {
            return Err(FlowError::BadState(format!(
                "release of {fields} on unknown ECMP record {key:?}"
            )));
        };

        for (i, field) in HashFields::FIELDS.iter().enumerate() {
            if fields.contains(*field) && rec.refs[i] == 0 {
                return Err(FlowError::BadState(format!(
                    "release of unreferenced field {field} on {key:?}"
                )));
            }
        }

        for (i, field) in HashFields::FIELDS.iter().enumerate() {
            if fields.contains(*field) {
                rec.refs[i] -= 1;
            }
        }

        if rec.is_idle() {
            self.records.remove(&key);
        }
        Ok(())
    }

    /// Apply a route's configured fields, as a delta from whatever it
    /// configured before. `None` withdraws the route's requirement.
    pub fn configure(
        &mut self,
        key: EcmpKey,
        fields: Option<HashFields>,
    ) -> Result<(), FlowError> {
        let new = fields.unwrap_or_else(HashFields::empty);
        let old = self
            .records
            .get(&key)
            .map(|r| r.configured)
            .unwrap_or_else(HashFields::empty);

        if old == new {
            return Ok(());
        }

        self.acquire(key, new - old);
        if let Some(rec) = self.records.get_mut(&key) {
            rec.configured = new;
        }
        self.release(key, old - new)
    }

    /// Withdraw every record for `route`, as when the route is
    /// deleted.
    pub fn withdraw_route(&mut self, route: RouteKey) {
        self.records.retain(|k, _| k.route != route);
    }

    /// Withdraw the records `route` holds on any nexthop but
    /// `keep`, as when the route moves to a new nexthop.
    pub fn withdraw_stale(&mut self, route: RouteKey, keep: NhId) {
        self.records.retain(|k, _| k.route != route || k.nh == keep);
    }

    /// The fields in effect for `key`.
    pub fn effective_mask(&self, key: EcmpKey) -> HashFields {
        match self.records.get(&key).map(FieldRecord::acquired) {
            Some(fields) if !fields.is_empty() => fields,
            _ => HashFields::all(),
        }
    }

    /// The mask a composite nexthop should hash with, negotiated
    /// across every route that reaches it.
    pub fn composite_mask(&self, nh: NhId) -> HashFields {
        let masks: Vec<HashFields> = self
            .records
            .iter()
            .filter(|(k, _)| k.nh == nh)
            .map(|(k, _)| self.effective_mask(*k))
            .collect();
        most_common_mask(&masks)
    }

    pub fn num_records(&self) -> usize {
        self.records.len()
    }
}

/// Select the mask requested by the most candidates.
///
/// Each distinct mask is counted. Among the masks with the highest
/// count, one that contains every other wins; failing that, the union
/// of the tied masks is used. Ties never drop a field. With no
/// candidates every field is used.
pub fn most_common_mask(candidates: &[HashFields]) -> HashFields {
    let mut counts: BTreeMap<u8, usize> = BTreeMap::new();
    for mask in candidates {
        *counts.entry(mask.bits()).or_default() += 1;
    }

    let Some(max) = counts.values().copied().max() else {
        return HashFields::all();
    };

    let tied: Vec<HashFields> = counts
        .iter()
        .filter(|(_, n)| **n == max)
        .map(|(bits, _)| HashFields::from_bits_truncate(*bits))
        .collect();

    let union = tied.iter().fold(HashFields::empty(), |acc, m| acc | *m);
    match tied.iter().find(|m| m.contains(union)) {
        Some(superset) => *superset,
        None => union,
    }
}

/// Pick the member of an ECMP group for `key`, hashing only the
/// fields in `fields`.
pub fn select_component(key: &FlowKey, fields: HashFields, members: usize) -> u16 {
    if members == 0 {
        return 0;
    }

    let mut h = crc32fast::Hasher::new();
    if fields.contains(HashFields::SOURCE_IP) {
        hash_ip(&mut h, key.src);
    }
    if fields.contains(HashFields::DESTINATION_IP) {
        hash_ip(&mut h, key.dst);
    }
    if fields.contains(HashFields::IP_PROTOCOL) {
        h.update(&[key.proto.0]);
    }
    if fields.contains(HashFields::SOURCE_PORT) {
        h.update(&key.sport.to_be_bytes());
    }
    if fields.contains(HashFields::DESTINATION_PORT) {
        h.update(&key.dport.to_be_bytes());
    }

    (h.finalize() as usize % members) as u16
}

fn hash_ip(h: &mut crc32fast::Hasher, ip: std::net::IpAddr) {
    match ip {
        std::net::IpAddr::V4(ip) => h.update(&ip.octets()),
        std::net::IpAddr::V6(ip) => h.update(&ip.octets()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use vrflow_api::VrfId;

    const SIP: HashFields = HashFields::SOURCE_IP;
    const DIP: HashFields = HashFields::DESTINATION_IP;
    const PROTO: HashFields = HashFields::IP_PROTOCOL;
    const DPORT: HashFields = HashFields::DESTINATION_PORT;

    fn key(n: u8) -> EcmpKey {
        EcmpKey {
            route: RouteKey::new(
                VrfId(1),
                format!("10.1.{n}.0/24").parse().unwrap(),
            ),
            nh: NhId(100),
        }
    }

    #[test]
    fn default_is_all_fields() {
        let reg = EcmpRegistry::new();
        assert_eq!(reg.effective_mask(key(1)), HashFields::all());
    }

    #[test]
    fn field_held_until_last_release() {
        let mut reg = EcmpRegistry::new();
        let k = key(1);
        reg.acquire(k, DPORT);
        reg.acquire(k, DPORT);
        assert_eq!(reg.effective_mask(k), DPORT);

        reg.release(k, DPORT).unwrap();
        assert_eq!(reg.effective_mask(k), DPORT);

        reg.release(k, DPORT).unwrap();
        assert_eq!(reg.effective_mask(k), HashFields::all());
        assert_eq!(reg.num_records(), 0);

        assert!(reg.release(k, DPORT).is_err());
    }

    #[test]
    fn over_release_leaves_counts_alone() {
        let mut reg = EcmpRegistry::new();
        let k = key(1);
        reg.acquire(k, SIP);
        assert!(reg.release(k, SIP | DIP).is_err());
        assert_eq!(reg.effective_mask(k), SIP);
    }

    #[test]
    fn configure_applies_deltas() {
        let mut reg = EcmpRegistry::new();
        let k = key(1);
        // Another path still wants the source IP.
        reg.acquire(k, SIP);
        reg.configure(k, Some(SIP | DIP)).unwrap();
        assert_eq!(reg.effective_mask(k), SIP | DIP);

        reg.configure(k, Some(DIP | PROTO)).unwrap();
        assert_eq!(reg.effective_mask(k), SIP | DIP | PROTO);

        reg.configure(k, None).unwrap();
        assert_eq!(reg.effective_mask(k), SIP);
    }

    #[test]
    fn most_common_counts_whole_masks() {
        let masks = [SIP | DIP, SIP | DIP, SIP | DIP | PROTO];
        assert_eq!(most_common_mask(&masks), SIP | DIP);

        let masks = [SIP, SIP, SIP | DIP, SIP | DIP | PROTO];
        assert_eq!(most_common_mask(&masks), SIP);
    }

    #[test]
    fn most_common_prefers_denser_ties() {
        let masks = [SIP | DIP | PROTO, SIP];
        assert_eq!(most_common_mask(&masks), SIP | DIP | PROTO);

        let masks = [SIP | DIP | PROTO, SIP | DIP, SIP];
        assert_eq!(most_common_mask(&masks), SIP | DIP | PROTO);

        let masks = [SIP | DIP | PROTO, SIP | DIP];
        assert_eq!(most_common_mask(&masks), SIP | DIP | PROTO);

        // No tied mask covers the others.
        let masks = [SIP | DIP, PROTO, PROTO, SIP | DIP];
        assert_eq!(most_common_mask(&masks), SIP | DIP | PROTO);

        let masks = [SIP | DIP | PROTO];
        assert_eq!(most_common_mask(&masks), SIP | DIP | PROTO);

        assert_eq!(most_common_mask(&[]), HashFields::all());
    }

    #[test]
    fn composite_mask_follows_routes() {
        let mut reg = EcmpRegistry::new();
        reg.configure(key(1), Some(SIP | DIP)).unwrap();
        reg.configure(key(2), Some(SIP | DIP)).unwrap();
        reg.configure(key(3), Some(SIP | DIP | PROTO)).unwrap();
        assert_eq!(reg.composite_mask(NhId(100)), SIP | DIP);

        reg.withdraw_route(key(2).route);
        assert_eq!(reg.composite_mask(NhId(100)), SIP | DIP | PROTO);

        reg.configure(key(3), Some(SIP)).unwrap();
        assert_eq!(reg.composite_mask(NhId(100)), SIP | DIP);

        reg.configure(key(3), None).unwrap();
        assert_eq!(reg.composite_mask(NhId(100)), SIP | DIP);
    }
}
