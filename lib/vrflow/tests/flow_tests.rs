// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow classification and pairing.
//!
//! These tests push packets through the engine running against the
//! lab topology and check the pairs it builds: their keys, their
//! translation and reverse-path state, and how they react to changes
//! in routing, interfaces and policy.

use common::*;
use vrflow_test_utils as common;

// If we are running `cargo test`, then make sure to
// register the USDT probes before running any tests.
#[cfg(test)]
#[ctor::ctor]
fn register_usdt() {
    usdt::register_probes().unwrap();
}

fn remote_pkt(lab: &Lab, sport: u16) -> PktCtx {
    lab.from_vm(VM_A, Protocol::TCP, REMOTE_IP, sport, 80)
}

// Verify that a packet between two local VMs builds a symmetric pair,
// with each direction checked against the VM it comes from.
#[test]
fn local_pair_is_symmetric() {
    let lab = Lab::new();
    let pkt = lab.from_vm(VM_A, Protocol::ICMP, VM_B_IP, 0, 0);
    let res = lab.process(&pkt);
    chk!(
        lab,
        matches!(res, PktResult::Created { rev: Some(_), short: None, .. })
    );

    let fkey = icmp_key(VM_A_NH, VM_A_IP, VM_B_IP);
    let rkey = lab.reverse_of(&fkey);
    assert_eq!(rkey, icmp_key(VM_B_NH, VM_B_IP, VM_A_IP));
    assert_num_flows!(lab, 2);
    assert_active!(lab, fkey);
    assert_active!(lab, rkey);
    lab.assert_symmetric();
    lab.assert_single_ownership();

    let fwd = lab.entry(&fkey);
    let rev = lab.entry(&rkey);
    assert!(fwd.flags().contains(FlowFlags::LOCAL));
    assert!(rev.is_reverse());
    assert_eq!(fwd.rpf().nh, Some(VM_A_NH));
    assert_eq!(rev.rpf().nh, Some(VM_B_NH));
    assert_eq!(fwd.vm(), Some(VM_A));
    assert_eq!(rev.vm(), Some(VM_B));

    // The forward write carries the slot of its reverse.
    let last = lab.fwd.writes_for(&fkey).pop().unwrap();
    assert_eq!(last.reverse_slot, Some(lab.slot_of(&rkey)));
    assert_eq!(last.action, FlowAction::Forward);
}

// Verify that a packet matching an existing pair, in either
// direction, neither creates entries nor reprograms them.
#[test]
fn repeat_packet_hits_pair() {
    let lab = Lab::new();
    let pkt = remote_pkt(&lab, 1000);
    let PktResult::Created { fwd, .. } = lab.process(&pkt) else {
        panic!("first packet did not create a pair");
    };

    let writes = lab.fwd.num_writes();
    assert_eq!(lab.process(&pkt), PktResult::Hit(fwd));
    assert_num_flows!(lab, 2);
    assert_eq!(lab.fwd.num_writes(), writes);
    assert_eq!(lab.entry(&pkt.key).counters().hits, 1);

    let rkey = lab.reverse_of(&pkt.key);
    assert_eq!(rkey, tcp_key(REMOTE_NH, REMOTE_IP, VM_A_IP, 80, 1000));
    assert!(lab.entry(&rkey).flags().contains(FlowFlags::INGRESS));
    let back = PktCtx {
        key: rkey,
        ..lab.from_fabric(REMOTE_NH, VRF, (REMOTE_IP, VM_A_IP))
    };
    chk!(lab, matches!(lab.process(&back), PktResult::Hit(_)));
    assert_num_flows!(lab, 2);
    assert_eq!(lab.fwd.num_writes(), writes);
    assert_eq!(lab.proto.stats().created, 2);
}

// Verify that a flow whose reverse key is its own key is kept as a
// single short entry.
#[test]
fn self_addressed_flow_is_single_entry() {
    let lab = Lab::new();
    let pkt = lab.from_vm(VM_A, Protocol::ICMP, VM_A_IP, 0, 0);
    let res = lab.process(&pkt);
    chk!(
        lab,
        matches!(
            res,
            PktResult::Created {
                rev: None,
                short: Some(ShortReason::SameFlowRflowKey),
                ..
            }
        )
    );

    assert_num_flows!(lab, 1);
    assert_short!(lab, pkt.key, ShortReason::SameFlowRflowKey);
    assert!(!lab.entry(&pkt.key).has_reverse());
    chk!(lab, matches!(lab.process(&pkt), PktResult::Hit(_)));
}

#[test]
fn floating_ip_egress() {
    let lab = Lab::new();
    let pkt = lab.from_vm(VM_A, Protocol::TCP, "8.8.8.8", 1000, 443);
    lab.process(&pkt);

    let rkey = lab.reverse_of(&pkt.key);
    assert_eq!(rkey, tcp_key(INTERNET_NH, "8.8.8.8", FIP_ADDR, 443, 1000));
    assert_active!(lab, pkt.key);
    assert_active!(lab, rkey);
    lab.assert_symmetric();

    let fwd = lab.entry(&pkt.key);
    assert!(fwd.flags().contains(FlowFlags::NAT));
    let nat = fwd.nat().unwrap();
    assert_eq!(nat.src, ip(FIP_ADDR));
    assert_eq!(nat.vrf, FIP_VRF);

    let rev = lab.entry(&rkey);
    assert_eq!(rev.nat().unwrap().dst, ip(VM_A_IP));
    assert_eq!(rev.rpf().nh, Some(INTERNET_NH));
    assert_eq!(lab.fwd.writes_for(&pkt.key).pop().unwrap().action, FlowAction::Nat);
}

// Verify that racing creations of one translated pair settle on a
// single pair, with no entry displaced by a creator that lost.
#[test]
fn racing_nat_creations_keep_one_pair() {
    let lab = Lab::new();
    let pkt = lab.from_vm(VM_A, Protocol::TCP, "8.8.8.8", 1000, 443);

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..50 {
                    lab.proto.process_packet(&pkt).unwrap();
                }
            });
        }
    });
    lab.settle();

    assert_num_flows!(lab, 2);
    let rkey = lab.reverse_of(&pkt.key);
    assert_active!(lab, pkt.key);
    assert_active!(lab, rkey);
    lab.assert_symmetric();
    lab.assert_single_ownership();

    let stats = lab.proto.stats();
    assert_eq!(stats.created, 2);
    assert_eq!(stats.deleted, 0);
    assert!(stats.short.is_empty());
}

#[test]
fn floating_ip_ingress() {
    let lab = Lab::new();
    let pkt = lab.from_fabric(INTERNET_NH, FIP_VRF, ("8.8.4.4", FIP_ADDR));
    lab.process(&pkt);

    let rkey = lab.reverse_of(&pkt.key);
    assert_eq!(rkey, tcp_key(VM_A_NH, VM_A_IP, "8.8.4.4", 22, 40000));
    assert_active!(lab, pkt.key);
    assert_active!(lab, rkey);

    let fwd = lab.entry(&pkt.key);
    assert!(fwd.flags().contains(FlowFlags::INGRESS));
    assert_eq!(fwd.nat().unwrap().dst, ip(VM_A_IP));
    assert_eq!(fwd.vm(), Some(VM_A));

    let rev = lab.entry(&rkey);
    assert_eq!(rev.nat().unwrap().src, ip(FIP_ADDR));
    assert_eq!(rev.rpf().nh, Some(VM_A_NH));
}

// Verify that a translated pair can be deleted through either of its
// keys.
#[test]
fn nat_pair_deleted_from_either_key() {
    let lab = Lab::new();
    let pkt = lab.from_vm(VM_A, Protocol::TCP, "8.8.8.8", 1000, 443);
    lab.process(&pkt);
    let rkey = lab.reverse_of(&pkt.key);

    lab.proto.delete(&rkey).unwrap();
    assert_num_flows!(lab, 0);
    assert!(lab.proto.lookup(&pkt.key).is_none());
    assert!(lab.proto.lookup(&rkey).is_none());
    assert_eq!(lab.proto.owner_part(&rkey), lab.proto.hash_part(&rkey));
    assert!(lab.proto.delete(&rkey).is_err());

    lab.process(&pkt);
    assert_num_flows!(lab, 2);
    lab.proto.delete(&pkt.key).unwrap();
    assert_num_flows!(lab, 0);
    lab.pump();
    assert_eq!(lab.fwd.num_slots(), 0);
    assert!(lab.proto.dump_slots().slots.is_empty());
}

#[test]
fn linklocal_port_ceiling() {
    let mut cfg = lab_cfg();
    cfg.linklocal_vm_flows = 2;
    let lab = Lab::with_cfg(cfg);
    let meta = |sport| lab.from_vm(VM_A, Protocol::TCP, METADATA_VIP, sport, METADATA_PORT);

    let mut ports = Vec::new();
    for sport in [1000, 1001] {
        let pkt = meta(sport);
        lab.process(&pkt);
        assert_active!(lab, pkt.key);

        let fwd = lab.entry(&pkt.key);
        assert!(fwd.flags().contains(
            FlowFlags::LINKLOCAL | FlowFlags::LINKLOCAL_BIND_LOCAL_PORT
        ));
        let port = fwd.linklocal_port().unwrap();
        assert_eq!(fwd.nat().unwrap().sport, port);
        assert_eq!(
            fwd.fwd_rule(),
            RuleRef::State(PolicyState::LinkLocalFlow)
        );

        let rkey = lab.reverse_of(&pkt.key);
        assert_eq!(
            rkey,
            tcp_key(
                VHOST_NH,
                METADATA_SERVER,
                ROUTER_ID,
                METADATA_SERVER_PORT,
                port
            )
        );
        assert_eq!(lab.entry(&rkey).rpf().src_nh, Some(VHOST_NH));
        ports.push(port);
    }
    assert_ne!(ports[0], ports[1]);

    // The VM's ceiling is reached: no port, so the pair is short and
    // keeps the VM's own source port.
    let third = meta(1002);
    lab.process(&third);
    assert_short!(lab, third.key, ShortReason::LinkLocalSrcNat);
    let e = lab.entry(&third.key);
    assert_eq!(e.linklocal_port(), None);
    assert_eq!(e.nat().unwrap().sport, 1002);

    // Deleting a pair gives its port back.
    lab.proto.delete(&meta(1000).key).unwrap();
    let fourth = meta(1003);
    lab.process(&fourth);
    assert_active!(lab, fourth.key);
    assert!(lab.entry(&fourth.key).linklocal_port().is_some());
}

#[test]
fn broadcast_pair_is_not_counted() {
    let mut cfg = lab_cfg();
    cfg.max_vm_flows = 2;
    let lab = Lab::with_cfg(cfg);

    let remote = remote_pkt(&lab, 1000);
    lab.process(&remote);
    assert_active!(lab, remote.key);

    let bcast = lab.from_vm(VM_A, Protocol::UDP, "10.0.0.255", 68, 67);
    lab.process(&bcast);
    let e = lab.entry(&bcast.key);
    assert!(e.flags().contains(FlowFlags::MULTICAST));
    assert!(!e.is_short());
    assert_eq!(e.fwd_rule(), RuleRef::State(PolicyState::MulticastFlow));

    let rkey = lab.reverse_of(&bcast.key);
    assert!(lab.entry(&rkey).flags().contains(FlowFlags::MULTICAST));
    assert_num_flows!(lab, 4);
}

// Verify that a VM is held to its flow ceiling, that short flows take
// no room under it, and that deleting a pair makes room again.
#[test]
fn vm_flow_limit() {
    let mut cfg = lab_cfg();
    cfg.max_vm_flows = 4;
    let lab = Lab::with_cfg(cfg);

    let first = remote_pkt(&lab, 1000);
    let second = remote_pkt(&lab, 1001);
    lab.process(&first);
    lab.process(&second);
    assert_active!(lab, first.key);
    assert_active!(lab, second.key);

    let third = remote_pkt(&lab, 1002);
    lab.process(&third);
    assert_short!(lab, third.key, ShortReason::FlowLimit);
    let rkey = lab.reverse_of(&third.key);
    assert_short!(lab, rkey, ShortReason::FlowLimit);

    let dead = lab.from_vm(VM_A, Protocol::TCP, "10.0.0.77", 1000, 80);
    lab.process(&dead);
    assert_short!(lab, dead.key, ShortReason::NoDstRoute);

    lab.proto.delete(&first.key).unwrap();
    let next = remote_pkt(&lab, 2000);
    lab.process(&next);
    assert_active!(lab, next.key);
}

#[test]
fn system_flow_limit() {
    let mut cfg = lab_cfg();
    cfg.max_system_flows = 4;
    let lab = Lab::with_cfg(cfg);

    lab.process(&remote_pkt(&lab, 1000));
    let other = lab.from_vm(VM_B, Protocol::TCP, REMOTE_IP, 1000, 80);
    lab.process(&other);
    assert_active!(lab, other.key);

    let over = lab.from_vm(VM_B, Protocol::TCP, REMOTE_IP, 1001, 80);
    lab.process(&over);
    assert_short!(lab, over.key, ShortReason::FlowLimit);
    assert_eq!(lab.dump().limit, 4);
}

#[test]
fn policy_deny_creates_short_pair() {
    let lab = Lab::new();
    let rule = RuleRef::Rule(Uuid::from_u128(7));
    let mut pkt = lab.from_vm(VM_A, Protocol::TCP, VM_B_IP, 1000, 80);
    pkt.decision = PolicyDecision::deny(rule, rule);
    lab.process(&pkt);

    assert_short!(lab, pkt.key, ShortReason::PolicyDeny);
    let rkey = lab.reverse_of(&pkt.key);
    assert_short!(lab, rkey, ShortReason::PolicyDeny);
    assert_eq!(lab.entry(&pkt.key).sg_rule(), rule);

    // A short pair is still programmed, as a drop.
    let w = lab.fwd.writes_for(&pkt.key).pop().unwrap();
    assert_eq!(w.action, FlowAction::Drop);
    assert_eq!(w.nh, NhEncoding::Drop);
    assert_eq!(lab.entry(&pkt.key).ksync().state(), KSyncState::IndexSet);
}

#[test]
fn policy_update_on_live_pair() {
    let lab = Lab::new();
    let pkt = lab.from_vm(VM_A, Protocol::TCP, VM_B_IP, 1000, 80);
    lab.process(&pkt);
    let rkey = lab.reverse_of(&pkt.key);

    let rule = RuleRef::Rule(Uuid::from_u128(42));
    lab.proto
        .update_policy(&pkt.key, PolicyDecision::allow(rule, rule))
        .unwrap();
    assert_eq!(lab.entry(&rkey).fwd_rule(), rule);
    assert_active!(lab, pkt.key);

    lab.proto
        .update_policy(&rkey, PolicyDecision::deny(rule, rule))
        .unwrap();
    lab.pump();
    assert_short!(lab, rkey, ShortReason::PolicyDeny);
    assert_short!(lab, pkt.key, ShortReason::ReverseFlowChange);
    assert_eq!(
        lab.fwd.writes_for(&pkt.key).pop().unwrap().action,
        FlowAction::Drop
    );
}

// Verify that toggling RPF on a network only changes what is handed
// to the forwarding plane. The source binding and the slots stay.
#[test]
fn rpf_toggle_keeps_source_binding() {
    let lab = Lab::new();
    let pkt = remote_pkt(&lab, 1000);
    lab.process(&pkt);
    let rkey = lab.reverse_of(&pkt.key);
    let slot = lab.slot_of(&pkt.key);
    let created = lab.proto.stats().created;

    assert!(lab.db.set_rpf(VN, false));
    lab.proto.vn_changed(VN);
    lab.pump();
    for key in [pkt.key, rkey] {
        let e = lab.entry(&key);
        assert!(!e.rpf().enabled);
        assert_eq!(e.rpf().nh, None);
        assert!(e.rpf().src_nh.is_some());
        assert_active!(lab, key);
    }
    assert_eq!(lab.slot_of(&pkt.key), slot);
    assert_eq!(lab.proto.stats().created, created);
    assert_eq!(lab.fwd.writes_for(&pkt.key).pop().unwrap().rpf_nh, None);
    assert!(!lab.proto.get_flow(&pkt.key).unwrap().enable_rpf);

    assert!(lab.db.set_rpf(VN, true));
    lab.proto.vn_changed(VN);
    lab.pump();
    assert_eq!(lab.entry(&pkt.key).rpf().nh, Some(VM_A_NH));
    assert_eq!(lab.entry(&rkey).rpf().nh, Some(REMOTE_NH));
    assert_eq!(
        lab.fwd.writes_for(&pkt.key).pop().unwrap().rpf_nh,
        Some(VM_A_NH)
    );
}

// Verify the source checks of a fabric packet whose source only
// matches a subnet route: the bridge table is consulted, and what it
// says decides the outcome.
#[test]
fn unroutable_source() {
    let lab = Lab::new();
    let mut pkt = lab.from_fabric(REMOTE_NH, VRF, ("10.0.0.50", VM_A_IP));
    lab.process(&pkt);
    assert_short!(lab, pkt.key, ShortReason::NoSrcRoute);

    pkt.key.sport = 40001;
    pkt.src_mac = Some(mac(50));
    lab.process(&pkt);
    assert_short!(lab, pkt.key, ShortReason::NoSrcRouteL2Rpf);

    lab.db.add_bridge(VRF, mac(50), REMOTE_NH);
    pkt.key.sport = 40002;
    lab.process(&pkt);
    assert_active!(lab, pkt.key);
    let rpf = *lab.entry(&pkt.key).rpf();
    assert!(rpf.l2_fallback);
    assert_eq!(rpf.nh, Some(REMOTE_NH));
}

#[test]
fn bridged_pair() {
    let lab = Lab::new();
    let pkt = lab.l2_from_vm(VM_A, VM_B_IP, vm_b_mac());
    lab.process(&pkt);

    let rkey = lab.reverse_of(&pkt.key);
    assert_eq!(rkey, udp_key(VM_B_NH, VM_B_IP, VM_A_IP, 6000, 5000));
    for key in [pkt.key, rkey] {
        assert_active!(lab, key);
        assert!(lab.entry(&key).flags().contains(FlowFlags::L2));
    }
    assert_eq!(lab.entry(&rkey).rpf().nh, Some(VM_B_NH));

    // An unknown destination MAC has nowhere to go.
    let lost = PktCtx {
        key: udp_key(VM_A_NH, VM_A_IP, VM_B_IP, 5001, 6000),
        ..lab.l2_from_vm(VM_A, VM_B_IP, mac(99))
    };
    lab.process(&lost);
    assert_short!(lab, lost.key, ShortReason::NoDstRoute);
}

#[test]
fn ecmp_destination() {
    let lab = Lab::new();
    let pkt = lab.from_vm(VM_A, Protocol::TCP, "10.1.0.5", 1000, 80);
    lab.process(&pkt);
    assert_active!(lab, pkt.key);

    let e = lab.entry(&pkt.key);
    assert!(e.flags().contains(FlowFlags::ECMP));
    assert_eq!(e.ecmp_fields(), HashFields::all());
    let w = lab.fwd.writes_for(&pkt.key).pop().unwrap();
    chk!(
        lab,
        matches!(w.nh, NhEncoding::Ecmp { nh: ECMP_NH, component } if component < 2)
    );

    let rkey = lab.reverse_of(&pkt.key);
    assert_eq!(rkey.nh, ECMP_NH);
    assert_eq!(lab.entry(&rkey).rpf().nh, Some(ECMP_NH));
}

// Verify that the hash fields of an ECMP group are negotiated across
// the routes reaching it, and that one route withdrawing its
// requirement leaves the other's in place.
#[test]
fn ecmp_fields_follow_routes() {
    let lab = Lab::new();
    let pkt = lab.from_vm(VM_A, Protocol::TCP, "10.1.0.5", 1000, 80);
    lab.process(&pkt);

    let dport = HashFields::DESTINATION_PORT;
    let set = |prefix: &str, fields| {
        let ev = lab.db.add_route(VRF, net(prefix), ECMP_NH, RouteKind::Normal, fields);
        lab.proto.route_changed(&ev);
        lab.pump();
    };

    set("10.2.0.0/24", Some(dport));
    set(ECMP_PREFIX, Some(dport));
    assert_eq!(lab.entry(&pkt.key).ecmp_fields(), dport);
    assert_eq!(lab.fwd.writes_for(&pkt.key).pop().unwrap().ecmp_fields, dport);

    set("10.2.0.0/24", None);
    assert_eq!(lab.entry(&pkt.key).ecmp_fields(), dport);

    set(ECMP_PREFIX, None);
    assert_eq!(lab.entry(&pkt.key).ecmp_fields(), HashFields::all());
    assert_active!(lab, pkt.key);
}

// Verify that routes requesting different masks of one ECMP group
// settle on the mask most of them asked for, and on the denser mask
// when they are evenly split.
#[test]
fn ecmp_field_tie_keeps_denser_mask() {
    let lab = Lab::new();
    let sd = HashFields::SOURCE_IP | HashFields::DESTINATION_IP;
    let sdp = sd | HashFields::IP_PROTOCOL;

    lab.db.add_route(VRF, net("10.2.0.0/24"), ECMP_NH, RouteKind::Normal, Some(sd));
    let first = lab.from_vm(VM_A, Protocol::TCP, "10.2.0.5", 1000, 80);
    lab.process(&first);
    assert_eq!(lab.entry(&first.key).ecmp_fields(), sd);

    lab.db.add_route(VRF, net(ECMP_PREFIX), ECMP_NH, RouteKind::Normal, Some(sdp));
    let second = lab.from_vm(VM_A, Protocol::TCP, "10.1.0.5", 1000, 80);
    lab.process(&second);
    assert_eq!(lab.entry(&second.key).ecmp_fields(), sdp);
    assert_eq!(
        lab.fwd.writes_for(&second.key).pop().unwrap().ecmp_fields,
        sdp
    );

    // A third route tips the balance back.
    let ev = lab.db.add_route(VRF, net("10.3.0.0/24"), ECMP_NH, RouteKind::Normal, Some(sd));
    lab.proto.route_changed(&ev);
    lab.pump();
    assert_eq!(lab.entry(&second.key).ecmp_fields(), sd);
    assert_eq!(lab.entry(&first.key).ecmp_fields(), sd);
}

#[test]
fn route_withdrawal_shortens_pair() {
    let lab = Lab::new();
    let pkt = lab.from_vm(VM_A, Protocol::TCP, "10.1.0.5", 1000, 80);
    lab.process(&pkt);
    let rkey = lab.reverse_of(&pkt.key);

    let ev = lab.db.del_route(VRF, net(ECMP_PREFIX)).unwrap();
    lab.proto.route_changed(&ev);
    lab.pump();
    assert_short!(lab, pkt.key, ShortReason::NoDstRoute);
    assert_short!(lab, rkey, ShortReason::ReverseFlowChange);
    assert_eq!(
        lab.fwd.writes_for(&pkt.key).pop().unwrap().action,
        FlowAction::Drop
    );
}

// Verify that a pair whose destination moved to another nexthop is
// rebuilt, since its reverse key names the old one.
#[test]
fn route_move_rebuilds_pair() {
    let lab = Lab::new();
    let pkt = remote_pkt(&lab, 1000);
    lab.process(&pkt);
    assert_eq!(lab.reverse_of(&pkt.key).nh, REMOTE_NH);

    let ev = lab.db.add_route(
        VRF,
        net("10.0.0.100/32"),
        REMOTE2_NH,
        RouteKind::Normal,
        None,
    );
    lab.proto.route_changed(&ev);
    lab.pump();
    assert!(lab.proto.lookup(&pkt.key).is_none());
    assert_num_flows!(lab, 0);

    lab.process(&pkt);
    assert_eq!(lab.reverse_of(&pkt.key).nh, REMOTE2_NH);
    assert_active!(lab, pkt.key);
}

#[test]
fn interface_down_shortens_its_flows() {
    let lab = Lab::new();
    let pkt = lab.from_vm(VM_A, Protocol::TCP, VM_B_IP, 1000, 80);
    lab.process(&pkt);
    let rkey = lab.reverse_of(&pkt.key);

    let mut a = lab.intf(VM_A);
    a.active = false;
    lab.db.set_interface(a);
    lab.proto.interface_changed(VM_A);
    lab.pump();
    assert_short!(lab, pkt.key, ShortReason::UnavailableInterface);
    assert_short!(lab, rkey, ShortReason::ReverseFlowChange);

    let next = lab.from_vm(VM_A, Protocol::TCP, VM_B_IP, 1001, 80);
    lab.process(&next);
    assert_short!(lab, next.key, ShortReason::UnavailableInterface);
}

// Verify that a flow translated through a floating IP the interface
// no longer owns is rebuilt on its next packet.
#[test]
fn floating_ip_removal_rebuilds_flow() {
    let lab = Lab::new();
    let pkt = lab.from_vm(VM_A, Protocol::TCP, "8.8.8.8", 1000, 443);
    lab.process(&pkt);
    let old_rkey = lab.reverse_of(&pkt.key);

    let mut a = lab.intf(VM_A);
    a.fips.clear();
    lab.db.set_interface(a);
    lab.proto.interface_changed(VM_A);

    lab.process(&pkt);
    assert_short!(lab, pkt.key, ShortReason::NoDstRoute);
    assert!(lab.entry(&pkt.key).nat().is_none());
    assert!(lab.proto.lookup(&old_rkey).is_none());
    assert_num_flows!(lab, 2);
}
