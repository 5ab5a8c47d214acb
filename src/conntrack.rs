// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Translates NAT conntrack events into paired IPv4 forwarding rules.
//!
//! Every offloaded flow is exactly one `upstream4` entry plus one
//! `downstream4` entry, installed and removed together within a single
//! coordinator task. A flow that loses one side without the other is an
//! anomaly that the next delete or client removal reconciles.

use std::net::Ipv4Addr;

use log::{debug, error, warn};

use crate::coordinator::OffloadState;
use crate::maps::{ipv4_mapped, MapAccessor as _, Tether4Key, Tether4Value, ETHERTYPE_IPV4};
use crate::rules::{Ipv4ClientInfo, MacAddr};
use zerocopy::byteorder::network_endian::U16 as NetU16;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

pub const NFNL_SUBSYS_CTNETLINK: u16 = 1;
pub const IPCTNL_MSG_CT_NEW: u16 = 0;
pub const IPCTNL_MSG_CT_DELETE: u16 = 2;

/// TCP destination ports never offloaded: FTP and PPTP control channels
/// need user-space ALG handling.
pub const NON_OFFLOADED_TCP_PORTS: [u16; 2] = [21, 1723];

/// One direction of a tracked flow.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConntrackTuple {
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl ConntrackTuple {
    pub fn reversed(&self) -> ConntrackTuple {
        ConntrackTuple {
            proto: self.proto,
            src: self.dst,
            dst: self.src,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

/// A conntrack notification as delivered by the conntrack monitor.
#[derive(Copy, Clone, Debug)]
pub struct ConntrackEvent {
    /// Raw nfnetlink message type: subsystem in the high byte, message in
    /// the low byte.
    pub msg_type: u16,
    pub tuple_orig: ConntrackTuple,
    pub tuple_reply: ConntrackTuple,
}

impl ConntrackEvent {
    pub fn new_flow(tuple_orig: ConntrackTuple, tuple_reply: ConntrackTuple) -> Self {
        ConntrackEvent {
            msg_type: (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_NEW,
            tuple_orig,
            tuple_reply,
        }
    }

    pub fn deleted_flow(tuple_orig: ConntrackTuple, tuple_reply: ConntrackTuple) -> Self {
        ConntrackEvent {
            msg_type: (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_DELETE,
            tuple_orig,
            tuple_reply,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.msg_type == (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_DELETE
    }
}

/// Concurrent offloaded-session counter with a high-water mark.
#[derive(Debug, Default)]
pub(crate) struct SessionCounter {
    current: u32,
    peak: u32,
}

impl SessionCounter {
    pub fn increment(&mut self) {
        self.current += 1;
        self.peak = self.peak.max(self.current);
    }

    pub fn decrement(&mut self) {
        self.decrement_by(1);
    }

    pub fn decrement_by(&mut self, n: u32) {
        match self.current.checked_sub(n) {
            Some(left) => self.current = left,
            None => {
                error!("session counter underflow: {} - {}", self.current, n);
                self.current = 0;
            }
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// Returns the peak observed since the last sample and re-arms the
    /// peak at the current level.
    pub fn sample_and_reset(&mut self) -> u32 {
        let peak = self.peak;
        self.peak = self.current;
        peak
    }

    pub fn reset(&mut self) {
        self.current = 0;
        self.peak = 0;
    }
}

/// Key of the client-to-upstream direction: the flow as seen entering the
/// downstream interface, pre-NAT.
fn upstream4_key(client: &Ipv4ClientInfo, orig: &ConntrackTuple) -> Tether4Key {
    Tether4Key {
        iif: client.downstream_ifindex,
        dst_mac: client.downstream_mac.0,
        l4proto: orig.proto,
        zero: 0,
        src4: orig.src.octets(),
        dst4: orig.dst.octets(),
        src_port: orig.src_port,
        dst_port: orig.dst_port,
    }
}

/// Key of the upstream-to-client direction: the reply as seen entering the
/// raw-IP upstream, post-NAT.
fn downstream4_key(upstream_ifindex: u32, reply: &ConntrackTuple) -> Tether4Key {
    Tether4Key {
        iif: upstream_ifindex,
        dst_mac: MacAddr::NULL.0,
        l4proto: reply.proto,
        zero: 0,
        src4: reply.src.octets(),
        dst4: reply.dst.octets(),
        src_port: reply.src_port,
        dst_port: reply.dst_port,
    }
}

fn upstream4_value(
    upstream_ifindex: u32,
    pmtu: u16,
    orig: &ConntrackTuple,
    reply: &ConntrackTuple,
) -> Tether4Value {
    Tether4Value {
        oif: upstream_ifindex,
        eth_dst_mac: MacAddr::NULL.0,
        eth_src_mac: MacAddr::NULL.0,
        eth_proto: NetU16::new(ETHERTYPE_IPV4),
        pmtu,
        // NAT rewrite toward the upstream: source becomes the public
        // address/port, destination is the remote from the original tuple.
        src46: ipv4_mapped(reply.dst),
        dst46: ipv4_mapped(orig.dst),
        src_port: reply.dst_port,
        dst_port: orig.dst_port,
        last_used_ns: 0,
    }
}

fn downstream4_value(
    client: &Ipv4ClientInfo,
    pmtu: u16,
    orig: &ConntrackTuple,
    reply: &ConntrackTuple,
) -> Tether4Value {
    Tether4Value {
        oif: client.downstream_ifindex,
        eth_dst_mac: client.client_mac.0,
        eth_src_mac: client.downstream_mac.0,
        eth_proto: NetU16::new(ETHERTYPE_IPV4),
        pmtu,
        // Un-NAT toward the client: destination becomes the private
        // address/port the client originated from.
        src46: ipv4_mapped(reply.src),
        dst46: ipv4_mapped(orig.src),
        src_port: reply.src_port,
        dst_port: orig.src_port,
        last_used_ns: 0,
    }
}

/// Consumes one conntrack event on the coordinator thread.
pub(crate) fn handle_conntrack_event(st: &mut OffloadState, event: &ConntrackEvent) {
    if !st.started || !st.kernel_active() {
        return;
    }
    let orig = event.tuple_orig;
    let reply = event.tuple_reply;
    if orig.proto == IPPROTO_TCP && NON_OFFLOADED_TCP_PORTS.contains(&orig.dst_port) {
        return;
    }
    let Some(client) = st.store.client_by_ip(orig.src).cloned() else {
        return;
    };
    let Some(upstream_ifindex) = st.store.ipv4_upstream_index(reply.dst) else {
        return;
    };

    let up_key = upstream4_key(&client, &orig);
    let down_key = downstream4_key(upstream_ifindex, &reply);

    if event.is_delete() {
        let up_removed = st.maps.upstream4_remove(&up_key);
        let down_removed = st.maps.downstream4_remove(&down_key);
        match (up_removed, down_removed) {
            // Raced with an earlier cleanup; nothing was offloaded.
            (false, false) => return,
            (true, true) => {}
            (up, _) => error!(
                "one-sided conntrack removal for client {} ({} side was already gone)",
                client.client_ipv4,
                if up { "downstream" } else { "upstream" }
            ),
        }
        st.sessions.decrement();
        st.stats.maybe_clear_limit(
            upstream_ifindex,
            &st.store,
            &st.sessions,
            st.maps.as_ref(),
            st.stats_sink.as_ref(),
        );
        return;
    }

    if st.store.last_ipv4_upstream_ifindex != upstream_ifindex {
        debug!(
            "dropping conntrack event for stale upstream ifindex {} (active {})",
            upstream_ifindex, st.store.last_ipv4_upstream_ifindex
        );
        return;
    }
    let Some(info) = st.store.ipv4_upstream_info else {
        return;
    };

    if !ensure_dev_member(st, client.downstream_ifindex) || !ensure_dev_member(st, upstream_ifindex)
    {
        return;
    }
    if !st.stats.maybe_set_limit(upstream_ifindex, &st.store, &st.sessions, st.maps.as_ref()) {
        return;
    }

    let existed = st.maps.upstream4_get(&up_key).is_some();
    let up_ok = st.maps.upstream4_add(&up_key, &upstream4_value(upstream_ifindex, info.mtu, &orig, &reply));
    let down_ok = st.maps.downstream4_add(&down_key, &downstream4_value(&client, info.mtu, &orig, &reply));
    match (up_ok, down_ok) {
        (true, true) => {
            if !existed {
                st.sessions.increment();
            }
        }
        (false, false) => error!("offload install failed for client {}", client.client_ipv4),
        (up, _) => error!(
            "one-sided offload install for client {} ({} side failed)",
            client.client_ipv4,
            if up { "downstream" } else { "upstream" }
        ),
    }
}

/// Adds `ifindex` to the kernel dev map unless the cache already has it.
/// Vacuously succeeds in memory-only mode.
pub(crate) fn ensure_dev_member(st: &mut OffloadState, ifindex: u32) -> bool {
    if !st.kernel_active() {
        return true;
    }
    if st.store.is_dev_member(ifindex) {
        return true;
    }
    if st.maps.dev_add(ifindex) {
        st.store.dev_member_insert(ifindex);
        true
    } else {
        error!("adding ifindex {} to the dev map failed", ifindex);
        false
    }
}

/// Removes every offloaded flow belonging to `client` from both IPv4
/// maps, keeping the session counter and per-upstream limits in step.
pub(crate) fn clear_client_rules(st: &mut OffloadState, client: &Ipv4ClientInfo) {
    if !st.kernel_active() {
        return;
    }
    let client_octets = client.client_ipv4.octets();
    let client_mapped = ipv4_mapped(client.client_ipv4);

    let mut upstream_entries: Vec<(Tether4Key, Tether4Value)> = Vec::new();
    st.maps.upstream4_for_each(&mut |key, value| {
        if key.src4 == client_octets {
            upstream_entries.push((*key, *value));
        }
    });
    let mut downstream_keys: Vec<Tether4Key> = Vec::new();
    st.maps.downstream4_for_each(&mut |key, value| {
        if value.dst46 == client_mapped {
            downstream_keys.push(*key);
        }
    });

    if upstream_entries.len() != downstream_keys.len() {
        error!(
            "unpaired rules for client {}: {} upstream vs {} downstream, leaving them for \
             conntrack delete reconciliation",
            client.client_ipv4,
            upstream_entries.len(),
            downstream_keys.len()
        );
        return;
    }
    if upstream_entries.is_empty() {
        return;
    }

    for (key, _) in &upstream_entries {
        if !st.maps.upstream4_remove(key) {
            warn!("upstream rule for client {} vanished during clear", client.client_ipv4);
        }
    }
    for key in &downstream_keys {
        if !st.maps.downstream4_remove(key) {
            warn!("downstream rule for client {} vanished during clear", client.client_ipv4);
        }
    }
    st.sessions.decrement_by(upstream_entries.len() as u32);

    let mut upstreams: Vec<u32> = upstream_entries.iter().map(|(_, value)| value.oif).collect();
    upstreams.sort_unstable();
    upstreams.dedup();
    for upstream in upstreams {
        st.stats.maybe_clear_limit(
            upstream,
            &st.store,
            &st.sessions,
            st.maps.as_ref(),
            st.stats_sink.as_ref(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(src: &str, sport: u16, dst: &str, dport: u16) -> ConntrackTuple {
        ConntrackTuple {
            proto: IPPROTO_TCP,
            src: src.parse().unwrap(),
            dst: dst.parse().unwrap(),
            src_port: sport,
            dst_port: dport,
        }
    }

    #[test]
    fn message_type_discrimination() {
        let orig = tuple("192.168.49.42", 55555, "93.184.216.34", 443);
        let reply = tuple("93.184.216.34", 443, "100.64.0.7", 44444);
        assert!(!ConntrackEvent::new_flow(orig, reply).is_delete());
        assert!(ConntrackEvent::deleted_flow(orig, reply).is_delete());
    }

    #[test]
    fn tuple_reversal_swaps_addresses_and_ports() {
        let reversed = tuple("93.184.216.34", 443, "100.64.0.7", 44444).reversed();
        assert_eq!(reversed, tuple("100.64.0.7", 44444, "93.184.216.34", 443));
    }

    #[test]
    fn session_counter_tracks_peak() {
        let mut counter = SessionCounter::default();
        counter.increment();
        counter.increment();
        counter.decrement();
        assert_eq!(counter.current(), 1);
        assert_eq!(counter.sample_and_reset(), 2);
        // Peak re-arms at the current level.
        assert_eq!(counter.sample_and_reset(), 1);
        counter.decrement();
        assert_eq!(counter.current(), 0);
        // Underflow is clamped, not wrapped.
        counter.decrement();
        assert_eq!(counter.current(), 0);
    }
}
