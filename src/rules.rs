// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Forwarding rule records and the in-memory mirror of installed state.
//!
//! Rules are plain records with `make_key`/`make_value` conversions to the
//! kernel layouts; [`RuleStore`] owns every table the coordinator consults
//! and is only ever touched from the coordinator's thread.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use log::error;
use zerocopy::byteorder::network_endian::U16 as NetU16;

use crate::maps::{
    Tether6Value, TetherDownstream6Key, TetherUpstream6Key, ETHERTYPE_IPV6, ETHER_MTU, NO_UPSTREAM,
};

/// An Ethernet MAC address.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The all-zero MAC, standing in for "no L2 address" on raw-IP
    /// interfaces and in deletion events.
    pub const NULL: MacAddr = MacAddr([0; 6]);

    pub fn is_null(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let MacAddr([a, b, c, d, e, g]) = self;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Opaque identity of one per-downstream server, stable for the lifetime
/// of a tethered downstream.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct DownstreamId(pub u32);

/// L2/L3 parameters of an interface, as reported by the serving machinery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceParams {
    pub index: u32,
    pub name: String,
    /// Absent on raw-IP interfaces.
    pub mac: Option<MacAddr>,
    pub is_point_to_point: bool,
}

/// The upper 64 bits of an IPv6 /64 prefix.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Ipv6Prefix64([u8; 8]);

impl Ipv6Prefix64 {
    pub fn new(addr: Ipv6Addr) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&addr.octets()[..8]);
        Ipv6Prefix64(raw)
    }

    pub fn raw(&self) -> [u8; 8] {
        self.0
    }
}

impl fmt::Display for Ipv6Prefix64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut octets = [0u8; 16];
        octets[..8].copy_from_slice(&self.0);
        write!(f, "{}/64", Ipv6Addr::from(octets))
    }
}

impl fmt::Debug for Ipv6Prefix64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One upstream-direction IPv6 forwarding rule: traffic from a downstream
/// client inside `source_prefix` is forwarded out the upstream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Ipv6UpstreamRule {
    pub upstream_ifindex: u32,
    pub downstream_ifindex: u32,
    pub source_prefix: Ipv6Prefix64,
    pub in_dst_mac: MacAddr,
    pub out_src_mac: MacAddr,
    pub out_dst_mac: MacAddr,
}

impl Ipv6UpstreamRule {
    pub fn make_key(&self) -> TetherUpstream6Key {
        TetherUpstream6Key {
            iif: self.downstream_ifindex,
            dst_mac: self.in_dst_mac.0,
            zero: [0; 2],
            src64: self.source_prefix.raw(),
        }
    }

    pub fn make_value(&self) -> Tether6Value {
        Tether6Value {
            oif: self.upstream_ifindex,
            eth_dst_mac: self.out_dst_mac.0,
            eth_src_mac: self.out_src_mac.0,
            eth_proto: NetU16::new(ETHERTYPE_IPV6),
            pmtu: ETHER_MTU,
        }
    }
}

/// One downstream-direction IPv6 forwarding rule for a single neighbor.
///
/// A rule whose `upstream_ifindex` is [`NO_UPSTREAM`] exists only in
/// memory; it is replayed into the kernel once an upstream appears.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv6DownstreamRule {
    pub upstream_ifindex: u32,
    pub downstream_ifindex: u32,
    pub neighbor: Ipv6Addr,
    /// MAC of the downstream interface (frame source).
    pub src_mac: MacAddr,
    /// MAC of the neighbor (frame destination).
    pub dst_mac: MacAddr,
}

impl Ipv6DownstreamRule {
    pub fn make_key(&self) -> TetherDownstream6Key {
        TetherDownstream6Key {
            iif: self.upstream_ifindex,
            dst_mac: MacAddr::NULL.0,
            zero: [0; 2],
            neigh6: self.neighbor.octets(),
        }
    }

    pub fn make_value(&self) -> Tether6Value {
        Tether6Value {
            oif: self.downstream_ifindex,
            eth_dst_mac: self.dst_mac.0,
            eth_src_mac: self.src_mac.0,
            eth_proto: NetU16::new(ETHERTYPE_IPV6),
            pmtu: ETHER_MTU,
        }
    }

    /// Whether the rule is present in the kernel map (as opposed to being
    /// an in-memory placeholder awaiting an upstream).
    pub fn is_installed(&self) -> bool {
        self.upstream_ifindex != NO_UPSTREAM
    }
}

/// One tethered IPv4 client, learned from neighbor discovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv4ClientInfo {
    pub downstream_ifindex: u32,
    pub downstream_mac: MacAddr,
    pub client_ipv4: Ipv4Addr,
    pub client_mac: MacAddr,
}

/// The active IPv4 upstream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UpstreamInfo {
    pub ifindex: u32,
    pub mtu: u16,
}

/// Per-downstream bookkeeping owned by the store.
#[derive(Debug)]
pub(crate) struct DownstreamState {
    pub params: InterfaceParams,
    /// Effective IPv6 upstream for this downstream's rules, or
    /// [`NO_UPSTREAM`].
    pub ipv6_upstream_ifindex: u32,
    pub ipv6_upstream_prefixes: Vec<Ipv6Prefix64>,
}

/// In-memory mirror of everything the coordinator has installed.
#[derive(Default)]
pub(crate) struct RuleStore {
    downstreams: HashMap<DownstreamId, DownstreamState>,
    /// Insertion-ordered per downstream so replay after an upstream change
    /// is deterministic.
    ipv6_downstream_rules: HashMap<DownstreamId, Vec<Ipv6DownstreamRule>>,
    ipv6_upstream_rules: HashMap<DownstreamId, HashSet<Ipv6UpstreamRule>>,
    tether_clients: HashMap<DownstreamId, HashMap<Ipv4Addr, Ipv4ClientInfo>>,
    ipv4_upstream_indices: HashMap<Ipv4Addr, u32>,
    interface_names: HashMap<u32, String>,
    dev_members: HashSet<u32>,
    forwarding_pairs: HashMap<String, HashSet<String>>,
    pub last_ipv4_upstream_ifindex: u32,
    pub ipv4_upstream_info: Option<UpstreamInfo>,
}

impl RuleStore {
    pub fn register_downstream(&mut self, id: DownstreamId, params: InterfaceParams) -> bool {
        if self.downstreams.contains_key(&id) {
            return false;
        }
        self.downstreams.insert(
            id,
            DownstreamState {
                params,
                ipv6_upstream_ifindex: NO_UPSTREAM,
                ipv6_upstream_prefixes: Vec::new(),
            },
        );
        true
    }

    /// Drops the downstream and every partition it owns.
    pub fn unregister_downstream(&mut self, id: DownstreamId) -> bool {
        let existed = self.downstreams.remove(&id).is_some();
        self.ipv6_downstream_rules.remove(&id);
        self.ipv6_upstream_rules.remove(&id);
        self.tether_clients.remove(&id);
        existed
    }

    pub fn is_served(&self, id: DownstreamId) -> bool {
        self.downstreams.contains_key(&id)
    }

    pub fn served_count(&self) -> usize {
        self.downstreams.len()
    }

    pub fn downstream(&self, id: DownstreamId) -> Option<&DownstreamState> {
        self.downstreams.get(&id)
    }

    pub fn downstream_mut(&mut self, id: DownstreamId) -> Option<&mut DownstreamState> {
        self.downstreams.get_mut(&id)
    }

    /// Downstreams whose interface matches `ifindex`, for neighbor-event
    /// fan-out. Sorted so fan-out order is deterministic.
    pub fn downstreams_on_interface(&self, ifindex: u32) -> Vec<DownstreamId> {
        let mut ids: Vec<_> = self
            .downstreams
            .iter()
            .filter(|(_, ds)| ds.params.index == ifindex)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    // IPv6 downstream rules, keyed by neighbor address within a downstream.

    pub fn ipv6_downstream_rule(
        &self,
        id: DownstreamId,
        neighbor: Ipv6Addr,
    ) -> Option<&Ipv6DownstreamRule> {
        self.ipv6_downstream_rules.get(&id)?.iter().find(|r| r.neighbor == neighbor)
    }

    /// Inserts or replaces the rule for its neighbor, preserving the
    /// original insertion position on replace.
    pub fn upsert_ipv6_downstream_rule(&mut self, id: DownstreamId, rule: Ipv6DownstreamRule) {
        let rules = self.ipv6_downstream_rules.entry(id).or_default();
        match rules.iter_mut().find(|r| r.neighbor == rule.neighbor) {
            Some(slot) => *slot = rule,
            None => rules.push(rule),
        }
    }

    pub fn remove_ipv6_downstream_rule(
        &mut self,
        id: DownstreamId,
        neighbor: Ipv6Addr,
    ) -> Option<Ipv6DownstreamRule> {
        let rules = self.ipv6_downstream_rules.get_mut(&id)?;
        let pos = rules.iter().position(|r| r.neighbor == neighbor)?;
        Some(rules.remove(pos))
    }

    pub fn ipv6_downstream_rules(&self, id: DownstreamId) -> &[Ipv6DownstreamRule] {
        self.ipv6_downstream_rules.get(&id).map_or(&[], Vec::as_slice)
    }

    pub fn clear_ipv6_downstream_rules(&mut self, id: DownstreamId) -> Vec<Ipv6DownstreamRule> {
        self.ipv6_downstream_rules.remove(&id).unwrap_or_default()
    }

    /// Rewrites the upstream ifindex of every stored downstream rule for
    /// `id`, returning the rules in insertion order.
    pub fn retarget_ipv6_downstream_rules(
        &mut self,
        id: DownstreamId,
        upstream_ifindex: u32,
    ) -> Vec<Ipv6DownstreamRule> {
        let rules = self.ipv6_downstream_rules.entry(id).or_default();
        for rule in rules.iter_mut() {
            rule.upstream_ifindex = upstream_ifindex;
        }
        rules.clone()
    }

    // IPv6 upstream rules.

    pub fn insert_ipv6_upstream_rule(&mut self, id: DownstreamId, rule: Ipv6UpstreamRule) {
        let rules = self.ipv6_upstream_rules.entry(id).or_default();
        if let Some(other) = rules.iter().find(|r| r.upstream_ifindex != rule.upstream_ifindex) {
            error!(
                "upstream rule set for {:?} mixes upstreams {} and {}",
                id, other.upstream_ifindex, rule.upstream_ifindex
            );
        }
        rules.insert(rule);
    }

    pub fn take_ipv6_upstream_rules(&mut self, id: DownstreamId) -> Vec<Ipv6UpstreamRule> {
        self.ipv6_upstream_rules.remove(&id).map_or_else(Vec::new, |s| s.into_iter().collect())
    }

    pub fn ipv6_upstream_rule_count(&self, id: DownstreamId) -> usize {
        self.ipv6_upstream_rules.get(&id).map_or(0, HashSet::len)
    }

    /// True when any IPv6 rule (either direction) is installed in the
    /// kernel with `ifindex` as its upstream.
    pub fn has_ipv6_rules_on_upstream(&self, ifindex: u32) -> bool {
        if ifindex == NO_UPSTREAM {
            return false;
        }
        self.ipv6_upstream_rules
            .values()
            .any(|rules| rules.iter().any(|r| r.upstream_ifindex == ifindex))
            || self
                .ipv6_downstream_rules
                .values()
                .any(|rules| rules.iter().any(|r| r.upstream_ifindex == ifindex))
    }

    // IPv4 clients.

    /// Registers a client, upholding system-wide address uniqueness: a
    /// stale record of the same address under any downstream is evicted
    /// and returned so its rules can be cleared.
    pub fn insert_client(
        &mut self,
        id: DownstreamId,
        client: Ipv4ClientInfo,
    ) -> Option<Ipv4ClientInfo> {
        let evicted = self.remove_client_anywhere(client.client_ipv4, Some(id));
        self.tether_clients.entry(id).or_default().insert(client.client_ipv4, client);
        evicted
    }

    fn remove_client_anywhere(
        &mut self,
        addr: Ipv4Addr,
        skip: Option<DownstreamId>,
    ) -> Option<Ipv4ClientInfo> {
        for (id, clients) in self.tether_clients.iter_mut() {
            if Some(*id) == skip {
                continue;
            }
            if let Some(old) = clients.remove(&addr) {
                return Some(old);
            }
        }
        None
    }

    pub fn remove_client(&mut self, id: DownstreamId, addr: Ipv4Addr) -> Option<Ipv4ClientInfo> {
        self.tether_clients.get_mut(&id)?.remove(&addr)
    }

    pub fn clear_clients(&mut self, id: DownstreamId) -> Vec<Ipv4ClientInfo> {
        self.tether_clients.remove(&id).map_or_else(Vec::new, |m| m.into_values().collect())
    }

    pub fn client_by_ip(&self, addr: Ipv4Addr) -> Option<&Ipv4ClientInfo> {
        self.tether_clients.values().find_map(|clients| clients.get(&addr))
    }

    pub fn clients(&self, id: DownstreamId) -> Vec<Ipv4ClientInfo> {
        self.tether_clients.get(&id).map_or_else(Vec::new, |m| m.values().cloned().collect())
    }

    pub fn all_clients(&self) -> Vec<Ipv4ClientInfo> {
        self.tether_clients.values().flat_map(|m| m.values().cloned()).collect()
    }

    // Upstream lookup tables.

    pub fn set_ipv4_upstream_indices(&mut self, entries: HashMap<Ipv4Addr, u32>) {
        self.ipv4_upstream_indices = entries;
    }

    pub fn ipv4_upstream_index(&self, addr: Ipv4Addr) -> Option<u32> {
        self.ipv4_upstream_indices.get(&addr).copied()
    }

    /// Records an ifindex-to-name mapping. Once written, a mapping is
    /// never rewritten to a different name; a mismatch is reported by the
    /// caller.
    pub fn record_interface_name(&mut self, ifindex: u32, name: &str) -> Result<(), String> {
        match self.interface_names.get(&ifindex) {
            Some(existing) if existing != name => Err(existing.clone()),
            Some(_) => Ok(()),
            None => {
                self.interface_names.insert(ifindex, name.to_string());
                Ok(())
            }
        }
    }

    pub fn interface_name(&self, ifindex: u32) -> Option<&str> {
        self.interface_names.get(&ifindex).map(String::as_str)
    }

    pub fn interface_index(&self, name: &str) -> Option<u32> {
        self.interface_names.iter().find_map(|(i, n)| (n == name).then_some(*i))
    }

    // Kernel dev-map membership cache.

    pub fn dev_member_insert(&mut self, ifindex: u32) -> bool {
        self.dev_members.insert(ifindex)
    }

    pub fn is_dev_member(&self, ifindex: u32) -> bool {
        self.dev_members.contains(&ifindex)
    }

    // Forwarding pair graph.

    pub fn add_forwarding_pair(&mut self, upstream: &str, downstream: &str) -> bool {
        self.forwarding_pairs.entry(upstream.to_string()).or_default().insert(downstream.into())
    }

    pub fn remove_forwarding_pair(&mut self, upstream: &str, downstream: &str) -> bool {
        let Some(set) = self.forwarding_pairs.get_mut(upstream) else { return false };
        let removed = set.remove(downstream);
        if set.is_empty() {
            self.forwarding_pairs.remove(upstream);
        }
        removed
    }

    pub fn downstream_has_pairs(&self, downstream: &str) -> bool {
        self.forwarding_pairs.values().any(|set| set.contains(downstream))
    }

    pub fn upstream_has_pairs(&self, upstream: &str) -> bool {
        self.forwarding_pairs.get(upstream).is_some_and(|set| !set.is_empty())
    }

    pub fn forwarding_pairs(&self) -> Vec<(String, Vec<String>)> {
        let mut pairs: Vec<(String, Vec<String>)> = self
            .forwarding_pairs
            .iter()
            .map(|(up, downs)| {
                let mut downs: Vec<String> = downs.iter().cloned().collect();
                downs.sort();
                (up.clone(), downs)
            })
            .collect();
        pairs.sort();
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn params(index: u32, name: &str) -> InterfaceParams {
        InterfaceParams {
            index,
            name: name.to_string(),
            mac: Some(MacAddr([2, 0, 0, 0, 0, index as u8])),
            is_point_to_point: false,
        }
    }

    fn downstream_rule(upstream: u32, neighbor: Ipv6Addr) -> Ipv6DownstreamRule {
        Ipv6DownstreamRule {
            upstream_ifindex: upstream,
            downstream_ifindex: 10,
            neighbor,
            src_mac: MacAddr([2, 0, 0, 0, 0, 1]),
            dst_mac: MacAddr([2, 0, 0, 0, 0, 2]),
        }
    }

    #[test]
    fn mac_formatting() {
        assert_eq!(MacAddr([0xaa, 0xbb, 0xcc, 0, 0, 1]).to_string(), "aa:bb:cc:00:00:01");
        assert!(MacAddr::NULL.is_null());
    }

    #[test]
    fn prefix_keeps_upper_bits_only() {
        let prefix = Ipv6Prefix64::new("2001:db8:1:2:3:4:5:6".parse().unwrap());
        assert_eq!(prefix.raw(), [0x20, 0x01, 0x0d, 0xb8, 0x00, 0x01, 0x00, 0x02]);
        assert_eq!(prefix.to_string(), "2001:db8:1:2::/64");
    }

    #[test]
    fn upstream_rule_key_value() {
        let rule = Ipv6UpstreamRule {
            upstream_ifindex: 20,
            downstream_ifindex: 10,
            source_prefix: Ipv6Prefix64::new("2001:db8::".parse().unwrap()),
            in_dst_mac: MacAddr([0xaa, 0xbb, 0xcc, 0, 0, 1]),
            out_src_mac: MacAddr::NULL,
            out_dst_mac: MacAddr::NULL,
        };
        let key = rule.make_key();
        assert_eq!(key.iif, 10);
        assert_eq!(key.dst_mac, [0xaa, 0xbb, 0xcc, 0, 0, 1]);
        assert_eq!(key.src64, [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0]);
        let value = rule.make_value();
        assert_eq!(value.oif, 20);
        assert_eq!(value.pmtu, ETHER_MTU);
    }

    #[test]
    fn downstream_rule_key_uses_upstream_as_iif() {
        let rule = downstream_rule(20, "2001:db8::1234".parse().unwrap());
        let key = rule.make_key();
        assert_eq!(key.iif, 20);
        assert_eq!(key.dst_mac, [0; 6]);
        let value = rule.make_value();
        assert_eq!(value.oif, 10);
        assert!(rule.is_installed());
        assert!(!downstream_rule(NO_UPSTREAM, rule.neighbor).is_installed());
    }

    #[test]
    fn downstream_registration_is_unique() {
        let mut store = RuleStore::default();
        assert!(store.register_downstream(DownstreamId(1), params(10, "wlan1")));
        assert!(!store.register_downstream(DownstreamId(1), params(10, "wlan1")));
        assert!(store.unregister_downstream(DownstreamId(1)));
        assert!(!store.unregister_downstream(DownstreamId(1)));
    }

    #[test]
    fn downstream_rules_keep_insertion_order() {
        let mut store = RuleStore::default();
        let id = DownstreamId(1);
        let n1: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let n2: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let n3: Ipv6Addr = "2001:db8::3".parse().unwrap();
        for n in [n1, n2, n3] {
            store.upsert_ipv6_downstream_rule(id, downstream_rule(20, n));
        }
        // Replacing the middle rule must not move it.
        store.upsert_ipv6_downstream_rule(id, downstream_rule(20, n2));
        let order: Vec<_> = store.ipv6_downstream_rules(id).iter().map(|r| r.neighbor).collect();
        assert_eq!(order, vec![n1, n2, n3]);

        let retargeted = store.retarget_ipv6_downstream_rules(id, NO_UPSTREAM);
        assert!(retargeted.iter().all(|r| r.upstream_ifindex == NO_UPSTREAM));
        assert_eq!(retargeted.len(), 3);
    }

    #[test]
    fn client_uniqueness_evicts_stale_entry() {
        let mut store = RuleStore::default();
        let addr: Ipv4Addr = "192.168.49.42".parse().unwrap();
        let client = |ifindex: u32| Ipv4ClientInfo {
            downstream_ifindex: ifindex,
            downstream_mac: MacAddr([2, 0, 0, 0, 0, 1]),
            client_ipv4: addr,
            client_mac: MacAddr([2, 0, 0, 0, 0, 9]),
        };
        assert_matches!(store.insert_client(DownstreamId(1), client(10)), None);
        // The same address showing up under another downstream evicts the
        // original record.
        let evicted = store.insert_client(DownstreamId(2), client(11));
        assert_matches!(evicted, Some(c) if c.downstream_ifindex == 10);
        assert_eq!(store.client_by_ip(addr).unwrap().downstream_ifindex, 11);
        assert_eq!(store.all_clients().len(), 1);
    }

    #[test]
    fn interface_names_never_rewrite() {
        let mut store = RuleStore::default();
        assert_matches!(store.record_interface_name(20, "rmnet_data1"), Ok(()));
        assert_matches!(store.record_interface_name(20, "rmnet_data1"), Ok(()));
        assert_matches!(store.record_interface_name(20, "rmnet_data2"), Err(old) if old == "rmnet_data1");
        assert_eq!(store.interface_index("rmnet_data1"), Some(20));
    }

    #[test]
    fn forwarding_pair_graph() {
        let mut store = RuleStore::default();
        assert!(store.add_forwarding_pair("rmnet0", "wlan1"));
        assert!(!store.add_forwarding_pair("rmnet0", "wlan1"));
        assert!(store.add_forwarding_pair("rmnet0", "usb0"));
        assert!(store.downstream_has_pairs("wlan1"));
        assert!(store.upstream_has_pairs("rmnet0"));
        assert!(store.remove_forwarding_pair("rmnet0", "wlan1"));
        assert!(!store.downstream_has_pairs("wlan1"));
        assert!(store.remove_forwarding_pair("rmnet0", "usb0"));
        assert!(!store.upstream_has_pairs("rmnet0"));
    }

    #[test]
    fn ipv6_rules_on_upstream_sees_both_directions() {
        let mut store = RuleStore::default();
        let id = DownstreamId(1);
        store.register_downstream(id, params(10, "wlan1"));
        assert!(!store.has_ipv6_rules_on_upstream(20));
        store.upsert_ipv6_downstream_rule(id, downstream_rule(20, "2001:db8::1".parse().unwrap()));
        assert!(store.has_ipv6_rules_on_upstream(20));
        store.retarget_ipv6_downstream_rules(id, NO_UPSTREAM);
        assert!(!store.has_ipv6_rules_on_upstream(20));
        store.insert_ipv6_upstream_rule(
            id,
            Ipv6UpstreamRule {
                upstream_ifindex: 20,
                downstream_ifindex: 10,
                source_prefix: Ipv6Prefix64::new("2001:db8::".parse().unwrap()),
                in_dst_mac: MacAddr([2, 0, 0, 0, 0, 1]),
                out_src_mac: MacAddr::NULL,
                out_dst_mac: MacAddr::NULL,
            },
        );
        assert!(store.has_ipv6_rules_on_upstream(20));
        assert_eq!(store.take_ipv6_upstream_rules(id).len(), 1);
        assert!(!store.has_ipv6_rules_on_upstream(20));
    }
}
