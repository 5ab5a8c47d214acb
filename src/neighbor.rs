// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Translates neighbor discovery events into IPv6 downstream rules and
//! IPv4 client records.
//!
//! IPv6 upstream rules are never created here; they come from upstream
//! changes only.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::coordinator::OffloadState;
use crate::rules::{Ipv4ClientInfo, Ipv6DownstreamRule, MacAddr};

/// A neighbor table update as delivered by the neighbor monitor.
/// `is_valid` reflects whether the kernel considers the entry reachable;
/// `mac` is absent for states without a link-layer address.
#[derive(Clone, Debug)]
pub struct NeighborEvent {
    pub ifindex: u32,
    pub ip: IpAddr,
    pub mac: Option<MacAddr>,
    pub is_valid: bool,
}

fn offloadable_neighbor_v6(ip: &Ipv6Addr) -> bool {
    !ip.is_multicast()
        && !ip.is_loopback()
        && !ip.is_unspecified()
        // Link-local (fe80::/10) neighbors never forward via the upstream.
        && (ip.segments()[0] & 0xffc0) != 0xfe80
}

fn offloadable_client_v4(ip: &Ipv4Addr) -> bool {
    !ip.is_multicast()
        && !ip.is_loopback()
        && !ip.is_unspecified()
        && !ip.is_broadcast()
        && !ip.is_link_local()
}

/// Consumes one neighbor event on the coordinator thread, fanning it out
/// to every downstream served on the event's interface.
pub(crate) fn handle_neighbor_event(st: &mut OffloadState, event: &NeighborEvent) {
    if !st.started {
        return;
    }
    for id in st.store.downstreams_on_interface(event.ifindex) {
        let Some(ds) = st.store.downstream(id) else { continue };
        let Some(downstream_mac) = ds.params.mac else { continue };
        let downstream_ifindex = ds.params.index;
        let ipv6_upstream_ifindex = ds.ipv6_upstream_ifindex;

        // A valid entry without a link-layer address is not forwardable
        // yet; treat it like a removal until the address is learned.
        let adding = event.is_valid && event.mac.is_some();

        match event.ip {
            IpAddr::V6(ip) => {
                if !offloadable_neighbor_v6(&ip) {
                    continue;
                }
                if adding {
                    let rule = Ipv6DownstreamRule {
                        upstream_ifindex: ipv6_upstream_ifindex,
                        downstream_ifindex,
                        neighbor: ip,
                        src_mac: downstream_mac,
                        dst_mac: event.mac.unwrap_or(MacAddr::NULL),
                    };
                    st.add_ipv6_downstream_rule(id, rule);
                } else {
                    st.remove_ipv6_downstream_rule(id, ip);
                }
            }
            IpAddr::V4(ip) => {
                if !offloadable_client_v4(&ip) {
                    continue;
                }
                if adding {
                    let client = Ipv4ClientInfo {
                        downstream_ifindex,
                        downstream_mac,
                        client_ipv4: ip,
                        client_mac: event.mac.unwrap_or(MacAddr::NULL),
                    };
                    st.add_client(id, client);
                } else {
                    st.remove_client(id, ip);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v6_address_classes() {
        assert!(offloadable_neighbor_v6(&"2001:db8::1234".parse().unwrap()));
        assert!(!offloadable_neighbor_v6(&"ff02::1".parse().unwrap()));
        assert!(!offloadable_neighbor_v6(&"::1".parse().unwrap()));
        assert!(!offloadable_neighbor_v6(&"fe80::1".parse().unwrap()));
        assert!(!offloadable_neighbor_v6(&"::".parse().unwrap()));
    }

    #[test]
    fn v4_address_classes() {
        assert!(offloadable_client_v4(&"192.168.49.42".parse().unwrap()));
        assert!(!offloadable_client_v4(&"224.0.0.1".parse().unwrap()));
        assert!(!offloadable_client_v4(&"127.0.0.1".parse().unwrap()));
        assert!(!offloadable_client_v4(&"169.254.1.1".parse().unwrap()));
        assert!(!offloadable_client_v4(&"255.255.255.255".parse().unwrap()));
    }
}
