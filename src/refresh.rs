// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Keeps kernel conntrack entries alive for offloaded flows.
//!
//! Offloaded traffic never traverses the host stack, so conntrack would
//! age out the very flows the datapath is forwarding. The refresher walks
//! both IPv4 maps and re-arms the timeout of every flow the kernel
//! forwarded recently.

use std::net::Ipv4Addr;

use log::{error, warn};

use crate::conntrack::{ConntrackTuple, IPPROTO_TCP};
use crate::maps::{MapAccessor, Tether4Key, Tether4Value};
use crate::netlink::{ConntrackNetlink, NetlinkError};

pub const CONNTRACK_TIMEOUT_UPDATE_INTERVAL_MS: u64 = 60_000;
pub const CONNTRACK_METRICS_UPDATE_INTERVAL_MS: u64 = 300_000;

/// Timeout re-armed on established TCP flows, in seconds.
pub const NF_CONNTRACK_TCP_TIMEOUT_ESTABLISHED: u32 = 432_000;
/// Timeout re-armed on UDP stream flows, in seconds.
pub const NF_CONNTRACK_UDP_TIMEOUT_STREAM: u32 = 180;

/// Flows used within this window of the refresh tick are re-armed.
const REFRESH_WINDOW_NS: u64 = CONNTRACK_TIMEOUT_UPDATE_INTERVAL_MS * 1_000_000;

/// Monotonic time source matching the kernel's `last_used_ns` clock.
pub trait Clock {
    fn now_ns(&self) -> u64;
}

/// `CLOCK_MONOTONIC`, the clock the datapath stamps rules with.
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        // SAFETY: clock_gettime writes a timespec we own.
        let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if ret != 0 {
            return 0;
        }
        (ts.tv_sec as u64).saturating_mul(1_000_000_000).saturating_add(ts.tv_nsec as u64)
    }
}

fn tuple_of(key: &Tether4Key) -> ConntrackTuple {
    ConntrackTuple {
        proto: key.l4proto,
        src: Ipv4Addr::from(key.src4),
        dst: Ipv4Addr::from(key.dst4),
        src_port: key.src_port,
        dst_port: key.dst_port,
    }
}

fn maybe_refresh(
    netlink: &dyn ConntrackNetlink,
    key: &Tether4Key,
    value: &Tether4Value,
    now_ns: u64,
    reversed: bool,
) {
    if value.last_used_ns == 0 || now_ns.saturating_sub(value.last_used_ns) > REFRESH_WINDOW_NS {
        return;
    }
    let timeout = if key.l4proto == IPPROTO_TCP {
        NF_CONNTRACK_TCP_TIMEOUT_ESTABLISHED
    } else {
        NF_CONNTRACK_UDP_TIMEOUT_STREAM
    };
    // Downstream keys hold the reply direction; the netlink attribute is
    // always the original direction, so flip them.
    let tuple = if reversed { tuple_of(key).reversed() } else { tuple_of(key) };
    match netlink.request_timeout_update(&tuple, timeout) {
        Ok(()) => {}
        Err(NetlinkError::NotFound) => {
            warn!("conntrack entry already gone for {}:{}", tuple.src, tuple.src_port)
        }
        Err(e) => error!("conntrack timeout update for {}:{} failed: {}", tuple.src, tuple.src_port, e),
    }
}

/// One refresh pass over both IPv4 maps.
pub(crate) fn refresh_offloaded_flows(
    maps: &dyn MapAccessor,
    netlink: &dyn ConntrackNetlink,
    clock: &dyn Clock,
) {
    let now_ns = clock.now_ns();
    maps.upstream4_for_each(&mut |key, value| maybe_refresh(netlink, key, value, now_ns, false));
    maps.downstream4_for_each(&mut |key, value| maybe_refresh(netlink, key, value, now_ns, true));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::IPPROTO_UDP;
    use crate::maps::{ipv4_mapped, ETHERTYPE_IPV4};
    use crate::rules::MacAddr;
    use crate::testutil::{FakeClock, FakeMaps, FakeNetlink};
    use std::net::Ipv4Addr;
    use zerocopy::byteorder::network_endian::U16 as NetU16;

    fn key(proto: u8, iif: u32, src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Tether4Key {
        Tether4Key {
            iif,
            dst_mac: MacAddr::NULL.0,
            l4proto: proto,
            zero: 0,
            src4: src,
            dst4: dst,
            src_port: sport,
            dst_port: dport,
        }
    }

    fn value(oif: u32, last_used_ns: u64) -> Tether4Value {
        Tether4Value {
            oif,
            eth_dst_mac: MacAddr::NULL.0,
            eth_src_mac: MacAddr::NULL.0,
            eth_proto: NetU16::new(ETHERTYPE_IPV4),
            pmtu: 1500,
            src46: ipv4_mapped(Ipv4Addr::from([100, 64, 0, 7])),
            dst46: ipv4_mapped(Ipv4Addr::from([93, 184, 216, 34])),
            src_port: 44444,
            dst_port: 443,
            last_used_ns,
        }
    }

    #[test]
    fn refreshes_recent_flows_only() {
        let maps = FakeMaps::new();
        let netlink = FakeNetlink::default();
        let clock = FakeClock::at_ns(120_000_000_000);

        // First flow was used 30s ago and is refreshed; the second went
        // quiet 90s ago and is skipped; the third never forwarded.
        maps.upstream4_add(
            &key(IPPROTO_TCP, 11, [192, 168, 49, 42], [93, 184, 216, 34], 55555, 443),
            &value(21, 90_000_000_000),
        );
        maps.upstream4_add(
            &key(IPPROTO_TCP, 11, [192, 168, 49, 43], [93, 184, 216, 34], 55556, 443),
            &value(21, 30_000_000_000),
        );
        maps.upstream4_add(
            &key(IPPROTO_TCP, 11, [192, 168, 49, 44], [93, 184, 216, 34], 55557, 443),
            &value(21, 0),
        );

        refresh_offloaded_flows(&maps, &netlink, &clock);

        let sent = netlink.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.src, Ipv4Addr::from([192, 168, 49, 42]));
        assert_eq!(sent[0].1, NF_CONNTRACK_TCP_TIMEOUT_ESTABLISHED);
    }

    #[test]
    fn downstream_tuples_are_reversed() {
        let maps = FakeMaps::new();
        let netlink = FakeNetlink::default();
        let clock = FakeClock::at_ns(120_000_000_000);

        maps.downstream4_add(
            &key(IPPROTO_UDP, 21, [93, 184, 216, 34], [100, 64, 0, 7], 443, 44444),
            &value(11, 119_000_000_000),
        );
        refresh_offloaded_flows(&maps, &netlink, &clock);

        let sent = netlink.requests();
        assert_eq!(sent.len(), 1);
        let (tuple, timeout) = &sent[0];
        assert_eq!(tuple.src, Ipv4Addr::from([100, 64, 0, 7]));
        assert_eq!(tuple.dst, Ipv4Addr::from([93, 184, 216, 34]));
        assert_eq!(tuple.src_port, 44444);
        assert_eq!(tuple.dst_port, 443);
        assert_eq!(*timeout, NF_CONNTRACK_UDP_TIMEOUT_STREAM);
    }

    #[test]
    fn enoent_is_not_fatal() {
        let maps = FakeMaps::new();
        let netlink = FakeNetlink::default();
        netlink.fail_with_not_found();
        let clock = FakeClock::at_ns(120_000_000_000);
        maps.upstream4_add(
            &key(IPPROTO_TCP, 11, [192, 168, 49, 42], [93, 184, 216, 34], 55555, 443),
            &value(21, 119_000_000_000),
        );
        // Must not panic; the flow is simply gone.
        refresh_offloaded_flows(&maps, &netlink, &clock);
        assert_eq!(netlink.requests().len(), 1);
    }
}
