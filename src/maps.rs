// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed access to the kernel-shared tethering maps.
//!
//! The key/value layouts here must match the in-kernel tethering program
//! byte for byte: `#[repr(C)]` with explicit padding, integers host-endian,
//! IP addresses as raw network-order bytes, ethertypes network-endian (the
//! datapath copies them straight into the L2 header).

use std::io;
use std::marker::PhantomData;

use log::{error, warn};
use zerocopy::byteorder::network_endian::U16 as NetU16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::bpf::MapFd;

/// Directory all tethering BPF objects are pinned under.
pub const BPF_TETHER_DIR: &str = "/sys/fs/bpf/tethering";

/// Upstream ifindex value meaning "no upstream"; rules carrying it exist
/// only in memory, never in a kernel map.
pub const NO_UPSTREAM: u32 = 0;

/// Default path MTU programmed into rule values when the upstream does not
/// report one.
pub const ETHER_MTU: u16 = 1500;

/// Lower bound for programmed path MTUs (minimum IPv6 link MTU).
pub const IPV6_MIN_MTU: u16 = 1280;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

/// Largest representable data limit; programming this value disables
/// enforcement for the interface.
pub const QUOTA_UNLIMITED: u64 = i64::MAX as u64;

fn map_path(which: &str) -> String {
    format!("{BPF_TETHER_DIR}/map_offload_tether_{which}_map")
}

/// Key of `upstream6`: traffic entering `iif` addressed to `dst_mac` from
/// a source in the /64 `src64` is forwarded to the upstream.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct TetherUpstream6Key {
    pub iif: u32,
    pub dst_mac: [u8; 6],
    pub zero: [u8; 2],
    pub src64: [u8; 8],
}

/// Key of `downstream6`: traffic entering `iif` for neighbor `neigh6` is
/// forwarded back down.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct TetherDownstream6Key {
    pub iif: u32,
    pub dst_mac: [u8; 6],
    pub zero: [u8; 2],
    pub neigh6: [u8; 16],
}

/// Value shared by both IPv6 maps.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct Tether6Value {
    pub oif: u32,
    pub eth_dst_mac: [u8; 6],
    pub eth_src_mac: [u8; 6],
    pub eth_proto: NetU16,
    pub pmtu: u16,
}

/// Key of `upstream4`/`downstream4`: one direction of a NAT flow.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct Tether4Key {
    pub iif: u32,
    pub dst_mac: [u8; 6],
    pub l4proto: u8,
    pub zero: u8,
    pub src4: [u8; 4],
    pub dst4: [u8; 4],
    pub src_port: u16,
    pub dst_port: u16,
}

/// Value of `upstream4`/`downstream4`: the rewrite applied to the flow.
/// `last_used_ns` is written by the kernel each time the rule forwards a
/// packet; user space only ever reads it.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct Tether4Value {
    pub oif: u32,
    pub eth_dst_mac: [u8; 6],
    pub eth_src_mac: [u8; 6],
    pub eth_proto: NetU16,
    pub pmtu: u16,
    pub src46: [u8; 16],
    pub dst46: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub last_used_ns: u64,
}

/// Value of the per-upstream `stats` map, keyed by upstream ifindex.
#[repr(C)]
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, IntoBytes, FromBytes, KnownLayout, Immutable,
)]
pub struct TetherStatsValue {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

/// Encodes an IPv4 address as IPv4-mapped IPv6 bytes, the form both
/// `src46`/`dst46` fields use.
pub fn ipv4_mapped(addr: std::net::Ipv4Addr) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[10] = 0xff;
    out[11] = 0xff;
    out[12..].copy_from_slice(&addr.octets());
    out
}

/// Direction a program forwards toward, from the attached interface's
/// point of view.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Upstream,
    Downstream,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// Interfaces named with this prefix are IPv4-only by construction; the
/// IPv6 program is never attached to them.
const IPV4_ONLY_IFACE_PREFIX: &str = "v4-";

pub(crate) fn skips_ipv6_program(ifname: &str) -> bool {
    ifname.starts_with(IPV4_ONLY_IFACE_PREFIX)
}

/// Attaches/detaches the tethering sched_cls programs on an interface.
/// Backed by the platform's tc utility; supplied by the embedder.
pub trait SchedClsApi {
    fn attach(&self, ifname: &str, dir: Direction, family: IpFamily) -> io::Result<()>;
    fn detach(&self, ifname: &str, family: IpFamily) -> io::Result<()>;
}

/// The capability the coordinator uses for every kernel map interaction.
///
/// Mutating operations return `bool` success; failures are logged by the
/// implementation and the caller keeps its in-memory state unchanged so a
/// later retry sees a consistent view.
pub trait MapAccessor {
    /// False on platforms without BPF offload support; every other method
    /// is then a no-op.
    fn is_initialized(&self) -> bool;

    fn upstream6_add(&self, key: &TetherUpstream6Key, value: &Tether6Value) -> bool;
    fn upstream6_remove(&self, key: &TetherUpstream6Key) -> bool;

    fn downstream6_add(&self, key: &TetherDownstream6Key, value: &Tether6Value) -> bool;
    fn downstream6_remove(&self, key: &TetherDownstream6Key) -> bool;

    fn upstream4_get(&self, key: &Tether4Key) -> Option<Tether4Value>;
    fn upstream4_add(&self, key: &Tether4Key, value: &Tether4Value) -> bool;
    fn upstream4_remove(&self, key: &Tether4Key) -> bool;
    fn upstream4_for_each(&self, f: &mut dyn FnMut(&Tether4Key, &Tether4Value));

    fn downstream4_add(&self, key: &Tether4Key, value: &Tether4Value) -> bool;
    fn downstream4_remove(&self, key: &Tether4Key) -> bool;
    fn downstream4_for_each(&self, f: &mut dyn FnMut(&Tether4Key, &Tether4Value));

    /// Atomically reads and removes the stats entry for an upstream. Must
    /// only be called when no rule forwards via that upstream.
    fn stats_get_and_clear(&self, upstream_ifindex: u32) -> Option<TetherStatsValue>;
    fn stats_for_each(&self, f: &mut dyn FnMut(u32, &TetherStatsValue));

    fn limit_set(&self, upstream_ifindex: u32, quota_bytes: u64) -> bool;
    fn limit_remove(&self, upstream_ifindex: u32) -> bool;

    fn dev_add(&self, ifindex: u32) -> bool;

    /// Read-only view of the datapath's per-probe error counters.
    fn error_for_each(&self, f: &mut dyn FnMut(u32, u32));

    fn attach_program(&self, ifname: &str, dir: Direction, family: IpFamily);
    fn detach_program(&self, ifname: &str, family: IpFamily);
}

/// Typed wrapper over one pinned map.
struct TypedMap<K, V> {
    name: &'static str,
    fd: MapFd,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> TypedMap<K, V>
where
    K: IntoBytes + FromBytes + Immutable + KnownLayout + Copy,
    V: IntoBytes + FromBytes + Immutable + KnownLayout + Copy,
{
    fn open(name: &'static str) -> io::Result<Self> {
        let fd = MapFd::from_pinned(&map_path(name))?;
        Ok(TypedMap { name, fd, _marker: PhantomData })
    }

    fn get(&self, key: &K) -> Option<V> {
        let mut value = V::new_zeroed();
        match self.fd.lookup(key.as_bytes(), value.as_mut_bytes()) {
            Ok(true) => Some(value),
            Ok(false) => None,
            Err(e) => {
                error!("lookup on {} failed: {}", self.name, e);
                None
            }
        }
    }

    fn add(&self, key: &K, value: &V) -> bool {
        match self.fd.update(key.as_bytes(), value.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                error!("update on {} failed: {}", self.name, e);
                false
            }
        }
    }

    fn remove(&self, key: &K) -> bool {
        match self.fd.delete(key.as_bytes()) {
            Ok(present) => present,
            Err(e) => {
                error!("delete on {} failed: {}", self.name, e);
                false
            }
        }
    }

    fn take(&self, key: &K) -> Option<V> {
        let mut value = V::new_zeroed();
        match self.fd.lookup_and_delete(key.as_bytes(), value.as_mut_bytes()) {
            Ok(true) => Some(value),
            Ok(false) => None,
            Err(e) => {
                error!("lookup-and-delete on {} failed: {}", self.name, e);
                None
            }
        }
    }

    /// Snapshot iteration: collects the key set first, then looks each key
    /// up, so entries present throughout are visited exactly once even
    /// while the kernel mutates the map.
    fn for_each(&self, f: &mut dyn FnMut(&K, &V)) {
        let mut keys = Vec::new();
        let mut cursor: Option<K> = None;
        loop {
            let mut next = K::new_zeroed();
            match self.fd.next_key(cursor.as_ref().map(|k| k.as_bytes()), next.as_mut_bytes()) {
                Ok(true) => {
                    keys.push(next);
                    cursor = Some(next);
                }
                Ok(false) => break,
                Err(e) => {
                    error!("key iteration on {} failed: {}", self.name, e);
                    return;
                }
            }
        }
        for key in keys {
            if let Some(value) = self.get(&key) {
                f(&key, &value);
            }
        }
    }
}

struct KernelMapsInner {
    upstream6: TypedMap<TetherUpstream6Key, Tether6Value>,
    downstream6: TypedMap<TetherDownstream6Key, Tether6Value>,
    upstream4: TypedMap<Tether4Key, Tether4Value>,
    downstream4: TypedMap<Tether4Key, Tether4Value>,
    stats: TypedMap<u32, TetherStatsValue>,
    limit: TypedMap<u32, u64>,
    dev: TypedMap<u32, u32>,
    error: TypedMap<u32, u32>,
}

/// Production [`MapAccessor`] backed by the pinned tethering maps.
///
/// When any pinned map is missing (no BPF offload on this device) the
/// accessor degrades to an uninitialized no-op shell rather than failing,
/// so the coordinator can keep a consistent in-memory view.
pub struct KernelMaps {
    inner: Option<KernelMapsInner>,
    programs: Box<dyn SchedClsApi>,
}

impl KernelMaps {
    pub fn open(programs: Box<dyn SchedClsApi>) -> Self {
        let inner = || -> io::Result<KernelMapsInner> {
            Ok(KernelMapsInner {
                upstream6: TypedMap::open("upstream6")?,
                downstream6: TypedMap::open("downstream6")?,
                upstream4: TypedMap::open("upstream4")?,
                downstream4: TypedMap::open("downstream4")?,
                stats: TypedMap::open("stats")?,
                limit: TypedMap::open("limit")?,
                dev: TypedMap::open("dev")?,
                error: TypedMap::open("error")?,
            })
        }();
        let inner = match inner {
            Ok(inner) => Some(inner),
            Err(e) => {
                warn!("tethering offload maps unavailable, running as no-op: {}", e);
                None
            }
        };
        KernelMaps { inner, programs }
    }
}

impl MapAccessor for KernelMaps {
    fn is_initialized(&self) -> bool {
        self.inner.is_some()
    }

    fn upstream6_add(&self, key: &TetherUpstream6Key, value: &Tether6Value) -> bool {
        self.inner.as_ref().is_some_and(|m| m.upstream6.add(key, value))
    }

    fn upstream6_remove(&self, key: &TetherUpstream6Key) -> bool {
        self.inner.as_ref().is_some_and(|m| m.upstream6.remove(key))
    }

    fn downstream6_add(&self, key: &TetherDownstream6Key, value: &Tether6Value) -> bool {
        self.inner.as_ref().is_some_and(|m| m.downstream6.add(key, value))
    }

    fn downstream6_remove(&self, key: &TetherDownstream6Key) -> bool {
        self.inner.as_ref().is_some_and(|m| m.downstream6.remove(key))
    }

    fn upstream4_get(&self, key: &Tether4Key) -> Option<Tether4Value> {
        self.inner.as_ref().and_then(|m| m.upstream4.get(key))
    }

    fn upstream4_add(&self, key: &Tether4Key, value: &Tether4Value) -> bool {
        self.inner.as_ref().is_some_and(|m| m.upstream4.add(key, value))
    }

    fn upstream4_remove(&self, key: &Tether4Key) -> bool {
        self.inner.as_ref().is_some_and(|m| m.upstream4.remove(key))
    }

    fn upstream4_for_each(&self, f: &mut dyn FnMut(&Tether4Key, &Tether4Value)) {
        if let Some(m) = self.inner.as_ref() {
            m.upstream4.for_each(f);
        }
    }

    fn downstream4_add(&self, key: &Tether4Key, value: &Tether4Value) -> bool {
        self.inner.as_ref().is_some_and(|m| m.downstream4.add(key, value))
    }

    fn downstream4_remove(&self, key: &Tether4Key) -> bool {
        self.inner.as_ref().is_some_and(|m| m.downstream4.remove(key))
    }

    fn downstream4_for_each(&self, f: &mut dyn FnMut(&Tether4Key, &Tether4Value)) {
        if let Some(m) = self.inner.as_ref() {
            m.downstream4.for_each(f);
        }
    }

    fn stats_get_and_clear(&self, upstream_ifindex: u32) -> Option<TetherStatsValue> {
        self.inner.as_ref().and_then(|m| m.stats.take(&upstream_ifindex))
    }

    fn stats_for_each(&self, f: &mut dyn FnMut(u32, &TetherStatsValue)) {
        if let Some(m) = self.inner.as_ref() {
            m.stats.for_each(&mut |k, v| f(*k, v));
        }
    }

    fn limit_set(&self, upstream_ifindex: u32, quota_bytes: u64) -> bool {
        self.inner.as_ref().is_some_and(|m| m.limit.add(&upstream_ifindex, &quota_bytes))
    }

    fn limit_remove(&self, upstream_ifindex: u32) -> bool {
        self.inner.as_ref().is_some_and(|m| m.limit.remove(&upstream_ifindex))
    }

    fn dev_add(&self, ifindex: u32) -> bool {
        self.inner.as_ref().is_some_and(|m| m.dev.add(&ifindex, &ifindex))
    }

    fn error_for_each(&self, f: &mut dyn FnMut(u32, u32)) {
        if let Some(m) = self.inner.as_ref() {
            m.error.for_each(&mut |k, v| f(*k, *v));
        }
    }

    fn attach_program(&self, ifname: &str, dir: Direction, family: IpFamily) {
        if self.inner.is_none() {
            return;
        }
        if family == IpFamily::V6 && skips_ipv6_program(ifname) {
            return;
        }
        if let Err(e) = self.programs.attach(ifname, dir, family) {
            // The interface may already be gone; forwarding for it simply
            // never starts.
            error!("attaching {:?}/{:?} program to {} failed: {}", dir, family, ifname, e);
        }
    }

    fn detach_program(&self, ifname: &str, family: IpFamily) {
        if self.inner.is_none() {
            return;
        }
        if family == IpFamily::V6 && skips_ipv6_program(ifname) {
            return;
        }
        if let Err(e) = self.programs.detach(ifname, family) {
            error!("detaching {:?} program from {} failed: {}", family, ifname, e);
        }
    }
}

/// [`MapAccessor`] used when offload is disabled by configuration: never
/// initialized, every operation a no-op.
pub struct NoopMaps;

impl MapAccessor for NoopMaps {
    fn is_initialized(&self) -> bool {
        false
    }

    fn upstream6_add(&self, _key: &TetherUpstream6Key, _value: &Tether6Value) -> bool {
        false
    }

    fn upstream6_remove(&self, _key: &TetherUpstream6Key) -> bool {
        false
    }

    fn downstream6_add(&self, _key: &TetherDownstream6Key, _value: &Tether6Value) -> bool {
        false
    }

    fn downstream6_remove(&self, _key: &TetherDownstream6Key) -> bool {
        false
    }

    fn upstream4_get(&self, _key: &Tether4Key) -> Option<Tether4Value> {
        None
    }

    fn upstream4_add(&self, _key: &Tether4Key, _value: &Tether4Value) -> bool {
        false
    }

    fn upstream4_remove(&self, _key: &Tether4Key) -> bool {
        false
    }

    fn upstream4_for_each(&self, _f: &mut dyn FnMut(&Tether4Key, &Tether4Value)) {}

    fn downstream4_add(&self, _key: &Tether4Key, _value: &Tether4Value) -> bool {
        false
    }

    fn downstream4_remove(&self, _key: &Tether4Key) -> bool {
        false
    }

    fn downstream4_for_each(&self, _f: &mut dyn FnMut(&Tether4Key, &Tether4Value)) {}

    fn stats_get_and_clear(&self, _upstream_ifindex: u32) -> Option<TetherStatsValue> {
        None
    }

    fn stats_for_each(&self, _f: &mut dyn FnMut(u32, &TetherStatsValue)) {}

    fn limit_set(&self, _upstream_ifindex: u32, _quota_bytes: u64) -> bool {
        false
    }

    fn limit_remove(&self, _upstream_ifindex: u32) -> bool {
        false
    }

    fn dev_add(&self, _ifindex: u32) -> bool {
        false
    }

    fn error_for_each(&self, _f: &mut dyn FnMut(u32, u32)) {}

    fn attach_program(&self, _ifname: &str, _dir: Direction, _family: IpFamily) {}

    fn detach_program(&self, _ifname: &str, _family: IpFamily) {}
}
