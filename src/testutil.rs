// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Recording fakes for the coordinator's capabilities. Each fake is
//! cloneable and shares its state, so tests keep a clone for inspection
//! after handing one to the coordinator.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::conntrack::ConntrackTuple;
use crate::coordinator::{EventMonitors, InterfaceQuery};
use crate::maps::{
    Direction, IpFamily, MapAccessor, Tether4Key, Tether4Value, Tether6Value,
    TetherDownstream6Key, TetherStatsValue, TetherUpstream6Key,
};
use crate::netlink::{ConntrackNetlink, NetlinkError};
use crate::refresh::Clock;
use crate::rules::InterfaceParams;
use crate::stats::{ForwardedStats, MetricsSink, StatsSink};

#[derive(Default)]
struct FakeMapsInner {
    upstream6: HashMap<TetherUpstream6Key, Tether6Value>,
    downstream6: HashMap<TetherDownstream6Key, Tether6Value>,
    upstream4: HashMap<Tether4Key, Tether4Value>,
    downstream4: HashMap<Tether4Key, Tether4Value>,
    stats: HashMap<u32, TetherStatsValue>,
    limit: HashMap<u32, u64>,
    dev: HashSet<u32>,
    error: HashMap<u32, u32>,
    attached: Vec<(String, Direction, IpFamily)>,
    detached: Vec<(String, IpFamily)>,
    fail_upstream4_add: bool,
    fail_downstream4_add: bool,
    fail_limit_set: bool,
}

/// In-memory [`MapAccessor`] double.
#[derive(Clone)]
pub(crate) struct FakeMaps {
    inner: Arc<Mutex<FakeMapsInner>>,
    initialized: bool,
}

impl FakeMaps {
    pub fn new() -> Self {
        FakeMaps { inner: Arc::default(), initialized: true }
    }

    pub fn uninitialized() -> Self {
        FakeMaps { inner: Arc::default(), initialized: false }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeMapsInner> {
        self.inner.lock().unwrap()
    }

    pub fn set_stats(&self, ifindex: u32, value: TetherStatsValue) {
        self.lock().stats.insert(ifindex, value);
    }

    pub fn stats(&self, ifindex: u32) -> Option<TetherStatsValue> {
        self.lock().stats.get(&ifindex).copied()
    }

    pub fn limit(&self, ifindex: u32) -> Option<u64> {
        self.lock().limit.get(&ifindex).copied()
    }

    pub fn upstream6(&self) -> HashMap<TetherUpstream6Key, Tether6Value> {
        self.lock().upstream6.clone()
    }

    pub fn downstream6(&self) -> HashMap<TetherDownstream6Key, Tether6Value> {
        self.lock().downstream6.clone()
    }

    pub fn upstream4(&self) -> HashMap<Tether4Key, Tether4Value> {
        self.lock().upstream4.clone()
    }

    pub fn downstream4(&self) -> HashMap<Tether4Key, Tether4Value> {
        self.lock().downstream4.clone()
    }

    pub fn dev_contains(&self, ifindex: u32) -> bool {
        self.lock().dev.contains(&ifindex)
    }

    pub fn set_error_counter(&self, probe: u32, count: u32) {
        self.lock().error.insert(probe, count);
    }

    pub fn attached(&self) -> Vec<(String, Direction, IpFamily)> {
        self.lock().attached.clone()
    }

    pub fn detached(&self) -> Vec<(String, IpFamily)> {
        self.lock().detached.clone()
    }

    pub fn set_fail_upstream4_add(&self, fail: bool) {
        self.lock().fail_upstream4_add = fail;
    }

    pub fn set_fail_downstream4_add(&self, fail: bool) {
        self.lock().fail_downstream4_add = fail;
    }

    pub fn set_fail_limit_set(&self, fail: bool) {
        self.lock().fail_limit_set = fail;
    }
}

impl MapAccessor for FakeMaps {
    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn upstream6_add(&self, key: &TetherUpstream6Key, value: &Tether6Value) -> bool {
        self.lock().upstream6.insert(*key, *value);
        true
    }

    fn upstream6_remove(&self, key: &TetherUpstream6Key) -> bool {
        self.lock().upstream6.remove(key).is_some()
    }

    fn downstream6_add(&self, key: &TetherDownstream6Key, value: &Tether6Value) -> bool {
        self.lock().downstream6.insert(*key, *value);
        true
    }

    fn downstream6_remove(&self, key: &TetherDownstream6Key) -> bool {
        self.lock().downstream6.remove(key).is_some()
    }

    fn upstream4_get(&self, key: &Tether4Key) -> Option<Tether4Value> {
        self.lock().upstream4.get(key).copied()
    }

    fn upstream4_add(&self, key: &Tether4Key, value: &Tether4Value) -> bool {
        let mut inner = self.lock();
        if inner.fail_upstream4_add {
            return false;
        }
        inner.upstream4.insert(*key, *value);
        true
    }

    fn upstream4_remove(&self, key: &Tether4Key) -> bool {
        self.lock().upstream4.remove(key).is_some()
    }

    fn upstream4_for_each(&self, f: &mut dyn FnMut(&Tether4Key, &Tether4Value)) {
        let entries: Vec<_> = self.lock().upstream4.iter().map(|(k, v)| (*k, *v)).collect();
        for (key, value) in entries {
            f(&key, &value);
        }
    }

    fn downstream4_add(&self, key: &Tether4Key, value: &Tether4Value) -> bool {
        let mut inner = self.lock();
        if inner.fail_downstream4_add {
            return false;
        }
        inner.downstream4.insert(*key, *value);
        true
    }

    fn downstream4_remove(&self, key: &Tether4Key) -> bool {
        self.lock().downstream4.remove(key).is_some()
    }

    fn downstream4_for_each(&self, f: &mut dyn FnMut(&Tether4Key, &Tether4Value)) {
        let entries: Vec<_> = self.lock().downstream4.iter().map(|(k, v)| (*k, *v)).collect();
        for (key, value) in entries {
            f(&key, &value);
        }
    }

    fn stats_get_and_clear(&self, upstream_ifindex: u32) -> Option<TetherStatsValue> {
        self.lock().stats.remove(&upstream_ifindex)
    }

    fn stats_for_each(&self, f: &mut dyn FnMut(u32, &TetherStatsValue)) {
        let entries: Vec<_> = self.lock().stats.iter().map(|(k, v)| (*k, *v)).collect();
        for (ifindex, value) in entries {
            f(ifindex, &value);
        }
    }

    fn limit_set(&self, upstream_ifindex: u32, quota_bytes: u64) -> bool {
        let mut inner = self.lock();
        if inner.fail_limit_set {
            return false;
        }
        inner.limit.insert(upstream_ifindex, quota_bytes);
        true
    }

    fn limit_remove(&self, upstream_ifindex: u32) -> bool {
        self.lock().limit.remove(&upstream_ifindex).is_some()
    }

    fn dev_add(&self, ifindex: u32) -> bool {
        self.lock().dev.insert(ifindex);
        true
    }

    fn error_for_each(&self, f: &mut dyn FnMut(u32, u32)) {
        let entries: Vec<_> = self.lock().error.iter().map(|(k, v)| (*k, *v)).collect();
        for (probe, count) in entries {
            f(probe, count);
        }
    }

    fn attach_program(&self, ifname: &str, dir: Direction, family: IpFamily) {
        if family == IpFamily::V6 && crate::maps::skips_ipv6_program(ifname) {
            return;
        }
        self.lock().attached.push((ifname.to_string(), dir, family));
    }

    fn detach_program(&self, ifname: &str, family: IpFamily) {
        if family == IpFamily::V6 && crate::maps::skips_ipv6_program(ifname) {
            return;
        }
        self.lock().detached.push((ifname.to_string(), family));
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeStatsSink {
    iface: Arc<Mutex<Vec<(String, ForwardedStats)>>>,
    uid: Arc<Mutex<Vec<(String, i32, ForwardedStats)>>>,
    alerts: Arc<AtomicUsize>,
}

impl FakeStatsSink {
    pub fn iface_updates(&self) -> Vec<(String, ForwardedStats)> {
        self.iface.lock().unwrap().clone()
    }

    pub fn uid_updates(&self) -> Vec<(String, i32, ForwardedStats)> {
        self.uid.lock().unwrap().clone()
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.load(Ordering::SeqCst)
    }
}

impl StatsSink for FakeStatsSink {
    fn notify_stats_updated(
        &self,
        per_iface: &[(String, ForwardedStats)],
        per_uid: &[(String, i32, ForwardedStats)],
    ) {
        self.iface.lock().unwrap().extend_from_slice(per_iface);
        self.uid.lock().unwrap().extend_from_slice(per_uid);
    }

    fn notify_alert_reached(&self) {
        self.alerts.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeMetricsSink {
    samples: Arc<Mutex<Vec<u32>>>,
}

impl FakeMetricsSink {
    pub fn samples(&self) -> Vec<u32> {
        self.samples.lock().unwrap().clone()
    }
}

impl MetricsSink for FakeMetricsSink {
    fn report_active_sessions(&self, peak_since_last_sample: u32) {
        self.samples.lock().unwrap().push(peak_since_last_sample);
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeMonitors {
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

impl FakeMonitors {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl EventMonitors for FakeMonitors {
    fn start(&mut self) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeInterfaces {
    params: Arc<Mutex<HashMap<String, InterfaceParams>>>,
    virtuals: Arc<Mutex<HashSet<String>>>,
}

impl FakeInterfaces {
    pub fn add_raw_ip(&self, name: &str, index: u32) {
        self.params.lock().unwrap().insert(
            name.to_string(),
            InterfaceParams {
                index,
                name: name.to_string(),
                mac: None,
                is_point_to_point: true,
            },
        );
    }

    pub fn add_ethernet(&self, name: &str, index: u32, mac: crate::rules::MacAddr) {
        self.params.lock().unwrap().insert(
            name.to_string(),
            InterfaceParams {
                index,
                name: name.to_string(),
                mac: Some(mac),
                is_point_to_point: false,
            },
        );
    }

    pub fn set_virtual(&self, name: &str) {
        self.virtuals.lock().unwrap().insert(name.to_string());
    }
}

impl InterfaceQuery for FakeInterfaces {
    fn params_by_name(&self, name: &str) -> Option<InterfaceParams> {
        self.params.lock().unwrap().get(name).cloned()
    }

    fn is_virtual(&self, name: &str) -> bool {
        self.virtuals.lock().unwrap().contains(name)
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeNetlink {
    requests: Arc<Mutex<Vec<(ConntrackTuple, u32)>>>,
    not_found: Arc<Mutex<bool>>,
}

impl FakeNetlink {
    pub fn requests(&self) -> Vec<(ConntrackTuple, u32)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn fail_with_not_found(&self) {
        *self.not_found.lock().unwrap() = true;
    }
}

impl ConntrackNetlink for FakeNetlink {
    fn request_timeout_update(
        &self,
        tuple: &ConntrackTuple,
        timeout_s: u32,
    ) -> Result<(), NetlinkError> {
        self.requests.lock().unwrap().push((*tuple, timeout_s));
        if *self.not_found.lock().unwrap() {
            Err(NetlinkError::NotFound)
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub(crate) struct FakeClock {
    ns: Arc<AtomicU64>,
}

impl FakeClock {
    pub fn at_ns(ns: u64) -> Self {
        FakeClock { ns: Arc::new(AtomicU64::new(ns)) }
    }
}

impl Clock for FakeClock {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::SeqCst)
    }
}
