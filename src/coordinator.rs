// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The offload coordinator: a single-threaded event loop owning every
//! piece of mutable offload state.
//!
//! External callers (per-downstream servers, the upstream monitor, the
//! conntrack and neighbor monitors) enqueue [`Task`]s through an
//! [`OffloadHandle`]; the loop drains them strictly in order, interleaved
//! with three periodic jobs (stats poll, conntrack refresh, session
//! metrics). Each task runs to completion, so paired map writes are atomic
//! with respect to every other task.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::pin::pin;
use std::time::Duration;

use futures::channel::{mpsc, oneshot};
use futures::{FutureExt as _, StreamExt as _};
use log::{debug, error, info, warn};
use tokio::time::{Interval, MissedTickBehavior};

use crate::conntrack::{self, ConntrackEvent, SessionCounter};
use crate::maps::{Direction, IpFamily, MapAccessor, IPV6_MIN_MTU, NO_UPSTREAM};
use crate::neighbor::{self, NeighborEvent};
use crate::netlink::ConntrackNetlink;
use crate::refresh::{
    self, Clock, CONNTRACK_METRICS_UPDATE_INTERVAL_MS, CONNTRACK_TIMEOUT_UPDATE_INTERVAL_MS,
};
use crate::rules::{
    DownstreamId, InterfaceParams, Ipv4ClientInfo, Ipv6DownstreamRule, Ipv6Prefix64,
    Ipv6UpstreamRule, MacAddr, RuleStore, UpstreamInfo,
};
use crate::stats::{ForwardedStats, MetricsSink, StatsAndLimit, StatsSink};

/// Read once at construction.
#[derive(Clone, Debug)]
pub struct Config {
    pub bpf_offload_enabled: bool,
    pub active_sessions_metrics_enabled: bool,
    pub offload_poll_interval_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bpf_offload_enabled: true,
            active_sessions_metrics_enabled: true,
            offload_poll_interval_ms: CONNTRACK_TIMEOUT_UPDATE_INTERVAL_MS as u32,
        }
    }
}

impl Config {
    fn validated(mut self) -> Self {
        if (self.offload_poll_interval_ms as u64) < CONNTRACK_TIMEOUT_UPDATE_INTERVAL_MS {
            warn!(
                "offload poll interval {}ms below conntrack refresh interval, using {}ms",
                self.offload_poll_interval_ms, CONNTRACK_TIMEOUT_UPDATE_INTERVAL_MS
            );
            self.offload_poll_interval_ms = CONNTRACK_TIMEOUT_UPDATE_INTERVAL_MS as u32;
        }
        self
    }
}

/// Upstream description delivered by the upstream monitor.
#[derive(Clone, Debug)]
pub struct UpstreamNetworkState {
    pub interface_name: String,
    pub interface_mtu: u32,
    pub ipv4_addresses: Vec<Ipv4Addr>,
    pub is_virtual: bool,
}

/// Interface facts supplied by the upstream-monitor collaborator.
pub trait InterfaceQuery {
    fn params_by_name(&self, name: &str) -> Option<InterfaceParams>;
    fn is_virtual(&self, name: &str) -> bool;
}

/// Start/stop control over the external conntrack and neighbor monitors.
/// Their events come back through [`OffloadHandle::conntrack_event`] and
/// [`OffloadHandle::neighbor_event`].
pub trait EventMonitors {
    fn start(&mut self) -> anyhow::Result<()>;
    fn stop(&mut self);
}

/// Everything the coordinator consumes from the outside world.
pub struct Capabilities {
    pub maps: Box<dyn MapAccessor + Send>,
    pub netlink: Box<dyn ConntrackNetlink + Send>,
    pub stats_sink: Box<dyn StatsSink + Send>,
    pub metrics_sink: Box<dyn MetricsSink + Send>,
    pub monitors: Box<dyn EventMonitors + Send>,
    pub interfaces: Box<dyn InterfaceQuery + Send>,
    pub clock: Box<dyn Clock + Send>,
}

/// One unit of work for the coordinator thread.
#[derive(Debug)]
pub enum Task {
    AddDownstream { id: DownstreamId, params: InterfaceParams },
    RemoveDownstream { id: DownstreamId },
    MaybeAddUpstream { ifindex: u32, name: String },
    UpdateIpv4Upstream { state: Option<UpstreamNetworkState> },
    UpdateIpv6Upstream { id: DownstreamId, upstream_ifindex: u32, prefixes: Vec<Ipv6Prefix64> },
    AddClient { id: DownstreamId, client: Ipv4ClientInfo },
    RemoveClient { id: DownstreamId, client_ipv4: Ipv4Addr },
    ClearClients { id: DownstreamId },
    ClearAllIpv6Rules { id: DownstreamId },
    AttachPair { downstream: String, upstream: String },
    DetachPair { downstream: String, upstream: String },
    SetDataLimit { iface: String, quota_bytes: u64 },
    UpdateAlertQuota { quota_bytes: i64 },
    ConntrackEvent(ConntrackEvent),
    NeighborEvent(NeighborEvent),
    Snapshot { reply: oneshot::Sender<DebugSnapshot> },
}

/// Cheap, cloneable entry point; every method enqueues one [`Task`].
#[derive(Clone)]
pub struct OffloadHandle {
    tx: mpsc::UnboundedSender<Task>,
}

impl OffloadHandle {
    fn enqueue(&self, task: Task) {
        if self.tx.unbounded_send(task).is_err() {
            debug!("coordinator loop is gone, dropping task");
        }
    }

    pub fn add_downstream(&self, id: DownstreamId, params: InterfaceParams) {
        self.enqueue(Task::AddDownstream { id, params });
    }

    pub fn remove_downstream(&self, id: DownstreamId) {
        self.enqueue(Task::RemoveDownstream { id });
    }

    pub fn maybe_add_upstream_to_lookup_table(&self, ifindex: u32, name: &str) {
        self.enqueue(Task::MaybeAddUpstream { ifindex, name: name.to_string() });
    }

    pub fn update_ipv4_upstream(&self, state: Option<UpstreamNetworkState>) {
        self.enqueue(Task::UpdateIpv4Upstream { state });
    }

    pub fn update_ipv6_upstream(
        &self,
        id: DownstreamId,
        upstream_ifindex: u32,
        prefixes: Vec<Ipv6Prefix64>,
    ) {
        self.enqueue(Task::UpdateIpv6Upstream { id, upstream_ifindex, prefixes });
    }

    pub fn add_client(&self, id: DownstreamId, client: Ipv4ClientInfo) {
        self.enqueue(Task::AddClient { id, client });
    }

    pub fn remove_client(&self, id: DownstreamId, client_ipv4: Ipv4Addr) {
        self.enqueue(Task::RemoveClient { id, client_ipv4 });
    }

    pub fn clear_clients(&self, id: DownstreamId) {
        self.enqueue(Task::ClearClients { id });
    }

    pub fn clear_all_ipv6_rules(&self, id: DownstreamId) {
        self.enqueue(Task::ClearAllIpv6Rules { id });
    }

    pub fn maybe_attach_program(&self, downstream: &str, upstream: &str) {
        self.enqueue(Task::AttachPair {
            downstream: downstream.to_string(),
            upstream: upstream.to_string(),
        });
    }

    pub fn maybe_detach_program(&self, downstream: &str, upstream: &str) {
        self.enqueue(Task::DetachPair {
            downstream: downstream.to_string(),
            upstream: upstream.to_string(),
        });
    }

    pub fn set_data_limit(&self, iface: &str, quota_bytes: u64) {
        self.enqueue(Task::SetDataLimit { iface: iface.to_string(), quota_bytes });
    }

    pub fn update_alert_quota(&self, quota_bytes: i64) {
        self.enqueue(Task::UpdateAlertQuota { quota_bytes });
    }

    pub fn conntrack_event(&self, event: ConntrackEvent) {
        self.enqueue(Task::ConntrackEvent(event));
    }

    pub fn neighbor_event(&self, event: NeighborEvent) {
        self.enqueue(Task::NeighborEvent(event));
    }

    /// Dump-style view of the coordinator; resolves `None` if the loop has
    /// shut down.
    pub async fn debug_snapshot(&self) -> Option<DebugSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Task::Snapshot { reply });
        rx.await.ok()
    }
}

/// Plain-data summary for diagnostics.
#[derive(Clone, Debug)]
pub struct DebugSnapshot {
    pub started: bool,
    pub downstreams: usize,
    pub sessions_current: u32,
    pub last_ipv4_upstream_ifindex: u32,
    pub forwarding_pairs: Vec<(String, Vec<String>)>,
    pub cached_stats: Vec<(u32, ForwardedStats)>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum LifecycleChange {
    None,
    Started,
    Stopped,
}

/// All mutable coordinator state, owned by the event loop task.
pub(crate) struct OffloadState {
    pub config: Config,
    pub maps: Box<dyn MapAccessor + Send>,
    pub netlink: Box<dyn ConntrackNetlink + Send>,
    pub stats_sink: Box<dyn StatsSink + Send>,
    pub metrics_sink: Box<dyn MetricsSink + Send>,
    pub monitors: Box<dyn EventMonitors + Send>,
    pub interfaces: Box<dyn InterfaceQuery + Send>,
    pub clock: Box<dyn Clock + Send>,
    pub store: RuleStore,
    pub stats: StatsAndLimit,
    pub sessions: SessionCounter,
    pub started: bool,
    error_counters: HashMap<u32, u32>,
}

impl OffloadState {
    pub(crate) fn kernel_active(&self) -> bool {
        self.maps.is_initialized()
    }

    pub(crate) fn handle_task(&mut self, task: Task) -> LifecycleChange {
        match task {
            Task::AddDownstream { id, params } => return self.add_downstream(id, params),
            Task::Snapshot { reply } => {
                let _ = reply.send(self.debug_snapshot());
            }
            task if !self.started => {
                debug!("no downstream served, ignoring {:?}", task);
            }
            Task::RemoveDownstream { id } => return self.remove_downstream(id),
            Task::MaybeAddUpstream { ifindex, name } => self.maybe_add_upstream(ifindex, &name),
            Task::UpdateIpv4Upstream { state } => self.update_ipv4_upstream(state),
            Task::UpdateIpv6Upstream { id, upstream_ifindex, prefixes } => {
                self.update_ipv6_upstream(id, upstream_ifindex, prefixes)
            }
            Task::AddClient { id, client } => self.add_client(id, client),
            Task::RemoveClient { id, client_ipv4 } => self.remove_client(id, client_ipv4),
            Task::ClearClients { id } => self.clear_clients(id),
            Task::ClearAllIpv6Rules { id } => self.clear_all_ipv6_rules(id),
            Task::AttachPair { downstream, upstream } => {
                self.maybe_attach_program(&downstream, &upstream)
            }
            Task::DetachPair { downstream, upstream } => {
                self.maybe_detach_program(&downstream, &upstream)
            }
            Task::SetDataLimit { iface, quota_bytes } => {
                self.stats.on_set_limit(
                    &iface,
                    quota_bytes,
                    &self.store,
                    &self.sessions,
                    self.maps.as_ref(),
                );
            }
            Task::UpdateAlertQuota { quota_bytes } => {
                self.stats.update_alert_quota(quota_bytes, self.stats_sink.as_ref());
            }
            Task::ConntrackEvent(event) => conntrack::handle_conntrack_event(self, &event),
            Task::NeighborEvent(event) => neighbor::handle_neighbor_event(self, &event),
        }
        LifecycleChange::None
    }

    fn add_downstream(&mut self, id: DownstreamId, params: InterfaceParams) -> LifecycleChange {
        if !self.store.register_downstream(id, params) {
            error!("downstream {:?} is already registered", id);
            return LifecycleChange::None;
        }
        if self.store.served_count() == 1 {
            info!("first downstream registered, starting offload");
            self.started = true;
            if let Err(e) = self.monitors.start() {
                error!("starting conntrack/neighbor monitors failed: {:#}", e);
            }
            return LifecycleChange::Started;
        }
        LifecycleChange::None
    }

    fn remove_downstream(&mut self, id: DownstreamId) -> LifecycleChange {
        if !self.store.is_served(id) {
            error!("downstream {:?} is not registered", id);
            return LifecycleChange::None;
        }
        // Reconcile anything the serving machinery left behind before the
        // partitions disappear.
        self.clear_all_ipv6_rules(id);
        self.clear_clients(id);
        self.store.unregister_downstream(id);
        if self.store.served_count() == 0 {
            info!("last downstream removed, stopping offload");
            self.monitors.stop();
            self.stats.update_forwarded_stats(
                self.maps.as_ref(),
                &self.store,
                self.stats_sink.as_ref(),
            );
            if self.sessions.current() != 0 {
                error!("{} sessions still counted after last downstream", self.sessions.current());
            }
            self.sessions.reset();
            self.started = false;
            return LifecycleChange::Stopped;
        }
        LifecycleChange::None
    }

    fn maybe_add_upstream(&mut self, ifindex: u32, name: &str) {
        if ifindex == 0 || name.is_empty() || self.interfaces.is_virtual(name) {
            return;
        }
        if let Err(existing) = self.store.record_interface_name(ifindex, name) {
            error!("ifindex {} is already named {}, refusing rename to {}", ifindex, existing, name);
        }
    }

    fn update_ipv4_upstream(&mut self, state: Option<UpstreamNetworkState>) {
        let mut new_ifindex = NO_UPSTREAM;
        let mut new_info = None;
        let mut indices = HashMap::new();
        if let Some(state) = &state {
            if !state.ipv4_addresses.is_empty() && !state.is_virtual {
                match self.interfaces.params_by_name(&state.interface_name) {
                    // Only raw-IP upstreams are offloadable.
                    Some(params) if params.mac.is_none() => {
                        self.maybe_add_upstream(params.index, &state.interface_name);
                        new_ifindex = params.index;
                        new_info = Some(UpstreamInfo {
                            ifindex: params.index,
                            mtu: effective_pmtu(state.interface_mtu),
                        });
                        indices =
                            state.ipv4_addresses.iter().map(|a| (*a, params.index)).collect();
                    }
                    Some(_) => {
                        debug!("upstream {} has a MAC, not offloading IPv4", state.interface_name)
                    }
                    None => warn!("no parameters for upstream {}", state.interface_name),
                }
            }
        }
        if new_ifindex == self.store.last_ipv4_upstream_ifindex {
            return;
        }
        // Every IPv4 rule points at the old upstream; drop them all before
        // switching so conntrack events observed after the change can
        // never install against a stale ifindex.
        for client in self.store.all_clients() {
            conntrack::clear_client_rules(self, &client);
        }
        self.store.last_ipv4_upstream_ifindex = new_ifindex;
        self.store.ipv4_upstream_info = new_info;
        self.store.set_ipv4_upstream_indices(indices);
    }

    /// The upstream ifindex a kernel-installed IPv6 rule may carry:
    /// virtual upstreams degrade to [`NO_UPSTREAM`].
    fn effective_ipv6_upstream(&self, ifindex: u32) -> u32 {
        if ifindex == NO_UPSTREAM {
            return NO_UPSTREAM;
        }
        match self.store.interface_name(ifindex) {
            Some(name) if self.interfaces.is_virtual(name) => NO_UPSTREAM,
            _ => ifindex,
        }
    }

    fn update_ipv6_upstream(
        &mut self,
        id: DownstreamId,
        upstream_ifindex: u32,
        prefixes: Vec<Ipv6Prefix64>,
    ) {
        let Some(ds) = self.store.downstream(id) else {
            error!("ipv6 upstream update for unregistered downstream {:?}", id);
            return;
        };
        let params = ds.params.clone();
        let prev_ifindex = ds.ipv6_upstream_ifindex;
        let prev_prefixes = ds.ipv6_upstream_prefixes.clone();
        let effective = self.effective_ipv6_upstream(upstream_ifindex);
        if prev_ifindex == effective && prev_prefixes == prefixes {
            return;
        }

        // Pull the downstream rules out of the kernel first; they are kept
        // in memory and replayed below.
        for rule in self.store.ipv6_downstream_rules(id).to_vec() {
            if rule.is_installed() && self.kernel_active() {
                self.maps.downstream6_remove(&rule.make_key());
            }
        }
        self.store.retarget_ipv6_downstream_rules(id, NO_UPSTREAM);

        // Drop the upstream rules, then release the old upstream's limit;
        // with no rule left the stats read-and-clear is safe.
        for rule in self.store.take_ipv6_upstream_rules(id) {
            if self.kernel_active() {
                self.maps.upstream6_remove(&rule.make_key());
            }
        }
        self.stats.maybe_clear_limit(
            prev_ifindex,
            &self.store,
            &self.sessions,
            self.maps.as_ref(),
            self.stats_sink.as_ref(),
        );

        let mut effective = effective;
        if effective != NO_UPSTREAM {
            if let Some(mac) = params.mac {
                let ready = conntrack::ensure_dev_member(self, params.index)
                    && conntrack::ensure_dev_member(self, effective)
                    && self.stats.maybe_set_limit(
                        effective,
                        &self.store,
                        &self.sessions,
                        self.maps.as_ref(),
                    );
                if ready {
                    for prefix in &prefixes {
                        let rule = Ipv6UpstreamRule {
                            upstream_ifindex: effective,
                            downstream_ifindex: params.index,
                            source_prefix: *prefix,
                            in_dst_mac: mac,
                            out_src_mac: MacAddr::NULL,
                            out_dst_mac: MacAddr::NULL,
                        };
                        if !self.kernel_active()
                            || self.maps.upstream6_add(&rule.make_key(), &rule.make_value())
                        {
                            self.store.insert_ipv6_upstream_rule(id, rule);
                        } else {
                            error!("installing ipv6 upstream rule for {} failed", prefix);
                        }
                    }
                } else {
                    effective = NO_UPSTREAM;
                }
            }
        }

        // Replay the kept downstream rules under the new upstream, behind
        // the same dev-map and limit gating as fresh installs.
        let replayed = self.store.retarget_ipv6_downstream_rules(id, effective);
        if effective != NO_UPSTREAM && !replayed.is_empty() {
            let ready = conntrack::ensure_dev_member(self, effective)
                && conntrack::ensure_dev_member(self, params.index)
                && self.stats.maybe_set_limit(
                    effective,
                    &self.store,
                    &self.sessions,
                    self.maps.as_ref(),
                );
            if ready {
                if self.kernel_active() {
                    for rule in &replayed {
                        if !self.maps.downstream6_add(&rule.make_key(), &rule.make_value()) {
                            error!("replaying ipv6 downstream rule for {} failed", rule.neighbor);
                        }
                    }
                }
            } else {
                effective = NO_UPSTREAM;
                self.store.retarget_ipv6_downstream_rules(id, NO_UPSTREAM);
            }
        }

        if let Some(ds) = self.store.downstream_mut(id) {
            ds.ipv6_upstream_ifindex = effective;
            ds.ipv6_upstream_prefixes = prefixes;
        }
    }

    pub(crate) fn add_ipv6_downstream_rule(&mut self, id: DownstreamId, rule: Ipv6DownstreamRule) {
        if !self.store.is_served(id) {
            return;
        }
        if rule.is_installed() && self.kernel_active() {
            if !conntrack::ensure_dev_member(self, rule.upstream_ifindex)
                || !conntrack::ensure_dev_member(self, rule.downstream_ifindex)
            {
                return;
            }
            if !self.stats.maybe_set_limit(
                rule.upstream_ifindex,
                &self.store,
                &self.sessions,
                self.maps.as_ref(),
            ) {
                return;
            }
            if !self.maps.downstream6_add(&rule.make_key(), &rule.make_value()) {
                error!("installing ipv6 downstream rule for {} failed", rule.neighbor);
                return;
            }
        }
        self.store.upsert_ipv6_downstream_rule(id, rule);
    }

    pub(crate) fn remove_ipv6_downstream_rule(&mut self, id: DownstreamId, neighbor: Ipv6Addr) {
        let Some(rule) = self.store.ipv6_downstream_rule(id, neighbor).cloned() else {
            return;
        };
        if rule.is_installed() && self.kernel_active() {
            self.maps.downstream6_remove(&rule.make_key());
        }
        self.store.remove_ipv6_downstream_rule(id, neighbor);
        self.stats.maybe_clear_limit(
            rule.upstream_ifindex,
            &self.store,
            &self.sessions,
            self.maps.as_ref(),
            self.stats_sink.as_ref(),
        );
    }

    pub(crate) fn add_client(&mut self, id: DownstreamId, client: Ipv4ClientInfo) {
        if !self.store.is_served(id) {
            return;
        }
        if let Some(evicted) = self.store.insert_client(id, client) {
            error!(
                "client {} reappeared on another downstream, clearing stale rules",
                evicted.client_ipv4
            );
            conntrack::clear_client_rules(self, &evicted);
        }
    }

    pub(crate) fn remove_client(&mut self, id: DownstreamId, client_ipv4: Ipv4Addr) {
        let Some(client) = self.store.remove_client(id, client_ipv4) else {
            return;
        };
        conntrack::clear_client_rules(self, &client);
    }

    fn clear_clients(&mut self, id: DownstreamId) {
        for client in self.store.clear_clients(id) {
            conntrack::clear_client_rules(self, &client);
        }
    }

    fn clear_all_ipv6_rules(&mut self, id: DownstreamId) {
        let Some(ds) = self.store.downstream(id) else {
            return;
        };
        let prev_ifindex = ds.ipv6_upstream_ifindex;
        // Downstream rules first, so the per-upstream stats read below
        // happens with nothing left to count against it.
        for rule in self.store.clear_ipv6_downstream_rules(id) {
            if rule.is_installed() && self.kernel_active() {
                self.maps.downstream6_remove(&rule.make_key());
            }
        }
        for rule in self.store.take_ipv6_upstream_rules(id) {
            if self.kernel_active() {
                self.maps.upstream6_remove(&rule.make_key());
            }
        }
        self.stats.maybe_clear_limit(
            prev_ifindex,
            &self.store,
            &self.sessions,
            self.maps.as_ref(),
            self.stats_sink.as_ref(),
        );
        if let Some(ds) = self.store.downstream_mut(id) {
            ds.ipv6_upstream_ifindex = NO_UPSTREAM;
            ds.ipv6_upstream_prefixes.clear();
        }
    }

    fn maybe_attach_program(&mut self, downstream: &str, upstream: &str) {
        if self.interfaces.is_virtual(upstream) {
            return;
        }
        let first_for_downstream = !self.store.downstream_has_pairs(downstream);
        let first_for_upstream = !self.store.upstream_has_pairs(upstream);
        if !self.store.add_forwarding_pair(upstream, downstream) {
            return;
        }
        if first_for_downstream {
            self.maps.attach_program(downstream, Direction::Upstream, IpFamily::V4);
            self.maps.attach_program(downstream, Direction::Upstream, IpFamily::V6);
        }
        if first_for_upstream {
            self.maps.attach_program(upstream, Direction::Downstream, IpFamily::V4);
            self.maps.attach_program(upstream, Direction::Downstream, IpFamily::V6);
        }
    }

    fn maybe_detach_program(&mut self, downstream: &str, upstream: &str) {
        if self.interfaces.is_virtual(upstream) {
            return;
        }
        if !self.store.remove_forwarding_pair(upstream, downstream) {
            return;
        }
        if !self.store.downstream_has_pairs(downstream) {
            self.maps.detach_program(downstream, IpFamily::V4);
            self.maps.detach_program(downstream, IpFamily::V6);
        }
        if !self.store.upstream_has_pairs(upstream) {
            self.maps.detach_program(upstream, IpFamily::V4);
            self.maps.detach_program(upstream, IpFamily::V6);
        }
    }

    pub(crate) fn poll_stats(&mut self) {
        self.stats.update_forwarded_stats(self.maps.as_ref(), &self.store, self.stats_sink.as_ref());
        self.log_datapath_errors();
    }

    fn log_datapath_errors(&mut self) {
        let mut current = HashMap::new();
        self.maps.error_for_each(&mut |probe, count| {
            current.insert(probe, count);
        });
        for (probe, count) in &current {
            let previous = self.error_counters.get(probe).copied().unwrap_or(0);
            if *count > previous {
                warn!("datapath error counter {} rose to {}", probe, count);
            }
        }
        self.error_counters = current;
    }

    pub(crate) fn refresh_conntrack(&mut self) {
        refresh::refresh_offloaded_flows(
            self.maps.as_ref(),
            self.netlink.as_ref(),
            self.clock.as_ref(),
        );
    }

    pub(crate) fn sample_session_metrics(&mut self) {
        let peak = self.sessions.sample_and_reset();
        self.metrics_sink.report_active_sessions(peak);
    }

    fn debug_snapshot(&self) -> DebugSnapshot {
        DebugSnapshot {
            started: self.started,
            downstreams: self.store.served_count(),
            sessions_current: self.sessions.current(),
            last_ipv4_upstream_ifindex: self.store.last_ipv4_upstream_ifindex,
            forwarding_pairs: self.store.forwarding_pairs(),
            cached_stats: self.stats.cached_stats(),
        }
    }
}

fn effective_pmtu(mtu: u32) -> u16 {
    if mtu == 0 {
        return crate::maps::ETHER_MTU;
    }
    let mtu = u16::try_from(mtu).unwrap_or(u16::MAX);
    mtu.max(IPV6_MIN_MTU)
}

struct Timers {
    poll: Interval,
    refresh: Interval,
    metrics: Option<Interval>,
}

impl Timers {
    fn new(config: &Config) -> Timers {
        Timers {
            poll: Self::interval(Duration::from_millis(config.offload_poll_interval_ms as u64)),
            refresh: Self::interval(Duration::from_millis(CONNTRACK_TIMEOUT_UPDATE_INTERVAL_MS)),
            metrics: config.active_sessions_metrics_enabled.then(|| {
                Self::interval(Duration::from_millis(CONNTRACK_METRICS_UPDATE_INTERVAL_MS))
            }),
        }
    }

    fn interval(period: Duration) -> Interval {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum TimerTick {
    Poll,
    Refresh,
    Metrics,
}

/// Resolves with the next due periodic job, or never while stopped.
async fn next_tick(timers: &mut Option<Timers>) -> TimerTick {
    match timers {
        Some(Timers { poll, refresh, metrics }) => {
            let mut poll = pin!(poll.tick().fuse());
            let mut refresh = pin!(refresh.tick().fuse());
            let mut metrics = pin!(async {
                match metrics {
                    Some(metrics) => {
                        let _ = metrics.tick().await;
                    }
                    None => futures::future::pending::<()>().await,
                }
            }
            .fuse());
            futures::select! {
                _ = poll => TimerTick::Poll,
                _ = refresh => TimerTick::Refresh,
                _ = metrics => TimerTick::Metrics,
            }
        }
        None => futures::future::pending().await,
    }
}

enum Work {
    Task(Task),
    Tick(TimerTick),
    Shutdown,
}

/// The coordinator event loop. Construct with [`Coordinator::new`], then
/// drive [`Coordinator::run`] on a current-thread runtime.
pub struct Coordinator {
    state: OffloadState,
    tasks: mpsc::UnboundedReceiver<Task>,
}

impl Coordinator {
    pub fn new(config: Config, capabilities: Capabilities) -> (Coordinator, OffloadHandle) {
        let Capabilities { maps, netlink, stats_sink, metrics_sink, monitors, interfaces, clock } =
            capabilities;
        let maps: Box<dyn MapAccessor + Send> = if config.bpf_offload_enabled {
            maps
        } else {
            info!("BPF offload disabled by configuration");
            Box::new(crate::maps::NoopMaps)
        };
        let (tx, tasks) = mpsc::unbounded();
        let coordinator = Coordinator {
            state: OffloadState {
                config: config.validated(),
                maps,
                netlink,
                stats_sink,
                metrics_sink,
                monitors,
                interfaces,
                clock,
                store: RuleStore::default(),
                stats: StatsAndLimit::default(),
                sessions: SessionCounter::default(),
                started: false,
                error_counters: HashMap::new(),
            },
            tasks,
        };
        (coordinator, OffloadHandle { tx })
    }

    /// Runs until every [`OffloadHandle`] is dropped.
    pub async fn run(mut self) {
        if !self.state.maps.is_initialized() {
            warn!("BPF offload unavailable, coordinator runs in memory-only mode");
        }
        let mut timers: Option<Timers> = None;
        loop {
            let work = {
                let mut tick = pin!(next_tick(&mut timers).fuse());
                let mut task = self.tasks.next();
                futures::select! {
                    task = task => match task {
                        Some(task) => Work::Task(task),
                        None => Work::Shutdown,
                    },
                    tick = tick => Work::Tick(tick),
                }
            };
            match work {
                Work::Task(task) => match self.state.handle_task(task) {
                    LifecycleChange::Started => timers = Some(Timers::new(&self.state.config)),
                    LifecycleChange::Stopped => timers = None,
                    LifecycleChange::None => {}
                },
                Work::Tick(TimerTick::Poll) => self.state.poll_stats(),
                Work::Tick(TimerTick::Refresh) => self.state.refresh_conntrack(),
                Work::Tick(TimerTick::Metrics) => self.state.sample_session_metrics(),
                Work::Shutdown => {
                    debug!("all handles dropped, coordinator loop exiting");
                    break;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn state_mut(&mut self) -> &mut OffloadState {
        &mut self.state
    }
}
