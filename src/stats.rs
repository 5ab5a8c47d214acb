// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Forwarded-traffic accounting: periodic stats deltas, the global alert
//! quota, and per-upstream data limits.
//!
//! The limit map entry for an upstream is programmed before the first rule
//! lands on it and torn down only after the last rule is gone; the final
//! stats read happens inside that teardown, which is what makes the
//! read-and-clear safe against concurrent kernel counting.

use std::collections::HashMap;

use log::{debug, error, warn};

use crate::conntrack::SessionCounter;
use crate::maps::{MapAccessor, TetherStatsValue, NO_UPSTREAM, QUOTA_UNLIMITED};
use crate::rules::RuleStore;

/// Synthetic uid forwarded traffic is attributed to in per-uid stats.
pub const UID_TETHERING: i32 = -5;

/// Byte/packet counters forwarded via one upstream. Monotonically
/// nondecreasing for as long as the upstream's stats entry exists.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ForwardedStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

impl From<TetherStatsValue> for ForwardedStats {
    fn from(value: TetherStatsValue) -> Self {
        let TetherStatsValue { rx_packets, rx_bytes, tx_packets, tx_bytes } = value;
        ForwardedStats { rx_bytes, rx_packets, tx_bytes, tx_packets }
    }
}

impl ForwardedStats {
    /// Counter growth since `earlier`. Saturating, so a counter reset in
    /// the kernel shows up as zero growth rather than an underflow.
    pub fn delta_since(&self, earlier: &ForwardedStats) -> ForwardedStats {
        ForwardedStats {
            rx_bytes: self.rx_bytes.saturating_sub(earlier.rx_bytes),
            rx_packets: self.rx_packets.saturating_sub(earlier.rx_packets),
            tx_bytes: self.tx_bytes.saturating_sub(earlier.tx_bytes),
            tx_packets: self.tx_packets.saturating_sub(earlier.tx_packets),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.rx_bytes.saturating_add(self.tx_bytes)
    }

    pub fn is_empty(&self) -> bool {
        *self == ForwardedStats::default()
    }
}

/// Where forwarded-traffic deltas and the quota alert are delivered.
pub trait StatsSink {
    /// `per_iface` carries (interface name, delta); `per_uid` the same
    /// deltas attributed to a uid ([`UID_TETHERING`]).
    fn notify_stats_updated(
        &self,
        per_iface: &[(String, ForwardedStats)],
        per_uid: &[(String, i32, ForwardedStats)],
    );
    fn notify_alert_reached(&self);
}

pub trait MetricsSink {
    fn report_active_sessions(&self, peak_since_last_sample: u32);
}

/// True when any installed rule, IPv6 or IPv4, forwards via `ifindex`.
fn any_rule_on_upstream(store: &RuleStore, sessions: &SessionCounter, ifindex: u32) -> bool {
    store.has_ipv6_rules_on_upstream(ifindex)
        || (store.last_ipv4_upstream_ifindex == ifindex && sessions.current() > 0)
}

pub(crate) struct StatsAndLimit {
    /// Per-interface quotas; absent means unlimited.
    interface_quotas: HashMap<String, u64>,
    remaining_alert_quota: i64,
    /// Cumulative counters already attributed per upstream ifindex.
    stats: HashMap<u32, ForwardedStats>,
}

impl Default for StatsAndLimit {
    fn default() -> Self {
        StatsAndLimit {
            interface_quotas: HashMap::new(),
            remaining_alert_quota: i64::MAX,
            stats: HashMap::new(),
        }
    }
}

impl StatsAndLimit {
    /// Records the quota for `name` and, when rules are already live on
    /// that interface, reprograms the kernel limit immediately.
    pub fn on_set_limit(
        &mut self,
        name: &str,
        quota_bytes: u64,
        store: &RuleStore,
        sessions: &SessionCounter,
        maps: &dyn MapAccessor,
    ) {
        if quota_bytes == QUOTA_UNLIMITED {
            self.interface_quotas.remove(name);
        } else {
            self.interface_quotas.insert(name.to_string(), quota_bytes);
        }
        self.maybe_update_data_limit(name, store, sessions, maps);
    }

    fn maybe_update_data_limit(
        &self,
        name: &str,
        store: &RuleStore,
        sessions: &SessionCounter,
        maps: &dyn MapAccessor,
    ) {
        let Some(ifindex) = store.interface_index(name) else { return };
        // With no rule on the upstream there is no limit entry to update;
        // the quota is picked up when the first rule is installed.
        if !any_rule_on_upstream(store, sessions, ifindex) {
            return;
        }
        let quota = self.quota_for(name);
        if !maps.limit_set(ifindex, quota) {
            error!("reprogramming data limit {} on {} failed", quota, name);
        }
    }

    fn quota_for(&self, name: &str) -> u64 {
        self.interface_quotas.get(name).copied().unwrap_or(QUOTA_UNLIMITED)
    }

    /// Replaces the global alert quota. Crossing zero from a positive
    /// value notifies the sink exactly once.
    pub fn update_alert_quota(&mut self, quota_bytes: i64, sink: &dyn StatsSink) {
        if quota_bytes < 0 {
            error!("rejecting negative alert quota {}", quota_bytes);
            return;
        }
        let crossed = self.remaining_alert_quota > 0 && quota_bytes == 0;
        self.remaining_alert_quota = quota_bytes;
        if crossed {
            sink.notify_alert_reached();
        }
    }

    pub fn remaining_alert_quota(&self) -> i64 {
        self.remaining_alert_quota
    }

    /// Programs the data limit for `ifindex` if it carries no rule yet.
    /// Returns false when the kernel write fails, in which case the caller
    /// must not install the rule.
    pub fn maybe_set_limit(
        &self,
        ifindex: u32,
        store: &RuleStore,
        sessions: &SessionCounter,
        maps: &dyn MapAccessor,
    ) -> bool {
        if !maps.is_initialized() {
            return true;
        }
        if any_rule_on_upstream(store, sessions, ifindex) {
            return true;
        }
        let quota = store.interface_name(ifindex).map_or(QUOTA_UNLIMITED, |n| self.quota_for(n));
        if maps.limit_set(ifindex, quota) {
            true
        } else {
            error!("programming data limit {} on ifindex {} failed", quota, ifindex);
            false
        }
    }

    /// Tears down the limit for `ifindex` once its last rule is gone:
    /// reads and zeros the kernel counters, attributes the final delta,
    /// and removes the limit entry.
    pub fn maybe_clear_limit(
        &mut self,
        ifindex: u32,
        store: &RuleStore,
        sessions: &SessionCounter,
        maps: &dyn MapAccessor,
        sink: &dyn StatsSink,
    ) {
        if ifindex == NO_UPSTREAM || !maps.is_initialized() {
            return;
        }
        if any_rule_on_upstream(store, sessions, ifindex) {
            return;
        }
        if let Some(total) = maps.stats_get_and_clear(ifindex) {
            let total = ForwardedStats::from(total);
            let cached = self.stats.remove(&ifindex).unwrap_or_default();
            let delta = total.delta_since(&cached);
            self.publish(ifindex, delta, store, sink);
        } else {
            self.stats.remove(&ifindex);
        }
        maps.limit_remove(ifindex);
    }

    /// Periodic poll: snapshots the stats map, attributes per-upstream
    /// growth to the sink, and burns down the alert quota.
    pub fn update_forwarded_stats(
        &mut self,
        maps: &dyn MapAccessor,
        store: &RuleStore,
        sink: &dyn StatsSink,
    ) {
        let mut snapshot = Vec::new();
        maps.stats_for_each(&mut |ifindex, value| {
            snapshot.push((ifindex, ForwardedStats::from(*value)));
        });
        for (ifindex, current) in snapshot {
            let cached = self.stats.insert(ifindex, current).unwrap_or_default();
            let delta = current.delta_since(&cached);
            self.publish(ifindex, delta, store, sink);
        }
    }

    fn publish(
        &mut self,
        ifindex: u32,
        delta: ForwardedStats,
        store: &RuleStore,
        sink: &dyn StatsSink,
    ) {
        if delta.is_empty() {
            return;
        }
        match store.interface_name(ifindex) {
            Some(name) => {
                let per_iface = [(name.to_string(), delta)];
                let per_uid = [(name.to_string(), UID_TETHERING, delta)];
                sink.notify_stats_updated(&per_iface, &per_uid);
            }
            None => warn!("dropping forwarded stats for unknown upstream ifindex {}", ifindex),
        }
        let bytes = delta.total_bytes();
        if self.remaining_alert_quota == i64::MAX || bytes == 0 {
            return;
        }
        let remaining = self
            .remaining_alert_quota
            .saturating_sub(i64::try_from(bytes).unwrap_or(i64::MAX))
            .max(0);
        debug!("alert quota {} -> {}", self.remaining_alert_quota, remaining);
        let crossed = self.remaining_alert_quota > 0 && remaining == 0;
        self.remaining_alert_quota = remaining;
        if crossed {
            sink.notify_alert_reached();
        }
    }

    pub fn cached_stats(&self) -> Vec<(u32, ForwardedStats)> {
        let mut stats: Vec<_> = self.stats.iter().map(|(i, s)| (*i, *s)).collect();
        stats.sort_unstable_by_key(|(i, _)| *i);
        stats
    }
}
