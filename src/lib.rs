// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! User-space coordinator for in-kernel tethering offload.
//!
//! The kernel datapath forwards tethered traffic between downstream
//! interfaces (hotspot, USB, Bluetooth, Ethernet) and the active upstream
//! without lifting packets into user space. It is driven entirely by a set
//! of pinned BPF maps; this crate is the brain that programs those maps.
//!
//! Three asynchronous inputs feed the coordinator: NAT conntrack events
//! (IPv4 flows), neighbor discovery events (IPv6 clients and IPv4 client
//! liveness), and upstream/downstream lifecycle notifications from the
//! serving machinery. Each input is translated into paired map writes so
//! that every offloaded flow always has matching upstream and downstream
//! entries. Periodic jobs pull the other way: forwarded-traffic stats are
//! polled out of the kernel and pushed to the platform stats service, and
//! conntrack timeouts are refreshed for flows the kernel keeps alive
//! without any user-space traffic.
//!
//! All mutable state lives on a single-threaded event loop
//! ([`coordinator::Coordinator::run`]); external callers enqueue work
//! through a cloneable [`coordinator::OffloadHandle`].

pub mod bpf;
pub mod conntrack;
pub mod coordinator;
pub mod maps;
pub mod neighbor;
pub mod netlink;
pub mod refresh;
pub mod rules;
pub mod stats;

#[cfg(test)]
pub(crate) mod testutil;

pub use coordinator::{
    Capabilities, Config, Coordinator, DebugSnapshot, OffloadHandle, UpstreamNetworkState,
};
pub use rules::{DownstreamId, InterfaceParams, MacAddr};
