// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Conntrack timeout-update messages over `NETLINK_NETFILTER`.
//!
//! The refresher sends one `IPCTNL_MSG_CT_NEW` update per live offloaded
//! flow, carrying the flow's original-direction tuple and a new timeout.
//! The kernel acks every request; `ENOENT` acks are the benign race where
//! the flow died between the map snapshot and the update.

use std::cell::Cell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use zerocopy::IntoBytes;

use crate::conntrack::{ConntrackTuple, IPCTNL_MSG_CT_NEW, NFNL_SUBSYS_CTNETLINK};

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;
const NLMSG_ERROR: u16 = 0x02;

const NLA_F_NESTED: u16 = 0x8000;
const NLA_ALIGNTO: usize = 4;

// ctattr_type
const CTA_TUPLE_ORIG: u16 = 1;
const CTA_TIMEOUT: u16 = 7;
// ctattr_tuple
const CTA_TUPLE_IP: u16 = 1;
const CTA_TUPLE_PROTO: u16 = 2;
// ctattr_ip
const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;
// ctattr_l4proto
const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;

#[derive(thiserror::Error, Debug)]
pub enum NetlinkError {
    /// The kernel no longer tracks the flow.
    #[error("flow not found")]
    NotFound,
    #[error("kernel rejected request: errno {0}")]
    Errno(i32),
    #[error("netlink socket error: {0}")]
    Io(#[from] io::Error),
}

/// Capability for refreshing one conntrack entry's timeout.
pub trait ConntrackNetlink {
    fn request_timeout_update(
        &self,
        tuple: &ConntrackTuple,
        timeout_s: u32,
    ) -> Result<(), NetlinkError>;
}

#[repr(C)]
#[derive(IntoBytes, zerocopy::Immutable)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

#[repr(C)]
#[derive(IntoBytes, zerocopy::Immutable)]
struct NfGenMsg {
    nfgen_family: u8,
    version: u8,
    res_id: u16,
}

struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    fn new() -> Self {
        MessageBuilder { buf: Vec::with_capacity(96) }
    }

    fn pad(&mut self) {
        while self.buf.len() % NLA_ALIGNTO != 0 {
            self.buf.push(0);
        }
    }

    fn put_attr(&mut self, kind: u16, payload: &[u8]) {
        let len = (4 + payload.len()) as u16;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.pad();
    }

    /// Opens a nested attribute; returns the offset to patch in
    /// [`Self::end_nest`].
    fn begin_nest(&mut self, kind: u16) -> usize {
        let start = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&(kind | NLA_F_NESTED).to_ne_bytes());
        start
    }

    fn end_nest(&mut self, start: usize) {
        let len = (self.buf.len() - start) as u16;
        self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
    }
}

/// Serializes one timeout-update request. `seq` is echoed in the ack.
pub(crate) fn build_timeout_update(tuple: &ConntrackTuple, timeout_s: u32, seq: u32) -> Vec<u8> {
    let mut b = MessageBuilder::new();
    let header = NlMsgHdr {
        nlmsg_len: 0, // patched below
        nlmsg_type: (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_NEW,
        nlmsg_flags: NLM_F_REQUEST | NLM_F_ACK,
        nlmsg_seq: seq,
        nlmsg_pid: 0,
    };
    b.buf.extend_from_slice(header.as_bytes());
    let genmsg = NfGenMsg { nfgen_family: libc::AF_INET as u8, version: 0, res_id: 0 };
    b.buf.extend_from_slice(genmsg.as_bytes());

    let orig = b.begin_nest(CTA_TUPLE_ORIG);
    {
        let ip = b.begin_nest(CTA_TUPLE_IP);
        b.put_attr(CTA_IP_V4_SRC, &tuple.src.octets());
        b.put_attr(CTA_IP_V4_DST, &tuple.dst.octets());
        b.end_nest(ip);

        let proto = b.begin_nest(CTA_TUPLE_PROTO);
        b.put_attr(CTA_PROTO_NUM, &[tuple.proto]);
        b.put_attr(CTA_PROTO_SRC_PORT, &tuple.src_port.to_be_bytes());
        b.put_attr(CTA_PROTO_DST_PORT, &tuple.dst_port.to_be_bytes());
        b.end_nest(proto);
    }
    b.end_nest(orig);

    b.put_attr(CTA_TIMEOUT, &timeout_s.to_be_bytes());

    let len = b.buf.len() as u32;
    b.buf[..4].copy_from_slice(&len.to_ne_bytes());
    b.buf
}

/// Production [`ConntrackNetlink`] backed by a `NETLINK_NETFILTER`
/// socket owned by the coordinator thread.
pub struct NetfilterSocket {
    fd: OwnedFd,
    seq: Cell<u32>,
}

impl NetfilterSocket {
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain socket creation; the fd is checked and owned below.
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_NETFILTER,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a valid, unowned socket fd.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let timeout = libc::timeval { tv_sec: 1, tv_usec: 0 };
        // SAFETY: setsockopt with a properly sized timeval.
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(NetfilterSocket { fd, seq: Cell::new(1) })
    }

    fn next_seq(&self) -> u32 {
        let seq = self.seq.get();
        self.seq.set(seq.wrapping_add(1));
        seq
    }
}

impl ConntrackNetlink for NetfilterSocket {
    fn request_timeout_update(
        &self,
        tuple: &ConntrackTuple,
        timeout_s: u32,
    ) -> Result<(), NetlinkError> {
        let msg = build_timeout_update(tuple, timeout_s, self.next_seq());
        // SAFETY: sends a fully initialized buffer on an owned socket.
        let sent = unsafe {
            libc::send(self.fd.as_raw_fd(), msg.as_ptr() as *const libc::c_void, msg.len(), 0)
        };
        if sent < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut ack = [0u8; 256];
        // SAFETY: receives into a stack buffer of the stated size.
        let received = unsafe {
            libc::recv(self.fd.as_raw_fd(), ack.as_mut_ptr() as *mut libc::c_void, ack.len(), 0)
        };
        if received < 0 {
            return Err(io::Error::last_os_error().into());
        }
        parse_ack(&ack[..received as usize])
    }
}

/// Interprets the kernel's `NLMSG_ERROR` ack.
fn parse_ack(ack: &[u8]) -> Result<(), NetlinkError> {
    // nlmsghdr (16 bytes) followed by nlmsgerr { i32 error; ... }.
    if ack.len() < 20 {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    let msg_type = u16::from_ne_bytes([ack[4], ack[5]]);
    if msg_type != NLMSG_ERROR {
        // Anything other than an ack is unexpected for an ACKed request.
        return Err(NetlinkError::Errno(0));
    }
    let error = i32::from_ne_bytes([ack[16], ack[17], ack[18], ack[19]]);
    match -error {
        0 => Ok(()),
        libc::ENOENT => Err(NetlinkError::NotFound),
        errno => Err(NetlinkError::Errno(errno)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::IPPROTO_TCP;

    fn tuple() -> ConntrackTuple {
        ConntrackTuple {
            proto: IPPROTO_TCP,
            src: "192.168.49.42".parse().unwrap(),
            dst: "93.184.216.34".parse().unwrap(),
            src_port: 55555,
            dst_port: 443,
        }
    }

    #[test]
    fn header_fields() {
        let msg = build_timeout_update(&tuple(), 432_000, 7);
        assert_eq!(u32::from_ne_bytes(msg[..4].try_into().unwrap()) as usize, msg.len());
        // NFNL_SUBSYS_CTNETLINK << 8 | IPCTNL_MSG_CT_NEW
        assert_eq!(u16::from_ne_bytes(msg[4..6].try_into().unwrap()), 0x0100);
        assert_eq!(
            u16::from_ne_bytes(msg[6..8].try_into().unwrap()),
            NLM_F_REQUEST | NLM_F_ACK
        );
        assert_eq!(u32::from_ne_bytes(msg[8..12].try_into().unwrap()), 7);
        // nfgenmsg: AF_INET, version 0.
        assert_eq!(msg[16], libc::AF_INET as u8);
        assert_eq!(msg[17], 0);
    }

    #[test]
    fn carries_tuple_and_timeout() {
        let msg = build_timeout_update(&tuple(), 180, 1);
        // Addresses appear in network order in the payload.
        let src = [192, 168, 49, 42];
        let dst = [93, 184, 216, 34];
        assert!(msg.windows(4).any(|w| w == src));
        assert!(msg.windows(4).any(|w| w == dst));
        // Ports and the timeout are big-endian.
        assert!(msg.windows(2).any(|w| w == 55555u16.to_be_bytes()));
        assert!(msg.windows(2).any(|w| w == 443u16.to_be_bytes()));
        assert!(msg.windows(4).any(|w| w == 180u32.to_be_bytes()));
    }

    #[test]
    fn nested_attributes_are_marked() {
        let msg = build_timeout_update(&tuple(), 180, 1);
        // First attribute after the 20-byte headers is CTA_TUPLE_ORIG.
        let kind = u16::from_ne_bytes(msg[22..24].try_into().unwrap());
        assert_eq!(kind, CTA_TUPLE_ORIG | NLA_F_NESTED);
    }

    #[test]
    fn ack_parsing() {
        let mut ack = vec![0u8; 20];
        ack[4..6].copy_from_slice(&NLMSG_ERROR.to_ne_bytes());
        assert_matches::assert_matches!(parse_ack(&ack), Ok(()));

        ack[16..20].copy_from_slice(&(-libc::ENOENT).to_ne_bytes());
        assert_matches::assert_matches!(parse_ack(&ack), Err(NetlinkError::NotFound));

        ack[16..20].copy_from_slice(&(-libc::EPERM).to_ne_bytes());
        assert_matches::assert_matches!(
            parse_ack(&ack),
            Err(NetlinkError::Errno(e)) if e == libc::EPERM
        );
    }
}
