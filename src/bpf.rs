// Copyright 2024 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Minimal `bpf(2)` shim for the pinned tethering maps.
//!
//! Only the element operations the coordinator needs are wrapped here;
//! map creation, program loading and verification belong to the kernel
//! program's build, not to user space.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

// bpf_cmd values from the kernel uapi. Stable ABI.
const BPF_MAP_LOOKUP_ELEM: libc::c_long = 1;
const BPF_MAP_UPDATE_ELEM: libc::c_long = 2;
const BPF_MAP_DELETE_ELEM: libc::c_long = 3;
const BPF_MAP_GET_NEXT_KEY: libc::c_long = 4;
const BPF_OBJ_GET: libc::c_long = 7;
const BPF_MAP_LOOKUP_AND_DELETE_ELEM: libc::c_long = 21;

/// `BPF_ANY` update flag: create the entry or overwrite an existing one.
const BPF_ANY: u64 = 0;

/// `bpf_attr` layout for element commands (`BPF_MAP_*_ELEM`,
/// `BPF_MAP_GET_NEXT_KEY`).
#[repr(C)]
#[derive(Default)]
struct ElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    // `value` for lookup/update, `next_key` for get-next-key.
    value_or_next_key: u64,
    flags: u64,
}

/// `bpf_attr` layout for `BPF_OBJ_GET`.
#[repr(C)]
#[derive(Default)]
struct ObjAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

fn sys_bpf<T>(cmd: libc::c_long, attr: &mut T) -> io::Result<i64> {
    // SAFETY: `attr` is a live, properly sized attribute struct for `cmd`,
    // and the kernel only reads/writes within the size we pass.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            std::mem::size_of::<T>(),
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as i64)
    }
}

/// An owned fd for one pinned BPF map.
#[derive(Debug)]
pub struct MapFd(OwnedFd);

impl MapFd {
    /// Opens the map pinned at `path` (`BPF_OBJ_GET`).
    pub fn from_pinned(path: &str) -> io::Result<Self> {
        let path = CString::new(path).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let mut attr =
            ObjAttr { pathname: path.as_ptr() as u64, ..Default::default() };
        let fd = sys_bpf(BPF_OBJ_GET, &mut attr)?;
        // SAFETY: a successful BPF_OBJ_GET returns a fresh fd we now own.
        Ok(MapFd(unsafe { OwnedFd::from_raw_fd(fd as RawFd) }))
    }

    fn elem_attr(&self) -> ElemAttr {
        ElemAttr { map_fd: self.0.as_raw_fd() as u32, ..Default::default() }
    }

    /// Looks up `key`, writing the value into `value`. `Ok(false)` means the
    /// entry does not exist.
    pub fn lookup(&self, key: &[u8], value: &mut [u8]) -> io::Result<bool> {
        let mut attr = self.elem_attr();
        attr.key = key.as_ptr() as u64;
        attr.value_or_next_key = value.as_mut_ptr() as u64;
        match sys_bpf(BPF_MAP_LOOKUP_ELEM, &mut attr) {
            Ok(_) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Creates or overwrites the entry for `key`.
    pub fn update(&self, key: &[u8], value: &[u8]) -> io::Result<()> {
        let mut attr = self.elem_attr();
        attr.key = key.as_ptr() as u64;
        attr.value_or_next_key = value.as_ptr() as u64;
        attr.flags = BPF_ANY;
        sys_bpf(BPF_MAP_UPDATE_ELEM, &mut attr).map(|_| ())
    }

    /// Deletes the entry for `key`. `Ok(false)` means it was already gone.
    pub fn delete(&self, key: &[u8]) -> io::Result<bool> {
        let mut attr = self.elem_attr();
        attr.key = key.as_ptr() as u64;
        match sys_bpf(BPF_MAP_DELETE_ELEM, &mut attr) {
            Ok(_) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Atomically reads and removes the entry for `key`.
    pub fn lookup_and_delete(&self, key: &[u8], value: &mut [u8]) -> io::Result<bool> {
        let mut attr = self.elem_attr();
        attr.key = key.as_ptr() as u64;
        attr.value_or_next_key = value.as_mut_ptr() as u64;
        match sys_bpf(BPF_MAP_LOOKUP_AND_DELETE_ELEM, &mut attr) {
            Ok(_) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Writes the key following `key` (or the first key when `key` is
    /// `None`) into `next_key`. `Ok(false)` signals the end of the map.
    pub fn next_key(&self, key: Option<&[u8]>, next_key: &mut [u8]) -> io::Result<bool> {
        let mut attr = self.elem_attr();
        attr.key = key.map_or(0, |k| k.as_ptr() as u64);
        attr.value_or_next_key = next_key.as_mut_ptr() as u64;
        match sys_bpf(BPF_MAP_GET_NEXT_KEY, &mut attr) {
            Ok(_) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
