//! Raw bindings to the netmap(4) kernel-bypass ring ABI.
//!
//! This crate only describes the wire layout of the control structures and
//! the `ioctl` request codes; it does not open devices, map memory, or
//! interpret ring contents. That policy lives in `netmap-capture`.
//!
//! Layouts follow `net/netmap_user.h` / `net/netmap.h` as used by FreeBSD
//! and the Linux netmap module. Field widths and offsets are fixed by the
//! kernel ABI and must not be changed.

#![allow(non_camel_case_types)]

use std::os::raw::c_char;

pub const NETMAP_API: u32 = 14;
pub const NETMAP_DEVICE: &str = "/dev/netmap";

/// `nmreq.nr_flags`: register a single NIC ring pair.
pub const NR_REG_ONE_NIC: u16 = 3;

/// `nmreq.nr_ringid` high bit: don't automatically poll-sync the TX ring.
pub const NETMAP_NO_TX_POLL: u32 = 0x8000;

/// `netmap_slot.flags`: the slot's `buf_idx` was swapped since the kernel last saw it.
pub const NS_BUF_CHANGED: u16 = 0x0004;

/// These request codes follow the `_IOWR('i', ..., struct nmreq)` encoding
/// netmap uses on Linux; they are only ever handed straight through to
/// `libc::ioctl` by `netmap-capture`, never interpreted here.
pub const NIOCGINFO: libc::c_ulong = 0xC0C8_6920;
pub const NIOCREGIF: libc::c_ulong = 0xC0C8_6921;
pub const NIOCTXSYNC: libc::c_ulong = 0x0000_6922;
pub const NIOCRXSYNC: libc::c_ulong = 0x0000_6923;

/// Mirrors `struct nmreq` from `net/netmap_user.h`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct nmreq {
    pub nr_name: [c_char; 16],
    pub nr_version: u32,
    pub nr_offset: u32,
    pub nr_memsize: u32,
    pub nr_tx_slots: u32,
    pub nr_rx_slots: u32,
    pub nr_tx_rings: u16,
    pub nr_rx_rings: u16,
    pub nr_ringid: u16,
    pub nr_cmd: u16,
    pub nr_arg1: u16,
    pub nr_arg2: u16,
    pub nr_arg3: u32,
    pub nr_flags: u32,
    pub spare2: [u32; 1],
}

impl Default for nmreq {
    fn default() -> Self {
        // SAFETY: an all-zero `nmreq` is a valid request per the netmap ABI.
        unsafe { std::mem::zeroed() }
    }
}

/// Mirrors `struct netmap_slot`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct netmap_slot {
    pub buf_idx: u32,
    pub len: u16,
    pub flags: u16,
    pub ptr: u64,
}

/// Mirrors `struct netmap_ring` (the variable-length `slot[]` tail is
/// accessed through [`netmap_ring::slot_ptr`], never through a Rust array field).
#[repr(C)]
pub struct netmap_ring {
    pub buf_ofs: i64,
    pub num_slots: u32,
    pub nr_buf_size: u32,
    pub ringid: u16,
    pub dir: u16,
    pub head: u32,
    pub cur: u32,
    pub tail: u32,
    pub flags: u32,
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub sem: [u8; 128],
    pub slot: [netmap_slot; 0],
}

impl netmap_ring {
    /// Pointer to slot `i`. `i` must be `< num_slots`.
    ///
    /// # Safety
    /// `self` must point into a live mapping that actually has `num_slots`
    /// trailing slots, which the kernel guarantees for any ring it handed
    /// back from `NIOCREGIF`/`mmap`.
    pub unsafe fn slot_ptr(&self, i: u32) -> *mut netmap_slot {
        let base = (self as *const netmap_ring as *const u8).add(std::mem::size_of::<Self>());
        (base as *mut netmap_slot).add(i as usize)
    }
}

/// Mirrors `struct netmap_if`: the per-device header at `mmap_base + nr_offset`.
#[repr(C)]
pub struct netmap_if {
    pub ni_name: [c_char; 16],
    pub ni_version: u32,
    pub ni_rx_rings: u32,
    pub ni_tx_rings: u32,
    pub ni_bufs_head: u32,
    pub spare1: [u32; 5],
    pub ring_ofs: [isize; 0],
}

impl netmap_if {
    /// Offset (bytes from the mapping base) of ring `i`. RX rings are
    /// indexed `[0, nr_rx_rings)`, TX rings `[nr_rx_rings, nr_rx_rings +
    /// nr_tx_rings)`, matching `NETMAP_RXRING`/`NETMAP_TXRING`.
    ///
    /// # Safety
    /// `self` must point into a live mapping with a `ring_ofs` table sized
    /// for its `ni_rx_rings + ni_tx_rings`.
    pub unsafe fn ring_offset(&self, i: u32) -> isize {
        let base = (self as *const netmap_if as *const u8).add(std::mem::size_of::<Self>());
        *(base as *const isize).add(i as usize)
    }
}

/// Opens the netmap control device. Policy (promiscuity, registration)
/// lives above this crate.
///
/// # Safety
/// This is a thin wrapper: it performs the raw `open(2)` and returns
/// whatever fd or `errno` the kernel gives back.
pub unsafe fn open_control() -> std::io::Result<std::os::fd::OwnedFd> {
    use std::os::fd::FromRawFd;
    let path = std::ffi::CString::new(NETMAP_DEVICE).unwrap();
    let fd = libc::open(path.as_ptr(), libc::O_RDWR);
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(std::os::fd::OwnedFd::from_raw_fd(fd))
}
