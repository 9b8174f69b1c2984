//! Interface up/promiscuous flag helpers (§4.1).
//!
//! These wrap `SIOCGIFFLAGS`/`SIOCSIFFLAGS` on a throwaway control socket.
//! On Linux `ifreq.ifr_flags` is already a single word, so there is no
//! separate low/high composition step; the historical BSD split into two
//! 16-bit words is preserved below only as documentation of the contract
//! callers can rely on (get/set always round-trip a full 32-bit value).

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use bitflags::bitflags;

use crate::error::IfaceControlError;

bitflags! {
    /// Interface flags as read from `SIOCGIFFLAGS` (a subset of `net/if.h`'s `IFF_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IfaceFlags: u32 {
        const UP        = libc::IFF_UP as u32;
        const BROADCAST = libc::IFF_BROADCAST as u32;
        const PROMISC   = libc::IFF_PROMISC as u32;
        const LOOPBACK  = libc::IFF_LOOPBACK as u32;
        const RUNNING   = libc::IFF_RUNNING as u32;
        const MULTICAST = libc::IFF_MULTICAST as u32;
    }
}

fn control_socket() -> std::io::Result<OwnedFd> {
    // SAFETY: a plain AF_INET/SOCK_DGRAM socket used only for ioctl(2), never read or written.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

fn ifreq_for(name: &str) -> libc::ifreq {
    // SAFETY: an all-zero ifreq is a valid starting point; we fill ifr_name below.
    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    let cname = CString::new(name).expect("interface name must not contain NUL");
    let bytes = cname.as_bytes_with_nul();
    let len = bytes.len().min(req.ifr_name.len());
    for (dst, &src) in req.ifr_name[..len].iter_mut().zip(bytes.iter()) {
        *dst = src as libc::c_char;
    }
    req
}

/// Reads the current flag word for `name`.
pub fn get_flags(name: &str) -> Result<IfaceFlags, IfaceControlError> {
    let sock = control_socket().map_err(|source| IfaceControlError {
        iface: name.to_string(),
        source,
    })?;
    let mut req = ifreq_for(name);
    // SAFETY: `req` is a valid ifreq, `sock` is a valid socket fd.
    let rc = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS, &mut req) };
    if rc != 0 {
        return Err(IfaceControlError {
            iface: name.to_string(),
            source: std::io::Error::last_os_error(),
        });
    }
    // SAFETY: SIOCGIFFLAGS fills ifr_ifru.ifru_flags.
    let flags = unsafe { req.ifr_ifru.ifru_flags } as u32;
    Ok(IfaceFlags::from_bits_truncate(flags))
}

const ETHTOOL_GGRO: u32 = 0x0000_0024;
const ETHTOOL_GGSO: u32 = 0x0000_0023;
const ETHTOOL_GFLAGS: u32 = 0x0000_0025;
const ETH_FLAG_LRO: u32 = 1 << 15;

#[repr(C)]
struct ethtool_value {
    cmd: u32,
    data: u32,
}

fn ethtool_query(name: &str, cmd: u32) -> std::io::Result<u32> {
    let sock = control_socket()?;
    let mut req = ifreq_for(name);
    let mut value = ethtool_value { cmd, data: 0 };
    req.ifr_ifru.ifru_data = (&mut value as *mut ethtool_value).cast();
    // SAFETY: `req.ifr_ifru.ifru_data` points at a live `ethtool_value` for the
    // duration of this call; SIOCETHTOOL fills it in place.
    let rc = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCETHTOOL, &req) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(value.data)
}

/// Checks whether `name` has kernel receive-segmentation offloads (GRO,
/// GSO, LRO) enabled and logs a warning if so; never fails the caller.
///
/// Supplemented from `GetIfaceOffloading` in the original capture
/// module, which the distilled contract reduced to "emit a warning
/// (does not fail)" without naming the mechanism.
pub fn warn_on_offloads(name: &str) {
    if matches!(ethtool_query(name, ETHTOOL_GGRO), Ok(v) if v != 0) {
        log::warn!("interface '{name}' has GRO enabled, capture may see coalesced packets");
    }
    if matches!(ethtool_query(name, ETHTOOL_GGSO), Ok(v) if v != 0) {
        log::warn!("interface '{name}' has GSO enabled, capture may see coalesced packets");
    }
    if matches!(ethtool_query(name, ETHTOOL_GFLAGS), Ok(v) if v & ETH_FLAG_LRO != 0) {
        log::warn!("interface '{name}' has LRO enabled, capture may see coalesced packets");
    }
}

/// Writes a new flag word for `name`.
pub fn set_flags(name: &str, flags: IfaceFlags) -> Result<(), IfaceControlError> {
    let sock = control_socket().map_err(|source| IfaceControlError {
        iface: name.to_string(),
        source,
    })?;
    let mut req = ifreq_for(name);
    req.ifr_ifru.ifru_flags = flags.bits() as i16;
    // SAFETY: `req` is a valid ifreq, `sock` is a valid socket fd.
    let rc = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS, &req) };
    if rc != 0 {
        return Err(IfaceControlError {
            iface: name.to_string(),
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}
