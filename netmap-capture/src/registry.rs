//! The device registry (§4.2): a mutex-protected table of opened capture
//! devices, each reference-counted and owning a shared memory region plus
//! an array of per-ring handles.
//!
//! Grounded on the teacher's `RwLock<BTreeMap<Box<str>, Arc<dyn
//! KernelScheme>>>` registry in `src/scheme/mod.rs` and on
//! `source-netmap.c`'s `netmap_devlist`/`netmap_devlist_lock` (a
//! `TAILQ` walked under a single mutex). Passed around as an explicit
//! handle rather than a process-wide singleton, per design note §9's
//! "alternatively, pass an explicit `DeviceRegistry` handle through init".

use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use netmap_sys::{netmap_if, netmap_ring, nmreq};

use crate::error::{CaptureError, Result};
use crate::iface::{self, IfaceFlags};
use crate::ring::RingHandle;

/// Backing memory for a device's rings. `None` is used only by
/// test-constructed devices whose rings are backed by independently-owned
/// fake buffers (see `ring::fake`).
enum MemoryRegion {
    Mapped { ptr: *mut libc::c_void, len: usize },
    None,
}

// SAFETY: the mapping is read/written only through `RingHandle`s, which
// enforce their own access discipline; `MemoryRegion` itself never
// dereferences the pointer.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if let MemoryRegion::Mapped { ptr, len } = *self {
            // SAFETY: `ptr`/`len` came from a successful `mmap` of this exact size,
            // and no `RingHandle` outlives the `Device` that owns this region
            // (every zero-copy packet holds a strong `Arc<Device>`, see `packet::ZeroCopyBinding`).
            unsafe {
                libc::munmap(ptr, len);
            }
        }
    }
}

/// One opened capture interface (§3's `Device`).
pub struct Device {
    pub name: String,
    region: MemoryRegion,
    pub rings: Box<[RingHandle]>,
    refcount: AtomicUsize,
    threads_bound: AtomicUsize,
}

impl Device {
    /// Claims the next unused thread slot and returns the inclusive ring
    /// range it owns (§4.2's thread-range assignment).
    ///
    /// `thread_count` must be `<= rings.len()`, checked by the caller
    /// (`TooManyThreads`) before any slot is claimed.
    pub fn claim_ring_range(&self, thread_count: usize) -> (usize, std::ops::RangeInclusive<usize>) {
        let slot = self.threads_bound.fetch_add(1, Ordering::SeqCst);
        let per_thread = self.rings.len() / thread_count;
        let ring_from = slot * per_thread;
        // The last thread absorbs any remainder from the non-dividing case
        // (spec scenario: 4 rings / 3 threads -> thread 2 owns [2,3]).
        let ring_to = if slot == thread_count - 1 {
            self.rings.len() - 1
        } else {
            ring_from + per_thread - 1
        };
        (slot, ring_from..=ring_to)
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }
}

/// A process-wide (or per-caller) table of opened [`Device`]s, unique by name.
#[derive(Default)]
pub struct DeviceRegistry {
    table: Mutex<HashMap<String, Arc<Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    /// Acquires (opening if necessary) the device named `name`.
    ///
    /// If a device by this name is already open, it is returned
    /// unchanged and `refcount` incremented: the first caller's
    /// `promiscuous` request and the rings it observed win, exactly as
    /// `NetmapOpen`'s `TAILQ_FOREACH` early-return does.
    pub fn acquire(&self, name: &str, promiscuous: bool, verbose: bool) -> Result<Arc<Device>> {
        let mut table = self.table.lock().expect("device registry poisoned");
        if let Some(existing) = table.get(name) {
            existing.refcount.fetch_add(1, Ordering::SeqCst);
            return Ok(Arc::clone(existing));
        }

        let device = open_device(name, promiscuous, verbose)?;
        let device = Arc::new(device);
        table.insert(name.to_string(), Arc::clone(&device));
        Ok(device)
    }

    /// Releases a previously acquired device. When `refcount` reaches
    /// zero, the entry is removed from the table; the mapping itself is
    /// unmapped once the last `Arc<Device>` (which may still be held by
    /// in-flight zero-copy packets) is dropped.
    pub fn release(&self, device: &Arc<Device>) -> Result<()> {
        let mut table = self.table.lock().expect("device registry poisoned");
        match table.get(&device.name) {
            Some(entry) if Arc::ptr_eq(entry, device) => {
                let remaining = entry.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
                if remaining == 0 {
                    table.remove(&device.name);
                }
                Ok(())
            }
            _ => Err(CaptureError::NotRegistered(device.name.clone())),
        }
    }

    #[cfg(test)]
    pub fn insert_for_test(&self, device: Arc<Device>) {
        self.table
            .lock()
            .expect("device registry poisoned")
            .insert(device.name.clone(), device);
    }

    #[cfg(test)]
    pub fn contains(&self, name: &str) -> bool {
        self.table.lock().expect("device registry poisoned").contains_key(name)
    }
}

#[cfg(test)]
pub fn new_test_device(name: &str, rings: Vec<RingHandle>) -> Device {
    Device {
        name: name.to_string(),
        region: MemoryRegion::None,
        rings: rings.into_boxed_slice(),
        refcount: AtomicUsize::new(1),
        threads_bound: AtomicUsize::new(0),
    }
}

fn cstring_field(name: &str) -> [std::os::raw::c_char; 16] {
    let mut buf = [0 as std::os::raw::c_char; 16];
    let cname = CString::new(name).expect("interface name must not contain NUL");
    let bytes = cname.as_bytes();
    let len = bytes.len().min(buf.len() - 1);
    for (dst, &src) in buf[..len].iter_mut().zip(bytes.iter()) {
        *dst = src as std::os::raw::c_char;
    }
    buf
}

/// Opens the netmap control device for `name`, validates it's up, sets
/// promiscuous mode if requested, queries ring geometry, and registers +
/// maps every ring (§4.2's "not found" path / `NetmapOpen`).
fn open_device(name: &str, promiscuous: bool, verbose: bool) -> Result<Device> {
    // SAFETY: `open_control` only performs `open(2)` on the netmap device node.
    let ctrl_fd = unsafe { netmap_sys::open_control() }
        .map_err(|e| CaptureError::RingRegistrationFailed {
            iface: name.to_string(),
            ring: usize::MAX,
            source: e,
        })?;

    let flags = iface::get_flags(name)?;
    if !flags.contains(IfaceFlags::UP) {
        if verbose {
            log::error!("interface '{name}' is down");
        }
        return Err(CaptureError::InterfaceDown(name.to_string()));
    }

    if promiscuous {
        // §9 open question: failure to set PROMISC does not abort open.
        // Documented policy: warn and continue.
        if let Err(e) = iface::set_flags(name, flags | IfaceFlags::PROMISC) {
            log::warn!("failed to set PROMISC on '{name}': {e}");
        }
    }

    let mut req = nmreq {
        nr_version: netmap_sys::NETMAP_API,
        ..Default::default()
    };
    for (dst, src) in req.nr_name.iter_mut().zip(cstring_field(name).iter()) {
        *dst = *src;
    }

    // SAFETY: `req` is a valid, zero-initialized `nmreq` with `nr_name`/`nr_version` set.
    let rc = unsafe { libc::ioctl(ctrl_fd.as_raw_fd(), netmap_sys::NIOCGINFO, &mut req) };
    if rc != 0 {
        return Err(CaptureError::RingRegistrationFailed {
            iface: name.to_string(),
            ring: usize::MAX,
            source: std::io::Error::last_os_error(),
        });
    }
    if req.nr_rx_rings != req.nr_tx_rings {
        return Err(CaptureError::AsymmetricRings {
            iface: name.to_string(),
            rx: req.nr_rx_rings,
            tx: req.nr_tx_rings,
        });
    }

    let rings_cnt = req.nr_rx_rings as usize;
    let memsize = req.nr_memsize as usize;
    let mut mapped_ptr: *mut libc::c_void = std::ptr::null_mut();
    let mut rings: Vec<RingHandle> = Vec::with_capacity(rings_cnt);

    for i in 0..rings_cnt {
        let mut register = || -> Result<RingHandle> {
            // SAFETY: opens a fresh handle to the control device.
            let fd = unsafe { netmap_sys::open_control() }.map_err(|source| {
                CaptureError::RingRegistrationFailed {
                    iface: name.to_string(),
                    ring: i,
                    source,
                }
            })?;

            let mut ring_req = req;
            ring_req.nr_flags = netmap_sys::NR_REG_ONE_NIC as u32;
            ring_req.nr_ringid = (i as u32 | netmap_sys::NETMAP_NO_TX_POLL) as u16;

            // SAFETY: `ring_req` is a valid request derived from the successful GETINFO above.
            let rc = unsafe { libc::ioctl(fd.as_raw_fd(), netmap_sys::NIOCREGIF, &mut ring_req) };
            if rc != 0 {
                return Err(CaptureError::RingRegistrationFailed {
                    iface: name.to_string(),
                    ring: i,
                    source: std::io::Error::last_os_error(),
                });
            }

            if mapped_ptr.is_null() {
                // SAFETY: `fd` was just registered for ring 0 and is the canonical
                // mapping handle for this device, matching `NetmapOpen`'s
                // "on the first successful registration, mmap" rule.
                let p = unsafe {
                    libc::mmap(
                        std::ptr::null_mut(),
                        memsize,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_SHARED,
                        fd.as_raw_fd(),
                        0,
                    )
                };
                if p == libc::MAP_FAILED {
                    return Err(CaptureError::RingRegistrationFailed {
                        iface: name.to_string(),
                        ring: i,
                        source: std::io::Error::last_os_error(),
                    });
                }
                mapped_ptr = p;
            }

            // SAFETY: `mapped_ptr` is a valid mapping of `memsize` bytes containing
            // a `netmap_if` at `ring_req.nr_offset`.
            let nifp = unsafe { mapped_ptr.add(ring_req.nr_offset as usize) as *mut netmap_if };
            // SAFETY: `nifp` is valid per the above, and ring index `i` is in range.
            let rx_off = unsafe { (*nifp).ring_offset(i as u32) };
            // SAFETY: TX rings are offset by `nr_rx_rings` in the ring table.
            let tx_off = unsafe { (*nifp).ring_offset(rings_cnt as u32 + i as u32) };
            let rx_ptr = unsafe { mapped_ptr.add(rx_off as usize) as *mut netmap_ring };
            let tx_ptr = unsafe { mapped_ptr.add(tx_off as usize) as *mut netmap_ring };

            // SAFETY: `rx_ptr`/`tx_ptr` point into the live mapping just established.
            Ok(unsafe { RingHandle::new(fd, rx_ptr, tx_ptr) })
        };

        match register() {
            Ok(handle) => {
                rings.push(handle);
            }
            Err(e) => {
                // Roll back everything opened so far.
                drop(rings);
                if !mapped_ptr.is_null() {
                    // SAFETY: `mapped_ptr`/`memsize` are the exact mmap we just made.
                    unsafe {
                        libc::munmap(mapped_ptr, memsize);
                    }
                }
                return Err(e);
            }
        }
    }

    Ok(Device {
        name: name.to_string(),
        region: if mapped_ptr.is_null() {
            MemoryRegion::None
        } else {
            MemoryRegion::Mapped {
                ptr: mapped_ptr,
                len: memsize,
            }
        },
        rings: rings.into_boxed_slice(),
        refcount: AtomicUsize::new(1),
        threads_bound: AtomicUsize::new(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;

    fn dummy_fd() -> OwnedFd {
        std::fs::File::open("/dev/null").expect("open /dev/null").into()
    }

    fn fake_rings(n: usize) -> Vec<RingHandle> {
        (0..n)
            .map(|_| {
                let rx = crate::ring::fake::FakeRing::new(8, 256);
                let tx = crate::ring::fake::FakeRing::new(8, 256);
                let ptrs = (rx.ptr, tx.ptr);
                // Leak the fakes: these test devices never unmap, and the
                // pointers only need to stay valid for the duration of the test.
                std::mem::forget(rx);
                std::mem::forget(tx);
                // SAFETY: the leaked FakeRings own memory that outlives the test.
                unsafe { RingHandle::new(dummy_fd(), ptrs.0, ptrs.1) }
            })
            .collect()
    }

    /// Spec §8 scenario 1: acquire twice, release once -> still present with
    /// refcount 1; release again -> removed, second release is `NotRegistered`.
    #[test]
    fn open_close_reference_counting() {
        let registry = DeviceRegistry::new();
        let device = Arc::new(new_test_device("eth0", fake_rings(1)));
        registry.insert_for_test(Arc::clone(&device));

        let acquired_again = registry.acquire("eth0", false, false).unwrap();
        assert!(Arc::ptr_eq(&acquired_again, &device));
        assert_eq!(device.refcount(), 2);

        registry.release(&device).unwrap();
        assert_eq!(device.refcount(), 1);
        assert!(registry.contains("eth0"));

        registry.release(&device).unwrap();
        assert!(!registry.contains("eth0"));

        let err = registry.release(&device).unwrap_err();
        assert!(matches!(err, CaptureError::NotRegistered(name) if name == "eth0"));
    }

    /// Spec §8 scenario 2: 4 rings, 3 threads -> [0,0], [1,1], [2,3].
    #[test]
    fn thread_range_partition_absorbs_remainder_in_last_thread() {
        let device = new_test_device("eth0", fake_rings(4));

        let (slot0, range0) = device.claim_ring_range(3);
        let (slot1, range1) = device.claim_ring_range(3);
        let (slot2, range2) = device.claim_ring_range(3);

        assert_eq!((slot0, range0), (0, 0..=0));
        assert_eq!((slot1, range1), (1, 1..=1));
        assert_eq!((slot2, range2), (2, 2..=3));
    }

    /// Boundary: threads == rings.len() -> each thread owns exactly one ring.
    #[test]
    fn thread_range_one_ring_per_thread_when_counts_match() {
        let device = new_test_device("eth0", fake_rings(3));
        for expected in 0..3 {
            let (slot, range) = device.claim_ring_range(3);
            assert_eq!(slot, expected);
            assert_eq!(range, expected..=expected);
        }
    }
}
