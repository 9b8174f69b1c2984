//! Ring-local types: the TX spinlock and the RX/TX descriptor handles.
//!
//! Grounded on the teacher's `spin::Mutex`-everywhere style for short
//! critical sections (`src/sync/mod.rs`, `src/scheme/ring.rs`): the TX
//! lock here is a hand-rolled test-and-set spinlock rather than
//! `std::sync::Mutex`, since §5 of the spec calls for both a `try_lock`
//! path (capture loop's opportunistic TX sync) and a blocking path (the
//! forwarding release hook), and the critical section is always just an
//! index swap plus a couple of flag writes.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};

use netmap_sys::{netmap_ring, netmap_slot};

/// A minimal test-and-set spinlock.
///
/// Matches the teacher's `unsafe impl Send for RingHandle` /
/// `unsafe impl Sync for RingHandle` posture in `src/scheme/ring.rs`:
/// the protected data lives behind raw pointers, and this lock is the
/// only thing making concurrent access to it sound.
#[derive(Debug, Default)]
pub struct RawSpinlock {
    locked: AtomicBool,
}

pub struct SpinlockGuard<'a>(&'a RawSpinlock);

impl RawSpinlock {
    pub const fn new() -> Self {
        RawSpinlock {
            locked: AtomicBool::new(false),
        }
    }

    /// Blocks until the lock is acquired. Used by the forwarding release
    /// hook, which the spec requires to prefer correctness over latency.
    pub fn lock(&self) -> SpinlockGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinlockGuard(self)
    }

    /// Non-blocking acquire. Used by the capture loop's opportunistic TX
    /// sync, which must never stall draining the RX ring.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinlockGuard(self))
    }
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.0.locked.store(false, Ordering::Release);
    }
}

/// One hardware ring pair: a registered kernel fd plus pointers into the
/// owning device's mapped region.
///
/// `rx`/`tx` are raw pointers rather than references because their
/// pointee is mutated concurrently by the kernel (RX) and by whichever
/// thread holds `tx_lock` (TX); a `&mut netmap_ring` would be unsound to
/// hand out more than once. Validity is tied to the owning `Device`'s
/// `memory_region`, which every `PacketDescriptor` referencing a slot in
/// this ring keeps alive via a strong `Arc` reference (see
/// [`crate::registry::Device`]).
pub struct RingHandle {
    pub fd: OwnedFd,
    rx: *mut netmap_ring,
    tx: *mut netmap_ring,
    pub tx_lock: RawSpinlock,
}

// SAFETY: `rx`/`tx` point into a `mmap`'d region owned by the `Device`
// that created this handle, which outlives every thread holding a
// reference to it. Concurrent RX access is confined to one capture
// thread by ring-range partition (§5); concurrent TX access is
// serialized by `tx_lock`.
unsafe impl Send for RingHandle {}
unsafe impl Sync for RingHandle {}

impl RingHandle {
    /// # Safety
    /// `rx` and `tx` must point at live `netmap_ring`s inside a mapping
    /// that remains valid for as long as this handle is reachable.
    pub unsafe fn new(fd: OwnedFd, rx: *mut netmap_ring, tx: *mut netmap_ring) -> Self {
        RingHandle {
            fd,
            rx,
            tx,
            tx_lock: RawSpinlock::new(),
        }
    }

    /// # Safety
    /// Caller must not retain the reference past the lifetime of the
    /// owning device's mapping, and must respect the single-writer
    /// discipline described on the struct.
    pub unsafe fn rx(&self) -> &netmap_ring {
        &*self.rx
    }

    /// # Safety
    /// See [`RingHandle::rx`]. Sound without a lock because RX rings are
    /// owned exclusively by one capture thread via ring-range partition
    /// (§5): only that thread ever calls this on a given handle.
    pub unsafe fn rx_mut(&self) -> &mut netmap_ring {
        &mut *self.rx
    }

    pub fn rx_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.fd.as_raw_fd()
    }

    /// # Safety
    /// See [`RingHandle::rx`]. Mutation must only happen while holding
    /// `tx_lock` (or during single-threaded init).
    pub unsafe fn tx_mut(&self) -> &mut netmap_ring {
        &mut *self.tx
    }
}

/// Slots available between `cur` and `tail` (`nm_ring_space`).
///
/// On the RX side this is how many received slots are waiting to be
/// consumed; on the TX side it's how many free slots a producer can
/// still fill. netmap defines both with the same wrapping subtraction
/// because a ring always keeps one slot unused, so `cur == tail` is
/// unambiguously "empty"/"full" without needing a separate full/empty flag.
pub fn ring_space(ring: &netmap_ring) -> u32 {
    let diff = ring.tail as i64 - ring.cur as i64;
    if diff >= 0 {
        diff as u32
    } else {
        (diff + ring.num_slots as i64) as u32
    }
}

/// Advances a ring cursor by one slot, wrapping at `num_slots` (`nm_ring_next`).
pub fn ring_next(ring: &netmap_ring, cur: u32) -> u32 {
    let next = cur + 1;
    if next >= ring.num_slots {
        0
    } else {
        next
    }
}

/// # Safety
/// `ring` must point at a live `netmap_ring` with `i < ring.num_slots`.
pub unsafe fn slot_mut(ring: *mut netmap_ring, i: u32) -> &'static mut netmap_slot {
    &mut *(*ring).slot_ptr(i)
}

#[cfg(test)]
pub mod fake {
    //! An in-process stand-in for a mapped netmap ring, used so the
    //! capture-loop and forwarding-path tests can run without a real
    //! netmap device (see SPEC_FULL §8).

    use super::*;
    use std::alloc::{alloc_zeroed, Layout};

    pub struct FakeRing {
        buf: *mut u8,
        layout: Layout,
        pub ptr: *mut netmap_ring,
    }

    impl FakeRing {
        /// Allocates a ring with `num_slots` slots and `num_slots` backing
        /// packet buffers of `buf_size` bytes each, laid out right after
        /// the slot array (`buf_ofs` points there), mirroring how a real
        /// netmap mapping places the buffer pool after the ring headers.
        pub fn new(num_slots: u32, buf_size: u32) -> Self {
            let header_size = std::mem::size_of::<netmap_ring>()
                + num_slots as usize * std::mem::size_of::<netmap_slot>();
            let bufs_size = num_slots as usize * buf_size as usize;
            let size = header_size + bufs_size;
            let layout = Layout::from_size_align(size, std::mem::align_of::<netmap_ring>())
                .expect("fake ring layout");
            // SAFETY: layout is non-zero sized and properly aligned.
            let buf = unsafe { alloc_zeroed(layout) };
            let ptr = buf as *mut netmap_ring;
            // SAFETY: freshly allocated, zeroed, sized memory; we now set the header fields.
            unsafe {
                (*ptr).num_slots = num_slots;
                (*ptr).nr_buf_size = buf_size;
                (*ptr).buf_ofs = header_size as i64;
                (*ptr).head = 0;
                (*ptr).cur = 0;
                (*ptr).tail = 0;
            }
            FakeRing { buf, layout, ptr }
        }

        /// # Safety
        /// Caller must not outlive `self`.
        pub unsafe fn ring(&self) -> &netmap_ring {
            &*self.ptr
        }

        /// # Safety
        /// Caller must not outlive `self`.
        pub unsafe fn ring_mut(&self) -> &mut netmap_ring {
            &mut *self.ptr
        }

        pub fn slot(&self, i: u32) -> &mut netmap_slot {
            // SAFETY: i is caller-checked against num_slots in practice (tests only).
            unsafe { slot_mut(self.ptr, i) }
        }

        /// Mutable view of buffer `idx`'s bytes. `idx` must be `< num_slots`.
        pub fn buffer_mut(&self, idx: u32) -> &mut [u8] {
            // SAFETY: `idx < num_slots` is caller-checked (tests only); `buf_ofs`
            // plus `idx * nr_buf_size` stays within this ring's allocation by construction.
            unsafe {
                let ring = &*self.ptr;
                let base = (self.ptr as *mut u8)
                    .add(ring.buf_ofs as usize + idx as usize * ring.nr_buf_size as usize);
                std::slice::from_raw_parts_mut(base, ring.nr_buf_size as usize)
            }
        }
    }

    impl Drop for FakeRing {
        fn drop(&mut self) {
            // SAFETY: `buf` was allocated with `layout` and not freed elsewhere.
            unsafe { std::alloc::dealloc(self.buf, self.layout) }
        }
    }

    // SAFETY: tests drive these from a single thread, or synchronize
    // externally; the raw pointer is only `Send` to let a `FakeRing` be
    // moved into the `Device`/`RingHandle` it backs.
    unsafe impl Send for FakeRing {}
    unsafe impl Sync for FakeRing {}

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn ring_space_wraps_correctly() {
            let fake = FakeRing::new(8, 2048);
            // SAFETY: single-threaded test, `fake` outlives the borrow.
            let ring = unsafe { fake.ring_mut() };
            ring.cur = 2;
            ring.tail = 5;
            assert_eq!(ring_space(ring), 3);

            ring.cur = 6;
            ring.tail = 1;
            assert_eq!(ring_space(ring), 3); // wraps: (1 - 6) + 8

            ring.cur = 3;
            ring.tail = 3;
            assert_eq!(ring_space(ring), 0);
        }

        #[test]
        fn ring_next_wraps_at_num_slots() {
            let fake = FakeRing::new(4, 2048);
            let ring = unsafe { fake.ring() };
            assert_eq!(ring_next(ring, 0), 1);
            assert_eq!(ring_next(ring, 2), 3);
            assert_eq!(ring_next(ring, 3), 0);
        }
    }
}
