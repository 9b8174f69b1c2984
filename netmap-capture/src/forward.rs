//! The IPS forwarding path: the packet release hook (§4.4).
//!
//! Called explicitly by whatever finishes processing a zero-copy packet
//! (the sink, in workers run-mode, synchronously — see design note §9 and
//! `CaptureThreadConfig::workers_run_mode`), rather than from a `Drop`
//! impl: a `Drop` can't reach the `PacketPool` it needs to hand the
//! descriptor back to. Grounded line-for-line on `NetmapWritePacket` /
//! `NetmapReleasePacket` in `source-netmap.c`.

use netmap_sys::{netmap_ring, NS_BUF_CHANGED};

use crate::packet::{CopyMode, PacketAction, PacketDescriptor};
use crate::pipeline::PacketPool;
use crate::ring::{ring_next, ring_space, slot_mut};

/// Releases `packet`, forwarding it to its bound destination ring first
/// if forwarding is enabled and the verdict allows it, then returning the
/// descriptor to `pool`.
pub fn release(packet: PacketDescriptor, pool: &dyn PacketPool) {
    try_forward(&packet);
    pool.release(packet);
}

/// Runs §4.4 steps 1-4, returns whether a forward (swap) was attempted.
fn try_forward(packet: &PacketDescriptor) -> bool {
    // Step 1: forwarding disabled (no binding, or copy_mode NONE) or pseudo packet.
    let Some(binding) = &packet.binding else {
        return false;
    };
    if binding.copy_mode == CopyMode::None || packet.is_pseudo {
        return false;
    }
    let Some(dst_device) = &binding.dst_device else {
        return false;
    };

    // Step 2: IPS mode honors the DROP verdict.
    if binding.copy_mode == CopyMode::Ips && packet.action == PacketAction::Drop {
        return false;
    }

    // Step 3: map source ring to destination ring.
    let dst_ring_id = binding.src_ring % dst_device.rings.len();
    let dst_handle = &dst_device.rings[dst_ring_id];
    let src_handle = &binding.src_device.rings[binding.src_ring];

    // Step 4: swap under the destination TX ring's lock.
    let _guard = dst_handle.tx_lock.lock();
    // SAFETY: protected by `tx_lock`, the sole mutator of this ring's head/cur/slots.
    let tx_ring = unsafe { dst_handle.tx_mut() };

    if ring_space(tx_ring) == 0 {
        packet.livedev.drop.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return false;
    }

    let tx_cur = tx_ring.cur;
    // SAFETY: `binding.src_ring`/`binding.slot_id` were captured during this
    // packet's drain and remain valid: `ring.head` has not advanced past
    // `slot_id` yet (the owning drain defers its commit until every slot in
    // the current batch has been handed off or released).
    let rx_slot = unsafe { slot_mut(src_handle_rx_ptr(src_handle), binding.slot_id) };
    // SAFETY: `tx_cur < tx_ring.num_slots`.
    let tx_slot = unsafe { slot_mut(tx_ring as *mut netmap_ring, tx_cur) };

    std::mem::swap(&mut rx_slot.buf_idx, &mut tx_slot.buf_idx);
    tx_slot.len = rx_slot.len;
    rx_slot.flags |= NS_BUF_CHANGED;
    tx_slot.flags |= NS_BUF_CHANGED;

    tx_ring.cur = ring_next(tx_ring, tx_cur);
    tx_ring.head = tx_ring.cur;

    true
}

/// Helper so `try_forward` can get a raw `*mut netmap_ring` for the RX
/// side without widening `RingHandle::rx_mut`'s safety contract (the
/// forwarding release hook is the one documented exception to "only the
/// owning capture thread touches this ring's RX side", since it only
/// ever runs synchronously within that same thread's call stack in
/// workers run-mode).
unsafe fn src_handle_rx_ptr(handle: &crate::ring::RingHandle) -> *mut netmap_ring {
    handle.rx_mut() as *mut netmap_ring
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;
    use std::sync::Arc;

    use crate::packet::{Datalink, PacketPayload, ZeroCopyBinding};
    use crate::pipeline::PacketPool;
    use crate::registry::new_test_device;
    use crate::ring::fake::FakeRing;
    use crate::ring::RingHandle;
    use crate::stats::Livedev;

    struct NoopPool;
    impl PacketPool for NoopPool {
        fn wait_for_capacity(&self) {}
        fn try_acquire(&self) -> Option<PacketDescriptor> {
            None
        }
        fn release(&self, _packet: PacketDescriptor) {}
    }

    fn dummy_fd() -> OwnedFd {
        std::fs::File::open("/dev/null").expect("open /dev/null").into()
    }

    /// Builds a one-ring device backed by fake memory. The returned
    /// `FakeRing`s must outlive every use of the device/its rings.
    fn single_ring_device(name: &str, num_slots: u32) -> (Arc<crate::registry::Device>, FakeRing, FakeRing) {
        let rx = FakeRing::new(num_slots, 256);
        let tx = FakeRing::new(num_slots, 256);
        // SAFETY: both FakeRings outlive the device built from this handle.
        let handle = unsafe { RingHandle::new(dummy_fd(), rx.ptr, tx.ptr) };
        let device = Arc::new(new_test_device(name, vec![handle]));
        (device, rx, tx)
    }

    fn zero_copy_packet(
        src_device: &Arc<crate::registry::Device>,
        dst_device: &Arc<crate::registry::Device>,
        slot_id: u32,
        copy_mode: CopyMode,
        action: PacketAction,
        livedev: &Arc<Livedev>,
    ) -> PacketDescriptor {
        PacketDescriptor {
            is_pseudo: false,
            livedev: Arc::clone(livedev),
            datalink: Datalink::Ethernet,
            timestamp: (0, 0),
            ignore_checksum: false,
            action,
            payload: PacketPayload::ZeroCopy {
                data: std::ptr::null(),
                len: 4,
            },
            binding: Some(ZeroCopyBinding {
                src_device: Arc::clone(src_device),
                src_ring: 0,
                slot_id,
                dst_device: Some(Arc::clone(dst_device)),
                copy_mode,
            }),
        }
    }

    /// Spec §8 scenario 3: zero-copy capture in RX ring 2 (here ring 0 for
    /// test simplicity) slot 5, IPS mode, DROP verdict. After release: RX
    /// slot's `buf_idx` unchanged, TX `cur` unchanged, `drops` unchanged.
    #[test]
    fn ips_drop_does_not_swap_or_count_as_drop() {
        let (src, rx, _src_tx) = single_ring_device("src0", 8);
        let (dst, _dst_rx, dst_tx) = single_ring_device("dst0", 8);
        let slot = rx.slot(5);
        slot.buf_idx = 42;
        slot.len = 100;
        let livedev = Arc::new(Livedev::new());

        let packet = zero_copy_packet(&src, &dst, 5, CopyMode::Ips, PacketAction::Drop, &livedev);
        let tx_cur_before = unsafe { dst_tx.ring() }.cur;

        release(packet, &NoopPool);

        assert_eq!(rx.slot(5).buf_idx, 42);
        assert_eq!(unsafe { dst_tx.ring() }.cur, tx_cur_before);
        assert_eq!(livedev.drop.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    /// Spec §8 scenario 4: same setup, PASS verdict. After release: the TX
    /// slot at the previous `cur` holds the RX buffer index, `head == cur
    /// == next(old_cur)`, both slots carry `BUF_CHANGED`, `len` is copied.
    #[test]
    fn forward_swaps_buffers_and_advances_tx_cursor() {
        let (src, rx, _src_tx) = single_ring_device("src0", 8);
        let (dst, _dst_rx, dst_tx) = single_ring_device("dst0", 8);
        rx.slot(5).buf_idx = 42;
        rx.slot(5).len = 100;
        let tx_free_buf = dst_tx.slot(0).buf_idx; // 0: TX cur starts at slot 0
        let livedev = Arc::new(Livedev::new());

        let packet = zero_copy_packet(&src, &dst, 5, CopyMode::Ips, PacketAction::Pass, &livedev);
        release(packet, &NoopPool);

        assert_eq!(rx.slot(5).buf_idx, tx_free_buf);
        assert_eq!(dst_tx.slot(0).buf_idx, 42);
        assert_eq!(dst_tx.slot(0).len, 100);
        assert_ne!(rx.slot(5).flags & netmap_sys::NS_BUF_CHANGED, 0);
        assert_ne!(dst_tx.slot(0).flags & netmap_sys::NS_BUF_CHANGED, 0);

        let tx_ring = unsafe { dst_tx.ring() };
        assert_eq!(tx_ring.cur, 1);
        assert_eq!(tx_ring.head, 1);
    }

    /// Spec §8 scenario 5: TX ring at capacity -> `drops` += 1, no swap, lock released.
    #[test]
    fn tx_full_counts_as_drop_without_swapping() {
        let (src, rx, _src_tx) = single_ring_device("src0", 8);
        let (dst, _dst_rx, dst_tx) = single_ring_device("dst0", 8);
        rx.slot(5).buf_idx = 42;
        // Fill the TX ring: cur == tail means nm_ring_space == 0.
        unsafe { dst_tx.ring_mut() }.tail = unsafe { dst_tx.ring() }.cur;
        let livedev = Arc::new(Livedev::new());

        let packet = zero_copy_packet(&src, &dst, 5, CopyMode::Ips, PacketAction::Pass, &livedev);
        release(packet, &NoopPool);

        assert_eq!(rx.slot(5).buf_idx, 42);
        assert_eq!(livedev.drop.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
