//! A trivial channel-backed [`PacketPool`]/[`CaptureSink`] pair standing
//! in for the external detection engine named in §6. Production callers
//! supply their own; this exists only so the engine can be exercised
//! end to end from this daemon.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use netmap_capture::packet::{Datalink, PacketAction, PacketDescriptor, PacketPayload};
use netmap_capture::stats::Livedev;
use netmap_capture::{forward, CaptureSink, PacketPool};

fn blank_packet(livedev: Arc<Livedev>) -> PacketDescriptor {
    PacketDescriptor {
        is_pseudo: false,
        livedev,
        datalink: Datalink::Ethernet,
        timestamp: (0, 0),
        ignore_checksum: false,
        action: PacketAction::Pass,
        payload: PacketPayload::Owned(Vec::new()),
        binding: None,
    }
}

/// A fixed-size pool of pre-allocated packet descriptors.
pub struct BoundedPool {
    free: Mutex<VecDeque<PacketDescriptor>>,
    has_capacity: Condvar,
}

impl BoundedPool {
    pub fn new(capacity: usize) -> Self {
        let dummy_livedev = Arc::new(Livedev::new());
        let mut free = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            free.push_back(blank_packet(Arc::clone(&dummy_livedev)));
        }
        BoundedPool {
            free: Mutex::new(free),
            has_capacity: Condvar::new(),
        }
    }
}

impl PacketPool for BoundedPool {
    fn wait_for_capacity(&self) {
        let mut free = self.free.lock().expect("packet pool poisoned");
        while free.is_empty() {
            free = self.has_capacity.wait(free).expect("packet pool poisoned");
        }
    }

    fn try_acquire(&self) -> Option<PacketDescriptor> {
        self.free.lock().expect("packet pool poisoned").pop_front()
    }

    fn release(&self, packet: PacketDescriptor) {
        self.free.lock().expect("packet pool poisoned").push_back(packet);
        self.has_capacity.notify_one();
    }
}

/// Accepts every packet and immediately runs the forwarding release hook
/// on it, matching the synchronous workers-run-mode pipeline the engine
/// requires for zero-copy forwarding to be sound (see `forward`'s module
/// doc comment).
pub struct PassthroughSink {
    pool: Arc<dyn PacketPool>,
}

impl PassthroughSink {
    pub fn new(pool: Arc<dyn PacketPool>) -> Self {
        PassthroughSink { pool }
    }
}

impl CaptureSink for PassthroughSink {
    fn accept(&self, packet: PacketDescriptor) -> Result<(), PacketDescriptor> {
        forward::release(packet, self.pool.as_ref());
        Ok(())
    }
}
