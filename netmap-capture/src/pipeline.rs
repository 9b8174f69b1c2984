//! The downstream thread-module contract (§6): the two collaborators a
//! capture worker hands packets to and draws backpressure from.
//!
//! Grounded on spec.md §6's "receive module" entry points
//! (`init`/`loop`/`exit_stats`/`deinit`) and the `next_slot` callback: a
//! production caller (the detection engine) implements both traits and
//! owns their registries. `netmap-capd` wires a trivial channel-backed
//! stand-in for each, exactly as the teacher's `KernelScheme` trait is
//! implemented once per scheme and looked up by name rather than baked
//! into the kernel core.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::packet::PacketDescriptor;

/// Backpressure + allocation gate for captured packets.
pub trait PacketPool: Send + Sync {
    /// Blocks until at least one packet is free (main-loop step 2).
    fn wait_for_capacity(&self);

    /// Non-blocking acquire used inside ring drain (ring-drain step 2).
    /// Returns `None` if the pool raced empty since `wait_for_capacity`.
    fn try_acquire(&self) -> Option<PacketDescriptor>;

    /// Returns a packet to the pool (drop path, DownstreamFailure path,
    /// or a normal zero-copy release with no forwarding).
    fn release(&self, packet: PacketDescriptor);
}

/// Receives packets from the capture loop (the `next_slot` equivalent).
pub trait CaptureSink: Send + Sync {
    /// On failure, returns the packet back to the caller so it can be
    /// returned to the pool (ring-drain step 6).
    fn accept(&self, packet: PacketDescriptor) -> Result<(), PacketDescriptor>;
}

/// Process-wide shutdown signal, polled once per main-loop iteration
/// (§5's "Cancellation").
#[derive(Debug, Default)]
pub struct ShutdownFlag(AtomicBool);

impl ShutdownFlag {
    pub const fn new() -> Self {
        ShutdownFlag(AtomicBool::new(false))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}
