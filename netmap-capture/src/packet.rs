//! The capture loop's output type and the small enums that drive its
//! per-packet policy (§3, §4.3).

use std::sync::Arc;

use bitflags::bitflags;

use crate::registry::Device;
use crate::stats::Livedev;

bitflags! {
    /// Per-thread capture flags (§3's `flags` field on `CaptureThreadState`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadFlags: u32 {
        /// Packets reference ring slot memory directly instead of being copied.
        const ZERO_COPY = 0b01;
    }
}

/// Forwarding behavior for captured packets (glossary: Copy mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    /// Pure capture, no forwarding.
    #[default]
    None,
    /// Capture and forward every non-pseudo packet.
    Tap,
    /// Capture and forward unless the downstream verdict is `Drop`.
    Ips,
}

/// Checksum validation policy (§4.3 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumMode {
    /// Always mark packets as having an unchecked/ignored checksum.
    Disable,
    /// Ignore checksums once a livedev's invalid-checksum ratio crosses a threshold.
    #[default]
    Auto,
    /// Never touch the ignore-checksum flag.
    Enable,
}

/// Verdict attached to a packet by downstream processing; read by the IPS
/// forwarding path (§4.4 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketAction {
    #[default]
    Pass,
    Drop,
}

/// Where a packet's bytes came from (§3's `PacketDescriptor`).
pub enum PacketPayload {
    /// Copy-mode capture: the packet owns its bytes.
    Owned(Vec<u8>),
    /// Zero-copy capture: bytes still live in the ring's mapped buffer.
    /// Valid only while `binding.device`'s mapping is alive, which the
    /// `Arc` inside `binding` guarantees.
    ZeroCopy { data: *const u8, len: usize },
}

impl PacketPayload {
    pub fn len(&self) -> usize {
        match self {
            PacketPayload::Owned(v) => v.len(),
            PacketPayload::ZeroCopy { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the packet bytes.
    ///
    /// # Safety
    /// For `ZeroCopy`, the caller must ensure the owning device's mapping
    /// is still alive (true for the lifetime of any live `PacketDescriptor`,
    /// which holds a strong device reference through `binding`).
    pub unsafe fn as_slice(&self) -> &[u8] {
        match self {
            PacketPayload::Owned(v) => v.as_slice(),
            PacketPayload::ZeroCopy { data, len } => std::slice::from_raw_parts(*data, *len),
        }
    }
}

/// Identifies the slot a zero-copy packet was captured from, and the
/// forwarding context the release hook needs. Keeping `src_device` as a
/// strong `Arc` is what keeps the mapped region alive for the packet's
/// lifetime (design note §9: "a strong/shared reference to the owning device").
/// The forwarding drop counter lives on `PacketDescriptor::livedev`
/// instead of being duplicated here, since that's the aggregate a
/// zero-copy packet's release always has in hand regardless of which
/// thread runs it.
pub struct ZeroCopyBinding {
    pub src_device: Arc<Device>,
    pub src_ring: usize,
    pub slot_id: u32,
    pub dst_device: Option<Arc<Device>>,
    pub copy_mode: CopyMode,
}

/// Link-layer type the packet was captured on. Only `Ethernet` is
/// produced by this crate; the variant exists so the downstream decode
/// module (§6, out of scope here) has something to switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Datalink {
    #[default]
    Ethernet,
}

/// One captured (or synthesized) packet handed to the downstream pipeline.
pub struct PacketDescriptor {
    pub is_pseudo: bool,
    pub livedev: Arc<Livedev>,
    pub datalink: Datalink,
    pub timestamp: (u32, u32),
    pub ignore_checksum: bool,
    pub action: PacketAction,
    pub payload: PacketPayload,
    pub binding: Option<ZeroCopyBinding>,
}

impl PacketDescriptor {
    pub fn is_zero_copy(&self) -> bool {
        self.binding.is_some()
    }
}

// SAFETY: `PacketPayload::ZeroCopy`'s pointer addresses memory kept alive
// by the `Arc<Device>` carried inside `binding`, exactly like
// `RingHandle` in `ring.rs`. The downstream pipeline (§6) is required to
// move packets across threads (pool <-> sink <-> capture loop).
unsafe impl Send for PacketDescriptor {}
unsafe impl Sync for PacketDescriptor {}
