//! Cross-thread statistics: the external counters contract (§6) and the
//! `Livedev` aggregate the checksum AUTO policy reads and latches.
//!
//! `ChecksumAutoPolicy`'s ratio check is supplemented from
//! `original_source/src/source-netmap.c`'s `ChecksumAutoModeCheck`, which
//! spec.md leaves as an unspecified "external policy" — see SPEC_FULL §2.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Registers the two capture-loop counters named in spec.md §6.
///
/// Implemented by whatever statistics subsystem the caller owns; this
/// crate never maintains a counter registry itself (out of scope, §1).
pub trait CaptureCounters: Send + Sync {
    fn add_kernel_packets(&self, iface: &str, n: u64);
    fn add_kernel_drops(&self, iface: &str, n: u64);
}

/// A no-op counters sink, useful for tests and for callers that don't
/// care about kernel-level packet/drop counters.
#[derive(Debug, Default)]
pub struct NullCounters;

impl CaptureCounters for NullCounters {
    fn add_kernel_packets(&self, _iface: &str, _n: u64) {}
    fn add_kernel_drops(&self, _iface: &str, _n: u64) {}
}

/// Per-interface aggregate the capture threads on that interface all flush into.
#[derive(Debug, Default)]
pub struct Livedev {
    pub pkts: AtomicU64,
    pub drop: AtomicU64,
    pub invalid_checksums: AtomicU64,
    pub ignore_checksum: AtomicBool,
}

impl Livedev {
    pub fn new() -> Self {
        Livedev::default()
    }
}

/// Sampled-ratio policy for `ChecksumMode::Auto`.
///
/// Mirrors `ChecksumAutoModeCheck`: once at least `min_packets` packets
/// have been seen and the ratio of invalid checksums exceeds `threshold`,
/// the livedev is latched into ignore-checksum mode permanently (until
/// process restart), just like the original's `ntv->livedev->ignore_checksum = 1`.
#[derive(Debug, Clone, Copy)]
pub struct ChecksumAutoPolicy {
    pub min_packets: u64,
    pub threshold: f64,
}

impl Default for ChecksumAutoPolicy {
    fn default() -> Self {
        ChecksumAutoPolicy {
            min_packets: 1000,
            threshold: 0.7,
        }
    }
}

impl ChecksumAutoPolicy {
    /// Returns whether `livedev` should latch into ignore-checksum mode.
    pub fn should_ignore(&self, livedev: &Livedev, pkts_seen: u64) -> bool {
        if livedev.ignore_checksum.load(Ordering::Relaxed) {
            return true;
        }
        if pkts_seen < self.min_packets {
            return false;
        }
        let invalid = livedev.invalid_checksums.load(Ordering::Relaxed) as f64;
        let total = livedev.pkts.load(Ordering::Relaxed).max(1) as f64;
        if invalid / total > self.threshold {
            livedev.ignore_checksum.store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_quiet_below_min_packets() {
        let livedev = Livedev::new();
        livedev.invalid_checksums.store(900, Ordering::Relaxed);
        livedev.pkts.store(900, Ordering::Relaxed);
        let policy = ChecksumAutoPolicy::default();
        assert!(!policy.should_ignore(&livedev, 900));
    }

    #[test]
    fn latches_once_ratio_exceeds_threshold() {
        let livedev = Livedev::new();
        livedev.pkts.store(1000, Ordering::Relaxed);
        livedev.invalid_checksums.store(800, Ordering::Relaxed);
        let policy = ChecksumAutoPolicy::default();
        assert!(policy.should_ignore(&livedev, 1000));
        assert!(livedev.ignore_checksum.load(Ordering::Relaxed));

        // Once latched, stays latched even if the ratio would no longer trip it.
        livedev.invalid_checksums.store(0, Ordering::Relaxed);
        assert!(policy.should_ignore(&livedev, 1000));
    }

    #[test]
    fn below_threshold_does_not_latch() {
        let livedev = Livedev::new();
        livedev.pkts.store(1000, Ordering::Relaxed);
        livedev.invalid_checksums.store(100, Ordering::Relaxed);
        let policy = ChecksumAutoPolicy::default();
        assert!(!policy.should_ignore(&livedev, 1000));
    }
}
