//! Error kinds for device open/close and capture-thread init.
//!
//! Runtime conditions that never abort the worker (`PollError`,
//! `RingHupOrErr`, `TxRingFull`, `PacketPoolExhausted`,
//! `DownstreamFailure`) are logged or counted at their call sites
//! instead: `drain_ring` aborts its current iteration with a bare
//! `break` and bumps the drop counter, and the outer loop retries next
//! iteration, so none of them need a `CaptureError` variant to carry a
//! `Result` out of a function nothing propagates past.

use thiserror::Error;

/// Failures from the interface up/promiscuous-flag helpers in [`crate::iface`].
#[derive(Debug, Error)]
#[error("interface control ioctl failed for '{iface}': {source}")]
pub struct IfaceControlError {
    pub iface: String,
    #[source]
    pub source: std::io::Error,
}

/// Fatal, init-time failures for device open and capture-thread setup.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("memory allocation failed: {0}")]
    MemoryAllocation(String),

    #[error(transparent)]
    IfaceControl(#[from] IfaceControlError),

    #[error("interface '{0}' is not administratively up")]
    InterfaceDown(String),

    #[error("interface '{iface}' has asymmetric rings: {rx} rx / {tx} tx")]
    AsymmetricRings { iface: String, rx: u16, tx: u16 },

    #[error("failed to register ring {ring} of '{iface}': {source}")]
    RingRegistrationFailed {
        iface: String,
        ring: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("thread count {threads} exceeds ring count {rings} on '{iface}'")]
    TooManyThreads {
        iface: String,
        threads: usize,
        rings: usize,
    },

    #[error("device '{0}' is not registered")]
    NotRegistered(String),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
