//! Multi-ring kernel-bypass capture engine with an IPS forwarding path.
//!
//! Four components, in the order a caller touches them: interface
//! control helpers ([`iface`]), the device registry ([`registry`]), the
//! per-worker capture loop ([`capture`]), and the forwarding release
//! hook ([`forward`]). [`config`] and [`pipeline`] are the ambient
//! wiring a binary needs to drive the engine; [`bpf`] and [`stats`]
//! support the capture loop's filter and checksum policy.

pub mod bpf;
pub mod capture;
pub mod config;
pub mod error;
pub mod forward;
pub mod iface;
pub mod packet;
pub mod pipeline;
pub mod registry;
pub mod ring;
pub mod stats;

pub use capture::{CaptureThreadConfig, CaptureThreadState, ThreadCounters};
pub use config::CaptureConfig;
pub use error::{CaptureError, IfaceControlError, Result};
pub use packet::{ChecksumMode, CopyMode, Datalink, PacketAction, PacketDescriptor, PacketPayload};
pub use pipeline::{CaptureSink, PacketPool, ShutdownFlag};
pub use registry::{Device, DeviceRegistry};
