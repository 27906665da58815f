//! CSI Plugin Access
//!
//! Provides the plugin side of the sidecar:
//! - gRPC connection to the driver socket
//! - Null connection for dummy mode
//! - Capability prober run once at startup

pub mod grpc;
pub mod null;
pub mod prober;
pub mod proto;

#[cfg(test)]
pub(crate) mod testing;

pub use grpc::CsiConnection;
pub use null::{NullConnection, DUMMY_DRIVER_NAME};
pub use prober::{CapabilityProber, ProbeResult, CSI_TIMEOUT};
