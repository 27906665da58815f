//! CSI Attacher
//!
//! A Kubernetes sidecar that attaches and detaches volumes on behalf of a
//! CSI driver by reconciling VolumeAttachment objects.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               Bootstrap                                 │
//! │                                                                         │
//! │  ┌──────────────────┐   ┌──────────────────┐   ┌─────────────────────┐  │
//! │  │ Capability       │──►│ Strategy         │──►│ Attach Controller   │  │
//! │  │ Prober           │   │ Selector         │   │ (informers, queues) │  │
//! │  └────────┬─────────┘   └──────────────────┘   └──────────┬──────────┘  │
//! │           │                                               │             │
//! │           │              ┌──────────────────┐             │             │
//! │           │              │ Leader Election  │◄────────────┘             │
//! │           │              │ (Lease/ConfigMap)│  gates                    │
//! │           │              └──────────────────┘                           │
//! ├───────────┼─────────────────────────────────────────────────────────────┤
//! │           ▼                                                             │
//! │     CSI driver (gRPC over unix socket)          Kubernetes API          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`plugin`]: CSI transport and capability probing
//! - [`strategy`]: Strategy selection and attach handlers
//! - [`leaderelection`]: Lock-gated execution
//! - [`controller`]: VolumeAttachment reconciliation
//! - [`bootstrap`]: Startup sequence
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod leaderelection;
pub mod metrics;
pub mod plugin;
pub mod strategy;

// Re-export commonly used types
pub use config::{parse_duration, AttacherConfig, LeaderElectionSettings};

pub use controller::{AttachController, ControllerSettings};

pub use domain::ports::{
    AccessMode, AccessType, CapabilitySet, ControllerCapability, DriverIdentity,
    PluginCapability, PluginConnection, Runnable, VolumeCapability,
};

pub use error::{Error, ErrorAction, Result};

pub use leaderelection::{
    LeaderElection, LeaderElectionConfig, LeadershipState, LockKind, ResourceLock,
};

pub use metrics::Metrics;

pub use plugin::{CapabilityProber, CsiConnection, NullConnection, ProbeResult};

pub use strategy::{select_strategy, AttachHandler, ReconciliationStrategy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
