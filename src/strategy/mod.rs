//! Reconciliation Strategy Selection
//!
//! Maps the capabilities a driver declared to the attach strategy the
//! controller runs with. Selection happens once per process.

pub mod handler;

pub use handler::{AttachHandler, AttachRequest, DetachRequest, PluginAttacher};

use crate::domain::ports::CapabilitySet;
use serde::{Deserialize, Serialize};

/// How VolumeAttachments are driven to their desired state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconciliationStrategy {
    /// Every attachment is satisfied immediately, the driver is never called
    Trivial,
    /// Attach/detach are forwarded to the driver
    PluginBacked {
        /// Driver honors the readonly flag of ControllerPublishVolume
        read_only: bool,
    },
}

impl ReconciliationStrategy {
    pub fn is_trivial(&self) -> bool {
        matches!(self, ReconciliationStrategy::Trivial)
    }
}

impl std::fmt::Display for ReconciliationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconciliationStrategy::Trivial => write!(f, "trivial"),
            ReconciliationStrategy::PluginBacked { read_only } => {
                write!(f, "plugin-backed (readonly publish: {})", read_only)
            }
        }
    }
}

/// Choose the strategy for a driver.
///
/// A driver without a controller service, or whose controller service
/// cannot publish/unpublish, cannot take part in attach/detach; its
/// attachments are still expected to reach `attached`, so they are marked
/// so straight away.
pub fn select_strategy(capabilities: &CapabilitySet) -> ReconciliationStrategy {
    if !capabilities.has_controller_service() {
        return ReconciliationStrategy::Trivial;
    }
    if !capabilities.supports_publish_unpublish() {
        return ReconciliationStrategy::Trivial;
    }
    ReconciliationStrategy::PluginBacked {
        read_only: capabilities.supports_publish_readonly(),
    }
}
