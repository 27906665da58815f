//! Domain Ports - Core trait definitions for the attacher
//!
//! These traits define the boundaries between the sidecar's decision logic
//! and the systems it talks to: the CSI plugin and the unit of work that the
//! leader election gates.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Driver Identity
// =============================================================================

/// The plugin's self-reported name.
///
/// Used as the `spec.attacher` value of VolumeAttachments handled by this
/// sidecar and as part of the leader election lock name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DriverIdentity(String);

impl DriverIdentity {
    /// Wrap a driver name, rejecting empty names
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        if name.is_empty() {
            None
        } else {
            Some(Self(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DriverIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Plugin-service capabilities (CSI `PluginCapability.Service.Type`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginCapability {
    ControllerService,
    VolumeAccessibilityConstraints,
    GroupControllerService,
}

/// Controller-operation capabilities (CSI `ControllerServiceCapability.RPC.Type`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ListVolumes,
    GetCapacity,
    CreateDeleteSnapshot,
    ListSnapshots,
    CloneVolume,
    PublishReadonly,
    ExpandVolume,
    ListVolumesPublishedNodes,
    VolumeCondition,
    GetVolume,
    SingleNodeMultiWriter,
}

/// Capabilities a plugin declared about itself, queried once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    plugin: BTreeSet<PluginCapability>,
    controller: BTreeSet<ControllerCapability>,
}

impl CapabilitySet {
    pub fn new(
        plugin: impl IntoIterator<Item = PluginCapability>,
        controller: impl IntoIterator<Item = ControllerCapability>,
    ) -> Self {
        Self {
            plugin: plugin.into_iter().collect(),
            controller: controller.into_iter().collect(),
        }
    }

    /// Whether the plugin exposes a controller-side service at all
    pub fn has_controller_service(&self) -> bool {
        self.plugin.contains(&PluginCapability::ControllerService)
    }

    /// Whether ControllerPublishVolume / ControllerUnpublishVolume are supported
    pub fn supports_publish_unpublish(&self) -> bool {
        self.controller
            .contains(&ControllerCapability::PublishUnpublishVolume)
    }

    /// Whether the readonly flag of ControllerPublishVolume is honored
    pub fn supports_publish_readonly(&self) -> bool {
        self.controller.contains(&ControllerCapability::PublishReadonly)
    }

    pub fn plugin(&self) -> &BTreeSet<PluginCapability> {
        &self.plugin
    }

    pub fn controller(&self) -> &BTreeSet<ControllerCapability> {
        &self.controller
    }
}

// =============================================================================
// Publish / Unpublish
// =============================================================================

/// How the volume is presented on the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    Block,
    Mount {
        fs_type: String,
        mount_flags: Vec<String>,
    },
}

/// CSI volume access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

/// Capability the volume is published with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCapability {
    pub access_type: AccessType,
    pub access_mode: AccessMode,
}

/// Request to make a volume available on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    /// Driver-side volume handle
    pub volume_id: String,
    /// Driver-side node ID
    pub node_id: String,
    pub capability: VolumeCapability,
    pub read_only: bool,
    /// Contents of the PV's controller publish secret
    pub secrets: BTreeMap<String, String>,
    /// PV `spec.csi.volumeAttributes`
    pub volume_context: BTreeMap<String, String>,
}

/// Request to withdraw a volume from a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpublishRequest {
    pub volume_id: String,
    pub node_id: String,
    pub secrets: BTreeMap<String, String>,
}

// =============================================================================
// Plugin Connection Port
// =============================================================================

/// Port for talking to a CSI plugin.
///
/// Every call is a single request/response; timeouts are applied by the
/// caller.
#[async_trait]
pub trait PluginConnection: Send + Sync {
    /// Ask whether the plugin is ready to serve requests
    async fn probe(&self) -> Result<bool>;

    /// Fetch the plugin's name
    async fn get_identity(&self) -> Result<String>;

    /// Fetch plugin-service capabilities
    async fn get_plugin_capabilities(&self) -> Result<BTreeSet<PluginCapability>>;

    /// Fetch controller-operation capabilities
    async fn get_controller_capabilities(&self) -> Result<BTreeSet<ControllerCapability>>;

    /// Attach a volume to a node; returns the publish context
    async fn publish(&self, request: PublishRequest) -> Result<BTreeMap<String, String>>;

    /// Detach a volume from a node
    async fn unpublish(&self, request: UnpublishRequest) -> Result<()>;

    /// Cancelled once the transport to the plugin drops. `None` for
    /// connections that cannot be lost.
    fn connection_lost(&self) -> Option<CancellationToken> {
        None
    }
}

// =============================================================================
// Runnable Port
// =============================================================================

/// A unit of work that runs until its token is cancelled.
///
/// Implementations must return promptly once `token` fires.
#[async_trait]
pub trait Runnable: Send + Sync {
    async fn run(&self, token: CancellationToken);
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type PluginConnectionRef = Arc<dyn PluginConnection>;
pub type RunnableRef = Arc<dyn Runnable>;
