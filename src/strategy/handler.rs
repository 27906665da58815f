//! Attach Handlers
//!
//! The selected strategy in executable form. The controller asks the
//! handler to attach or detach; the handler either answers immediately
//! (trivial) or forwards the call to the driver under a bounded timeout.
//! Errors carry their own retry classification, see [`Error::action`].

use super::ReconciliationStrategy;
use crate::domain::ports::{PluginConnectionRef, PublishRequest, UnpublishRequest, VolumeCapability};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Requests
// =============================================================================

/// Everything needed to attach one volume to one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub volume_id: String,
    pub node_id: String,
    pub capability: VolumeCapability,
    /// Read-only as requested by the PersistentVolume
    pub read_only: bool,
    pub secrets: BTreeMap<String, String>,
    pub volume_context: BTreeMap<String, String>,
}

/// Everything needed to detach one volume from one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachRequest {
    pub volume_id: String,
    pub node_id: String,
    pub secrets: BTreeMap<String, String>,
}

// =============================================================================
// Plugin Attacher
// =============================================================================

/// Forwards attach/detach to the driver
#[derive(Clone)]
pub struct PluginAttacher {
    connection: PluginConnectionRef,
    timeout: Duration,
    supports_read_only: bool,
}

impl PluginAttacher {
    pub fn new(connection: PluginConnectionRef, timeout: Duration, supports_read_only: bool) -> Self {
        Self {
            connection,
            timeout,
            supports_read_only,
        }
    }

    async fn attach(&self, request: AttachRequest) -> Result<BTreeMap<String, String>> {
        let publish = PublishRequest {
            // Drivers without PUBLISH_READONLY must never see readonly=true
            read_only: request.read_only && self.supports_read_only,
            volume_id: request.volume_id,
            node_id: request.node_id,
            capability: request.capability,
            secrets: request.secrets,
            volume_context: request.volume_context,
        };

        debug!(
            "ControllerPublishVolume volume={} node={} readonly={}",
            publish.volume_id, publish.node_id, publish.read_only
        );

        tokio::time::timeout(self.timeout, self.connection.publish(publish))
            .await
            .map_err(|_| Error::PluginTimeout {
                operation: "ControllerPublishVolume".into(),
                timeout: self.timeout,
            })?
    }

    async fn detach(&self, request: DetachRequest) -> Result<()> {
        let unpublish = UnpublishRequest {
            volume_id: request.volume_id,
            node_id: request.node_id,
            secrets: request.secrets,
        };

        debug!(
            "ControllerUnpublishVolume volume={} node={}",
            unpublish.volume_id, unpublish.node_id
        );

        tokio::time::timeout(self.timeout, self.connection.unpublish(unpublish))
            .await
            .map_err(|_| Error::PluginTimeout {
                operation: "ControllerUnpublishVolume".into(),
                timeout: self.timeout,
            })?
    }
}

// =============================================================================
// Attach Handler
// =============================================================================

/// The strategy the controller reconciles with
#[derive(Clone)]
pub enum AttachHandler {
    Trivial,
    PluginBacked(PluginAttacher),
}

impl AttachHandler {
    /// Build the handler for a selected strategy
    pub fn new(
        strategy: ReconciliationStrategy,
        connection: PluginConnectionRef,
        timeout: Duration,
    ) -> Self {
        match strategy {
            ReconciliationStrategy::Trivial => {
                info!("Using trivial attach handler, volumes are marked attached without calling the driver");
                AttachHandler::Trivial
            }
            ReconciliationStrategy::PluginBacked { read_only } => {
                info!("Using CSI attach handler (readonly publish supported: {})", read_only);
                AttachHandler::PluginBacked(PluginAttacher::new(connection, timeout, read_only))
            }
        }
    }

    pub fn strategy(&self) -> ReconciliationStrategy {
        match self {
            AttachHandler::Trivial => ReconciliationStrategy::Trivial,
            AttachHandler::PluginBacked(attacher) => ReconciliationStrategy::PluginBacked {
                read_only: attacher.supports_read_only,
            },
        }
    }

    /// Attach a volume; returns the attachment metadata to record
    pub async fn attach(&self, request: AttachRequest) -> Result<BTreeMap<String, String>> {
        match self {
            AttachHandler::Trivial => Ok(BTreeMap::new()),
            AttachHandler::PluginBacked(attacher) => attacher.attach(request).await,
        }
    }

    /// Detach a volume
    pub async fn detach(&self, request: DetachRequest) -> Result<()> {
        match self {
            AttachHandler::Trivial => Ok(()),
            AttachHandler::PluginBacked(attacher) => attacher.detach(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{AccessMode, AccessType};
    use crate::plugin::testing::MockConnection;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn attach_request(read_only: bool) -> AttachRequest {
        AttachRequest {
            volume_id: "vol-1".into(),
            node_id: "node-1".into(),
            capability: VolumeCapability {
                access_type: AccessType::Block,
                access_mode: AccessMode::SingleNodeWriter,
            },
            read_only,
            secrets: BTreeMap::new(),
            volume_context: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_trivial_never_contacts_driver() {
        let conn = Arc::new(MockConnection::new("hostpath.csi.k8s.io"));
        let handler = AttachHandler::new(
            ReconciliationStrategy::Trivial,
            conn.clone(),
            Duration::from_secs(15),
        );

        let metadata = handler.attach(attach_request(false)).await.unwrap();
        assert!(metadata.is_empty());
        handler
            .detach(DetachRequest {
                volume_id: "vol-1".into(),
                node_id: "node-1".into(),
                secrets: BTreeMap::new(),
            })
            .await
            .unwrap();

        assert_eq!(conn.publish_calls(), 0);
        assert_eq!(handler.strategy(), ReconciliationStrategy::Trivial);
    }

    #[tokio::test]
    async fn test_read_only_requires_driver_support() {
        let conn = Arc::new(MockConnection::new("hostpath.csi.k8s.io"));
        let without = AttachHandler::new(
            ReconciliationStrategy::PluginBacked { read_only: false },
            conn.clone(),
            Duration::from_secs(15),
        );
        let with = AttachHandler::new(
            ReconciliationStrategy::PluginBacked { read_only: true },
            conn.clone(),
            Duration::from_secs(15),
        );

        without.attach(attach_request(true)).await.unwrap();
        let metadata = with.attach(attach_request(true)).await.unwrap();

        let published = conn.published.lock();
        assert_eq!(published.len(), 2);
        assert!(!published[0].read_only);
        assert!(published[1].read_only);
        assert_eq!(metadata.get("devicePath").map(String::as_str), Some("/dev/vol-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout_is_retryable() {
        let conn = MockConnection {
            identity: "slow.csi.k8s.io".into(),
            publish_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let handler = AttachHandler::new(
            ReconciliationStrategy::PluginBacked { read_only: false },
            Arc::new(conn),
            Duration::from_secs(15),
        );

        let err = handler.attach(attach_request(false)).await.unwrap_err();
        assert_matches!(err, Error::PluginTimeout { .. });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_terminal_driver_error_is_not_retryable() {
        let conn = MockConnection {
            identity: "hostpath.csi.k8s.io".into(),
            publish_error: Some(tonic::Code::NotFound),
            ..Default::default()
        };
        let handler = AttachHandler::new(
            ReconciliationStrategy::PluginBacked { read_only: false },
            Arc::new(conn),
            Duration::from_secs(15),
        );

        let err = handler.attach(attach_request(false)).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
