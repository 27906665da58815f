//! Null plugin connection used in dummy mode
//!
//! Reports a fixed driver name and no capabilities, so strategy selection
//! always lands on the trivial handler without touching any socket.

use crate::domain::ports::{
    ControllerCapability, PluginCapability, PluginConnection, PublishRequest, UnpublishRequest,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

/// Driver name reported in dummy mode
pub const DUMMY_DRIVER_NAME: &str = "csi/dummy";

/// Connection that never talks to a driver
#[derive(Debug, Clone, Copy, Default)]
pub struct NullConnection;

#[async_trait]
impl PluginConnection for NullConnection {
    async fn probe(&self) -> Result<bool> {
        Ok(true)
    }

    async fn get_identity(&self) -> Result<String> {
        Ok(DUMMY_DRIVER_NAME.to_string())
    }

    async fn get_plugin_capabilities(&self) -> Result<BTreeSet<PluginCapability>> {
        Ok(BTreeSet::new())
    }

    async fn get_controller_capabilities(&self) -> Result<BTreeSet<ControllerCapability>> {
        Ok(BTreeSet::new())
    }

    async fn publish(&self, _request: PublishRequest) -> Result<BTreeMap<String, String>> {
        Err(Error::PluginUnsupported {
            operation: "ControllerPublishVolume".into(),
        })
    }

    async fn unpublish(&self, _request: UnpublishRequest) -> Result<()> {
        Err(Error::PluginUnsupported {
            operation: "ControllerUnpublishVolume".into(),
        })
    }
}
