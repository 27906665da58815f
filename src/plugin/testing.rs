//! Scriptable plugin connection for unit tests

use crate::domain::ports::{
    ControllerCapability, PluginCapability, PluginConnection, PublishRequest, UnpublishRequest,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct MockConnection {
    pub identity: String,
    pub plugin: BTreeSet<PluginCapability>,
    pub controller: BTreeSet<ControllerCapability>,
    pub identity_delay: Duration,
    /// Delay applied to capability queries
    pub query_delay: Duration,
    /// Delay applied to publish and unpublish
    pub publish_delay: Duration,
    pub capability_error: Option<tonic::Code>,
    pub publish_error: Option<tonic::Code>,
    /// Scripted probe answers; `Ok(true)` once exhausted
    pub probes: Mutex<VecDeque<std::result::Result<bool, tonic::Code>>>,
    pub probe_calls: AtomicUsize,
    pub published: Mutex<Vec<PublishRequest>>,
    pub unpublished: Mutex<Vec<UnpublishRequest>>,
}

impl MockConnection {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            ..Default::default()
        }
    }

    pub fn with_plugin(mut self, caps: impl IntoIterator<Item = PluginCapability>) -> Self {
        self.plugin = caps.into_iter().collect();
        self
    }

    pub fn with_controller(mut self, caps: impl IntoIterator<Item = ControllerCapability>) -> Self {
        self.controller = caps.into_iter().collect();
        self
    }

    pub fn publish_calls(&self) -> usize {
        self.published.lock().len() + self.unpublished.lock().len()
    }
}

#[async_trait]
impl PluginConnection for MockConnection {
    async fn probe(&self) -> Result<bool> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        match self.probes.lock().pop_front() {
            None => Ok(true),
            Some(Ok(ready)) => Ok(ready),
            Some(Err(code)) => Err(Error::from_status("Probe", tonic::Status::new(code, "scripted"))),
        }
    }

    async fn get_identity(&self) -> Result<String> {
        tokio::time::sleep(self.identity_delay).await;
        Ok(self.identity.clone())
    }

    async fn get_plugin_capabilities(&self) -> Result<BTreeSet<PluginCapability>> {
        tokio::time::sleep(self.query_delay).await;
        if let Some(code) = self.capability_error {
            return Err(Error::from_status(
                "GetPluginCapabilities",
                tonic::Status::new(code, "scripted"),
            ));
        }
        Ok(self.plugin.clone())
    }

    async fn get_controller_capabilities(&self) -> Result<BTreeSet<ControllerCapability>> {
        tokio::time::sleep(self.query_delay).await;
        if let Some(code) = self.capability_error {
            return Err(Error::from_status(
                "ControllerGetCapabilities",
                tonic::Status::new(code, "scripted"),
            ));
        }
        Ok(self.controller.clone())
    }

    async fn publish(&self, request: PublishRequest) -> Result<BTreeMap<String, String>> {
        tokio::time::sleep(self.publish_delay).await;
        self.published.lock().push(request.clone());
        if let Some(code) = self.publish_error {
            return Err(Error::from_status(
                "ControllerPublishVolume",
                tonic::Status::new(code, "scripted"),
            ));
        }
        Ok(BTreeMap::from([("devicePath".to_string(), format!("/dev/{}", request.volume_id))]))
    }

    async fn unpublish(&self, request: UnpublishRequest) -> Result<()> {
        tokio::time::sleep(self.publish_delay).await;
        self.unpublished.lock().push(request);
        if let Some(code) = self.publish_error {
            return Err(Error::from_status(
                "ControllerUnpublishVolume",
                tonic::Status::new(code, "scripted"),
            ));
        }
        Ok(())
    }
}
