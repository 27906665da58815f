//! Attach Controller
//!
//! Drives VolumeAttachments for one driver to their desired state.
//!
//! ```text
//!   VolumeAttachment ─┐            ┌──► attachment workers ──┐
//!   PersistentVolume ─┼─ informers ┤                         ├─► AttachHandler ─► driver
//!   Node / CSINode  ──┘  (caches)  └──► volume workers ──────┘        │
//!                                                                    ▼
//!                                                   finalizers, status patches
//! ```
//!
//! The controller is a [`Runnable`]: everything it starts is bound to the
//! token it is run with, and `run` returns only after all of it has been
//! joined. It can be run again with a fresh token, reusing its caches.

pub mod client;
pub mod informer;
pub mod queue;
pub mod volume;

pub use client::{ClusterClient, ClusterClientRef, KubeClusterClient};
pub use informer::Informer;
pub use queue::WorkQueue;

use crate::config::{AttacherConfig, WORKER_THREADS};
use crate::domain::ports::{DriverIdentity, Runnable};
use crate::error::{Error, ErrorAction, Result};
use crate::metrics::Metrics;
use crate::strategy::{AttachHandler, AttachRequest, DetachRequest, ReconciliationStrategy};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{CSIPersistentVolumeSource, Node, PersistentVolume};
use k8s_openapi::api::storage::v1::{CSINode, VolumeAttachment};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use volume::{
    attach_error_status, attached_status, attachment_name, csi_source, detach_error_status,
    detached_status, finalizer_name, has_finalizer, is_driver_volume, is_read_only, pv_name,
    volume_capability,
};

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub resync: Duration,
    pub retry_interval_start: Duration,
    pub retry_interval_max: Duration,
    /// Workers per queue
    pub workers: usize,
}

impl From<&AttacherConfig> for ControllerSettings {
    fn from(config: &AttacherConfig) -> Self {
        Self {
            resync: config.resync,
            retry_interval_start: config.retry_interval_start,
            retry_interval_max: config.retry_interval_max,
            workers: WORKER_THREADS,
        }
    }
}

// =============================================================================
// Listers
// =============================================================================

/// Read-only views of the cached cluster state
#[derive(Clone)]
pub struct Listers {
    pub volume_attachments: Store<VolumeAttachment>,
    pub persistent_volumes: Store<PersistentVolume>,
    pub nodes: Store<Node>,
    pub csi_nodes: Store<CSINode>,
}

#[derive(Clone)]
struct Informers {
    volume_attachments: Informer<VolumeAttachment>,
    persistent_volumes: Informer<PersistentVolume>,
    nodes: Informer<Node>,
    csi_nodes: Informer<CSINode>,
}

impl Informers {
    fn new(client: &Client) -> Self {
        Self {
            volume_attachments: Informer::new(Api::all(client.clone())),
            persistent_volumes: Informer::new(Api::all(client.clone())),
            nodes: Informer::new(Api::all(client.clone())),
            csi_nodes: Informer::new(Api::all(client.clone())),
        }
    }

    fn listers(&self) -> Listers {
        Listers {
            volume_attachments: self.volume_attachments.store(),
            persistent_volumes: self.persistent_volumes.store(),
            nodes: self.nodes.store(),
            csi_nodes: self.csi_nodes.store(),
        }
    }

    async fn wait_synced(&self) {
        tokio::join!(
            self.volume_attachments.wait_synced(),
            self.persistent_volumes.wait_synced(),
            self.nodes.wait_synced(),
            self.csi_nodes.wait_synced(),
        );
    }
}

// =============================================================================
// Attach Controller
// =============================================================================

#[derive(Clone)]
pub struct AttachController {
    inner: Arc<Inner>,
}

struct Inner {
    driver: DriverIdentity,
    finalizer: String,
    handler: AttachHandler,
    cluster: ClusterClientRef,
    listers: Listers,
    /// Absent when the caches are fed externally
    informers: Option<Informers>,
    settings: ControllerSettings,
    metrics: Metrics,
}

type KeyQueue = Arc<WorkQueue<String>>;

impl AttachController {
    /// Controller watching and writing through `client`
    pub fn new(
        client: Client,
        driver: DriverIdentity,
        handler: AttachHandler,
        settings: ControllerSettings,
        metrics: Metrics,
    ) -> Self {
        let informers = Informers::new(&client);
        let listers = informers.listers();
        Self::build(
            driver,
            handler,
            Arc::new(KubeClusterClient::new(client)),
            listers,
            Some(informers),
            settings,
            metrics,
        )
    }

    /// Controller over caches that are kept current by someone else
    pub fn with_listers(
        driver: DriverIdentity,
        handler: AttachHandler,
        cluster: ClusterClientRef,
        listers: Listers,
        settings: ControllerSettings,
        metrics: Metrics,
    ) -> Self {
        Self::build(driver, handler, cluster, listers, None, settings, metrics)
    }

    fn build(
        driver: DriverIdentity,
        handler: AttachHandler,
        cluster: ClusterClientRef,
        listers: Listers,
        informers: Option<Informers>,
        settings: ControllerSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                finalizer: finalizer_name(&driver),
                driver,
                handler,
                cluster,
                listers,
                informers,
                settings,
                metrics,
            }),
        }
    }

    pub fn driver(&self) -> &DriverIdentity {
        &self.inner.driver
    }

    pub fn strategy(&self) -> ReconciliationStrategy {
        self.inner.handler.strategy()
    }

    // =========================================================================
    // Event routing
    // =========================================================================

    fn is_ours(&self, va: &VolumeAttachment) -> bool {
        va.spec.attacher == self.inner.driver.as_str()
    }

    fn on_attachment(&self, va: &VolumeAttachment, attachments: &KeyQueue, volumes: &KeyQueue) {
        if !self.is_ours(va) {
            return;
        }
        attachments.add(attachment_name(va));
        // A removed attachment may unblock the volume's finalizer
        if let Ok(pv) = pv_name(va) {
            volumes.add(pv.to_string());
        }
    }

    fn on_volume(&self, pv: &PersistentVolume, volumes: &KeyQueue) {
        if is_driver_volume(pv, &self.inner.driver)
            || has_finalizer(pv.metadata.finalizers.as_ref(), &self.inner.finalizer)
        {
            volumes.add(pv.metadata.name.clone().unwrap_or_default());
        }
    }

    /// Queue everything in the caches
    fn resync(&self, attachments: &KeyQueue, volumes: &KeyQueue) {
        for va in self.inner.listers.volume_attachments.state() {
            self.on_attachment(&va, attachments, volumes);
        }
        for pv in self.inner.listers.persistent_volumes.state() {
            self.on_volume(&pv, volumes);
        }
    }

    // =========================================================================
    // Workers
    // =========================================================================

    async fn process_attachments(self, queue: KeyQueue) {
        while let Some(name) = queue.get().await {
            let result = self.sync_attachment(&name).await;
            handle_result("VolumeAttachment", &queue, &name, result);
            queue.done(&name);
        }
    }

    async fn process_volumes(self, queue: KeyQueue) {
        while let Some(name) = queue.get().await {
            let result = self.sync_volume(&name).await;
            handle_result("PersistentVolume", &queue, &name, result);
            queue.done(&name);
        }
    }

    // =========================================================================
    // VolumeAttachment sync
    // =========================================================================

    async fn sync_attachment(&self, name: &str) -> Result<()> {
        let Some(va) = self
            .inner
            .listers
            .volume_attachments
            .get(&ObjectRef::new(name))
        else {
            debug!("VolumeAttachment {} no longer exists", name);
            return Ok(());
        };
        if !self.is_ours(&va) {
            return Ok(());
        }

        match &self.inner.handler {
            AttachHandler::Trivial => self.sync_trivial(&va).await,
            AttachHandler::PluginBacked(_) => self.sync_plugin_backed(&va).await,
        }
    }

    async fn sync_trivial(&self, va: &VolumeAttachment) -> Result<()> {
        if va.metadata.deletion_timestamp.is_some() || is_attached(va) {
            return Ok(());
        }
        let name = attachment_name(va);
        self.inner
            .cluster
            .patch_attachment_status(&name, attached_status(&BTreeMap::new()))
            .await?;
        info!("Marked VolumeAttachment {} as attached", name);
        Ok(())
    }

    async fn sync_plugin_backed(&self, va: &VolumeAttachment) -> Result<()> {
        let finalized = has_finalizer(va.metadata.finalizers.as_ref(), &self.inner.finalizer);
        if va.metadata.deletion_timestamp.is_some() {
            return if finalized { self.detach(va).await } else { Ok(()) };
        }
        if is_attached(va) && finalized {
            return Ok(());
        }
        self.attach(va).await
    }

    async fn attach(&self, va: &VolumeAttachment) -> Result<()> {
        let name = attachment_name(va);
        let pv = self.volume_for(va)?;
        let source = csi_source(&pv, &self.inner.driver)?;
        let node_id = self.node_id(va)?;

        if !has_finalizer(va.metadata.finalizers.as_ref(), &self.inner.finalizer) {
            self.inner
                .cluster
                .add_attachment_finalizer(va, &self.inner.finalizer, &node_id)
                .await?;
        }
        if !has_finalizer(pv.metadata.finalizers.as_ref(), &self.inner.finalizer) {
            self.inner
                .cluster
                .add_volume_finalizer(&pv, &self.inner.finalizer)
                .await?;
        }

        let request = AttachRequest {
            volume_id: source.volume_handle.clone(),
            node_id,
            capability: volume_capability(&pv, source)?,
            read_only: is_read_only(&pv, source),
            secrets: self.publish_secrets(source).await?,
            volume_context: source.volume_attributes.clone().unwrap_or_default(),
        };

        let started = Instant::now();
        let result = self.inner.handler.attach(request).await;
        self.inner
            .metrics
            .record_operation("attach", result.is_ok(), started.elapsed());

        match result {
            Ok(metadata) => {
                self.inner
                    .cluster
                    .patch_attachment_status(&name, attached_status(&metadata))
                    .await?;
                info!("Attached VolumeAttachment {} to node {}", name, va.spec.node_name);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to attach VolumeAttachment {}: {}", name, e);
                if let Err(patch) = self
                    .inner
                    .cluster
                    .patch_attachment_status(&name, attach_error_status(&e.to_string()))
                    .await
                {
                    warn!("Failed to record attach error on {}: {}", name, patch);
                }
                Err(e)
            }
        }
    }

    async fn detach(&self, va: &VolumeAttachment) -> Result<()> {
        let name = attachment_name(va);
        let pv = self.volume_for(va)?;
        let source = csi_source(&pv, &self.inner.driver)?;

        let request = DetachRequest {
            volume_id: source.volume_handle.clone(),
            node_id: self.node_id(va)?,
            secrets: self.publish_secrets(source).await?,
        };

        let started = Instant::now();
        let result = self.inner.handler.detach(request).await;
        self.inner
            .metrics
            .record_operation("detach", result.is_ok(), started.elapsed());

        match result {
            Ok(()) => {
                // The finalizer patch carries the cached resourceVersion, so it goes first.
                self.inner
                    .cluster
                    .remove_attachment_finalizer(va, &self.inner.finalizer)
                    .await?;
                if let Err(e) = self
                    .inner
                    .cluster
                    .patch_attachment_status(&name, detached_status())
                    .await
                {
                    debug!("Could not mark {} detached, it is likely gone: {}", name, e);
                }
                info!("Detached VolumeAttachment {} from node {}", name, va.spec.node_name);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to detach VolumeAttachment {}: {}", name, e);
                if let Err(patch) = self
                    .inner
                    .cluster
                    .patch_attachment_status(&name, detach_error_status(&e.to_string()))
                    .await
                {
                    warn!("Failed to record detach error on {}: {}", name, patch);
                }
                Err(e)
            }
        }
    }

    fn volume_for(&self, va: &VolumeAttachment) -> Result<Arc<PersistentVolume>> {
        let pv = pv_name(va)?;
        self.inner
            .listers
            .persistent_volumes
            .get(&ObjectRef::new(pv))
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolume".into(),
                name: pv.to_string(),
            })
    }

    fn node_id(&self, va: &VolumeAttachment) -> Result<String> {
        let node = &va.spec.node_name;
        let listers = &self.inner.listers;
        volume::node_id(
            node,
            &self.inner.driver,
            listers.csi_nodes.get(&ObjectRef::new(node)).as_deref(),
            listers.nodes.get(&ObjectRef::new(node)).as_deref(),
            Some(va),
        )
    }

    async fn publish_secrets(&self, source: &CSIPersistentVolumeSource) -> Result<BTreeMap<String, String>> {
        let reference = source
            .controller_publish_secret_ref
            .as_ref()
            .and_then(|r| Some((r.namespace.as_deref()?, r.name.as_deref()?)));
        match reference {
            Some((namespace, name)) => self.inner.cluster.get_secret(namespace, name).await,
            None => Ok(BTreeMap::new()),
        }
    }

    // =========================================================================
    // PersistentVolume sync
    // =========================================================================

    async fn sync_volume(&self, name: &str) -> Result<()> {
        let Some(pv) = self
            .inner
            .listers
            .persistent_volumes
            .get(&ObjectRef::new(name))
        else {
            return Ok(());
        };
        if pv.metadata.deletion_timestamp.is_none()
            || !has_finalizer(pv.metadata.finalizers.as_ref(), &self.inner.finalizer)
        {
            return Ok(());
        }

        let in_use = self
            .inner
            .listers
            .volume_attachments
            .state()
            .iter()
            .any(|va| self.is_ours(va) && pv_name(va).is_ok_and(|pv| pv == name));
        if in_use {
            debug!("PersistentVolume {} is still attached, keeping finalizer", name);
            return Ok(());
        }

        self.inner
            .cluster
            .remove_volume_finalizer(&pv, &self.inner.finalizer)
            .await?;
        info!("Removed finalizer from PersistentVolume {}", name);
        Ok(())
    }
}

fn is_attached(va: &VolumeAttachment) -> bool {
    va.status.as_ref().is_some_and(|s| s.attached)
}

fn handle_result(kind: &str, queue: &KeyQueue, key: &String, result: Result<()>) {
    let Err(e) = result else {
        queue.forget(key);
        return;
    };
    match e.action() {
        ErrorAction::RequeueWithBackoff => {
            warn!("Error syncing {} {}, retrying: {}", kind, key, e);
            queue.add_rate_limited(key.clone());
        }
        ErrorAction::RequeueAfter(delay) => {
            warn!("Error syncing {} {}, retrying in {:?}: {}", kind, key, delay, e);
            queue.add_after(key.clone(), delay);
        }
        ErrorAction::NoRequeue => {
            warn!("Error syncing {} {}, waiting for changes: {}", kind, key, e);
            queue.forget(key);
        }
    }
}

#[async_trait]
impl Runnable for AttachController {
    async fn run(&self, token: CancellationToken) {
        let settings = &self.inner.settings;
        let attachments: KeyQueue =
            WorkQueue::new(settings.retry_interval_start, settings.retry_interval_max);
        let volumes: KeyQueue =
            WorkQueue::new(settings.retry_interval_start, settings.retry_interval_max);
        let mut tasks = JoinSet::new();

        info!(
            "Starting attach controller for {} ({})",
            self.inner.driver,
            self.strategy()
        );

        if let Some(informers) = self.inner.informers.clone() {
            {
                let (this, token) = (self.clone(), token.clone());
                let (attachments, volumes) = (attachments.clone(), volumes.clone());
                let informer = informers.volume_attachments.clone();
                tasks.spawn(async move {
                    informer
                        .run(token, |va| this.on_attachment(va, &attachments, &volumes))
                        .await
                });
            }
            {
                let (this, token, volumes) = (self.clone(), token.clone(), volumes.clone());
                let informer = informers.persistent_volumes.clone();
                tasks.spawn(async move { informer.run(token, |pv| this.on_volume(pv, &volumes)).await });
            }
            {
                let (informer, token) = (informers.nodes.clone(), token.clone());
                tasks.spawn(async move { informer.run(token, |_| {}).await });
            }
            {
                let (informer, token) = (informers.csi_nodes.clone(), token.clone());
                tasks.spawn(async move { informer.run(token, |_| {}).await });
            }

            tokio::select! {
                _ = token.cancelled() => {}
                _ = informers.wait_synced() => debug!("Caches synced"),
            }
        }

        if !token.is_cancelled() {
            self.resync(&attachments, &volumes);

            {
                let (this, token) = (self.clone(), token.clone());
                let (attachments, volumes) = (attachments.clone(), volumes.clone());
                let period = settings.resync;
                tasks.spawn(async move {
                    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = ticker.tick() => {
                                debug!("Resyncing all VolumeAttachments");
                                this.resync(&attachments, &volumes);
                            }
                        }
                    }
                });
            }

            for _ in 0..settings.workers {
                tasks.spawn(self.clone().process_attachments(attachments.clone()));
                tasks.spawn(self.clone().process_volumes(volumes.clone()));
            }
        }

        token.cancelled().await;
        attachments.shut_down();
        volumes.shut_down();

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Controller task failed: {}", e);
            }
        }
        info!("Attach controller stopped");
    }
}
