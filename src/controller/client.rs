//! Cluster Writes
//!
//! Every mutation the controller makes, behind a trait so reconciliation
//! can be exercised without an API server. Finalizer edits are merge
//! patches that carry the observed resourceVersion, so a stale cache turns
//! into a conflict instead of a lost update.

use super::volume::ATTACHMENT_NODE_ID_ANNOTATION;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, Secret};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Add `finalizer` to an attachment and remember the node ID on it
    async fn add_attachment_finalizer(
        &self,
        va: &VolumeAttachment,
        finalizer: &str,
        node_id: &str,
    ) -> Result<()>;

    async fn remove_attachment_finalizer(&self, va: &VolumeAttachment, finalizer: &str) -> Result<()>;

    /// Merge `status` into the attachment's status
    async fn patch_attachment_status(&self, name: &str, status: Value) -> Result<()>;

    async fn add_volume_finalizer(&self, pv: &PersistentVolume, finalizer: &str) -> Result<()>;

    async fn remove_volume_finalizer(&self, pv: &PersistentVolume, finalizer: &str) -> Result<()>;

    /// Decoded contents of a secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>>;
}

pub type ClusterClientRef = std::sync::Arc<dyn ClusterClient>;

// =============================================================================
// Kubernetes Implementation
// =============================================================================

pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn attachments(&self) -> Api<VolumeAttachment> {
        Api::all(self.client.clone())
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }
}

fn finalizer_patch(resource_version: Option<String>, finalizers: Vec<String>) -> Value {
    json!({
        "metadata": {
            "resourceVersion": resource_version,
            "finalizers": finalizers,
        }
    })
}

fn with_finalizer(finalizers: &[String], finalizer: &str) -> Vec<String> {
    let mut updated = finalizers.to_vec();
    if !updated.iter().any(|f| f == finalizer) {
        updated.push(finalizer.to_string());
    }
    updated
}

fn without_finalizer(finalizers: &[String], finalizer: &str) -> Vec<String> {
    finalizers.iter().filter(|f| *f != finalizer).cloned().collect()
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn add_attachment_finalizer(
        &self,
        va: &VolumeAttachment,
        finalizer: &str,
        node_id: &str,
    ) -> Result<()> {
        let mut patch = finalizer_patch(
            va.resource_version(),
            with_finalizer(va.finalizers(), finalizer),
        );
        patch["metadata"]["annotations"] =
            json!({ ATTACHMENT_NODE_ID_ANNOTATION: node_id });

        self.attachments()
            .patch(&va.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_attachment_finalizer(&self, va: &VolumeAttachment, finalizer: &str) -> Result<()> {
        let patch = finalizer_patch(
            va.resource_version(),
            without_finalizer(va.finalizers(), finalizer),
        );
        self.attachments()
            .patch(&va.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_attachment_status(&self, name: &str, status: Value) -> Result<()> {
        self.attachments()
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "status": status })),
            )
            .await?;
        Ok(())
    }

    async fn add_volume_finalizer(&self, pv: &PersistentVolume, finalizer: &str) -> Result<()> {
        let patch = finalizer_patch(
            pv.resource_version(),
            with_finalizer(pv.finalizers(), finalizer),
        );
        self.volumes()
            .patch(&pv.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_volume_finalizer(&self, pv: &PersistentVolume, finalizer: &str) -> Result<()> {
        let patch = finalizer_patch(
            pv.resource_version(),
            without_finalizer(pv.finalizers(), finalizer),
        );
        self.volumes()
            .patch(&pv.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "Secret".into(),
                name: format!("{}/{}", namespace, name),
            })?;

        let mut data: BTreeMap<String, String> = secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
            .collect();
        data.extend(secret.string_data.unwrap_or_default());
        Ok(data)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalizer_list_edits() {
        let existing = vec!["kubernetes.io/pv-protection".to_string()];
        let added = with_finalizer(&existing, "external-attacher/csi-dummy");
        assert_eq!(added.len(), 2);
        assert_eq!(with_finalizer(&added, "external-attacher/csi-dummy"), added);
        assert_eq!(without_finalizer(&added, "external-attacher/csi-dummy"), existing);
    }

    #[tokio::test]
    async fn test_recording_client_rejects_stale_finalizer_patch() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
        use testing::RecordingClient;

        let client = RecordingClient::default();
        client.versions.lock().insert("va-1".into(), 1);
        let va = VolumeAttachment {
            metadata: ObjectMeta {
                name: Some("va-1".into()),
                resource_version: Some("1".into()),
                ..Default::default()
            },
            ..Default::default()
        };

        client
            .patch_attachment_status("va-1", json!({ "attached": false }))
            .await
            .unwrap();
        let err = client
            .remove_attachment_finalizer(&va, "external-attacher/csi-dummy")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Kube(kube::Error::Api(ref resp)) if resp.code == 409));
    }

    #[test]
    fn test_finalizer_patch_carries_version() {
        let patch = finalizer_patch(Some("42".into()), vec!["a".into()]);
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["metadata"]["finalizers"][0], "a");
    }
}
