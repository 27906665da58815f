//! ConfigMap lock backend (deprecated)
//!
//! Keeps the election record as JSON in an annotation, leaving the rest of
//! the ConfigMap untouched. Writes are merge patches carrying the observed
//! resourceVersion so concurrent updates are rejected by the API server.

use super::record::LeaderElectionRecord;
use super::{map_write_error, ResourceLock, VersionedRecord};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;

/// Annotation holding the JSON election record
pub const LEADER_ANNOTATION: &str = "control-plane.alpha.kubernetes.io/leader";

pub struct ConfigMapLock {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
}

impl ConfigMapLock {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// Record stored on `config_map`; an unannotated ConfigMap is unheld
fn decode_record(config_map: &ConfigMap, lock: &str) -> Result<LeaderElectionRecord> {
    match config_map
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(LEADER_ANNOTATION))
    {
        Some(raw) => serde_json::from_str(raw).map_err(|e| Error::LeaseRecordMalformed {
            lock: lock.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(LeaderElectionRecord::default()),
    }
}

#[async_trait]
impl ResourceLock for ConfigMapLock {
    async fn get(&self) -> Result<Option<VersionedRecord>> {
        let Some(config_map) = self.api.get_opt(&self.name).await? else {
            return Ok(None);
        };

        Ok(Some(VersionedRecord {
            record: decode_record(&config_map, &self.describe())?,
            version: config_map.metadata.resource_version.unwrap_or_default(),
        }))
    }

    async fn create(&self, record: &LeaderElectionRecord) -> Result<()> {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                annotations: Some(BTreeMap::from([(
                    LEADER_ANNOTATION.to_string(),
                    serde_json::to_string(record)?,
                )])),
                ..Default::default()
            },
            ..Default::default()
        };

        self.api
            .create(&PostParams::default(), &config_map)
            .await
            .map_err(|e| map_write_error(e, &self.describe()))?;
        Ok(())
    }

    async fn update(&self, record: &LeaderElectionRecord, version: &str) -> Result<()> {
        let patch = json!({
            "metadata": {
                "resourceVersion": version,
                "annotations": {
                    LEADER_ANNOTATION: serde_json::to_string(record)?,
                },
            },
        });

        self.api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_write_error(e, &self.describe()))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("configmaps/{}/{}", self.namespace, self.name)
    }
}
