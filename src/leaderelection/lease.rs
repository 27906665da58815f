//! Lease lock backend (coordination.k8s.io/v1)

use super::record::LeaderElectionRecord;
use super::{map_write_error, ResourceLock, VersionedRecord};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;

/// Stores the election record in a Lease object
pub struct LeaseLock {
    api: Api<Lease>,
    namespace: String,
    name: String,
}

impl LeaseLock {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn lease(&self, record: &LeaderElectionRecord, version: Option<&str>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: version.map(str::to_string),
                ..Default::default()
            },
            spec: Some(record.into()),
        }
    }
}

#[async_trait]
impl ResourceLock for LeaseLock {
    async fn get(&self) -> Result<Option<VersionedRecord>> {
        let Some(lease) = self.api.get_opt(&self.name).await? else {
            return Ok(None);
        };

        Ok(Some(VersionedRecord {
            record: lease
                .spec
                .as_ref()
                .map(LeaderElectionRecord::from)
                .unwrap_or_default(),
            version: lease.metadata.resource_version.unwrap_or_default(),
        }))
    }

    async fn create(&self, record: &LeaderElectionRecord) -> Result<()> {
        self.api
            .create(&PostParams::default(), &self.lease(record, None))
            .await
            .map_err(|e| map_write_error(e, &self.describe()))?;
        Ok(())
    }

    async fn update(&self, record: &LeaderElectionRecord, version: &str) -> Result<()> {
        self.api
            .replace(&self.name, &PostParams::default(), &self.lease(record, Some(version)))
            .await
            .map_err(|e| map_write_error(e, &self.describe()))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("leases/{}/{}", self.namespace, self.name)
    }
}
