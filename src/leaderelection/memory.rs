//! In-process lock with the same optimistic concurrency as the API server

use super::record::LeaderElectionRecord;
use super::{ResourceLock, VersionedRecord};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;

/// Clones share the same record
#[derive(Clone)]
pub struct MemoryLock {
    name: String,
    slot: Arc<Mutex<Option<(LeaderElectionRecord, u64)>>>,
}

impl MemoryLock {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Current holder, `None` when absent or released
    pub fn holder(&self) -> Option<String> {
        self.slot
            .lock()
            .as_ref()
            .map(|(record, _)| record.holder_identity.clone())
            .filter(|holder| !holder.is_empty())
    }

    /// Overwrite the record as if another candidate had taken the lock
    pub fn force_holder(&self, holder: &str) {
        let mut slot = self.slot.lock();
        let (transitions, version) = slot
            .as_ref()
            .map(|(record, version)| (record.leader_transitions + 1, version + 1))
            .unwrap_or((0, 1));
        let now = Utc::now();
        *slot = Some((
            LeaderElectionRecord {
                holder_identity: holder.to_string(),
                lease_duration_seconds: 15,
                acquire_time: Some(now),
                renew_time: Some(now),
                leader_transitions: transitions,
            },
            version,
        ));
    }
}

#[async_trait]
impl ResourceLock for MemoryLock {
    async fn get(&self) -> Result<Option<VersionedRecord>> {
        Ok(self.slot.lock().as_ref().map(|(record, version)| VersionedRecord {
            record: record.clone(),
            version: version.to_string(),
        }))
    }

    async fn create(&self, record: &LeaderElectionRecord) -> Result<()> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(Error::LeaseConflict {
                lock: self.describe(),
            });
        }
        *slot = Some((record.clone(), 1));
        Ok(())
    }

    async fn update(&self, record: &LeaderElectionRecord, version: &str) -> Result<()> {
        let mut slot = self.slot.lock();
        match slot.as_mut() {
            Some((current, current_version)) if current_version.to_string() == version => {
                *current = record.clone();
                *current_version += 1;
                Ok(())
            }
            Some(_) => Err(Error::LeaseConflict {
                lock: self.describe(),
            }),
            None => Err(Error::ResourceNotFound {
                kind: "Lease".into(),
                name: self.name.clone(),
            }),
        }
    }

    fn describe(&self) -> String {
        format!("memory/{}", self.name)
    }
}
