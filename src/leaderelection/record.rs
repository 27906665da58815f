//! Leader Election Record
//!
//! The backend-neutral content of a lock: who holds it, since when, and
//! for how long. Serialized as JSON in the legacy ConfigMap annotation and
//! mapped field-by-field onto a coordination.k8s.io Lease spec.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::LeaseSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionRecord {
    /// Empty when nobody holds the lock
    #[serde(default)]
    pub holder_identity: String,
    #[serde(default)]
    pub lease_duration_seconds: i32,
    #[serde(default)]
    pub acquire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub renew_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub leader_transitions: i32,
}

impl LeaderElectionRecord {
    pub fn is_held(&self) -> bool {
        !self.holder_identity.is_empty()
    }

    /// Lease duration recorded by the holder, if any
    pub fn lease_duration(&self) -> Option<Duration> {
        u64::try_from(self.lease_duration_seconds)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl From<&LeaseSpec> for LeaderElectionRecord {
    fn from(spec: &LeaseSpec) -> Self {
        Self {
            holder_identity: spec.holder_identity.clone().unwrap_or_default(),
            lease_duration_seconds: spec.lease_duration_seconds.unwrap_or_default(),
            acquire_time: spec.acquire_time.as_ref().map(|t| t.0),
            renew_time: spec.renew_time.as_ref().map(|t| t.0),
            leader_transitions: spec.lease_transitions.unwrap_or_default(),
        }
    }
}

impl From<&LeaderElectionRecord> for LeaseSpec {
    fn from(record: &LeaderElectionRecord) -> Self {
        LeaseSpec {
            holder_identity: Some(record.holder_identity.clone()),
            lease_duration_seconds: Some(record.lease_duration_seconds),
            acquire_time: record.acquire_time.map(MicroTime),
            renew_time: record.renew_time.map(MicroTime),
            lease_transitions: Some(record.leader_transitions),
            ..Default::default()
        }
    }
}
