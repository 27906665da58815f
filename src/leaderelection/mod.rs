//! Leader Election
//!
//! Runs a procedure under a cluster-wide lock so that only one replica of
//! the attacher reconciles at a time.
//!
//! ```text
//!   Unheld ──► Acquiring ──► Held ──► Released ──┐
//!                  ▲                             │
//!                  └─────────────────────────────┘
//! ```
//!
//! While `Held`, the lock is renewed every retry period. If a renewal does
//! not succeed within the renew deadline the procedure's token is cancelled,
//! the procedure gets a bounded grace period to stop, and acquisition starts
//! over. Lock expiry is judged on the local monotonic clock from the moment
//! the current record was last seen to change, never from the timestamps
//! the holder wrote into it.

pub mod configmap;
pub mod lease;
pub mod record;

#[cfg(test)]
pub(crate) mod memory;

pub use configmap::ConfigMapLock;
pub use lease::LeaseLock;
pub use record::LeaderElectionRecord;

use crate::domain::ports::{DriverIdentity, RunnableRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use kube::Client;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// Prefix of the lock object name, followed by the driver name
pub const LOCK_NAME_PREFIX: &str = "external-attacher-leader-";

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Renew deadline must exceed the retry period by this factor
pub const JITTER_FACTOR: f64 = 1.2;

// =============================================================================
// Lock Kind
// =============================================================================

/// Storage used for the election record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    /// Annotation on a ConfigMap (deprecated)
    #[default]
    ConfigMaps,
    /// coordination.k8s.io Lease
    Leases,
}

impl FromStr for LockKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "configmaps" => Ok(LockKind::ConfigMaps),
            "leases" => Ok(LockKind::Leases),
            other => Err(Error::Configuration(format!(
                "--leader-election-type must be either 'configmaps' or 'leases', got {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKind::ConfigMaps => write!(f, "configmaps"),
            LockKind::Leases => write!(f, "leases"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Timing of the election
#[derive(Debug, Clone, PartialEq)]
pub struct LeaderElectionConfig {
    /// How long a non-renewed lock stays valid for other candidates
    pub lease_duration: Duration,
    /// How long the holder keeps retrying a renewal before giving up
    pub renew_deadline: Duration,
    /// Interval between acquisition and renewal attempts
    pub retry_period: Duration,
    /// Time the procedure gets to stop once leadership is lost
    pub stop_grace_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            stop_grace_period: DEFAULT_STOP_GRACE_PERIOD,
        }
    }
}

impl LeaderElectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry_period.is_zero() {
            return Err(Error::Configuration(
                "leader election retry period must be positive".into(),
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::Configuration(format!(
                "leader election lease duration ({:?}) must be greater than renew deadline ({:?})",
                self.lease_duration, self.renew_deadline
            )));
        }
        if self.renew_deadline.as_secs_f64() <= JITTER_FACTOR * self.retry_period.as_secs_f64() {
            return Err(Error::Configuration(format!(
                "leader election renew deadline ({:?}) must be greater than {} * retry period ({:?})",
                self.renew_deadline, JITTER_FACTOR, self.retry_period
            )));
        }
        if self.lease_duration.as_secs() == 0 || i32::try_from(self.lease_duration.as_secs()).is_err() {
            return Err(Error::Configuration(format!(
                "leader election lease duration {:?} is out of range",
                self.lease_duration
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Leadership State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    Unheld,
    Acquiring,
    Held,
    Released,
}

impl std::fmt::Display for LeadershipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeadershipState::Unheld => write!(f, "unheld"),
            LeadershipState::Acquiring => write!(f, "acquiring"),
            LeadershipState::Held => write!(f, "held"),
            LeadershipState::Released => write!(f, "released"),
        }
    }
}

// =============================================================================
// Resource Lock Port
// =============================================================================

/// Election record plus the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    pub record: LeaderElectionRecord,
    pub version: String,
}

/// Durable storage for the election record.
///
/// `create` must fail if the object exists and `update` must fail with
/// [`Error::LeaseConflict`] if `version` is stale; the exclusivity of the
/// whole election rests on these two checks.
#[async_trait]
pub trait ResourceLock: Send + Sync {
    async fn get(&self) -> Result<Option<VersionedRecord>>;

    async fn create(&self, record: &LeaderElectionRecord) -> Result<()>;

    async fn update(&self, record: &LeaderElectionRecord, version: &str) -> Result<()>;

    /// Human readable location, e.g. `leases/kube-system/name`
    fn describe(&self) -> String;
}

/// Translate API write failures; 409 means somebody else wrote first
pub(crate) fn map_write_error(err: kube::Error, lock: &str) -> Error {
    match err {
        kube::Error::Api(response) if response.code == 409 => Error::LeaseConflict {
            lock: lock.to_string(),
        },
        other => Error::Kube(other),
    }
}

// =============================================================================
// Names
// =============================================================================

/// Lock object name for a driver
pub fn lock_name(driver: &DriverIdentity) -> String {
    sanitize_name(&format!("{}{}", LOCK_NAME_PREFIX, driver))
}

/// Make an arbitrary string usable as an object name: lowercase, every
/// character outside `[a-z0-9-]` becomes `-`, and a trailing `-` gets an
/// `x` appended.
pub fn sanitize_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    if sanitized.ends_with('-') {
        sanitized.push('x');
    }
    sanitized
}

/// Candidate identity: host name plus a process-unique suffix
pub fn default_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}_{}", host, std::process::id())
}

fn validate_namespace(namespace: &str) -> Result<()> {
    if is_dns_label(namespace, 63, false) {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "invalid leader election namespace {:?}",
            namespace
        )))
    }
}

fn validate_lock_name(name: &str) -> Result<()> {
    if is_dns_label(name, 253, true) {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "invalid leader election lock name {:?}",
            name
        )))
    }
}

fn is_dns_label(value: &str, max_len: usize, allow_dots: bool) -> bool {
    let valid_char =
        |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || (allow_dots && c == '.');
    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());

    !value.is_empty()
        && value.len() <= max_len
        && value.chars().all(valid_char)
        && alnum(value.chars().next())
        && alnum(value.chars().last())
}

// =============================================================================
// Leader Election
// =============================================================================

enum LockSource {
    Kube { client: Client, kind: LockKind },
    Custom(Arc<dyn ResourceLock>),
}

/// Gates a procedure behind a cluster-wide lock
pub struct LeaderElection {
    lock_name: String,
    identity: String,
    namespace: Option<String>,
    source: LockSource,
    config: LeaderElectionConfig,
    state: watch::Sender<LeadershipState>,
}

impl LeaderElection {
    /// Election over a Kubernetes object of the given kind
    pub fn new(client: Client, lock_name: impl Into<String>, kind: LockKind) -> Self {
        Self::with_source(lock_name.into(), LockSource::Kube { client, kind })
    }

    /// Election over an already constructed lock
    pub fn with_lock(lock: Arc<dyn ResourceLock>, lock_name: impl Into<String>) -> Self {
        Self::with_source(lock_name.into(), LockSource::Custom(lock))
    }

    fn with_source(lock_name: String, source: LockSource) -> Self {
        let (state, _) = watch::channel(LeadershipState::Unheld);
        Self {
            lock_name,
            identity: default_identity(),
            namespace: None,
            source,
            config: LeaderElectionConfig::default(),
            state,
        }
    }

    /// Namespace of the lock object; defaults to the client's namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn with_config(mut self, config: LeaderElectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state.subscribe()
    }

    /// Acquire the lock and run `runnable` whenever it is held.
    ///
    /// Returns `Ok` once `shutdown` fires or the procedure finishes on its
    /// own; in both cases a held lock is released first. Returns an error
    /// only for invalid configuration. Contention and API failures are
    /// retried forever.
    pub async fn run(self, runnable: RunnableRef, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;
        validate_lock_name(&self.lock_name)?;
        if let Some(namespace) = &self.namespace {
            validate_namespace(namespace)?;
        }

        let lock: Arc<dyn ResourceLock> = match self.source {
            LockSource::Custom(lock) => lock,
            LockSource::Kube { client, kind } => {
                let namespace = self
                    .namespace
                    .clone()
                    .unwrap_or_else(|| client.default_namespace().to_string());
                validate_namespace(&namespace)?;
                match kind {
                    LockKind::Leases => Arc::new(LeaseLock::new(client, &namespace, &self.lock_name)),
                    LockKind::ConfigMaps => {
                        warn!(
                            "The '{}' leader election type is deprecated and will be removed in a future release. Use '--leader-election-type={}' instead.",
                            LockKind::ConfigMaps,
                            LockKind::Leases
                        );
                        Arc::new(ConfigMapLock::new(client, &namespace, &self.lock_name))
                    }
                }
            }
        };

        let mut elector = Elector {
            lock,
            identity: self.identity,
            config: self.config,
            observed: None,
            state: self.state,
        };

        info!(
            "Starting leader election on {} as {}",
            elector.lock.describe(),
            elector.identity
        );

        loop {
            if !elector.acquire(&shutdown).await {
                elector.set_state(LeadershipState::Unheld);
                return Ok(());
            }

            let token = shutdown.child_token();
            // Dropping this future must stop the procedure as well
            let _guard = token.clone().drop_guard();
            let mut work = runnable.run(token.clone());

            let outcome = tokio::select! {
                _ = &mut work => Outcome::Finished,
                _ = elector.hold() => Outcome::Lost,
                _ = shutdown.cancelled() => Outcome::Shutdown,
            };

            token.cancel();
            if outcome != Outcome::Finished
                && tokio::time::timeout(elector.config.stop_grace_period, &mut work)
                    .await
                    .is_err()
            {
                warn!(
                    "Procedure did not stop within {:?} of losing leadership, abandoning it",
                    elector.config.stop_grace_period
                );
            }
            drop(work);

            match outcome {
                Outcome::Lost => {
                    elector.set_state(LeadershipState::Released);
                    warn!("Lost leadership of {}, retrying acquisition", elector.lock.describe());
                }
                Outcome::Shutdown | Outcome::Finished => {
                    elector.release().await;
                    elector.set_state(LeadershipState::Released);
                    return Ok(());
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Finished,
    Lost,
    Shutdown,
}

// =============================================================================
// Elector
// =============================================================================

struct Observed {
    record: LeaderElectionRecord,
    version: String,
    at: Instant,
}

/// Acquire/renew/release state of one candidate
struct Elector {
    lock: Arc<dyn ResourceLock>,
    identity: String,
    config: LeaderElectionConfig,
    /// Last record and version seen, and when that was first seen
    observed: Option<Observed>,
    state: watch::Sender<LeadershipState>,
}

impl Elector {
    fn set_state(&self, state: LeadershipState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Leadership of {}: {} -> {}", self.lock.describe(), previous, state);
        }
    }

    /// Retry until the lock is ours; false if shut down first
    async fn acquire(&mut self, shutdown: &CancellationToken) -> bool {
        self.set_state(LeadershipState::Acquiring);
        info!("Attempting to acquire leader lease {}", self.lock.describe());

        loop {
            if shutdown.is_cancelled() {
                return false;
            }
            if self.try_acquire_or_renew().await {
                self.set_state(LeadershipState::Held);
                info!("Successfully acquired lease {}", self.lock.describe());
                return true;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Keep renewing; returns once a renewal misses its deadline
    async fn hold(&mut self) {
        let retry_period = self.config.retry_period;
        loop {
            tokio::time::sleep(retry_period).await;

            let deadline = Instant::now() + self.config.renew_deadline;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let renewed = tokio::time::timeout(remaining, self.try_acquire_or_renew())
                    .await
                    .unwrap_or(false);
                if renewed {
                    debug!("Renewed lease {}", self.lock.describe());
                    break;
                }
                if Instant::now() + retry_period >= deadline {
                    warn!(
                        "Failed to renew lease {} within {:?}",
                        self.lock.describe(),
                        self.config.renew_deadline
                    );
                    return;
                }
                tokio::time::sleep(retry_period).await;
            }
        }
    }

    /// One acquisition or renewal attempt
    async fn try_acquire_or_renew(&mut self) -> bool {
        let now = Utc::now();
        let mut desired = LeaderElectionRecord {
            holder_identity: self.identity.clone(),
            lease_duration_seconds: self.config.lease_duration.as_secs() as i32,
            acquire_time: Some(now),
            renew_time: Some(now),
            leader_transitions: 0,
        };

        let current = match self.lock.get().await {
            Ok(current) => current,
            Err(e) => {
                warn!("Error retrieving lock {}: {}", self.lock.describe(), e);
                return false;
            }
        };

        let Some(current) = current else {
            return match self.lock.create(&desired).await {
                Ok(()) => {
                    self.observe(desired, String::new());
                    true
                }
                Err(e) => {
                    debug!("Error creating lock {}: {}", self.lock.describe(), e);
                    false
                }
            };
        };

        let changed = self
            .observed
            .as_ref()
            .map_or(true, |o| o.record != current.record || o.version != current.version);
        if changed {
            self.observe(current.record.clone(), current.version.clone());
        }

        let ours = current.record.holder_identity == self.identity;
        if current.record.is_held() && !ours && !self.expired(&current.record) {
            debug!(
                "Lock {} is held by {} and has not yet expired",
                self.lock.describe(),
                current.record.holder_identity
            );
            return false;
        }

        if ours {
            desired.acquire_time = current.record.acquire_time;
            desired.leader_transitions = current.record.leader_transitions;
        } else {
            desired.leader_transitions = current.record.leader_transitions + 1;
        }

        match self.lock.update(&desired, &current.version).await {
            Ok(()) => {
                self.observe(desired, String::new());
                true
            }
            Err(Error::LeaseConflict { .. }) => {
                debug!("Lock {} was updated concurrently", self.lock.describe());
                false
            }
            Err(e) => {
                warn!("Error updating lock {}: {}", self.lock.describe(), e);
                false
            }
        }
    }

    fn expired(&self, record: &LeaderElectionRecord) -> bool {
        let duration = record.lease_duration().unwrap_or(self.config.lease_duration);
        match &self.observed {
            Some(observed) => observed.at.elapsed() >= duration,
            None => true,
        }
    }

    /// Our own writes are stored without a version; the next read resets it
    fn observe(&mut self, record: LeaderElectionRecord, version: String) {
        self.observed = Some(Observed {
            record,
            version,
            at: Instant::now(),
        });
    }

    /// Hand the lock back so a standby can take over without waiting
    async fn release(&mut self) {
        let current = match self.lock.get().await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                warn!("Error retrieving lock {} for release: {}", self.lock.describe(), e);
                return;
            }
        };
        if current.record.holder_identity != self.identity {
            return;
        }

        let now = Utc::now();
        let released = LeaderElectionRecord {
            holder_identity: String::new(),
            lease_duration_seconds: 1,
            acquire_time: Some(now),
            renew_time: Some(now),
            leader_transitions: current.record.leader_transitions,
        };
        match self.lock.update(&released, &current.version).await {
            Ok(()) => {
                info!("Released lease {}", self.lock.describe());
                self.observe(released, String::new());
            }
            Err(e) => warn!("Failed to release lease {}: {}", self.lock.describe(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryLock;
    use super::*;
    use crate::domain::ports::Runnable;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // =========================================================================
    // Helpers
    // =========================================================================

    #[derive(Default)]
    struct Tracker {
        active: AtomicUsize,
        max_active: AtomicUsize,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    struct ActiveGuard(Arc<Tracker>);

    impl Drop for ActiveGuard {
        fn drop(&mut self) {
            self.0.active.fetch_sub(1, Ordering::SeqCst);
            self.0.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TrackingRunnable(Arc<Tracker>);

    #[async_trait]
    impl Runnable for TrackingRunnable {
        async fn run(&self, token: CancellationToken) {
            let now = self.0.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.max_active.fetch_max(now, Ordering::SeqCst);
            self.0.starts.fetch_add(1, Ordering::SeqCst);
            let _guard = ActiveGuard(self.0.clone());
            token.cancelled().await;
        }
    }

    struct OneShot;

    #[async_trait]
    impl Runnable for OneShot {
        async fn run(&self, _token: CancellationToken) {}
    }

    fn elector(lock: &MemoryLock, identity: &str) -> LeaderElection {
        LeaderElection::with_lock(Arc::new(lock.clone()), "external-attacher-leader-test")
            .with_identity(identity)
    }

    async fn wait_for(
        rx: &mut watch::Receiver<LeadershipState>,
        state: LeadershipState,
        within: Duration,
    ) {
        tokio::time::timeout(within, rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("state {} not reached within {:?}", state, within))
            .unwrap();
    }

    // =========================================================================
    // Names and configuration
    // =========================================================================

    #[test]
    fn test_lock_name_is_sanitized() {
        let dummy = DriverIdentity::new("csi/dummy").unwrap();
        assert_eq!(lock_name(&dummy), "external-attacher-leader-csi-dummy");

        let hostpath = DriverIdentity::new("hostpath.csi.k8s.io").unwrap();
        assert_eq!(
            lock_name(&hostpath),
            "external-attacher-leader-hostpath-csi-k8s-io"
        );

        assert_eq!(sanitize_name("Driver_"), "driver-x");
        assert!(validate_lock_name(&lock_name(&dummy)).is_ok());
    }

    #[test]
    fn test_same_driver_same_lock() {
        let a = DriverIdentity::new("ebs.csi.aws.com").unwrap();
        let b = DriverIdentity::new("ebs.csi.aws.com").unwrap();
        let c = DriverIdentity::new("efs.csi.aws.com").unwrap();
        assert_eq!(lock_name(&a), lock_name(&b));
        assert_ne!(lock_name(&a), lock_name(&c));
    }

    #[test]
    fn test_lock_kind_parse() {
        assert_eq!("leases".parse::<LockKind>().unwrap(), LockKind::Leases);
        assert_eq!("configmaps".parse::<LockKind>().unwrap(), LockKind::ConfigMaps);
        assert_matches!("endpoints".parse::<LockKind>(), Err(Error::Configuration(_)));
        assert_eq!(LockKind::default(), LockKind::ConfigMaps);
    }

    #[test]
    fn test_config_validation() {
        assert!(LeaderElectionConfig::default().validate().is_ok());

        let short_lease = LeaderElectionConfig {
            lease_duration: Duration::from_secs(10),
            ..Default::default()
        };
        assert_matches!(short_lease.validate(), Err(Error::Configuration(_)));

        let tight_renew = LeaderElectionConfig {
            renew_deadline: Duration::from_secs(6),
            ..Default::default()
        };
        assert_matches!(tight_renew.validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_namespace_validation() {
        assert!(validate_namespace("kube-system").is_ok());
        assert!(validate_namespace("Kube_System").is_err());
        assert!(validate_namespace("").is_err());
        assert!(validate_namespace("-leading").is_err());
    }

    #[tokio::test]
    async fn test_invalid_namespace_is_fatal() {
        let lock = MemoryLock::new("external-attacher-leader-test");
        let result = elector(&lock, "a")
            .with_namespace("Not A Namespace")
            .run(Arc::new(OneShot), CancellationToken::new())
            .await;
        assert_matches!(result, Err(Error::Configuration(_)));
        assert_eq!(lock.holder(), None);
    }

    // =========================================================================
    // Election behavior
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_racing_candidates_hold_exclusively() {
        let lock = MemoryLock::new("external-attacher-leader-test");
        let tracker = Arc::new(Tracker::default());
        let shutdown = CancellationToken::new();

        let a = elector(&lock, "a");
        let b = elector(&lock, "b");
        let rx_a = a.subscribe();
        let rx_b = b.subscribe();

        let task_a = tokio::spawn(a.run(Arc::new(TrackingRunnable(tracker.clone())), shutdown.clone()));
        let task_b = tokio::spawn(b.run(Arc::new(TrackingRunnable(tracker.clone())), shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(120)).await;

        let held = [*rx_a.borrow(), *rx_b.borrow()]
            .iter()
            .filter(|s| **s == LeadershipState::Held)
            .count();
        assert_eq!(held, 1);
        assert_eq!(tracker.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.starts.load(Ordering::SeqCst), 1);

        let loser = if *rx_a.borrow() == LeadershipState::Held { &rx_b } else { &rx_a };
        assert_eq!(*loser.borrow(), LeadershipState::Acquiring);

        shutdown.cancel();
        task_a.await.unwrap().unwrap();
        task_b.await.unwrap().unwrap();
        assert_eq!(tracker.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lease_cancels_and_reacquires() {
        let lock = MemoryLock::new("external-attacher-leader-test");
        let tracker = Arc::new(Tracker::default());
        let shutdown = CancellationToken::new();

        let a = elector(&lock, "a");
        let mut rx = a.subscribe();
        let task = tokio::spawn(a.run(Arc::new(TrackingRunnable(tracker.clone())), shutdown.clone()));

        wait_for(&mut rx, LeadershipState::Held, Duration::from_secs(1)).await;
        assert_eq!(tracker.starts.load(Ordering::SeqCst), 1);

        // Someone else grabs the record behind our back
        lock.force_holder("intruder");

        tokio::time::timeout(
            DEFAULT_RETRY_PERIOD + DEFAULT_RENEW_DEADLINE + Duration::from_secs(1),
            rx.wait_for(|s| *s != LeadershipState::Held),
        )
        .await
        .expect("leadership loss not detected")
        .unwrap();
        assert_eq!(tracker.stops.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.active.load(Ordering::SeqCst), 0);

        // The intruder never renews, so the lock expires and is re-acquired
        wait_for(&mut rx, LeadershipState::Held, Duration::from_secs(30)).await;
        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(lock.holder().as_deref(), Some("a"));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_standby_takes_over_after_holder_dies() {
        let lock = MemoryLock::new("external-attacher-leader-test");
        let tracker = Arc::new(Tracker::default());
        let shutdown = CancellationToken::new();

        let a = elector(&lock, "a");
        let mut rx_a = a.subscribe();
        let task_a = tokio::spawn(a.run(Arc::new(TrackingRunnable(tracker.clone())), shutdown.clone()));
        wait_for(&mut rx_a, LeadershipState::Held, Duration::from_secs(1)).await;

        let b = elector(&lock, "b");
        let mut rx_b = b.subscribe();
        let task_b = tokio::spawn(b.run(Arc::new(TrackingRunnable(tracker.clone())), shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(*rx_b.borrow(), LeadershipState::Acquiring);

        // Kill the holder without letting it release
        task_a.abort();
        let _ = task_a.await;

        wait_for(
            &mut rx_b,
            LeadershipState::Held,
            Duration::from_secs(30),
        )
        .await;
        assert_eq!(lock.holder().as_deref(), Some("b"));
        assert_eq!(tracker.max_active.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        task_b.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_shutdown_releases_lock() {
        let lock = MemoryLock::new("external-attacher-leader-test");
        let tracker = Arc::new(Tracker::default());
        let shutdown_a = CancellationToken::new();
        let shutdown_b = CancellationToken::new();

        let a = elector(&lock, "a");
        let mut rx_a = a.subscribe();
        let task_a = tokio::spawn(a.run(Arc::new(TrackingRunnable(tracker.clone())), shutdown_a.clone()));
        wait_for(&mut rx_a, LeadershipState::Held, Duration::from_secs(1)).await;

        let b = elector(&lock, "b");
        let mut rx_b = b.subscribe();
        let task_b = tokio::spawn(b.run(Arc::new(TrackingRunnable(tracker.clone())), shutdown_b.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;

        shutdown_a.cancel();
        task_a.await.unwrap().unwrap();
        assert_eq!(lock.holder(), None);

        wait_for(&mut rx_b, LeadershipState::Held, DEFAULT_RETRY_PERIOD + Duration::from_secs(1)).await;

        shutdown_b.cancel();
        task_b.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_procedure_releases_and_returns() {
        let lock = MemoryLock::new("external-attacher-leader-test");
        let le = elector(&lock, "a");
        let rx = le.subscribe();

        le.run(Arc::new(OneShot), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*rx.borrow(), LeadershipState::Released);
        assert_eq!(lock.holder(), None);
    }

    #[tokio::test]
    async fn test_shutdown_before_acquisition() {
        let lock = MemoryLock::new("external-attacher-leader-test");
        lock.force_holder("someone-else");
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let le = elector(&lock, "a");
        let rx = le.subscribe();
        le.run(Arc::new(OneShot), shutdown).await.unwrap();

        assert_eq!(*rx.borrow(), LeadershipState::Unheld);
        assert_eq!(lock.holder().as_deref(), Some("someone-else"));
    }
}
