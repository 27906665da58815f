//! Attacher Configuration
//!
//! The immutable settings the process runs with. Built once in `main` from
//! the command line and passed down explicitly.

use crate::error::{Error, Result};
use crate::leaderelection::{LeaderElectionConfig, LockKind};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Defaults
// =============================================================================

pub const DEFAULT_CSI_ADDRESS: &str = "/run/csi/socket";
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_RETRY_INTERVAL_START: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_INTERVAL_MAX: Duration = Duration::from_secs(5 * 60);

/// Workers per queue
pub const WORKER_THREADS: usize = 10;

// =============================================================================
// Leader Election Settings
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaderElectionSettings {
    /// Run redundantly behind a lock
    pub enabled: bool,
    pub kind: LockKind,
    /// Lock namespace; `None` uses the client's default namespace
    pub namespace: Option<String>,
    pub timing: LeaderElectionConfig,
}

// =============================================================================
// Attacher Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct AttacherConfig {
    /// Explicit kubeconfig; in-cluster configuration otherwise
    pub kubeconfig: Option<PathBuf>,
    /// Interval of the periodic full re-queue
    pub resync: Duration,
    /// Plugin socket address
    pub csi_address: String,
    /// Skip the plugin entirely and attach trivially
    pub dummy: bool,
    /// Bound on attach, detach and readiness calls
    pub timeout: Duration,
    pub retry_interval_start: Duration,
    pub retry_interval_max: Duration,
    pub leader_election: LeaderElectionSettings,
    /// Address for `/healthz` and `/metrics`
    pub http_endpoint: Option<String>,
}

impl Default for AttacherConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            resync: DEFAULT_RESYNC,
            csi_address: DEFAULT_CSI_ADDRESS.to_string(),
            dummy: false,
            timeout: DEFAULT_TIMEOUT,
            retry_interval_start: DEFAULT_RETRY_INTERVAL_START,
            retry_interval_max: DEFAULT_RETRY_INTERVAL_MAX,
            leader_election: LeaderElectionSettings::default(),
            http_endpoint: None,
        }
    }
}

impl AttacherConfig {
    /// Reject settings the process cannot start with
    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.kubeconfig {
            if !path.is_file() {
                return Err(Error::Configuration(format!(
                    "kubeconfig {} does not exist",
                    path.display()
                )));
            }
        }
        if self.timeout.is_zero() {
            return Err(Error::Configuration("--timeout must be positive".into()));
        }
        if self.resync.is_zero() {
            return Err(Error::Configuration("--resync must be positive".into()));
        }
        if self.retry_interval_start.is_zero() {
            return Err(Error::Configuration(
                "--retry-interval-start must be positive".into(),
            ));
        }
        if self.retry_interval_start > self.retry_interval_max {
            return Err(Error::Configuration(format!(
                "--retry-interval-start ({:?}) must not exceed --retry-interval-max ({:?})",
                self.retry_interval_start, self.retry_interval_max
            )));
        }
        if !self.dummy && self.csi_address.trim().is_empty() {
            return Err(Error::Configuration("--csi-address must not be empty".into()));
        }
        if self.leader_election.enabled {
            self.leader_election.timing.validate()?;
        }
        Ok(())
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration such as `1h2m3s`, `500ms` or a bare `0`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s)
        .map_err(|e| Error::DurationParse(format!("invalid duration {:?}: {}", input, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1h2m3s").unwrap(), Duration::from_secs(3723));
        assert_eq!(parse_duration("2m30s").unwrap(), Duration::from_secs(150));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert_matches!(parse_duration(""), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("15"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("5x"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("-5s"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("s"), Err(Error::DurationParse(_)));
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AttacherConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.leader_election.enabled);
        assert_eq!(config.leader_election.kind, LockKind::ConfigMaps);
        assert_eq!(config.timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_kubeconfig_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = AttacherConfig {
            kubeconfig: Some(dir.path().join("missing")),
            ..Default::default()
        };
        assert_matches!(missing.validate(), Err(Error::Configuration(_)));

        let file = tempfile::NamedTempFile::new().unwrap();
        let present = AttacherConfig {
            kubeconfig: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(present.validate().is_ok());
    }

    #[test]
    fn test_retry_interval_bounds() {
        let config = AttacherConfig {
            retry_interval_start: Duration::from_secs(600),
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_leader_election_timing_checked_only_when_enabled() {
        let mut config = AttacherConfig::default();
        config.leader_election.timing.renew_deadline = Duration::from_secs(20);
        assert!(config.validate().is_ok());

        config.leader_election.enabled = true;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));
    }
}
