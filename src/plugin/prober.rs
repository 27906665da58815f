//! Capability Prober
//!
//! Waits for the driver to become ready, then asks it for its name and
//! the capabilities that decide which attach strategy the sidecar uses.
//! Timeouts and transport errors are reported as the same failure kind.

use crate::domain::ports::{CapabilitySet, DriverIdentity, PluginConnectionRef};
use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// Timeout of short CSI calls like GetPluginInfo
pub const CSI_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay between readiness probes
pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Probe Result
// =============================================================================

/// Everything learned about the driver at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub driver: DriverIdentity,
    pub capabilities: CapabilitySet,
}

// =============================================================================
// Capability Prober
// =============================================================================

pub struct CapabilityProber {
    connection: PluginConnectionRef,
    timeout: Duration,
}

impl CapabilityProber {
    pub fn new(connection: PluginConnectionRef) -> Self {
        Self {
            connection,
            timeout: CSI_TIMEOUT,
        }
    }

    /// Override the per-query timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Block until the driver reports ready.
    ///
    /// `Unavailable`, `DeadlineExceeded` and local timeouts are retried
    /// forever; any other error is returned.
    pub async fn wait_until_ready(&self, probe_timeout: Duration) -> Result<()> {
        info!("Probing CSI driver for readiness");
        loop {
            match tokio::time::timeout(probe_timeout, self.connection.probe()).await {
                Ok(Ok(true)) => {
                    info!("CSI driver is ready");
                    return Ok(());
                }
                Ok(Ok(false)) => warn!("CSI driver reports not ready"),
                Ok(Err(Error::PluginRpc { code, message, .. }))
                    if matches!(
                        code,
                        tonic::Code::Unavailable | tonic::Code::DeadlineExceeded
                    ) =>
                {
                    warn!("CSI driver probe failed: {:?}: {}", code, message)
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => warn!("CSI driver probe timed out after {:?}", probe_timeout),
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    /// Fetch driver identity, plugin capabilities and controller
    /// capabilities, in that order. All three must succeed.
    pub async fn probe(&self) -> Result<ProbeResult> {
        let name = self
            .bounded("GetPluginInfo", self.connection.get_identity())
            .await
            .map_err(Error::IdentityUnavailable)?;
        let driver = DriverIdentity::new(name)
            .ok_or_else(|| Error::IdentityUnavailable("driver name is empty".into()))?;
        debug!("CSI driver name: {:?}", driver.as_str());

        let plugin = self
            .bounded(
                "GetPluginCapabilities",
                self.connection.get_plugin_capabilities(),
            )
            .await
            .map_err(|reason| Error::CapabilityQueryFailed {
                query: "GetPluginCapabilities".into(),
                reason,
            })?;

        let controller = self
            .bounded(
                "ControllerGetCapabilities",
                self.connection.get_controller_capabilities(),
            )
            .await
            .map_err(|reason| Error::CapabilityQueryFailed {
                query: "ControllerGetCapabilities".into(),
                reason,
            })?;

        let capabilities = CapabilitySet::new(plugin, controller);
        debug!(
            "CSI driver {} capabilities: plugin={:?} controller={:?}",
            driver,
            capabilities.plugin(),
            capabilities.controller()
        );

        Ok(ProbeResult {
            driver,
            capabilities,
        })
    }

    /// Run one query under the short timeout, flattening both failure
    /// modes into a reason string.
    async fn bounded<T>(
        &self,
        query: &str,
        call: impl Future<Output = Result<T>>,
    ) -> std::result::Result<T, String> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("{} timed out after {:?}", query, self.timeout)),
        }
    }
}
