//! Bootstrap
//!
//! Turns an [`AttacherConfig`] into a running attacher:
//!
//! 1. connect to the driver (or stand in for it in dummy mode)
//! 2. wait for it to be ready and learn its name and capabilities
//! 3. select the attach strategy
//! 4. build the controller
//! 5. run it, directly or behind leader election
//!
//! Steps 1 to 4 are fatal on failure. Nothing touches cluster state
//! before step 5.

use crate::config::AttacherConfig;
use crate::controller::{AttachController, ControllerSettings};
use crate::domain::ports::{CapabilitySet, DriverIdentity, PluginConnectionRef, RunnableRef};
use crate::error::{Error, Result};
use crate::leaderelection::{lock_name, LeaderElection};
use crate::metrics::Metrics;
use crate::plugin::{CapabilityProber, CsiConnection, NullConnection};
use crate::strategy::{select_strategy, AttachHandler, ReconciliationStrategy};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What the driver told us about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub driver: DriverIdentity,
    pub capabilities: CapabilitySet,
    pub strategy: ReconciliationStrategy,
}

/// Build the API client from an explicit kubeconfig or the pod environment
pub async fn build_client(config: &AttacherConfig) -> Result<Client> {
    let kube_config = match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::Configuration(format!("failed to read kubeconfig {}: {}", path.display(), e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Configuration(format!("invalid kubeconfig: {}", e)))?
        }
        None => Config::incluster()
            .map_err(|e| Error::Configuration(format!("failed to load in-cluster config: {}", e)))?,
    };
    Ok(Client::try_from(kube_config)?)
}

/// Connection to the driver, or the null driver in dummy mode
pub async fn connect_plugin(config: &AttacherConfig) -> Result<PluginConnectionRef> {
    if config.dummy {
        info!("Running in dummy mode, no CSI driver is contacted");
        return Ok(Arc::new(NullConnection));
    }
    Ok(Arc::new(CsiConnection::connect(&config.csi_address).await?))
}

/// Wait for the driver, query it and pick the strategy
pub async fn discover(connection: PluginConnectionRef, probe_timeout: Duration) -> Result<Discovery> {
    let prober = CapabilityProber::new(connection);
    prober.wait_until_ready(probe_timeout).await?;
    let probed = prober.probe().await?;

    let strategy = select_strategy(&probed.capabilities);
    info!("CSI driver name: {:?}, attach strategy: {}", probed.driver.as_str(), strategy);

    Ok(Discovery {
        driver: probed.driver,
        capabilities: probed.capabilities,
        strategy,
    })
}

/// Run `runnable` until `shutdown`, behind `election` when one is given.
///
/// Without election the procedure runs exactly once. A leader election
/// error (invalid settings) is returned.
pub async fn run_gated(
    runnable: RunnableRef,
    election: Option<LeaderElection>,
    shutdown: CancellationToken,
    metrics: Option<Metrics>,
) -> Result<()> {
    let Some(election) = election else {
        runnable.run(shutdown).await;
        return Ok(());
    };

    if let Some(metrics) = metrics {
        let mut state = election.subscribe();
        tokio::spawn(async move {
            loop {
                metrics.set_leadership(*state.borrow_and_update());
                if state.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    election.run(runnable, shutdown).await
}

/// Like [`run_gated`], but also stops when `lost` fires.
///
/// A lost driver connection is an error: capabilities were probed for the
/// old driver process, so the attacher has to start over.
pub async fn run_supervised(
    runnable: RunnableRef,
    election: Option<LeaderElection>,
    shutdown: CancellationToken,
    metrics: Option<Metrics>,
    lost: Option<CancellationToken>,
) -> Result<()> {
    let Some(lost) = lost else {
        return run_gated(runnable, election, shutdown, metrics).await;
    };

    let work = shutdown.child_token();
    let watcher = {
        let work = work.clone();
        let lost = lost.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = lost.cancelled() => {
                    error!("Lost connection to CSI driver, stopping");
                    work.cancel();
                }
                _ = work.cancelled() => {}
            }
        })
    };

    let result = run_gated(runnable, election, work.clone(), metrics).await;
    work.cancel();
    let _ = watcher.await;
    result?;

    if lost.is_cancelled() && !shutdown.is_cancelled() {
        return Err(Error::PluginConnection {
            address: "CSI driver".into(),
            reason: "connection lost".into(),
        });
    }
    Ok(())
}

/// Run the attacher until `shutdown` fires
pub async fn run(config: AttacherConfig, metrics: Metrics, shutdown: CancellationToken) -> Result<()> {
    config.validate()?;

    let client = build_client(&config).await?;
    let connection = connect_plugin(&config).await?;
    let discovery = discover(connection.clone(), config.timeout).await?;

    let lost = connection.connection_lost();
    let handler = AttachHandler::new(discovery.strategy, connection, config.timeout);
    let controller = AttachController::new(
        client.clone(),
        discovery.driver.clone(),
        handler,
        ControllerSettings::from(&config),
        metrics.clone(),
    );

    let election = if config.leader_election.enabled {
        let settings = &config.leader_election;
        let mut election = LeaderElection::new(client, lock_name(&discovery.driver), settings.kind)
            .with_config(settings.timing.clone());
        if let Some(namespace) = &settings.namespace {
            election = election.with_namespace(namespace.clone());
        }
        info!("Leader election enabled as {}", election.identity());
        Some(election)
    } else {
        None
    };

    run_supervised(Arc::new(controller), election, shutdown, Some(metrics), lost)
        .await
        .map_err(|e| match e {
            Error::PluginConnection { reason, .. } => Error::PluginConnection {
                address: config.csi_address.clone(),
                reason,
            },
            other => other,
        })?;
    warn!("Attacher stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ControllerCapability, PluginCapability, Runnable};
    use crate::leaderelection::memory::MemoryLock;
    use crate::leaderelection::LeadershipState;
    use crate::plugin::testing::MockConnection;
    use crate::plugin::DUMMY_DRIVER_NAME;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRunnable {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Runnable for CountingRunnable {
        async fn run(&self, token: CancellationToken) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            token.cancelled().await;
        }
    }

    #[tokio::test]
    async fn test_dummy_mode_is_trivial() {
        let config = AttacherConfig {
            dummy: true,
            ..Default::default()
        };
        let connection = connect_plugin(&config).await.unwrap();
        let discovery = discover(connection, config.timeout).await.unwrap();

        assert_eq!(discovery.driver.as_str(), DUMMY_DRIVER_NAME);
        assert_eq!(discovery.strategy, ReconciliationStrategy::Trivial);
    }

    #[tokio::test]
    async fn test_discover_selects_plugin_backed() {
        let connection = MockConnection::new("hostpath.csi.k8s.io")
            .with_plugin([PluginCapability::ControllerService])
            .with_controller([
                ControllerCapability::PublishUnpublishVolume,
                ControllerCapability::PublishReadonly,
            ]);
        let discovery = discover(Arc::new(connection), Duration::from_secs(15))
            .await
            .unwrap();

        assert_eq!(
            discovery.strategy,
            ReconciliationStrategy::PluginBacked { read_only: true }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_capability_timeout_aborts_before_strategy() {
        let connection = MockConnection {
            identity: "slow.csi.k8s.io".into(),
            query_delay: Duration::from_secs(30),
            ..Default::default()
        };
        let result = discover(Arc::new(connection), Duration::from_secs(15)).await;
        assert_matches!(result, Err(Error::CapabilityQueryFailed { .. }));
    }

    #[tokio::test]
    async fn test_connection_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = AttacherConfig {
            csi_address: dir.path().join("missing.sock").display().to_string(),
            ..Default::default()
        };
        assert_matches!(
            connect_plugin(&config).await.map(|_| ()),
            Err(Error::PluginConnection { .. })
        );
    }

    #[tokio::test]
    async fn test_without_election_runs_directly() {
        let runnable = Arc::new(CountingRunnable::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_gated(runnable.clone(), None, shutdown.clone(), None));

        while runnable.runs.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(runnable.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lost_connection_stops_and_fails() {
        let runnable = Arc::new(CountingRunnable::default());
        let shutdown = CancellationToken::new();
        let lost = CancellationToken::new();
        let task = tokio::spawn(run_supervised(
            runnable.clone(),
            None,
            shutdown.clone(),
            None,
            Some(lost.clone()),
        ));

        while runnable.runs.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        lost.cancel();

        assert_matches!(task.await.unwrap(), Err(Error::PluginConnection { .. }));
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_releases_lease() {
        let lock = MemoryLock::new("external-attacher-leader-test");
        let election = LeaderElection::with_lock(Arc::new(lock.clone()), "external-attacher-leader-test")
            .with_identity("replica-0");
        let mut state = election.subscribe();
        let lost = CancellationToken::new();

        let task = tokio::spawn(run_supervised(
            Arc::new(CountingRunnable::default()),
            Some(election),
            CancellationToken::new(),
            None,
            Some(lost.clone()),
        ));
        state.wait_for(|s| *s == LeadershipState::Held).await.unwrap();
        lost.cancel();

        assert_matches!(task.await.unwrap(), Err(Error::PluginConnection { .. }));
        assert_eq!(lock.holder(), None);
    }

    #[tokio::test]
    async fn test_shutdown_with_live_connection_is_clean() {
        let runnable = Arc::new(CountingRunnable::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_supervised(
            runnable.clone(),
            None,
            shutdown.clone(),
            None,
            Some(CancellationToken::new()),
        ));

        while runnable.runs.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_election_runs_once_held() {
        let lock = MemoryLock::new("external-attacher-leader-test");
        let election = LeaderElection::with_lock(Arc::new(lock.clone()), "external-attacher-leader-test")
            .with_identity("replica-0");
        let mut state = election.subscribe();
        let metrics = Metrics::new().unwrap();
        let runnable = Arc::new(CountingRunnable::default());
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_gated(
            runnable.clone(),
            Some(election),
            shutdown.clone(),
            Some(metrics.clone()),
        ));
        state.wait_for(|s| *s == LeadershipState::Held).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(runnable.runs.load(Ordering::SeqCst), 1);
        assert_eq!(lock.holder().as_deref(), Some("replica-0"));
        let (_, body) = metrics.encode().unwrap();
        assert!(String::from_utf8(body).unwrap().contains("csi_attacher_leader 1"));

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(lock.holder(), None);
    }
}
