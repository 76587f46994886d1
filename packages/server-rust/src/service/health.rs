//! Instance health probing.
//!
//! [`HealthMonitor::probe`] sends one `GET` to an instance's health path and
//! folds the answer into the registry: success jumps straight to `Healthy`,
//! anything else moves one step down the ladder. Probe failures are state,
//! never errors.
//!
//! [`HealthProbeWorker`] runs the probes on a fixed interval in its own task,
//! apart from request traffic, and accepts on-demand probe requests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use portalfed_core::{ClockSource, HealthState};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::config::HealthConfig;
use super::registry::SpRegistry;
use crate::traits::{AuthProvider, SpTransport};
use crate::transport::SpRequest;

// ---------------------------------------------------------------------------
// HealthMonitor
// ---------------------------------------------------------------------------

pub struct HealthMonitor {
    registry: Arc<SpRegistry>,
    transport: Arc<dyn SpTransport>,
    auth: Arc<dyn AuthProvider>,
    clock: Arc<dyn ClockSource>,
    config: HealthConfig,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        registry: Arc<SpRegistry>,
        transport: Arc<dyn SpTransport>,
        auth: Arc<dyn AuthProvider>,
        clock: Arc<dyn ClockSource>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            auth,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Probes one instance and records the result. `None` if the instance is
    /// not registered.
    pub async fn probe(&self, instance_id: &str) -> Option<HealthState> {
        let spec = self.registry.spec(instance_id)?;
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let started = Instant::now();

        let healthy = match self.auth.headers(instance_id).await {
            Ok(headers) => {
                let request = SpRequest::probe(&spec, headers, timeout);
                match tokio::time::timeout(timeout, self.transport.send(request)).await {
                    Ok(response) => response.is_success(),
                    Err(_elapsed) => false,
                }
            }
            Err(e) => {
                warn!(instance_id, error = %e, "cannot resolve probe credentials");
                false
            }
        };

        #[allow(clippy::cast_possible_truncation)]
        let latency_ms = started.elapsed().as_millis() as u64;
        let (previous, next) = self.registry.record_probe_outcome(
            instance_id,
            healthy,
            self.clock.now(),
            latency_ms,
        )?;

        if next.rank() > previous.rank() && previous != HealthState::Unknown {
            warn!(instance_id, from = %previous, to = %next, "instance health downgraded");
        } else {
            debug!(instance_id, health = %next, latency_ms, "probe complete");
        }
        Some(next)
    }

    /// Probes every registered instance concurrently.
    pub async fn probe_all(&self) -> Vec<(String, HealthState)> {
        let ids = self.registry.ids();
        let results = join_all(ids.iter().map(|id| self.probe(id))).await;
        ids.into_iter()
            .zip(results)
            .filter_map(|(id, state)| state.map(|s| (id, s)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// HealthProbeWorker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTask {
    All,
    Instance(String),
}

/// Background task driving a [`HealthMonitor`].
///
/// Every `probe_interval_ms` it probes all instances. Submitted
/// [`ProbeTask`]s run in between ticks.
pub struct HealthProbeWorker {
    tx: Option<mpsc::Sender<ProbeTask>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HealthProbeWorker {
    /// Spawns the probe loop. The first tick fires one interval after start.
    #[must_use]
    pub fn start(monitor: Arc<HealthMonitor>) -> Self {
        let (tx, mut rx) = mpsc::channel::<ProbeTask>(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let interval = Duration::from_millis(monitor.config().probe_interval_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(ProbeTask::All) => {
                            monitor.probe_all().await;
                        }
                        Some(ProbeTask::Instance(id)) => {
                            monitor.probe(&id).await;
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        let probed = monitor.probe_all().await;
                        debug!(instances = probed.len(), "scheduled probe round complete");
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Requests an out-of-schedule probe.
    ///
    /// # Errors
    ///
    /// Returns an error once the worker has stopped.
    pub async fn submit(&self, task: ProbeTask) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("probe worker channel closed")),
            None => Err(anyhow::anyhow!("probe worker not running")),
        }
    }

    /// Stops the loop and waits for it to exit.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
