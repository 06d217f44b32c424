//! Background connection health monitoring.
//!
//! A [`HealthMonitor`] runs one tokio task that periodically calls a [`Probe`] and
//! writes the result into the shared [`ConnectionStatus`]. The task never blocks
//! request paths: operations only read the atomic `available` flag.
//!
//! ```ignore
//! let mut monitor = HealthMonitor::new(status.clone(), config.health_interval, config.probe_timeout);
//! monitor.start(probe);
//! // ...
//! monitor.stop().await;
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use mea::rwlock::RwLock;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{error::StorageResult, state::ConnectionStatus};

/// A lightweight connectivity check.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn probe(&self) -> StorageResult<()>;
}

/// Snapshot of the monitor's view of the backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthStatus {
    /// Result of the last probe.
    pub available: bool,
    /// Number of probes run since the monitor started.
    pub checks: u64,
    /// Consecutive failed probes.
    pub consecutive_failures: u32,
    /// Error of the last failed probe, cleared on success.
    pub last_error: Option<String>,
    /// When the last probe finished.
    pub last_check: Option<Instant>,
}

impl HealthStatus {
    fn record_success(&mut self) {
        self.available = true;
        self.checks += 1;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.last_check = Some(Instant::now());
    }

    fn record_failure(&mut self, error: String) {
        self.available = false;
        self.checks += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error);
        self.last_check = Some(Instant::now());
    }
}

/// Supervised background task validating connectivity.
#[derive(Debug)]
pub struct HealthMonitor {
    connection: Arc<ConnectionStatus>,
    status: Arc<RwLock<HealthStatus>>,
    interval: Duration,
    probe_timeout: Duration,
    shutdown_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(connection: Arc<ConnectionStatus>, interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            connection,
            status: Arc::new(RwLock::new(HealthStatus::default())),
            interval,
            probe_timeout,
            shutdown_tx: None,
            task: None,
        }
    }

    /// Spawns the probe loop. The first probe runs immediately.
    ///
    /// Must be called from within a tokio runtime. A running loop is replaced.
    pub fn start<P: Probe>(&mut self, probe: Arc<P>) {
        self.abort();

        let (tx, rx) = mpsc::channel(1);
        self.shutdown_tx = Some(tx);

        let connection = self.connection.clone();
        let status = self.status.clone();
        let interval = self.interval;
        let probe_timeout = self.probe_timeout;

        self.task = Some(tokio::spawn(async move {
            Self::probe_loop(rx, probe, connection, status, interval, probe_timeout).await;
        }));
    }

    /// Signals the loop to stop and waits for it to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!(error = %e, "Health monitor task ended abnormally");
            }
        }
    }

    /// Returns `true` while the probe loop is running.
    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Returns a snapshot of the latest probe results.
    pub async fn status(&self) -> HealthStatus {
        self.status.read().await.clone()
    }

    /// Runs a single probe, bounded by `timeout`, and records the result.
    pub async fn check<P: Probe + ?Sized>(
        probe: &P,
        connection: &ConnectionStatus,
        status: &RwLock<HealthStatus>,
        timeout: Duration,
    ) -> bool {
        let result = match tokio::time::timeout(timeout, probe.probe()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("health probe timed out after {timeout:?}")),
        };

        let available = result.is_ok();
        let previous = connection.record_probe(available);

        {
            let mut status = status.write().await;
            match result {
                Ok(()) => status.record_success(),
                Err(ref error) => status.record_failure(error.clone()),
            }
        }

        match (previous, &result) {
            (Some(false), Ok(())) => info!("Storage connection available"),
            (Some(true), Err(error)) => warn!(error = %error, "Storage connection lost"),
            (_, Err(error)) => debug!(error = %error, "Storage health probe failed"),
            (_, Ok(())) => debug!("Storage health probe succeeded"),
        }

        available
    }

    async fn probe_loop<P: Probe>(
        mut shutdown_rx: mpsc::Receiver<()>,
        probe: Arc<P>,
        connection: Arc<ConnectionStatus>,
        status: Arc<RwLock<HealthStatus>>,
        interval: Duration,
        probe_timeout: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Health monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    Self::check(probe.as_ref(), &connection, &status, probe_timeout).await;
                }
            }
        }
    }

    fn abort(&mut self) {
        self.shutdown_tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::StorageError, state::ConnectionState};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FlagProbe {
        up: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Probe for FlagProbe {
        async fn probe(&self) -> StorageResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StorageError::ConnectionFailure("refused".into()))
            }
        }
    }

    struct StuckProbe;

    #[async_trait]
    impl Probe for StuckProbe {
        async fn probe(&self) -> StorageResult<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn validating() -> Arc<ConnectionStatus> {
        let connection = Arc::new(ConnectionStatus::default());
        connection.set_state(ConnectionState::Validating);
        connection
    }

    #[tokio::test(start_paused = true)]
    async fn polls_and_flips_availability() {
        let connection = validating();
        let probe = Arc::new(FlagProbe::default());
        probe.up.store(true, Ordering::SeqCst);

        let mut monitor = HealthMonitor::new(connection.clone(), Duration::from_secs(10), Duration::from_secs(1));
        monitor.start(probe.clone());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(connection.is_available());
        assert_eq!(connection.state(), ConnectionState::Available);

        probe.up.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!connection.is_available());

        let status = monitor.status().await;
        assert_eq!(status.checks, 2);
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_error.unwrap().contains("refused"));

        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeout_marks_unavailable() {
        let connection = validating();
        let status = RwLock::new(HealthStatus::default());

        let available = HealthMonitor::check(&StuckProbe, &connection, &status, Duration::from_millis(50)).await;

        assert!(!available);
        assert_eq!(connection.state(), ConnectionState::Unavailable);
        assert!(status.read().await.last_error.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_loop() {
        let connection = validating();
        let probe = Arc::new(FlagProbe::default());
        let mut monitor = HealthMonitor::new(connection, Duration::from_secs(1), Duration::from_millis(100));

        monitor.start(probe.clone());
        tokio::time::sleep(Duration::from_millis(1)).await;
        monitor.stop().await;

        let calls = probe.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), calls);
    }
}
