//! Health Checks
//!
//! Periodic mount health supervision with in-place recovery of read-only
//! mounts, plus the liveness/readiness state served to Kubernetes probes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::Mounter;
use crate::metrics;

/// Default health check period
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

// =============================================================================
// Health Status
// =============================================================================

/// Health of the exported mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeHealth {
    /// Mount is reachable and writable
    Healthy,
    /// Mount is reachable but read-only; recoverable by remount
    ReadOnly,
    /// Mount is unreachable
    Unhealthy,
}

impl VolumeHealth {
    fn label(&self) -> &'static str {
        match self {
            VolumeHealth::Healthy => "healthy",
            VolumeHealth::ReadOnly => "read_only",
            VolumeHealth::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for VolumeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeHealth::Healthy => write!(f, "Healthy"),
            VolumeHealth::ReadOnly => write!(f, "ReadOnly"),
            VolumeHealth::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: VolumeHealth,
    pub message: Option<String>,
    /// Duration of check
    pub duration_ms: u64,
}

impl HealthCheckResult {
    pub fn healthy() -> Self {
        Self {
            status: VolumeHealth::Healthy,
            message: None,
            duration_ms: 0,
        }
    }

    pub fn read_only(message: impl Into<String>) -> Self {
        Self {
            status: VolumeHealth::ReadOnly,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: VolumeHealth::Unhealthy,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Body of the `/healthz` endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub live: bool,
    pub ready: bool,
    pub last_check: Option<HealthCheckResult>,
    pub version: String,
    pub uptime_seconds: u64,
}

// =============================================================================
// Probe State
// =============================================================================

/// Liveness/readiness flags shared between the manager, the monitor and the
/// HTTP probes.
pub struct HealthCheck {
    start_time: Instant,
    live: AtomicBool,
    ready: AtomicBool,
    last_check: RwLock<Option<HealthCheckResult>>,
}

impl HealthCheck {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            last_check: RwLock::new(None),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn last_check(&self) -> Option<HealthCheckResult> {
        self.last_check.read().clone()
    }

    fn record(&self, result: HealthCheckResult) {
        *self.last_check.write() = Some(result);
    }

    pub fn response(&self) -> HealthResponse {
        HealthResponse {
            live: self.is_live(),
            ready: self.is_ready(),
            last_check: self.last_check(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.uptime().as_secs(),
        }
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheck")
            .field("live", &self.is_live())
            .field("ready", &self.is_ready())
            .finish()
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Supervises the exported mount and cancels `shutdown` when it cannot serve.
pub struct HealthMonitor {
    mount_path: PathBuf,
    mounter: Arc<dyn Mounter>,
    period: Duration,
    state: Arc<HealthCheck>,
}

impl HealthMonitor {
    pub fn new(
        mount_path: impl Into<PathBuf>,
        mounter: Arc<dyn Mounter>,
        period: Duration,
        state: Arc<HealthCheck>,
    ) -> Self {
        Self {
            mount_path: mount_path.into(),
            mounter,
            period,
            state,
        }
    }

    /// Classify the mount once.
    pub async fn check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let result = if let Err(e) = self.mounter.probe(&self.mount_path).await {
            HealthCheckResult::unhealthy(format!(
                "volume mounted at {} is unhealthy: {}",
                self.mount_path.display(),
                e
            ))
        } else {
            match self.mounter.is_read_only(&self.mount_path).await {
                Ok(true) => HealthCheckResult::read_only(format!(
                    "volume mounted at {} is read only",
                    self.mount_path.display()
                )),
                Ok(false) => HealthCheckResult::healthy(),
                Err(e) => {
                    debug!("Failed to list mount points: {}", e);
                    HealthCheckResult::healthy()
                }
            }
        };

        metrics::HEALTH_CHECKS
            .with_label_values(&[result.status.label()])
            .inc();
        let result = result.with_duration(start.elapsed());
        self.state.record(result.clone());
        result
    }

    /// Check one tick; returns false when the instance must shut down.
    async fn check_and_recover(&self) -> bool {
        let result = self.check().await;
        match result.status {
            VolumeHealth::Healthy => true,
            VolumeHealth::ReadOnly => {
                warn!(
                    reason = result.message.as_deref().unwrap_or_default(),
                    "Recovering read only volume"
                );
                let remount = self.mounter.remount_read_write(&self.mount_path).await;
                metrics::REMOUNT_ATTEMPTS
                    .with_label_values(&[metrics::outcome(&remount)])
                    .inc();
                match remount {
                    Ok(()) => {
                        info!("Remounted volume read-write");
                        true
                    }
                    Err(e) => {
                        error!("Volume is unable to recover by remounting, terminating: {}", e);
                        false
                    }
                }
            }
            VolumeHealth::Unhealthy => {
                error!(
                    reason = result.message.as_deref().unwrap_or_default(),
                    "Terminating"
                );
                false
            }
        }
    }

    /// Run until `shutdown` is cancelled. Cancels it on unrecoverable health.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(mount_path = %self.mount_path.display(), "Starting health check for volume");
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Health check is ending");
                    return;
                }
                _ = ticker.tick() => {
                    // Dropping an in-flight check kills its host command.
                    let serving = tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("Health check is ending");
                            return;
                        }
                        serving = self.check_and_recover() => serving,
                    };
                    if !serving {
                        self.state.set_live(false);
                        shutdown.cancel();
                        return;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("mount_path", &self.mount_path)
            .field("period", &self.period)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::FakeMounter;
    use std::path::Path;

    const PERIOD: Duration = Duration::from_millis(20);

    async fn mounted() -> Arc<FakeMounter> {
        let mounter = Arc::new(FakeMounter::new());
        mounter.attach_device("/dev/longhorn/vol-a");
        mounter
            .format_and_mount(
                Path::new("/dev/longhorn/vol-a"),
                Path::new("/export/vol-a"),
                "ext4",
                &[],
                &[],
            )
            .await
            .unwrap();
        mounter
    }

    fn monitor(mounter: Arc<FakeMounter>) -> (HealthMonitor, Arc<HealthCheck>) {
        let state = Arc::new(HealthCheck::new());
        (
            HealthMonitor::new("/export/vol-a", mounter, PERIOD, state.clone()),
            state,
        )
    }

    #[tokio::test]
    async fn test_check_classifies_mount() {
        let mounter = mounted().await;
        let (monitor, state) = monitor(mounter.clone());
        assert_eq!(monitor.check().await.status, VolumeHealth::Healthy);

        mounter.set_read_only("/export/vol-a", true);
        assert_eq!(monitor.check().await.status, VolumeHealth::ReadOnly);

        mounter.set_unreachable("/export/vol-a", true);
        assert_eq!(monitor.check().await.status, VolumeHealth::Unhealthy);
        assert_eq!(
            state.last_check().map(|c| c.status),
            Some(VolumeHealth::Unhealthy)
        );
    }

    #[tokio::test]
    async fn test_unhealthy_mount_shuts_down_within_interval() {
        let mounter = mounted().await;
        mounter.set_unreachable("/export/vol-a", true);
        let (monitor, state) = monitor(mounter.clone());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(shutdown.clone()));

        tokio::time::timeout(PERIOD * 10, shutdown.cancelled())
            .await
            .unwrap();
        handle.await.unwrap();
        assert_eq!(mounter.remount_calls(), 0);
        assert!(!state.is_live());
    }

    #[tokio::test]
    async fn test_read_only_mount_recovers_with_one_remount() {
        let mounter = mounted().await;
        mounter.set_read_only("/export/vol-a", true);
        let (monitor, state) = monitor(mounter.clone());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(shutdown.clone()));

        tokio::time::sleep(PERIOD * 4).await;
        assert!(!shutdown.is_cancelled());
        assert_eq!(mounter.remount_calls(), 1);
        assert!(state.is_live());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_remount_shuts_down() {
        let mounter = mounted().await;
        mounter.set_read_only("/export/vol-a", true);
        mounter.fail_remount(true);
        let (monitor, _) = monitor(mounter.clone());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(shutdown.clone()));

        tokio::time::timeout(PERIOD * 10, shutdown.cancelled())
            .await
            .unwrap();
        handle.await.unwrap();
        assert_eq!(mounter.remount_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_remount_in_flight() {
        let mounter = mounted().await;
        mounter.set_read_only("/export/vol-a", true);
        mounter.delay_remount(Duration::from_secs(5));
        let (monitor, state) = monitor(mounter.clone());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(1), async {
            while mounter.remount_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let cancelled_at = Instant::now();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert!(state.is_live());
    }

    #[tokio::test]
    async fn test_monitor_exits_on_cancel() {
        let mounter = mounted().await;
        let (monitor, state) = monitor(mounter);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(shutdown.clone()));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(state.is_live());
    }
}
