//! Freeze detection for the supervised server.
//!
//! Runs as a single polling task per server process. Each tick checks that
//! the process is still alive, logs host load, and compares the time since
//! the last heartbeat with the freeze threshold. The first tick where the
//! silence strictly exceeds the threshold stops the watchdog and fires the
//! restart callback on its own task. A watchdog never runs again once stopped.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ConfigError;
use crate::heartbeat::HeartbeatState;
use crate::metrics::MetricsSource;
use crate::supervisor::ProcessHandle;

/// Immutable timing and alert settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchdogConfig {
    poll_interval: Duration,
    freeze_threshold: Duration,
    cpu_alert_percent: f32,
    sample_window: Duration,
}

impl WatchdogConfig {
    /// Validate and build a config.
    ///
    /// A threshold shorter than the poll interval could never be observed
    /// with a strict comparison, and a sampling window that fills the whole
    /// interval would make ticks overlap.
    pub fn new(
        poll_interval: Duration,
        freeze_threshold: Duration,
        cpu_alert_percent: f32,
        sample_window: Duration,
    ) -> Result<Self, ConfigError> {
        if poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "watchdog poll interval must be greater than zero".to_string(),
            ));
        }
        if freeze_threshold < poll_interval {
            return Err(ConfigError::Invalid(format!(
                "freeze threshold ({}s) is shorter than the poll interval ({}s)",
                freeze_threshold.as_secs(),
                poll_interval.as_secs()
            )));
        }
        if sample_window >= poll_interval {
            return Err(ConfigError::Invalid(format!(
                "cpu sampling window ({}ms) must be shorter than the poll interval ({}s)",
                sample_window.as_millis(),
                poll_interval.as_secs()
            )));
        }
        if !cpu_alert_percent.is_finite() || cpu_alert_percent <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "cpu alert threshold must be a positive percentage, got {cpu_alert_percent}"
            )));
        }

        Ok(Self {
            poll_interval,
            freeze_threshold,
            cpu_alert_percent,
            sample_window,
        })
    }

    /// CPU sampling window for the probe paired with this watchdog.
    pub fn sample_window(&self) -> Duration {
        self.sample_window
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            freeze_threshold: Duration::from_secs(60),
            cpu_alert_percent: 90.0,
            sample_window: Duration::from_secs(1),
        }
    }
}

/// Lifecycle of one watchdog instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogPhase {
    Idle,
    Active,
    Stopped,
}

impl WatchdogPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WatchdogPhase::Idle,
            1 => WatchdogPhase::Active,
            _ => WatchdogPhase::Stopped,
        }
    }
}

/// What a single tick concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Process alive, heartbeat fresh.
    Healthy,
    /// Heartbeat fresh again after the server had been marked unresponsive.
    Recovered,
    /// Silence exceeded the threshold; the restart callback was fired.
    FreezeDetected { staleness: Duration },
    /// Still silent, but a restart is already in flight.
    RestartPending,
    /// The process exited on its own; no restart.
    ProcessExited,
    /// The watchdog was already stopped; nothing was evaluated.
    Inactive,
}

/// Why the polling task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    ProcessExited,
    RestartTriggered,
    Cancelled,
}

/// Details handed to the restart callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezeReport {
    pub pid: u32,
    pub staleness: Duration,
}

pub type RestartFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Backup, relaunch and re-arm. Called at most once per watchdog, on its own task.
pub type RestartCallback = Box<dyn FnOnce(FreezeReport) -> RestartFuture + Send + 'static>;

/// Health evaluator for one supervised process.
pub struct Watchdog<P> {
    config: WatchdogConfig,
    process: ProcessHandle,
    heartbeat: Arc<HeartbeatState>,
    probe: P,
    on_restart: Option<RestartCallback>,
    freeze_detection: bool,
    phase: Arc<AtomicU8>,
}

impl<P: MetricsSource> Watchdog<P> {
    /// Pair a new watchdog with a freshly launched process.
    ///
    /// Re-arms `heartbeat` so silence is measured from now.
    pub fn new(
        config: WatchdogConfig,
        process: ProcessHandle,
        heartbeat: Arc<HeartbeatState>,
        probe: P,
        on_restart: RestartCallback,
    ) -> Self {
        heartbeat.reset(Instant::now());
        Self {
            config,
            process,
            heartbeat,
            probe,
            on_restart: Some(on_restart),
            freeze_detection: true,
            phase: Arc::new(AtomicU8::new(WatchdogPhase::Idle as u8)),
        }
    }

    /// Monitor liveness and load only; used when no heartbeat source exists.
    pub fn without_freeze_detection(mut self) -> Self {
        self.freeze_detection = false;
        self
    }

    pub fn phase(&self) -> WatchdogPhase {
        WatchdogPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: WatchdogPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Evaluate one poll tick at `now`.
    pub async fn tick(&mut self, now: Instant) -> TickOutcome {
        if self.phase() == WatchdogPhase::Stopped {
            return TickOutcome::Inactive;
        }

        if !self.process.is_alive() {
            tracing::warn!(
                pid = self.process.pid(),
                status = ?self.process.status(),
                "server process is not running, watchdog taking no action"
            );
            self.set_phase(WatchdogPhase::Stopped);
            return TickOutcome::ProcessExited;
        }

        self.log_system_metrics().await;
        self.check_responsiveness(now)
    }

    async fn log_system_metrics(&mut self) {
        match self.probe.sample().await {
            Ok(sample) => {
                tracing::info!(
                    cpu_percent = %format!("{:.2}", sample.cpu_load_percent),
                    used_mb = sample.used_memory_mb(),
                    total_mb = sample.total_memory_mb(),
                    "system metrics"
                );
                if sample.cpu_load_percent > self.config.cpu_alert_percent {
                    tracing::warn!(
                        cpu_percent = %format!("{:.2}", sample.cpu_load_percent),
                        threshold = self.config.cpu_alert_percent,
                        "cpu load above alert threshold"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "system metrics unavailable, skipping load check");
            }
        }
    }

    fn check_responsiveness(&mut self, now: Instant) -> TickOutcome {
        if !self.freeze_detection {
            return TickOutcome::Healthy;
        }
        let staleness = self.heartbeat.staleness(now);

        if staleness > self.config.freeze_threshold {
            let was_responding = self.heartbeat.set_responding(false);
            if !was_responding {
                tracing::debug!(
                    staleness_secs = staleness.as_secs(),
                    "server still unresponsive, restart already in flight"
                );
                return TickOutcome::RestartPending;
            }
            tracing::error!(
                pid = self.process.pid(),
                staleness_secs = staleness.as_secs(),
                threshold_secs = self.config.freeze_threshold.as_secs(),
                "server stopped responding"
            );
            self.trigger_restart(staleness);
            return TickOutcome::FreezeDetected { staleness };
        }

        if !self.heartbeat.is_responding() && !self.heartbeat.set_responding(true) {
            tracing::info!(
                staleness_secs = staleness.as_secs(),
                "server regained responsiveness"
            );
            return TickOutcome::Recovered;
        }
        TickOutcome::Healthy
    }

    fn trigger_restart(&mut self, staleness: Duration) {
        tracing::warn!(
            pid = self.process.pid(),
            "frozen server detected, starting restart sequence"
        );
        // Stop first so no later tick can race the restart.
        self.set_phase(WatchdogPhase::Stopped);

        if let Some(on_restart) = self.on_restart.take() {
            let report = FreezeReport {
                pid: self.process.pid(),
                staleness,
            };
            tokio::spawn(on_restart(report));
        }
    }

    /// Start polling on a dedicated task. Ticks are serialized on that task.
    pub fn start(mut self) -> WatchdogHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let phase = Arc::clone(&self.phase);
        let pid = self.process.pid();

        self.set_phase(WatchdogPhase::Active);
        tracing::info!(
            pid,
            interval_secs = self.config.poll_interval.as_secs(),
            freeze_threshold_secs = self.config.freeze_threshold.as_secs(),
            "watchdog started"
        );

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let outcome = tokio::select! {
                    biased;
                    _ = stop_rx.changed() => None,
                    outcome = async {
                        let now = interval.tick().await;
                        self.tick(now).await
                    } => Some(outcome),
                };

                match outcome {
                    None => {
                        self.set_phase(WatchdogPhase::Stopped);
                        tracing::info!(pid, "watchdog stopped");
                        return WatchdogExit::Cancelled;
                    }
                    Some(TickOutcome::ProcessExited) => return WatchdogExit::ProcessExited,
                    Some(TickOutcome::FreezeDetected { .. }) => {
                        return WatchdogExit::RestartTriggered
                    }
                    Some(TickOutcome::Inactive) => return WatchdogExit::Cancelled,
                    Some(_) => {}
                }
            }
        });

        WatchdogHandle {
            stop: stop_tx,
            phase,
            task,
        }
    }
}

/// Control handle for a running watchdog.
pub struct WatchdogHandle {
    stop: watch::Sender<bool>,
    phase: Arc<AtomicU8>,
    task: JoinHandle<WatchdogExit>,
}

impl WatchdogHandle {
    /// Cancel polling, including a tick in progress. Idempotent.
    pub fn stop(&self) {
        self.phase
            .store(WatchdogPhase::Stopped as u8, Ordering::Release);
        self.stop.send_replace(true);
    }

    /// Wait for the polling task to end.
    pub async fn join(self) -> WatchdogExit {
        self.task.await.unwrap_or(WatchdogExit::Cancelled)
    }
}
