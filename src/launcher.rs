//! Orchestration: owns the current server process and its watchdog.
//!
//! The launcher starts the heartbeat channel, activates plugins, launches the
//! server and pairs it with a fresh watchdog. Watchdog and exit-waiter report
//! back through a generation-tagged event channel; events from a replaced
//! generation are ignored. A freeze terminates the frozen server, runs the
//! backup, relaunches and installs the next watchdog. A natural exit ends
//! supervision without relaunching.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backup::BackupTarget;
use crate::config::{ConfigError, HeartbeatConfig, LauncherConfig};
use crate::heartbeat::{self, ChannelHandle, ChannelOutcome, HeartbeatState};
use crate::metrics::SystemProbe;
use crate::plugins::PluginRegistry;
use crate::supervisor::{self, ConsoleSink, LaunchError, LaunchSpec, OutputSink, ProcessHandle};
use crate::watchdog::{FreezeReport, RestartCallback, Watchdog, WatchdogConfig, WatchdogHandle};

/// Backup reason recorded for freeze-triggered restarts.
pub const RESTART_REASON: &str = "watchdog_restart";

#[derive(Debug)]
enum LauncherEvent {
    Freeze { generation: u64, report: FreezeReport },
    Exited { generation: u64, code: Option<i32> },
    Stop,
}

/// How a launcher run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The server exited on its own.
    ServerExited { code: Option<i32>, restarts: u32 },
    /// A stop was requested through [`LauncherHandle::stop`].
    Stopped { restarts: u32 },
}

/// The server process currently supervised, with its watchdog.
struct Supervision {
    generation: u64,
    process: ProcessHandle,
    watchdog: WatchdogHandle,
}

/// Programmatic control over a running launcher.
#[derive(Clone)]
pub struct LauncherHandle {
    events: mpsc::UnboundedSender<LauncherEvent>,
    heartbeat: Arc<HeartbeatState>,
}

impl LauncherHandle {
    /// Request shutdown: stop the watchdog and terminate the server.
    pub fn stop(&self) {
        let _ = self.events.send(LauncherEvent::Stop);
    }

    /// Feed a heartbeat from an in-process source.
    ///
    /// Embedding entry point; the binary receives heartbeats over TCP only.
    #[allow(dead_code)]
    pub fn receive_heartbeat(&self) {
        self.heartbeat.mark_alive(Instant::now());
    }
}

pub struct Launcher {
    launch_spec: LaunchSpec,
    watchdog_config: WatchdogConfig,
    heartbeat_config: HeartbeatConfig,
    terminate_grace: Duration,
    heartbeat: Arc<HeartbeatState>,
    backup: Arc<dyn BackupTarget>,
    plugins: PluginRegistry,
    sink: Arc<dyn OutputSink>,
    events_tx: mpsc::UnboundedSender<LauncherEvent>,
    events_rx: mpsc::UnboundedReceiver<LauncherEvent>,
    generation: u64,
    restarts: u32,
    current: Option<Supervision>,
}

impl Launcher {
    pub fn new(
        config: &LauncherConfig,
        backup: Arc<dyn BackupTarget>,
        plugins: PluginRegistry,
    ) -> Result<Self, ConfigError> {
        let watchdog_config = config.watchdog.to_watchdog_config()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            launch_spec: config.server.launch_spec(),
            watchdog_config,
            heartbeat_config: config.heartbeat.clone(),
            terminate_grace: config.watchdog.terminate_grace(),
            heartbeat: Arc::new(HeartbeatState::new()),
            backup,
            plugins,
            sink: Arc::new(ConsoleSink),
            events_tx,
            events_rx,
            generation: 0,
            restarts: 0,
            current: None,
        })
    }

    pub fn handle(&self) -> LauncherHandle {
        LauncherHandle {
            events: self.events_tx.clone(),
            heartbeat: Arc::clone(&self.heartbeat),
        }
    }

    /// Supervise the server until it exits or a stop is requested.
    /// Plugins are deactivated on every path.
    pub async fn run(mut self) -> Result<RunOutcome, LaunchError> {
        let channel = start_heartbeat_channel(&self.heartbeat_config, Arc::clone(&self.heartbeat))
            .await
            .map(|channel| {
                tracing::info!(
                    local_addr = %channel.local_addr(),
                    "waiting for the core agent to connect"
                );
                (channel.abort_handle(), tokio::spawn(report_channel_outcome(channel)))
            });

        run_plugin_hook(&mut self.plugins, PluginRegistry::activate_all).await;
        let result = self.supervise(channel.is_some()).await;

        if let Some((abort, monitor)) = channel {
            abort.abort();
            let _ = monitor.await;
        }
        run_plugin_hook(&mut self.plugins, PluginRegistry::deactivate_all).await;

        result
    }

    /// Without a heartbeat listener, silence proves nothing, so freeze
    /// detection is only enabled when the channel is bound.
    async fn supervise(&mut self, freeze_detection: bool) -> Result<RunOutcome, LaunchError> {
        let mut restart_reason: Option<&str> = None;

        loop {
            match restart_reason.take() {
                Some(reason) => {
                    tracing::info!("restarting server");
                    run_backup(Arc::clone(&self.backup), reason).await;
                }
                None => tracing::info!("starting server for the first time"),
            }

            let process = supervisor::launch(&self.launch_spec, Arc::clone(&self.sink))
                .inspect_err(|e| tracing::error!(error = %e, "server launch failed"))?;
            self.install(process, freeze_detection);

            loop {
                let event = self.events_rx.recv().await.unwrap_or(LauncherEvent::Stop);

                match event {
                    LauncherEvent::Freeze { generation, report }
                        if generation == self.generation =>
                    {
                        tracing::warn!(
                            pid = report.pid,
                            staleness_secs = report.staleness.as_secs(),
                            "terminating frozen server"
                        );
                        self.terminate_current().await;
                        self.restarts += 1;
                        restart_reason = Some(RESTART_REASON);
                        break;
                    }
                    LauncherEvent::Exited { generation, code } if generation == self.generation => {
                        tracing::info!(exit_code = ?code, "server exited, supervision finished");
                        if let Some(current) = self.current.take() {
                            current.watchdog.stop();
                            let exit = current.watchdog.join().await;
                            tracing::debug!(generation, ?exit, "watchdog finished");
                        }
                        return Ok(RunOutcome::ServerExited {
                            code,
                            restarts: self.restarts,
                        });
                    }
                    LauncherEvent::Stop => {
                        tracing::info!("stop requested, shutting down server");
                        self.terminate_current().await;
                        return Ok(RunOutcome::Stopped {
                            restarts: self.restarts,
                        });
                    }
                    stale => tracing::debug!(event = ?stale, "ignoring event from replaced server"),
                }
            }
        }
    }

    /// Pair a freshly launched process with its exit waiter and a new watchdog.
    fn install(&mut self, process: supervisor::SupervisedProcess, freeze_detection: bool) {
        self.generation += 1;
        let generation = self.generation;
        let handle = process.handle();
        tracing::info!(generation, pid = process.pid(), "supervising server");

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let code = match process.await_exit().await {
                Ok(report) => {
                    tracing::debug!(
                        generation,
                        pid = report.pid,
                        uptime_secs = report.uptime.as_secs(),
                        "exit waiter finished"
                    );
                    report.code
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed waiting for server exit");
                    None
                }
            };
            let _ = events.send(LauncherEvent::Exited { generation, code });
        });

        let events = self.events_tx.clone();
        let on_restart: RestartCallback = Box::new(move |report| {
            Box::pin(async move {
                let _ = events.send(LauncherEvent::Freeze { generation, report });
            })
        });

        let probe = SystemProbe::new(self.watchdog_config.sample_window());
        let mut watchdog = Watchdog::new(
            self.watchdog_config,
            handle.clone(),
            Arc::clone(&self.heartbeat),
            probe,
            on_restart,
        );
        if !freeze_detection {
            watchdog = watchdog.without_freeze_detection();
        }

        self.current = Some(Supervision {
            generation,
            process: handle,
            watchdog: watchdog.start(),
        });
    }

    async fn terminate_current(&mut self) {
        if let Some(current) = self.current.take() {
            terminate(current, self.terminate_grace).await;
        }
    }
}

async fn start_heartbeat_channel(
    config: &HeartbeatConfig,
    state: Arc<HeartbeatState>,
) -> Option<ChannelHandle> {
    if !config.enabled {
        tracing::warn!("heartbeat channel disabled, freeze detection is off");
        return None;
    }
    match heartbeat::listen(&config.address(), state).await {
        Ok(channel) => Some(channel),
        Err(e) => {
            tracing::error!(
                error = %e,
                "heartbeat channel unavailable, watchdog limited to process liveness"
            );
            None
        }
    }
}

/// Log how the heartbeat receiver ended. The listener never re-opens, so
/// after a disconnect the watchdog sees only silence.
async fn report_channel_outcome(mut channel: ChannelHandle) {
    let outcome = channel.join().await;
    let signals = channel.signals_received();
    match outcome {
        ChannelOutcome::Disconnected { peer } => tracing::warn!(
            %peer,
            signals,
            "core agent disconnected, heartbeats unavailable"
        ),
        ChannelOutcome::Failed(e) => {
            tracing::error!(error = %e, signals, "heartbeat channel failed")
        }
        ChannelOutcome::Aborted => tracing::debug!(signals, "heartbeat channel closed"),
    }
}

async fn terminate(current: Supervision, grace: Duration) {
    current.watchdog.stop();
    let status = current.process.terminate(grace).await;
    tracing::info!(pid = current.process.pid(), ?status, "server process terminated");

    let exit = current.watchdog.join().await;
    tracing::debug!(generation = current.generation, ?exit, "watchdog finished");
}

/// Plugin hooks may block (e.g. shell commands), so they run off the async workers.
async fn run_plugin_hook(plugins: &mut PluginRegistry, hook: fn(&mut PluginRegistry) -> usize) {
    let mut registry = std::mem::take(plugins);
    let task: JoinHandle<(PluginRegistry, usize)> = tokio::task::spawn_blocking(move || {
        let succeeded = hook(&mut registry);
        (registry, succeeded)
    });
    match task.await {
        Ok((registry, succeeded)) => {
            tracing::debug!(succeeded, total = registry.len(), "plugin hooks finished");
            *plugins = registry;
        }
        Err(e) => tracing::error!(error = %e, "plugin hook task panicked"),
    }
}

/// Snapshot state before relaunching; failures are logged, never fatal.
async fn run_backup(backup: Arc<dyn BackupTarget>, reason: &str) {
    let reason = reason.to_string();
    match tokio::task::spawn_blocking(move || backup.create_backup(&reason)).await {
        Ok(Ok(path)) => tracing::info!(path = %path.display(), "pre-restart backup complete"),
        Ok(Err(e)) => tracing::error!(error = %e, "pre-restart backup failed"),
        Err(e) => tracing::error!(error = %e, "pre-restart backup task panicked"),
    }
}
