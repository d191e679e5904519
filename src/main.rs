mod backup;
mod config;
mod heartbeat;
mod launcher;
mod metrics;
mod plugins;
mod signals;
mod supervisor;
mod watchdog;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use crate::backup::DirectoryBackup;
use crate::config::LauncherConfig;
use crate::launcher::{Launcher, RunOutcome};
use crate::plugins::{PluginFactories, PluginRegistry};

/// Launch a game server, watch it for crashes and silent freezes, and
/// restart it after taking a backup.
#[derive(Parser, Debug)]
#[command(name = "egg-launcher", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "launcher.toml")]
    config: PathBuf,

    /// Watchdog check interval in seconds (overrides config)
    #[arg(long)]
    interval: Option<u64>,

    /// Seconds without a heartbeat before the server counts as frozen
    #[arg(long)]
    freeze_threshold: Option<u64>,

    /// Heartbeat listener port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Disable the heartbeat listener and freeze detection
    #[arg(long)]
    no_heartbeat: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (watchdog ticks, stale events)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut LauncherConfig) {
        if let Some(interval) = self.interval {
            config.watchdog.check_interval_secs = interval;
        }
        if let Some(threshold) = self.freeze_threshold {
            config.watchdog.freeze_threshold_secs = threshold;
        }
        if let Some(port) = self.port {
            config.heartbeat.port = port;
        }
        if self.no_heartbeat {
            config.heartbeat.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "egg_launcher=debug"
    } else {
        "egg_launcher=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "launcher failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut config = config::load_config(&cli.config)?;
    cli.apply_overrides(&mut config);
    // Validate timings before anything is launched.
    config.watchdog.to_watchdog_config()?;

    if cli.dry_run {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(ExitCode::SUCCESS);
    }

    if config.server.command.is_empty() {
        let jar = config.server.jar_path();
        if !jar.is_file() {
            return Err(format!("server jar not found: {}", jar.display()).into());
        }
    }

    println!("egg-launcher v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "Watchdog: check every {}s, freeze after {}s without heartbeat",
        config.watchdog.check_interval_secs, config.watchdog.freeze_threshold_secs
    );

    let plugins = PluginRegistry::discover(&config.plugins.dir, &PluginFactories::builtin());
    if plugins.is_empty() {
        tracing::info!("no plugins to activate");
    } else {
        tracing::info!(count = plugins.len(), names = ?plugins.names(), "plugins discovered");
    }

    let backup = Arc::new(DirectoryBackup::new(&config.backup));
    let launcher = Launcher::new(&config, backup, plugins)?;

    let handle = launcher.handle();
    tokio::spawn(async move {
        signals::shutdown_signal().await;
        handle.stop();
    });

    let outcome = launcher.run().await?;
    tracing::info!(?outcome, "launcher finished");

    Ok(match outcome {
        RunOutcome::Stopped { .. } | RunOutcome::ServerExited { code: Some(0), .. } => {
            ExitCode::SUCCESS
        }
        RunOutcome::ServerExited { .. } => ExitCode::FAILURE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_replace_config_values() {
        let cli = Cli::try_parse_from([
            "egg-launcher",
            "--interval",
            "5",
            "--freeze-threshold",
            "20",
            "--port",
            "30001",
            "--no-heartbeat",
        ])
        .unwrap();

        let mut config = LauncherConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.watchdog.check_interval_secs, 5);
        assert_eq!(config.watchdog.freeze_threshold_secs, 20);
        assert_eq!(config.heartbeat.port, 30001);
        assert!(!config.heartbeat.enabled);
    }

    #[test]
    fn test_no_flags_keep_config() {
        let cli = Cli::try_parse_from(["egg-launcher"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("launcher.toml"));

        let mut config = LauncherConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.watchdog.check_interval_secs, 15);
        assert!(config.heartbeat.enabled);
    }
}
