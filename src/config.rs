use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::supervisor::LaunchSpec;
use crate::watchdog::WatchdogConfig;

/// Top-level configuration loaded from launcher.toml.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LauncherConfig {
    pub server: ServerConfig,
    pub watchdog: WatchdogSection,
    pub heartbeat: HeartbeatConfig,
    pub backup: BackupConfig,
    pub plugins: PluginsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub working_dir: PathBuf,
    pub java: String,
    pub jar: String,
    pub min_heap: String,
    pub max_heap: String,
    pub nogui: bool,
    pub extra_args: Vec<String>,
    /// Explicit argv replacing the java invocation (e.g. a wrapper script).
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchdogSection {
    pub check_interval_secs: u64,
    pub freeze_threshold_secs: u64,
    pub cpu_alert_percent: f32,
    pub cpu_sample_millis: u64,
    pub terminate_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackupConfig {
    pub dir: PathBuf,
    pub retention: usize,
    pub files: Vec<PathBuf>,
    pub logs_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub dir: PathBuf,
}

/// Errors produced while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for [`LauncherConfig`].
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A value is out of range or inconsistent with another value.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Load config from `path`, falling back to defaults when the file is absent.
pub fn load_config(path: &Path) -> Result<LauncherConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(LauncherConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

impl ServerConfig {
    /// Full path of the server jar, relative to the launcher's directory.
    pub fn jar_path(&self) -> PathBuf {
        self.working_dir.join(&self.jar)
    }

    /// Build the process invocation: bounded heap, the jar, and optionally `nogui`.
    pub fn launch_spec(&self) -> LaunchSpec {
        if let Some((program, args)) = self.command.split_first() {
            return LaunchSpec {
                program: program.clone(),
                args: args.to_vec(),
                working_dir: self.working_dir.clone(),
            };
        }

        let mut args = vec![
            format!("-Xms{}", self.min_heap),
            format!("-Xmx{}", self.max_heap),
        ];
        args.extend(self.extra_args.iter().cloned());
        args.push("-jar".to_string());
        args.push(self.jar.clone());
        if self.nogui {
            args.push("nogui".to_string());
        }

        LaunchSpec {
            program: self.java.clone(),
            args,
            working_dir: self.working_dir.clone(),
        }
    }
}

impl WatchdogSection {
    /// Convert to the immutable runtime config, rejecting inconsistent timings.
    pub fn to_watchdog_config(&self) -> Result<WatchdogConfig, ConfigError> {
        WatchdogConfig::new(
            Duration::from_secs(self.check_interval_secs),
            Duration::from_secs(self.freeze_threshold_secs),
            self.cpu_alert_percent,
            Duration::from_millis(self.cpu_sample_millis),
        )
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

impl HeartbeatConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("server"),
            java: "java".to_string(),
            jar: "forge-server.jar".to_string(),
            min_heap: "2G".to_string(),
            max_heap: "4G".to_string(),
            nogui: true,
            extra_args: Vec::new(),
            command: Vec::new(),
        }
    }
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            check_interval_secs: 15,
            freeze_threshold_secs: 60,
            cpu_alert_percent: 90.0,
            cpu_sample_millis: 1000,
            terminate_grace_secs: 30,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 25566,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("backups/auto"),
            retention: 10,
            files: vec![PathBuf::from("server/server.properties")],
            logs_dir: PathBuf::from("logs"),
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("egg_plugins"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("launcher.toml")).unwrap();
        assert_eq!(config.watchdog.check_interval_secs, 15);
        assert_eq!(config.watchdog.freeze_threshold_secs, 60);
        assert_eq!(config.heartbeat.port, 25566);
        assert_eq!(config.backup.retention, 10);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launcher.toml");
        std::fs::write(
            &path,
            "[watchdog]\nfreeze_threshold_secs = 90\n\n[heartbeat]\nport = 30000\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.watchdog.freeze_threshold_secs, 90);
        assert_eq!(config.watchdog.check_interval_secs, 15);
        assert_eq!(config.heartbeat.port, 30000);
        assert_eq!(config.heartbeat.bind, "127.0.0.1");
        assert_eq!(config.server.jar, "forge-server.jar");
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launcher.toml");
        std::fs::write(&path, "[watchdog\ncheck_interval_secs = ").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_launch_spec_default_invocation() {
        let spec = ServerConfig::default().launch_spec();
        assert_eq!(spec.program, "java");
        assert_eq!(
            spec.args,
            vec!["-Xms2G", "-Xmx4G", "-jar", "forge-server.jar", "nogui"]
        );
        assert_eq!(spec.working_dir, PathBuf::from("server"));
    }

    #[test]
    fn test_launch_spec_extra_args_before_jar() {
        let server = ServerConfig {
            nogui: false,
            extra_args: vec!["-XX:+UseG1GC".to_string()],
            ..Default::default()
        };
        let spec = server.launch_spec();
        assert_eq!(
            spec.args,
            vec!["-Xms2G", "-Xmx4G", "-XX:+UseG1GC", "-jar", "forge-server.jar"]
        );
    }

    #[test]
    fn test_explicit_command_overrides_java() {
        let server = ServerConfig {
            command: vec!["./start.sh".to_string(), "--fast".to_string()],
            ..Default::default()
        };
        let spec = server.launch_spec();
        assert_eq!(spec.program, "./start.sh");
        assert_eq!(spec.args, vec!["--fast"]);
    }

    #[test]
    fn test_default_watchdog_section_is_valid() {
        let config = WatchdogSection::default().to_watchdog_config().unwrap();
        assert_eq!(config, WatchdogConfig::default());
    }

    #[test]
    fn test_threshold_shorter_than_interval_rejected() {
        let section = WatchdogSection {
            check_interval_secs: 30,
            freeze_threshold_secs: 10,
            ..Default::default()
        };
        let err = section.to_watchdog_config().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_jar_path_joins_working_dir() {
        assert_eq!(
            ServerConfig::default().jar_path(),
            PathBuf::from("server/forge-server.jar")
        );
    }
}
