//! Launcher plugins: discovered from manifests, activated at startup and
//! deactivated at shutdown.
//!
//! Every `*.toml` file in the plugins directory is a manifest naming a plugin
//! `kind`. Kinds map to factories; one bad manifest or one failing plugin is
//! logged and skipped without affecting the others.

use serde::Deserialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

/// Lifecycle hooks implemented by every plugin.
pub trait Plugin: Send {
    fn name(&self) -> &str;
    fn activate(&mut self) -> Result<(), PluginError>;
    fn deactivate(&mut self) -> Result<(), PluginError>;
}

/// Errors produced while loading or running plugins.
#[derive(Debug)]
pub enum PluginError {
    Manifest {
        path: PathBuf,
        message: String,
    },
    UnknownKind {
        name: String,
        kind: String,
    },
    Command {
        plugin: String,
        command: String,
        detail: String,
    },
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginError::Manifest { path, message } => {
                write!(f, "invalid plugin manifest {}: {}", path.display(), message)
            }
            PluginError::UnknownKind { name, kind } => {
                write!(f, "plugin '{name}' has unknown kind '{kind}'")
            }
            PluginError::Command {
                plugin,
                command,
                detail,
            } => write!(f, "plugin '{plugin}' command `{command}` failed: {detail}"),
        }
    }
}

impl std::error::Error for PluginError {}

/// Parsed plugin manifest. Fields beyond `name` and `kind` belong to the kind.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub kind: String,
    #[serde(flatten)]
    pub settings: toml::Table,
}

pub type PluginFactory = fn(&PluginManifest) -> Result<Box<dyn Plugin>, PluginError>;

/// Maps manifest kinds to constructors.
pub struct PluginFactories {
    factories: HashMap<String, PluginFactory>,
}

impl PluginFactories {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Factories for the kinds shipped with the launcher.
    pub fn builtin() -> Self {
        let mut factories = Self::empty();
        factories.register("command", CommandPlugin::from_manifest);
        factories
    }

    pub fn register(&mut self, kind: &str, factory: PluginFactory) {
        self.factories.insert(kind.to_string(), factory);
    }

    fn build(&self, manifest: &PluginManifest) -> Result<Box<dyn Plugin>, PluginError> {
        let factory = self
            .factories
            .get(&manifest.kind)
            .ok_or_else(|| PluginError::UnknownKind {
                name: manifest.name.clone(),
                kind: manifest.kind.clone(),
            })?;
        factory(manifest)
    }
}

impl Default for PluginFactories {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Loaded plugins, in discovery order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every manifest in `dir`. Failures are logged per candidate.
    pub fn discover(dir: &Path, factories: &PluginFactories) -> Self {
        let mut registry = Self::new();
        tracing::info!(dir = %dir.display(), "loading plugins");

        if !dir.is_dir() {
            tracing::warn!(dir = %dir.display(), "plugin directory does not exist");
            return registry;
        }

        let pattern = dir.join("*.toml");
        let candidates = match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(error = %e, "invalid plugin search pattern");
                return registry;
            }
        };

        let mut paths: Vec<PathBuf> = candidates.flatten().collect();
        paths.sort();
        for path in paths {
            match load_candidate(&path, factories) {
                Ok(plugin) => {
                    tracing::info!(plugin = plugin.name(), path = %path.display(), "plugin loaded");
                    registry.register(plugin);
                }
                Err(e) => tracing::error!(error = %e, path = %path.display(), "failed to load plugin"),
            }
        }

        tracing::info!(count = registry.len(), "plugins loaded");
        registry
    }

    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Activate every plugin; returns how many succeeded.
    pub fn activate_all(&mut self) -> usize {
        tracing::info!(count = self.plugins.len(), "activating plugins");
        self.run_each("activate", |p| p.activate())
    }

    /// Deactivate every plugin; returns how many succeeded.
    pub fn deactivate_all(&mut self) -> usize {
        tracing::info!(count = self.plugins.len(), "deactivating plugins");
        self.run_each("deactivate", |p| p.deactivate())
    }

    fn run_each<F>(&mut self, action: &str, mut f: F) -> usize
    where
        F: FnMut(&mut dyn Plugin) -> Result<(), PluginError>,
    {
        let mut ok = 0;
        for plugin in self.plugins.iter_mut() {
            let result = catch_unwind(AssertUnwindSafe(|| f(plugin.as_mut())));
            match result {
                Ok(Ok(())) => ok += 1,
                Ok(Err(e)) => {
                    tracing::error!(plugin = plugin.name(), action, error = %e, "plugin hook failed")
                }
                Err(_) => tracing::error!(plugin = plugin.name(), action, "plugin hook panicked"),
            }
        }
        ok
    }
}

fn load_candidate(path: &Path, factories: &PluginFactories) -> Result<Box<dyn Plugin>, PluginError> {
    let contents = std::fs::read_to_string(path).map_err(|e| PluginError::Manifest {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let manifest: PluginManifest = toml::from_str(&contents).map_err(|e| PluginError::Manifest {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    factories.build(&manifest)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommandSettings {
    on_activate: Vec<String>,
    on_deactivate: Vec<String>,
}

/// Runs shell commands on activation and deactivation.
pub struct CommandPlugin {
    name: String,
    on_activate: Vec<String>,
    on_deactivate: Vec<String>,
}

impl CommandPlugin {
    pub fn from_manifest(manifest: &PluginManifest) -> Result<Box<dyn Plugin>, PluginError> {
        let settings: CommandSettings = toml::Value::Table(manifest.settings.clone())
            .try_into()
            .map_err(|e: toml::de::Error| PluginError::Manifest {
                path: PathBuf::from(&manifest.name),
                message: e.to_string(),
            })?;
        Ok(Box::new(CommandPlugin {
            name: manifest.name.clone(),
            on_activate: settings.on_activate,
            on_deactivate: settings.on_deactivate,
        }))
    }

    fn run(&self, commands: &[String]) -> Result<(), PluginError> {
        for command in commands {
            tracing::debug!(plugin = %self.name, command, "running plugin command");
            let status = std::process::Command::new("sh")
                .args(["-c", command])
                .status()
                .map_err(|e| PluginError::Command {
                    plugin: self.name.clone(),
                    command: command.clone(),
                    detail: e.to_string(),
                })?;
            if !status.success() {
                return Err(PluginError::Command {
                    plugin: self.name.clone(),
                    command: command.clone(),
                    detail: format!("exited with {status}"),
                });
            }
        }
        Ok(())
    }
}

impl Plugin for CommandPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn activate(&mut self) -> Result<(), PluginError> {
        self.run(&self.on_activate)
    }

    fn deactivate(&mut self) -> Result<(), PluginError> {
        self.run(&self.on_deactivate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Probe {
        name: String,
        calls: Arc<AtomicUsize>,
        behavior: Behavior,
    }

    enum Behavior {
        Ok,
        Fail,
        Panic,
    }

    impl Plugin for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        fn activate(&mut self) -> Result<(), PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Ok => Ok(()),
                Behavior::Fail => Err(PluginError::Command {
                    plugin: self.name.clone(),
                    command: "activate".to_string(),
                    detail: "boom".to_string(),
                }),
                Behavior::Panic => panic!("plugin exploded"),
            }
        }

        fn deactivate(&mut self) -> Result<(), PluginError> {
            self.activate()
        }
    }

    fn probe(name: &str, calls: &Arc<AtomicUsize>, behavior: Behavior) -> Box<dyn Plugin> {
        Box::new(Probe {
            name: name.to_string(),
            calls: Arc::clone(calls),
            behavior,
        })
    }

    #[test]
    fn test_failures_do_not_stop_other_plugins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = PluginRegistry::new();
        registry.register(probe("failing", &calls, Behavior::Fail));
        registry.register(probe("panicking", &calls, Behavior::Panic));
        registry.register(probe("healthy", &calls, Behavior::Ok));

        assert_eq!(registry.activate_all(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        assert_eq!(registry.deactivate_all(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_discover_skips_bad_candidates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("camera.toml"),
            "name = \"camera-controller\"\nkind = \"command\"\non_activate = [\"true\"]\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("mystery.toml"),
            "name = \"mystery\"\nkind = \"wasm\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.toml"), "name = ").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = PluginRegistry::discover(dir.path(), &PluginFactories::builtin());
        assert_eq!(registry.names(), vec!["camera-controller"]);
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            PluginRegistry::discover(&dir.path().join("egg_plugins"), &PluginFactories::builtin());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_custom_kind_registration() {
        fn build(manifest: &PluginManifest) -> Result<Box<dyn Plugin>, PluginError> {
            Ok(Box::new(CommandPlugin {
                name: manifest.name.clone(),
                on_activate: vec![],
                on_deactivate: vec![],
            }))
        }

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.toml"), "name = \"custom\"\nkind = \"native\"\n").unwrap();

        let mut factories = PluginFactories::empty();
        factories.register("native", build);
        let registry = PluginRegistry::discover(dir.path(), &factories);
        assert_eq!(registry.names(), vec!["custom"]);
    }

    #[test]
    fn test_command_plugin_runs_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let manifest: PluginManifest = toml::from_str(&format!(
            "name = \"marker\"\nkind = \"command\"\non_activate = [\"echo on > '{0}'\"]\non_deactivate = [\"echo off >> '{0}'\"]\n",
            marker.display()
        ))
        .unwrap();

        let mut plugin = CommandPlugin::from_manifest(&manifest).unwrap();
        plugin.activate().unwrap();
        plugin.deactivate().unwrap();
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "on\noff\n");
    }

    #[test]
    fn test_command_plugin_nonzero_exit_is_error() {
        let manifest: PluginManifest =
            toml::from_str("name = \"bad\"\nkind = \"command\"\non_activate = [\"exit 3\"]\n")
                .unwrap();
        let mut plugin = CommandPlugin::from_manifest(&manifest).unwrap();
        let err = plugin.activate().unwrap_err();
        assert!(err.to_string().contains("exit 3"));
    }
}
