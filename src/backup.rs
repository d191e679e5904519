//! Pre-restart state backups.
//!
//! Each backup is a directory `{dir}/{YYYYmmdd_HHMMSS}_{reason}/` holding the
//! configured files and the most recent server log. Only the newest
//! `retention` backups are kept.

use std::path::{Path, PathBuf};

use crate::config::BackupConfig;

/// Anything that can snapshot server state before a restart.
pub trait BackupTarget: Send + Sync + 'static {
    /// Create a backup tagged with `reason`, returning its location.
    fn create_backup(&self, reason: &str) -> Result<PathBuf, BackupError>;
}

/// Errors that abort a backup.
#[derive(Debug)]
pub enum BackupError {
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for BackupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupError::CreateDir { path, source } => {
                write!(f, "failed to create backup directory {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for BackupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackupError::CreateDir { source, .. } => Some(source),
        }
    }
}

/// Copies selected files into timestamped directories.
#[derive(Debug, Clone)]
pub struct DirectoryBackup {
    dir: PathBuf,
    retention: usize,
    files: Vec<PathBuf>,
    logs_dir: PathBuf,
}

impl DirectoryBackup {
    /// A retention of zero would delete the backup just taken, so it is raised to one.
    pub fn new(config: &BackupConfig) -> Self {
        if config.retention == 0 {
            tracing::warn!("backup retention of 0 would discard every backup, keeping 1");
        }
        Self {
            dir: config.dir.clone(),
            retention: config.retention.max(1),
            files: config.files.clone(),
            logs_dir: config.logs_dir.clone(),
        }
    }

    /// Create a backup using an explicit timestamp prefix.
    fn create_backup_at(&self, reason: &str, timestamp: &str) -> Result<PathBuf, BackupError> {
        tracing::info!(reason, "creating backup");

        let backup_path = self.dir.join(format!("{timestamp}_{reason}"));
        std::fs::create_dir_all(&backup_path).map_err(|e| BackupError::CreateDir {
            path: backup_path.clone(),
            source: e,
        })?;

        for file in &self.files {
            let Some(name) = file.file_name() else {
                continue;
            };
            copy_if_exists(file, &backup_path.join(name));
        }

        self.copy_latest_log(&backup_path.join("logs"))?;

        tracing::info!(path = %backup_path.display(), "backup created");
        self.apply_retention();
        Ok(backup_path)
    }

    fn copy_latest_log(&self, dest_dir: &Path) -> Result<(), BackupError> {
        let entries = match std::fs::read_dir(&self.logs_dir) {
            Ok(e) => e,
            Err(_) => return Ok(()),
        };

        let latest = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
            .filter_map(|path| {
                let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((modified, path))
            })
            .max_by_key(|(modified, _)| *modified);

        let Some((_, latest)) = latest else {
            return Ok(());
        };

        std::fs::create_dir_all(dest_dir).map_err(|e| BackupError::CreateDir {
            path: dest_dir.to_path_buf(),
            source: e,
        })?;
        if let Some(name) = latest.file_name() {
            copy_if_exists(&latest, &dest_dir.join(name));
        }
        Ok(())
    }

    /// Delete all but the newest `retention` backup directories.
    ///
    /// Names start with a sortable timestamp, so name order is age order.
    fn apply_retention(&self) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read backup directory for retention");
                return;
            }
        };

        let mut backups: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        if backups.len() <= self.retention {
            tracing::debug!(count = backups.len(), "no backup cleanup needed");
            return;
        }

        backups.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
        for old in backups.iter().skip(self.retention) {
            match std::fs::remove_dir_all(old) {
                Ok(()) => tracing::info!(path = %old.display(), "removed old backup"),
                Err(e) => tracing::warn!(
                    error = %e,
                    path = %old.display(),
                    "failed to remove old backup"
                ),
            }
        }
    }
}

impl BackupTarget for DirectoryBackup {
    fn create_backup(&self, reason: &str) -> Result<PathBuf, BackupError> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        self.create_backup_at(reason, &timestamp)
    }
}

/// Copy one file, logging instead of failing when it is missing or unreadable.
fn copy_if_exists(source: &Path, dest: &Path) {
    if !source.exists() {
        tracing::warn!(path = %source.display(), "file to back up does not exist");
        return;
    }
    match std::fs::copy(source, dest) {
        Ok(_) => tracing::debug!(from = %source.display(), to = %dest.display(), "copied"),
        Err(e) => tracing::warn!(error = %e, path = %source.display(), "failed to copy file"),
    }
}
