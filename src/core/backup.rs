// src/core/backup.rs

//! Workspace snapshot and restore.
//!
//! Snapshots archive the whole workspace minus the skip-list directories.
//! Restore extracts into a staging sibling and only touches the live
//! workspace once extraction has fully succeeded; any failure removes the
//! staging directory and leaves the workspace as it was.

use crate::core::errors::BlockforgeError;
use crate::core::events::{self, Event, EventBus};
use crate::core::registry::InstanceRegistry;
use crate::core::supervisor::ProcessSupervisor;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Top-level workspace directories excluded from snapshots.
const SKIP_DIRS: [&str; 3] = ["logs", "crash-reports", "debug"];

/// One archive on disk.
#[derive(Serialize, Debug, Clone)]
pub struct BackupRecord {
    /// The archive filename, which doubles as the backup id.
    pub id: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

pub struct BackupManager {
    registry: Arc<InstanceRegistry>,
    supervisor: ProcessSupervisor,
    bus: Arc<EventBus>,
    backups_dir: PathBuf,
}

impl BackupManager {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        supervisor: ProcessSupervisor,
        bus: Arc<EventBus>,
        backups_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            supervisor,
            bus,
            backups_dir: backups_dir.into(),
        }
    }

    fn dir_for(&self, id: &str) -> PathBuf {
        self.backups_dir.join(id)
    }

    /// Archives the instance workspace to
    /// `<backups>/<id>/<name-or-timestamp>-<epoch>.zip` with maximum
    /// compression. Outcome is published on the instance's backup topic.
    pub async fn snapshot(
        &self,
        id: &str,
        name: Option<String>,
    ) -> Result<BackupRecord, BlockforgeError> {
        let instance = self.registry.get(id)?;
        let dir = self.dir_for(id);
        tokio::fs::create_dir_all(&dir).await?;

        let label = match name {
            Some(name) if !name.trim().is_empty() => sanitize_label(&name),
            _ => Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string(),
        };
        let filename = format!("{label}-{}.zip", Utc::now().timestamp());
        let dest = dir.join(&filename);

        let workspace = instance.workspace.clone();
        let archive_dest = dest.clone();
        let result = tokio::task::spawn_blocking(move || create_archive(&workspace, &archive_dest))
            .await
            .map_err(|e| BlockforgeError::Internal(format!("snapshot task panicked: {e}")))?;

        match result {
            Ok(()) => {
                let size_bytes = tokio::fs::metadata(&dest).await.map(|m| m.len()).unwrap_or(0);
                info!(
                    "Snapshot '{}' of instance '{}' complete ({} bytes).",
                    filename, instance.name, size_bytes
                );
                self.bus.publish(
                    &events::backup_topic(id),
                    Event::Backup {
                        server_id: id.to_string(),
                        backup: filename.clone(),
                        success: true,
                        error: None,
                    },
                );
                Ok(BackupRecord {
                    id: filename,
                    size_bytes,
                    created_at: Utc::now(),
                })
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                self.bus.publish(
                    &events::backup_topic(id),
                    Event::Backup {
                        server_id: id.to_string(),
                        backup: filename,
                        success: false,
                        error: Some(e.to_string()),
                    },
                );
                Err(e)
            }
        }
    }

    /// The archives of one instance, newest first.
    pub fn list(&self, id: &str) -> Result<Vec<BackupRecord>, BlockforgeError> {
        self.registry.get(id)?;
        let dir = self.dir_for(id);
        let mut records = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".zip") {
                continue;
            }
            let metadata = entry.metadata()?;
            records.push(BackupRecord {
                id: name,
                size_bytes: metadata.len(),
                created_at: metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Resolves a backup id to its archive path, rejecting ids that would
    /// escape the instance's backup directory.
    pub fn path_for(&self, id: &str, backup_id: &str) -> Result<PathBuf, BlockforgeError> {
        self.registry.get(id)?;
        if backup_id.contains('/') || backup_id.contains('\\') || backup_id.contains("..") {
            return Err(BlockforgeError::InvalidArgument(format!(
                "invalid backup id '{backup_id}'"
            )));
        }
        let path = self.dir_for(id).join(backup_id);
        if !path.is_file() {
            return Err(BlockforgeError::not_found(format!("backup '{backup_id}'")));
        }
        Ok(path)
    }

    /// Deletes one archive.
    pub fn delete(&self, id: &str, backup_id: &str) -> Result<(), BlockforgeError> {
        let path = self.path_for(id, backup_id)?;
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Restores an archive with rollback: the instance is stopped first,
    /// the archive extracts into a staging sibling, and only then are the
    /// workspace's top-level entries replaced. Directories absent from the
    /// archive (the snapshot skip list) survive.
    pub async fn restore(&self, id: &str, backup_id: &str) -> Result<(), BlockforgeError> {
        let instance = self.registry.get(id)?;
        let archive = self.path_for(id, backup_id)?;

        if self.supervisor.is_running(id) {
            self.supervisor.stop(id, false).await?;
        }

        let parent = instance
            .workspace
            .parent()
            .ok_or_else(|| BlockforgeError::Internal("workspace has no parent".into()))?;
        let staging = parent.join(format!(".{id}.restore"));
        if staging.exists() {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await?;

        let extract_to = staging.clone();
        let archive_path = archive.clone();
        let extracted = tokio::task::spawn_blocking(move || -> Result<(), BlockforgeError> {
            let file = std::fs::File::open(&archive_path)?;
            let mut zip = ZipArchive::new(file)?;
            zip.extract(&extract_to)?;
            Ok(())
        })
        .await
        .map_err(|e| BlockforgeError::Internal(format!("restore task panicked: {e}")))?;

        if let Err(e) = extracted {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            warn!("Restore of '{}' into '{}' failed: {}", backup_id, id, e);
            return Err(e);
        }

        // Swap top-level entries from staging into the live workspace.
        let mut entries = tokio::fs::read_dir(&staging).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = instance.workspace.join(entry.file_name());
            if target.is_dir() {
                tokio::fs::remove_dir_all(&target).await?;
            } else if target.exists() {
                tokio::fs::remove_file(&target).await?;
            }
            tokio::fs::rename(entry.path(), &target).await?;
        }
        tokio::fs::remove_dir_all(&staging).await?;

        info!("Restored backup '{}' into instance '{}'.", backup_id, id);
        Ok(())
    }
}

/// Replaces filesystem-hostile characters in a user-supplied backup name.
fn sanitize_label(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Walks the workspace and writes the archive, skipping the top-level
/// skip-list directories.
fn create_archive(workspace: &Path, dest: &Path) -> Result<(), BlockforgeError> {
    let file = std::fs::File::create(dest)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(9));

    for entry in WalkDir::new(workspace).min_depth(1) {
        let entry = entry.map_err(|e| BlockforgeError::Internal(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(workspace)
            .map_err(|e| BlockforgeError::Internal(e.to_string()))?;

        let first = relative
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .unwrap_or_default();
        if SKIP_DIRS.contains(&first.as_str()) {
            continue;
        }

        // Zip entry names use forward slashes regardless of platform.
        let entry_name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            writer.add_directory(entry_name, options)?;
        } else if entry.file_type().is_file() {
            writer.start_file(entry_name, options)?;
            let mut source = std::fs::File::open(entry.path())?;
            let mut buffer = [0u8; 64 * 1024];
            loop {
                let read = source.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                writer.write_all(&buffer[..read])?;
            }
        }
    }

    writer.finish()?;
    Ok(())
}
