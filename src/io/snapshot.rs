//! Inventory snapshot - ordered JSON array of items on disk
//!
//! Rewritten in full after every mutation: the new content goes to a
//! sibling temp file which is then renamed over the snapshot, so a crash
//! leaves either the old or the new set, never a torn file.

use crate::domain::inventory::InventoryItem;
use anyhow::Context;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load items; a missing file is an empty inventory
    pub fn load(&self) -> anyhow::Result<Vec<InventoryItem>> {
        if !self.path.exists() {
            info!(file = %self.path.display(), "snapshot_missing_starting_empty");
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read snapshot {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let items: Vec<InventoryItem> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot {}", self.path.display()))?;
        info!(file = %self.path.display(), items = %items.len(), "snapshot_loaded");
        Ok(items)
    }

    /// Load items, treating an unreadable snapshot as empty
    pub fn load_or_empty(&self) -> Vec<InventoryItem> {
        match self.load() {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "snapshot_unreadable_starting_empty");
                Vec::new()
            }
        }
    }

    /// Atomically replace the snapshot with `items`
    pub fn write(&self, items: &[InventoryItem]) -> anyhow::Result<()> {
        // Create parent directories if they don't exist
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let json = serde_json::to_vec_pretty(items).context("Failed to encode snapshot")?;
        let tmp = self.tmp_path();
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!(file = %self.path.display(), items = %items.len(), bytes = %json.len(), "snapshot_written");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
