//! Persistent plugin registry.
//!
//! Records live in `registry/plugins.json` under the data home. Every
//! mutation is serialised by a writer lock file and lands via the
//! two-phase temp-file + atomic-rename discipline, so a crash mid-write
//! can never leave a partial registry; readers always observe either
//! the old or the new snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{ErrorCode, PortunixError, Result};
use crate::fsutil;
use crate::lockfile::LockFile;
use crate::plugins::manifest::PluginCapability;
use crate::plugins::sandbox::PermissionSet;

// ═══════════════════════════════════════════════════════════════════════════════
// Plugin Record
// ═══════════════════════════════════════════════════════════════════════════════

/// Persistent metadata describing an installed plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRecord {
    /// Unique plugin id.
    pub id: String,
    /// Installed semver.
    pub version: semver::Version,
    /// Host API version the plugin targets.
    pub api_version: String,
    /// Absolute path of the installed plugin binary.
    pub binary_path: PathBuf,
    /// SHA-256 of the binary recorded at install time.
    pub binary_sha256: String,
    /// Capabilities declared by the manifest.
    pub capabilities: Vec<PluginCapability>,
    /// Environment overrides for the plugin process.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Granted permissions; immutable after install.
    pub permissions: PermissionSet,
    /// Whether the plugin may be started.
    pub enabled: bool,
    /// Install timestamp.
    pub installed_at: DateTime<Utc>,
}

/// On-disk registry document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    /// Format version for future migrations.
    #[serde(default = "default_format")]
    format: u32,
    /// Records keyed by plugin id.
    #[serde(default)]
    plugins: BTreeMap<String, PluginRecord>,
}

fn default_format() -> u32 {
    1
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry Store
// ═══════════════════════════════════════════════════════════════════════════════

/// The registry store owns PluginRecord persistence; every component
/// else refers to plugins by id only.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    file: PathBuf,
    records: Arc<RwLock<BTreeMap<String, PluginRecord>>>,
}

impl RegistryStore {
    /// Open the registry at `file`, loading any existing document.
    pub fn open(file: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();
        let records = if file.exists() {
            let bytes = std::fs::read(&file)?;
            let doc: RegistryDocument = serde_json::from_slice(&bytes)?;
            doc.plugins
        } else {
            BTreeMap::new()
        };
        debug!(file = %file.display(), count = records.len(), "registry loaded");
        Ok(Self {
            file,
            records: Arc::new(RwLock::new(records)),
        })
    }

    /// Snapshot all records, sorted by id.
    pub async fn list(&self) -> Vec<PluginRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Get a single record by id.
    pub async fn get(&self, id: &str) -> Result<PluginRecord> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PortunixError::plugin_not_found(id))
    }

    /// Whether a record exists.
    pub async fn contains(&self, id: &str) -> bool {
        self.records.read().await.contains_key(id)
    }

    /// Insert a new record. Fails on duplicate id.
    pub async fn insert(&self, record: PluginRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(PortunixError::new(
                ErrorCode::PluginAlreadyInstalled,
                format!("plugin already installed: {}", record.id),
            )
            .with_hint("uninstall the existing plugin first, or bump the id"));
        }
        let id = record.id.clone();
        records.insert(id.clone(), record);
        self.persist(&records)?;
        info!(plugin = %id, "plugin record created");
        Ok(())
    }

    /// Remove a record by id, returning it.
    pub async fn remove(&self, id: &str) -> Result<PluginRecord> {
        let mut records = self.records.write().await;
        let record = records
            .remove(id)
            .ok_or_else(|| PortunixError::plugin_not_found(id))?;
        if let Err(err) = self.persist(&records) {
            // Leave no partial state: restore the in-memory map to
            // match the still-on-disk document.
            records.insert(record.id.clone(), record);
            return Err(err);
        }
        info!(plugin = id, "plugin record removed");
        Ok(record)
    }

    /// Flip the enabled flag.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<PluginRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| PortunixError::plugin_not_found(id))?;
        let previous = record.enabled;
        record.enabled = enabled;
        let updated = record.clone();
        if let Err(err) = self.persist(&records) {
            if let Some(record) = records.get_mut(id) {
                record.enabled = previous;
            }
            return Err(err);
        }
        info!(plugin = id, enabled, "plugin record updated");
        Ok(updated)
    }

    /// Path of the registry file (for diagnostics).
    pub fn file(&self) -> &Path {
        &self.file
    }

    fn persist(&self, records: &BTreeMap<String, PluginRecord>) -> Result<()> {
        let _writer = LockFile::acquire(&writer_lock_path(&self.file), "registry write")?;
        let doc = RegistryDocument {
            format: default_format(),
            plugins: records.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        fsutil::atomic_write(&self.file, &bytes)
    }
}

fn writer_lock_path(file: &Path) -> PathBuf {
    let mut name = file.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    file.with_file_name(name)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str) -> PluginRecord {
        PluginRecord {
            id: id.to_string(),
            version: semver::Version::new(1, 0, 0),
            api_version: "1.0".to_string(),
            binary_path: PathBuf::from("/data/plugins").join(id).join("bin").join(id),
            binary_sha256: "00".repeat(32),
            capabilities: vec![PluginCapability::Diagnostics],
            environment: BTreeMap::new(),
            permissions: PermissionSet::default(),
            enabled: false,
            installed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_persists_and_reloads() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("registry/plugins.json");

        let store = RegistryStore::open(&file).unwrap();
        store.insert(record("p1")).await.unwrap();

        // A fresh store sees the persisted record.
        let reopened = RegistryStore::open(&file).unwrap();
        let loaded = reopened.get("p1").await.unwrap();
        assert_eq!(loaded.version, semver::Version::new(1, 0, 0));
        assert!(!loaded.enabled);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = RegistryStore::open(tmp.path().join("plugins.json")).unwrap();
        store.insert(record("p1")).await.unwrap();
        let err = store.insert(record("p1")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PluginAlreadyInstalled);
    }

    #[tokio::test]
    async fn test_enable_disable_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = RegistryStore::open(tmp.path().join("plugins.json")).unwrap();
        store.insert(record("p1")).await.unwrap();

        store.set_enabled("p1", true).await.unwrap();
        store.set_enabled("p1", false).await.unwrap();
        let rec = store.set_enabled("p1", true).await.unwrap();
        assert!(rec.enabled);
    }

    #[tokio::test]
    async fn test_remove_unknown_id() {
        let tmp = TempDir::new().unwrap();
        let store = RegistryStore::open(tmp.path().join("plugins.json")).unwrap();
        let err = store.remove("ghost").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PluginNotFound);
    }

    #[tokio::test]
    async fn test_no_partial_file_visible() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("plugins.json");
        let store = RegistryStore::open(&file).unwrap();
        store.insert(record("p1")).await.unwrap();
        store.insert(record("p2")).await.unwrap();

        // The on-disk document always parses.
        let doc: RegistryDocument =
            serde_json::from_slice(&std::fs::read(&file).unwrap()).unwrap();
        assert_eq!(doc.plugins.len(), 2);
        // And no temp or lock residue remains after the writes.
        assert!(!writer_lock_path(&file).exists());
    }
}
