//! Persisted per-device session configuration
//!
//! One JSON object keyed by device id, read in full at startup and rewritten
//! atomically (temp file + rename) on every change. Reads go through an
//! `ArcSwap` cache so hot paths never touch the filesystem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::config::SessionConfig;
use crate::error::Result;

type ConfigMap = HashMap<String, SessionConfig>;

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub device_id: String,
}

/// JSON-file-backed store of per-device session configs
pub struct SessionConfigStore {
    path: PathBuf,
    cache: ArcSwap<ConfigMap>,
    change_tx: broadcast::Sender<ConfigChange>,
}

impl SessionConfigStore {
    /// Open (or create) the store at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let map: ConfigMap = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(path = %path.display(), devices = map.len(), "session config store loaded");
        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path,
            cache: ArcSwap::from_pointee(map),
            change_tx,
        })
    }

    /// Config for a device, falling back to defaults for unknown devices.
    pub fn get(&self, device_id: &str) -> SessionConfig {
        self.cache
            .load()
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.cache.load().contains_key(device_id)
    }

    /// All persisted configs.
    pub fn all(&self) -> ConfigMap {
        (**self.cache.load()).clone()
    }

    /// Persist a device's config, then publish it to the cache and notify
    /// subscribers.
    pub async fn set(&self, device_id: &str, config: SessionConfig) -> Result<()> {
        let mut map = (**self.cache.load()).clone();
        map.insert(device_id.to_string(), config);

        self.persist(&map).await?;
        self.cache.store(Arc::new(map));

        let _ = self.change_tx.send(ConfigChange {
            device_id: device_id.to_string(),
        });
        debug!(device_id, "session config persisted");
        Ok(())
    }

    /// Atomic rewrite: serialize to a sibling temp file, then rename over
    /// the store path.
    async fn persist(&self, map: &ConfigMap) -> Result<()> {
        let json = serde_json::to_vec_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Subscribe to configuration changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_store_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let store = SessionConfigStore::open(&path).await.unwrap();
        assert_eq!(store.get("emulator-5554"), SessionConfig::default());

        let mut config = SessionConfig::default();
        config.audio = true;
        config.max_size = 1280;
        store.set("emulator-5554", config.clone()).await.unwrap();

        // A fresh store instance must see the persisted value.
        let store2 = SessionConfigStore::open(&path).await.unwrap();
        assert_eq!(store2.get("emulator-5554"), config);
        assert!(store2.contains("emulator-5554"));
        assert!(!store2.contains("other-device"));
    }

    #[tokio::test]
    async fn test_rewrite_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = SessionConfigStore::open(&path).await.unwrap();

        store
            .set("device-a", SessionConfig::default())
            .await
            .unwrap();
        store
            .set("device-b", SessionConfig::default())
            .await
            .unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(store.all().len(), 2);
    }

    #[tokio::test]
    async fn test_change_notification() {
        let dir = tempdir().unwrap();
        let store = SessionConfigStore::open(dir.path().join("sessions.json"))
            .await
            .unwrap();
        let mut rx = store.subscribe();

        store
            .set("device-a", SessionConfig::default())
            .await
            .unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.device_id, "device-a");
    }
}
