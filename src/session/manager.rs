//! Session manager: per-device session registry and persisted configuration
//!
//! One `StreamingSession` per device id, created lazily and never removed
//! while the manager lives. Config changes always persist; they apply to
//! the live session object only while it is not running/starting, otherwise
//! they take effect on the next explicit start/restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::adb::Adb;
use crate::control::ControlChannelRegistry;
use crate::error::Result;
use crate::session::config::{SessionConfig, SessionConfigPatch};
use crate::session::store::SessionConfigStore;
use crate::session::streaming::StreamingSession;
use crate::session::{SessionState, SessionStatus};

/// Process-wide gateway settings shared by every session
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// adb binary to drive devices with
    pub adb_path: PathBuf,
    /// Local path of the device-side agent binary
    pub server_binary: PathBuf,
    /// Where the agent binary is pushed on the device
    pub server_remote_path: String,
    /// Preferred local forward port; an ephemeral port is used when unset
    /// or when forwarding this port fails
    pub fixed_port: Option<u16>,
    /// Per-socket connect budget while the agent comes up
    pub connect_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            adb_path: "adb".into(),
            server_binary: "droidgate-server.jar".into(),
            server_remote_path: "/data/local/tmp/droidgate-server.jar".to_string(),
            fixed_port: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Registry of streaming sessions plus the persisted per-device config map
pub struct SessionManager {
    settings: Arc<GatewaySettings>,
    adb: Arc<Adb>,
    registry: Arc<ControlChannelRegistry>,
    store: SessionConfigStore,
    sessions: parking_lot::RwLock<HashMap<String, Arc<StreamingSession>>>,
}

impl SessionManager {
    /// Build a manager with its config store under `data_dir`.
    pub async fn new(data_dir: &Path, settings: GatewaySettings) -> Result<Arc<Self>> {
        let store = SessionConfigStore::open(data_dir.join("sessions.json")).await?;
        let adb = Arc::new(Adb::new(&settings.adb_path));

        Ok(Arc::new(Self {
            settings: Arc::new(settings),
            adb,
            registry: Arc::new(ControlChannelRegistry::new()),
            store,
            sessions: parking_lot::RwLock::new(HashMap::new()),
        }))
    }

    /// The shared control channel registry, for device-command dispatchers.
    pub fn registry(&self) -> Arc<ControlChannelRegistry> {
        self.registry.clone()
    }

    /// The live session for a device, if one was ever created.
    pub fn session(&self, device_id: &str) -> Option<Arc<StreamingSession>> {
        self.sessions.read().get(device_id).cloned()
    }

    fn get_or_create(&self, device_id: &str) -> Arc<StreamingSession> {
        if let Some(session) = self.sessions.read().get(device_id) {
            return session.clone();
        }

        let mut sessions = self.sessions.write();
        sessions
            .entry(device_id.to_string())
            .or_insert_with(|| {
                StreamingSession::new(
                    device_id.to_string(),
                    self.store.get(device_id),
                    self.adb.clone(),
                    self.registry.clone(),
                    self.settings.clone(),
                )
            })
            .clone()
    }

    /// Status of every known session.
    pub fn list_sessions(&self) -> Vec<SessionStatus> {
        self.sessions
            .read()
            .values()
            .map(|session| session.status())
            .collect()
    }

    /// Status for one device. Devices without a live session report as
    /// stopped with their persisted config.
    pub fn get_session(&self, device_id: &str) -> SessionStatus {
        if let Some(session) = self.session(device_id) {
            return session.status();
        }
        SessionStatus {
            device_id: device_id.to_string(),
            status: SessionState::Stopped,
            config: self.store.get(device_id),
            started_at: None,
            updated_at: chrono::Utc::now(),
            last_error: None,
            port: None,
            scid: None,
        }
    }

    /// Start a device's session, optionally applying a config patch first.
    /// The patch always persists; it reaches the live session only when the
    /// session is not already running/starting.
    pub async fn start(
        &self,
        device_id: &str,
        patch: Option<SessionConfigPatch>,
    ) -> Result<SessionStatus> {
        let session = self.get_or_create(device_id);

        let config = match patch {
            Some(patch) => {
                let merged = self.store.get(device_id).merged(&patch);
                self.store.set(device_id, merged.clone()).await?;
                merged
            }
            None => self.store.get(device_id),
        };
        if !session.is_active() {
            session.apply_config(config);
        }

        session.start().await
    }

    /// Stop a device's session; a no-op for unknown or stopped devices.
    pub async fn stop(&self, device_id: &str) -> Result<SessionStatus> {
        match self.session(device_id) {
            Some(session) => session.stop().await,
            None => Ok(self.get_session(device_id)),
        }
    }

    /// Restart a device's session, optionally with new config.
    pub async fn restart(
        &self,
        device_id: &str,
        patch: Option<SessionConfigPatch>,
    ) -> Result<SessionStatus> {
        let session = self.get_or_create(device_id);

        let config = match patch {
            Some(patch) => {
                let merged = self.store.get(device_id).merged(&patch);
                self.store.set(device_id, merged.clone()).await?;
                Some(merged)
            }
            None => None,
        };

        session.restart(config).await
    }

    /// Persist a config change. A running/starting session keeps its
    /// current config until the next explicit start or restart.
    pub async fn set_config(
        &self,
        device_id: &str,
        patch: SessionConfigPatch,
    ) -> Result<SessionStatus> {
        let merged = self.store.get(device_id).merged(&patch);
        self.store.set(device_id, merged.clone()).await?;

        if let Some(session) = self.session(device_id) {
            if !session.is_active() {
                session.apply_config(merged);
            }
        }

        Ok(self.get_session(device_id))
    }

    /// Whether the device's video pipeline is live, for command dispatchers
    /// deciding between protocol injection and their fallback path.
    pub fn is_video_active(&self, device_id: &str) -> bool {
        self.session(device_id)
            .map(|session| session.is_video_active())
            .unwrap_or(false)
    }

    /// Stop every session at process shutdown. Sessions stay registered so
    /// a later start reuses them.
    pub async fn stop_all(&self) {
        let sessions: Vec<Arc<StreamingSession>> =
            self.sessions.read().values().cloned().collect();
        info!(count = sessions.len(), "stopping all sessions");
        for session in sessions {
            let _ = session.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use tempfile::tempdir;

    fn test_settings() -> GatewaySettings {
        GatewaySettings {
            adb_path: "/nonexistent/adb".into(),
            server_binary: "/nonexistent/agent.jar".into(),
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_without_channels_fails() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(dir.path(), test_settings())
            .await
            .unwrap();

        let patch = SessionConfigPatch {
            video: Some(false),
            audio: Some(false),
            control: Some(false),
            ..Default::default()
        };
        let err = manager.start("emulator-5554", Some(patch)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[tokio::test]
    async fn test_get_session_synthesizes_stopped_status() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(dir.path(), test_settings())
            .await
            .unwrap();

        let status = manager.get_session("never-seen");
        assert_eq!(status.status, SessionState::Stopped);
        assert_eq!(status.config, SessionConfig::default());
        assert!(status.scid.is_none());
    }

    #[tokio::test]
    async fn test_set_config_persists_across_manager_instances() {
        let dir = tempdir().unwrap();
        {
            let manager = SessionManager::new(dir.path(), test_settings())
                .await
                .unwrap();
            let patch = SessionConfigPatch {
                max_size: Some(1280),
                audio: Some(true),
                ..Default::default()
            };
            let status = manager.set_config("emulator-5554", patch).await.unwrap();
            assert_eq!(status.config.max_size, 1280);
        }

        let manager = SessionManager::new(dir.path(), test_settings())
            .await
            .unwrap();
        let status = manager.get_session("emulator-5554");
        assert_eq!(status.config.max_size, 1280);
        assert!(status.config.audio);
    }

    #[tokio::test]
    async fn test_sessions_are_reused_per_device() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(dir.path(), test_settings())
            .await
            .unwrap();

        let first = manager.get_or_create("device-a");
        let second = manager.get_or_create("device-a");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.list_sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_unknown_device_is_noop() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(dir.path(), test_settings())
            .await
            .unwrap();

        let status = manager.stop("ghost").await.unwrap();
        assert_eq!(status.status, SessionState::Stopped);
        assert!(manager.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_stop_all_leaves_sessions_registered() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(dir.path(), test_settings())
            .await
            .unwrap();

        let _ = manager.start("device-a", None).await.unwrap();
        manager.stop_all().await;
        assert_eq!(manager.list_sessions().len(), 1);
        assert!(!manager.is_video_active("device-a"));
    }
}
