//! Streaming sessions: per-device lifecycle, configuration and media queues

pub mod config;
pub mod manager;
pub mod queue;
pub(crate) mod reader;
pub mod store;
pub mod streaming;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use config::{SessionConfig, SessionConfigPatch};
pub use manager::{GatewaySettings, SessionManager};
pub use queue::{AudioQueueSource, MediaKind, MediaPacket, MediaQueue, MediaSource, VideoQueueSource};
pub use store::SessionConfigStore;
pub use streaming::StreamingSession;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Error,
}

/// Read-only session snapshot, recomputed from the live session on each
/// query and never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub device_id: String,
    pub status: SessionState,
    pub config: SessionConfig,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub port: Option<u16>,
    pub scid: Option<String>,
}
