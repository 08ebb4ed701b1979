//! Streaming session: one device's agent process, port forward and channel
//! sockets
//!
//! The session is a small state machine (`stopped → starting → running |
//! error`) guarded by a per-session lock. `start` returns immediately; all
//! multi-second work (binary push, process spawn, socket connects, meta
//! read) happens in a supervisor task. Any failure during `starting`
//! releases every acquired resource before the status flips to `error`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adb::{self, Adb};
use crate::codec::{locate_codec_meta, AudioCodec, VideoCodec};
use crate::control::{message, ControlChannelRegistry, ControlEntry};
use crate::error::{GatewayError, Result};
use crate::session::config::SessionConfig;
use crate::session::manager::GatewaySettings;
use crate::session::queue::MediaQueue;
use crate::session::reader;
use crate::session::{SessionState, SessionStatus};

/// Delay between socket connect attempts while the agent comes up
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Video/audio queue depth; real-time streams never buffer more
const MEDIA_QUEUE_CAPACITY: usize = 2;

struct StateCell {
    status: SessionState,
    started_at: Option<chrono::DateTime<Utc>>,
    updated_at: chrono::DateTime<Utc>,
    last_error: Option<String>,
    port: Option<u16>,
    scid: Option<String>,
}

/// Live resources owned by one start cycle. A fresh runtime is built on
/// every `start`; nothing is reused after a failure.
struct SessionRuntime {
    cancel: CancellationToken,
    torn_down: AtomicBool,
    child: tokio::sync::Mutex<Option<Child>>,
    port: parking_lot::Mutex<Option<u16>>,
    forwarded: AtomicBool,
    control_entry: parking_lot::Mutex<Option<Arc<ControlEntry>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SessionRuntime {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
            child: tokio::sync::Mutex::new(None),
            port: parking_lot::Mutex::new(None),
            forwarded: AtomicBool::new(false),
            control_entry: parking_lot::Mutex::new(None),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

/// One device's streaming session, created lazily and reused across
/// start/stop/restart cycles.
pub struct StreamingSession {
    device_id: String,
    adb: Arc<Adb>,
    registry: Arc<ControlChannelRegistry>,
    settings: Arc<GatewaySettings>,
    config: parking_lot::Mutex<SessionConfig>,
    state: parking_lot::Mutex<StateCell>,
    /// Serializes start/stop/restart against each other
    lifecycle: tokio::sync::Mutex<()>,
    runtime: parking_lot::Mutex<Option<Arc<SessionRuntime>>>,
    video_queue: Arc<MediaQueue>,
    audio_queue: Arc<MediaQueue>,
    profile_tx: watch::Sender<Option<String>>,
    video_active: AtomicBool,
}

impl StreamingSession {
    pub(crate) fn new(
        device_id: String,
        config: SessionConfig,
        adb: Arc<Adb>,
        registry: Arc<ControlChannelRegistry>,
        settings: Arc<GatewaySettings>,
    ) -> Arc<Self> {
        let (profile_tx, _) = watch::channel(None);
        Arc::new(Self {
            device_id,
            adb,
            registry,
            settings,
            config: parking_lot::Mutex::new(config),
            state: parking_lot::Mutex::new(StateCell {
                status: SessionState::Stopped,
                started_at: None,
                updated_at: Utc::now(),
                last_error: None,
                port: None,
                scid: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            runtime: parking_lot::Mutex::new(None),
            video_queue: Arc::new(MediaQueue::new(MEDIA_QUEUE_CAPACITY)),
            audio_queue: Arc::new(MediaQueue::new(MEDIA_QUEUE_CAPACITY)),
            profile_tx,
            video_active: AtomicBool::new(false),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> SessionConfig {
        self.config.lock().clone()
    }

    /// Replace the session's config. The manager only calls this while the
    /// session is not running/starting; a live session keeps its config
    /// until the next start.
    pub(crate) fn apply_config(&self, config: SessionConfig) {
        *self.config.lock() = config;
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state.lock().status,
            SessionState::Running | SessionState::Starting
        )
    }

    pub fn is_video_active(&self) -> bool {
        self.video_active.load(Ordering::Acquire)
    }

    pub fn video_queue(&self) -> Arc<MediaQueue> {
        self.video_queue.clone()
    }

    pub fn audio_queue(&self) -> Arc<MediaQueue> {
        self.audio_queue.clone()
    }

    /// Watch for the device encoder profile observed from the first SPS.
    pub fn profile_watch(&self) -> watch::Receiver<Option<String>> {
        self.profile_tx.subscribe()
    }

    /// Read-only status snapshot; never blocks on I/O.
    pub fn status(&self) -> SessionStatus {
        let state = self.state.lock();
        self.snapshot_locked(&state)
    }

    fn snapshot_locked(&self, state: &StateCell) -> SessionStatus {
        SessionStatus {
            device_id: self.device_id.clone(),
            status: state.status,
            config: self.config.lock().clone(),
            started_at: state.started_at,
            updated_at: state.updated_at,
            last_error: state.last_error.clone(),
            port: state.port,
            scid: state.scid.clone(),
        }
    }

    /// Start the session. Idempotent while running or starting. Fails fast
    /// when the config enables no channel at all.
    pub async fn start(self: &Arc<Self>) -> Result<SessionStatus> {
        let _lifecycle = self.lifecycle.lock().await;

        {
            let state = self.state.lock();
            if matches!(state.status, SessionState::Running | SessionState::Starting) {
                return Ok(self.snapshot_locked(&state));
            }
        }

        let config = self.config.lock().clone();
        if !config.any_channel_enabled() {
            return Err(GatewayError::Config(format!(
                "session for {} has no channel enabled",
                self.device_id
            )));
        }

        self.video_queue.reset();
        self.audio_queue.reset();
        // Consumers must start on a clean IDR after every (re)start.
        self.video_queue.request_keyframe();
        self.profile_tx.send_replace(None);

        let scid = adb::generate_scid();
        {
            let mut state = self.state.lock();
            state.status = SessionState::Starting;
            state.started_at = Some(Utc::now());
            state.updated_at = Utc::now();
            state.last_error = None;
            state.port = None;
            state.scid = Some(scid.clone());
        }

        let runtime = Arc::new(SessionRuntime::new());
        *self.runtime.lock() = Some(runtime.clone());

        let session = self.clone();
        let supervisor_runtime = runtime.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = session
                .run_startup(supervisor_runtime.clone(), config, scid)
                .await
            {
                warn!(device_id = %session.device_id, error = %e, "session startup failed");
                session.fail(&supervisor_runtime, e).await;
            }
        });
        runtime.tasks.lock().push(handle);

        Ok(self.status())
    }

    /// Stop the session, joining every reader and releasing all owned
    /// resources. Safe to call on an already-stopped session.
    pub async fn stop(&self) -> Result<SessionStatus> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked().await;
        Ok(self.status())
    }

    /// Stop, optionally swap config, then start again.
    pub async fn restart(self: &Arc<Self>, config: Option<SessionConfig>) -> Result<SessionStatus> {
        {
            let _lifecycle = self.lifecycle.lock().await;
            self.stop_locked().await;
            if let Some(config) = config {
                *self.config.lock() = config;
            }
        }
        self.start().await
    }

    async fn stop_locked(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.cancel.cancel();
            let handles: Vec<JoinHandle<()>> = runtime.tasks.lock().drain(..).collect();
            for handle in handles {
                let _ = handle.await;
            }
            self.teardown(&runtime).await;
        }

        let mut state = self.state.lock();
        state.status = SessionState::Stopped;
        state.updated_at = Utc::now();
    }

    /// Mark the keyframe gate and nudge the device to restart its encoder
    /// so playback can resume from a fresh IDR.
    pub async fn request_keyframe(&self) {
        self.video_queue.request_keyframe();
        if let Some(entry) = self.registry.get(&self.device_id) {
            if let Err(e) = entry.send(&message::encode_reset_video()).await {
                debug!(device_id = %self.device_id, "keyframe nudge failed: {}", e);
            }
        }
    }

    async fn run_startup(
        self: &Arc<Self>,
        runtime: Arc<SessionRuntime>,
        config: SessionConfig,
        scid: String,
    ) -> Result<()> {
        tokio::select! {
            _ = runtime.cancel.cancelled() => return Ok(()),
            result = self.adb.push(
                &self.device_id,
                &self.settings.server_binary,
                &self.settings.server_remote_path,
            ) => result?,
        }

        let socket_name = adb::socket_name(&scid);
        let port = tokio::select! {
            _ = runtime.cancel.cancelled() => return Ok(()),
            result = self.establish_forward(&socket_name) => result?,
        };
        *runtime.port.lock() = Some(port);
        runtime.forwarded.store(true, Ordering::Release);
        self.state.lock().port = Some(port);

        let mut child = self.adb.spawn_server(
            &self.device_id,
            &self.settings.server_remote_path,
            &scid,
            &config,
        )?;
        adb::spawn_output_loggers(&mut child, &self.device_id);
        *runtime.child.lock().await = Some(child);

        // The agent accepts one connection per enabled channel, in a fixed
        // order: video, audio, control.
        if config.video {
            let mut stream = self.connect_channel(port, &runtime.cancel).await?;
            let (meta, leftover) = tokio::select! {
                _ = runtime.cancel.cancelled() => return Ok(()),
                result = locate_codec_meta(&mut stream) => result?,
            };
            if meta.codec != VideoCodec::H264 {
                return Err(GatewayError::Protocol(format!(
                    "unsupported video codec {}",
                    meta.codec
                )));
            }
            info!(
                device_id = %self.device_id,
                codec = meta.codec.name(),
                width = meta.width,
                height = meta.height,
                "video channel connected"
            );

            let queue = self.video_queue.clone();
            let profile_tx = self.profile_tx.clone();
            let cancel = runtime.cancel.clone();
            self.spawn_channel_task(
                &runtime,
                "video",
                reader::video_reader(stream, leftover, queue, profile_tx, cancel),
            );
        }

        if config.audio {
            let mut stream = self.connect_channel(port, &runtime.cancel).await?;
            let mut tag = [0u8; 4];
            tokio::select! {
                _ = runtime.cancel.cancelled() => return Ok(()),
                result = stream.read_exact(&mut tag) => {
                    result.map_err(|e| {
                        GatewayError::Connect(format!("audio channel read failed: {}", e))
                    })?;
                }
            }
            let codec = AudioCodec::from_tag(tag).ok_or_else(|| {
                GatewayError::Protocol(format!("unsupported audio codec tag {:02x?}", tag))
            })?;
            info!(device_id = %self.device_id, codec = codec.name(), "audio channel connected");

            let queue = self.audio_queue.clone();
            let cancel = runtime.cancel.clone();
            self.spawn_channel_task(
                &runtime,
                "audio",
                reader::audio_reader(stream, codec, queue, cancel),
            );
        }

        if config.control {
            let stream = self.connect_channel(port, &runtime.cancel).await?;
            let (read_half, write_half) = stream.into_split();
            let entry = self.registry.register(&self.device_id, write_half).await;
            *runtime.control_entry.lock() = Some(entry.clone());
            info!(device_id = %self.device_id, "control channel registered");

            if !config.video {
                self.video_active.store(true, Ordering::Release);
            }

            let registry = self.registry.clone();
            let device_id = self.device_id.clone();
            let cancel = runtime.cancel.clone();
            self.spawn_channel_task(
                &runtime,
                "control",
                reader::control_reader(read_half, registry, device_id, entry, cancel),
            );
        }

        if config.video {
            self.video_active.store(true, Ordering::Release);
        }

        {
            let mut state = self.state.lock();
            state.status = SessionState::Running;
            state.updated_at = Utc::now();
        }
        info!(device_id = %self.device_id, port, %scid, "session running");
        Ok(())
    }

    /// Forward a local port to the agent's socket. A configured fixed port
    /// is preferred; on forward failure it falls back exactly once to an
    /// OS-assigned ephemeral port.
    async fn establish_forward(&self, socket_name: &str) -> Result<u16> {
        if let Some(fixed) = self.settings.fixed_port {
            match self.adb.forward(&self.device_id, fixed, socket_name).await {
                Ok(()) => return Ok(fixed),
                Err(e) => warn!(
                    device_id = %self.device_id,
                    port = fixed,
                    "fixed port forward failed ({}), falling back to ephemeral port",
                    e
                ),
            }
        }

        let port = adb::allocate_ephemeral_port()?;
        self.adb.forward(&self.device_id, port, socket_name).await?;
        Ok(port)
    }

    /// Connect one channel socket, retrying with a fixed backoff until
    /// `connect_timeout` elapses.
    async fn connect_channel(&self, port: u16, cancel: &CancellationToken) -> Result<TcpStream> {
        let deadline = Instant::now() + self.settings.connect_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(GatewayError::Connect("session cancelled".into()));
            }
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(GatewayError::Connect(format!(
                            "could not connect to 127.0.0.1:{} within {:?}: {}",
                            port, self.settings.connect_timeout, e
                        )));
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(GatewayError::Connect("session cancelled".into()));
                }
                _ = tokio::time::sleep(CONNECT_RETRY_DELAY) => {}
            }
        }
    }

    fn spawn_channel_task(
        self: &Arc<Self>,
        runtime: &Arc<SessionRuntime>,
        channel: &'static str,
        fut: impl std::future::Future<Output = Result<()>> + Send + 'static,
    ) {
        let session = self.clone();
        let task_runtime = runtime.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = fut.await {
                warn!(
                    device_id = %session.device_id,
                    channel,
                    error = %e,
                    "channel reader failed"
                );
                session.fail(&task_runtime, e).await;
            }
        });
        runtime.tasks.lock().push(handle);
    }

    /// Record a failure: tear everything down, then flip to `error`. Only
    /// acts if `runtime` is still the session's current one, so stale tasks
    /// from a superseded start cycle cannot disturb a fresh session.
    async fn fail(&self, runtime: &Arc<SessionRuntime>, err: GatewayError) {
        let is_current = self
            .runtime
            .lock()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, runtime));
        if !is_current {
            return;
        }

        self.teardown(runtime).await;

        {
            let mut state = self.state.lock();
            if matches!(state.status, SessionState::Starting | SessionState::Running) {
                state.status = SessionState::Error;
                state.last_error = Some(err.to_string());
                state.updated_at = Utc::now();
            }
        }
        *self.runtime.lock() = None;
    }

    /// Release every resource owned by a runtime: agent process, port
    /// forward, registry entry, queues and the video-active flag. Runs at
    /// most once per runtime.
    async fn teardown(&self, runtime: &Arc<SessionRuntime>) {
        if runtime.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        runtime.cancel.cancel();

        if let Some(mut child) = runtime.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!(device_id = %self.device_id, "failed to kill device agent: {}", e);
            }
        }

        let port = *runtime.port.lock();
        if let Some(port) = port {
            if runtime.forwarded.load(Ordering::Acquire) {
                if let Err(e) = self.adb.remove_forward(&self.device_id, port).await {
                    debug!(device_id = %self.device_id, port, "forward removal failed: {}", e);
                }
            }
        }

        let entry = runtime.control_entry.lock().take();
        if let Some(entry) = entry {
            self.registry.clear(&self.device_id, Some(&entry)).await;
        }

        self.video_active.store(false, Ordering::Release);
        self.video_queue.close();
        self.audio_queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::config::SessionConfig;
    use std::time::Duration;

    fn test_settings(adb_path: &str) -> Arc<GatewaySettings> {
        Arc::new(GatewaySettings {
            adb_path: adb_path.into(),
            server_binary: "/nonexistent/agent.jar".into(),
            server_remote_path: "/data/local/tmp/agent.jar".to_string(),
            fixed_port: None,
            connect_timeout: Duration::from_millis(300),
        })
    }

    fn make_session(adb_path: &str, config: SessionConfig) -> Arc<StreamingSession> {
        let settings = test_settings(adb_path);
        StreamingSession::new(
            "emulator-5554".to_string(),
            config,
            Arc::new(Adb::new(&settings.adb_path)),
            Arc::new(ControlChannelRegistry::new()),
            settings,
        )
    }

    async fn wait_for_state(session: &Arc<StreamingSession>, wanted: SessionState) {
        for _ in 0..100 {
            if session.status().status == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "session never reached {:?}, stuck at {:?}",
            wanted,
            session.status().status
        );
    }

    #[tokio::test]
    async fn test_start_without_channels_fails_immediately() {
        let config = SessionConfig {
            video: false,
            audio: false,
            control: false,
            ..Default::default()
        };
        let session = make_session("/nonexistent/adb", config);

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
        // The guard fires before any process is spawned, so the session
        // never leaves stopped.
        assert_eq!(session.status().status, SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_on_never_started_session_is_noop() {
        let session = make_session("/nonexistent/adb", SessionConfig::default());
        let status = session.stop().await.unwrap();
        assert_eq!(status.status, SessionState::Stopped);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_startup_failure_reaches_error_state() {
        let session = make_session("/nonexistent/adb", SessionConfig::default());

        let status = session.start().await.unwrap();
        assert_eq!(status.status, SessionState::Starting);
        assert!(status.scid.is_some());

        wait_for_state(&session, SessionState::Error).await;
        let status = session.status();
        assert!(status.last_error.is_some());
        assert!(!session.is_video_active());
    }

    #[tokio::test]
    async fn test_restart_on_stopped_behaves_like_start() {
        let session = make_session("/nonexistent/adb", SessionConfig::default());

        let status = session.restart(None).await.unwrap();
        assert_eq!(status.status, SessionState::Starting);
        wait_for_state(&session, SessionState::Error).await;

        // A later start attempts a full clean reinitialization.
        let status = session.start().await.unwrap();
        assert_eq!(status.status, SessionState::Starting);
        assert!(status.last_error.is_none());
        wait_for_state(&session, SessionState::Error).await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_starting() {
        // A stub adb that hangs keeps the session in `starting`.
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("adb");
        std::fs::write(&stub, "#!/bin/sh\nsleep 10\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let session = make_session(stub.to_str().unwrap(), SessionConfig::default());
        let first = session.start().await.unwrap();
        assert_eq!(first.status, SessionState::Starting);
        let scid = first.scid.clone();

        let second = session.start().await.unwrap();
        assert_eq!(second.status, SessionState::Starting);
        assert_eq!(second.scid, scid);

        let stopped = session.stop().await.unwrap();
        assert_eq!(stopped.status, SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_while_starting_returns_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("adb");
        std::fs::write(&stub, "#!/bin/sh\nsleep 10\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let session = make_session(stub.to_str().unwrap(), SessionConfig::default());
        session.start().await.unwrap();
        let status = session.stop().await.unwrap();
        assert_eq!(status.status, SessionState::Stopped);
    }
}
