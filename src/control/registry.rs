//! Shared control channel registry
//!
//! One live control socket per device, published by the owning streaming
//! session and consumed by independent call paths (device-command dispatch,
//! the bridge's keyframe nudge). The per-entry mutex is the single
//! synchronization point for writes; the generation counter gives
//! compare-and-clear semantics so a session tearing down cannot evict an
//! entry a concurrent restart already replaced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{GatewayError, Result};

type ControlWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A registered control socket write handle
pub struct ControlEntry {
    generation: u64,
    writer: Mutex<ControlWriter>,
    closed: AtomicBool,
}

impl ControlEntry {
    /// Send one encoded control message as a single write, holding the
    /// entry's lock for the duration.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::Connect("control channel is closed".into()));
        }

        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(payload).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            self.closed.store(true, Ordering::Release);
            return Err(GatewayError::Connect(format!(
                "control channel write failed: {}",
                e
            )));
        }
        trace!(bytes = payload.len(), "control message sent");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Registry of per-device control channels
#[derive(Default)]
pub struct ControlChannelRegistry {
    entries: parking_lot::Mutex<HashMap<String, Arc<ControlEntry>>>,
    next_generation: AtomicU64,
}

impl ControlChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly connected control socket for a device, replacing
    /// and closing any prior entry.
    pub async fn register(
        &self,
        device_id: &str,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Arc<ControlEntry> {
        let entry = Arc::new(ControlEntry {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            writer: Mutex::new(Box::new(writer)),
            closed: AtomicBool::new(false),
        });

        let previous = self
            .entries
            .lock()
            .insert(device_id.to_string(), entry.clone());

        if let Some(previous) = previous {
            debug!(device_id, "replacing stale control channel entry");
            previous.close().await;
        }

        debug!(device_id, generation = entry.generation, "control channel registered");
        entry
    }

    /// Return the live entry for a device, probing for a dead socket first.
    pub fn get(&self, device_id: &str) -> Option<Arc<ControlEntry>> {
        let mut entries = self.entries.lock();
        match entries.get(device_id) {
            Some(entry) if entry.is_closed() => {
                entries.remove(device_id);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    /// Remove a device's entry. With `expected` set, the removal only
    /// happens if the current entry is the same registration
    /// (compare-and-clear); the removed or expected socket is closed either
    /// way.
    pub async fn clear(&self, device_id: &str, expected: Option<&Arc<ControlEntry>>) {
        let removed = {
            let mut entries = self.entries.lock();
            match (entries.get(device_id), expected) {
                (Some(current), Some(expected))
                    if current.generation != expected.generation =>
                {
                    // A newer registration took the slot; leave it alone.
                    None
                }
                (Some(_), _) => entries.remove(device_id),
                (None, _) => None,
            }
        };

        if let Some(entry) = removed {
            debug!(device_id, generation = entry.generation, "control channel cleared");
            entry.close().await;
        } else if let Some(expected) = expected {
            // Still close the socket the caller owned.
            expected.close().await;
        }
    }

    /// Send an encoded control message to a device's live channel.
    pub async fn send(&self, device_id: &str, payload: &[u8]) -> Result<()> {
        let entry = self.get(device_id).ok_or_else(|| {
            GatewayError::NotFound(format!("no control channel for device {}", device_id))
        })?;
        entry.send(payload).await
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.get(device_id).is_some()
    }
}
