//! Bounded real-time media queues
//!
//! Each media channel feeds one bounded queue. Video is lossy and
//! real-time: a full queue drops its oldest packet to admit a new one.
//! While the "need keyframe" flag is set, non-keyframe inserts are refused
//! outright so a newly connected consumer never starts mid-GOP; the flag
//! clears atomically with the first keyframe queued after it was raised.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// One decoded media packet as read off the wire
#[derive(Debug, Clone)]
pub struct MediaPacket {
    /// AnnexB video frame or one encoded/batched audio frame
    pub data: Bytes,
    /// Presentation timestamp in microseconds
    pub pts: u64,
    /// Packet can start a decode (IDR for video)
    pub keyframe: bool,
}

/// Result of a queue insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Inserted without displacing anything
    Queued,
    /// Inserted after evicting the oldest packet
    Evicted,
    /// Rejected while waiting for a keyframe
    Refused,
}

struct QueueState {
    packets: VecDeque<MediaPacket>,
    need_keyframe: bool,
    closed: bool,
}

/// Bounded drop-oldest packet queue
pub struct MediaQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

impl MediaQueue {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity >= 1);
        Self {
            state: Mutex::new(QueueState {
                packets: VecDeque::with_capacity(capacity),
                need_keyframe: false,
                closed: false,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Insert a packet, applying keyframe gating and drop-oldest
    /// backpressure.
    pub fn push(&self, packet: MediaPacket) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Refused;
            }
            if state.need_keyframe {
                if !packet.keyframe {
                    return PushOutcome::Refused;
                }
                state.need_keyframe = false;
            }

            let outcome = if state.packets.len() >= self.capacity {
                state.packets.pop_front();
                PushOutcome::Evicted
            } else {
                PushOutcome::Queued
            };
            state.packets.push_back(packet);
            outcome
        };

        self.notify.notify_one();
        outcome
    }

    /// Pop the oldest packet, waiting until one is available. Returns
    /// `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<MediaPacket> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(packet) = state.packets.pop_front() {
                    return Some(packet);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<MediaPacket> {
        self.state.lock().packets.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raise the "need keyframe" flag; inserts are refused until the next
    /// keyframe packet arrives.
    pub fn request_keyframe(&self) {
        self.state.lock().need_keyframe = true;
    }

    pub fn needs_keyframe(&self) -> bool {
        self.state.lock().need_keyframe
    }

    /// Close the queue: pending packets stay poppable, new inserts are
    /// refused, and blocked consumers wake with `None` once drained.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Reopen and empty the queue for a fresh session start.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.packets.clear();
        state.need_keyframe = false;
        state.closed = false;
    }
}

/// Media channel kind, used by the bridge to label tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// A blocking source of media packets; the peer-connection layer depends
/// only on this trait.
#[async_trait]
pub trait MediaSource: Send + Sync {
    fn kind(&self) -> MediaKind;

    /// Next packet in wire order, or `None` when the stream ended.
    async fn next(&self) -> Option<MediaPacket>;
}

/// Video packets drawn from a session's video queue
pub struct VideoQueueSource(pub Arc<MediaQueue>);

#[async_trait]
impl MediaSource for VideoQueueSource {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    async fn next(&self) -> Option<MediaPacket> {
        self.0.pop().await
    }
}

/// Audio packets drawn from a session's audio queue
pub struct AudioQueueSource(pub Arc<MediaQueue>);

#[async_trait]
impl MediaSource for AudioQueueSource {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    async fn next(&self) -> Option<MediaPacket> {
        self.0.pop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pts: u64, keyframe: bool) -> MediaPacket {
        MediaPacket {
            data: Bytes::from_static(&[0u8; 4]),
            pts,
            keyframe,
        }
    }

    #[test]
    fn test_drop_oldest_backpressure() {
        let queue = MediaQueue::new(2);
        assert_eq!(queue.push(packet(1, false)), PushOutcome::Queued);
        assert_eq!(queue.push(packet(2, false)), PushOutcome::Queued);
        assert_eq!(queue.push(packet(3, false)), PushOutcome::Evicted);

        assert_eq!(queue.try_pop().unwrap().pts, 2);
        assert_eq!(queue.try_pop().unwrap().pts, 3);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_keyframe_gate_refuses_until_idr() {
        let queue = MediaQueue::new(2);
        queue.push(packet(1, false));
        queue.push(packet(2, false));

        queue.request_keyframe();
        assert_eq!(queue.push(packet(3, false)), PushOutcome::Refused);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().unwrap().pts, 1);

        // The first keyframe clears the flag and is admitted.
        assert_eq!(queue.push(packet(4, true)), PushOutcome::Queued);
        assert!(!queue.needs_keyframe());

        // Normal drop-oldest behavior resumes afterwards.
        assert_eq!(queue.push(packet(5, false)), PushOutcome::Evicted);
    }

    #[test]
    fn test_keyframe_gate_refuses_when_full() {
        let queue = MediaQueue::new(2);
        queue.push(packet(1, false));
        queue.push(packet(2, false));
        queue.request_keyframe();

        assert_eq!(queue.push(packet(3, false)), PushOutcome::Refused);
        assert_eq!(queue.len(), 2);
        // Keyframe still gets in, evicting the oldest.
        assert_eq!(queue.push(packet(4, true)), PushOutcome::Evicted);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(MediaQueue::new(2));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.push(packet(7, true));

        let got = consumer.await.unwrap().unwrap();
        assert_eq!(got.pts, 7);
    }

    #[tokio::test]
    async fn test_close_wakes_consumer() {
        let queue = Arc::new(MediaQueue::new(2));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.close();
        assert!(consumer.await.unwrap().is_none());

        assert_eq!(queue.push(packet(1, true)), PushOutcome::Refused);
        queue.reset();
        assert_eq!(queue.push(packet(1, true)), PushOutcome::Queued);
    }

    #[tokio::test]
    async fn test_media_source_wrappers() {
        let queue = Arc::new(MediaQueue::new(2));
        queue.push(packet(9, true));

        let video = VideoQueueSource(queue.clone());
        assert_eq!(video.kind(), MediaKind::Video);
        assert_eq!(video.next().await.unwrap().pts, 9);

        let audio = AudioQueueSource(queue);
        assert_eq!(audio.kind(), MediaKind::Audio);
    }
}
