//! WebRTC bridge for low-latency device mirroring
//!
//! Re-publishes a streaming session's demultiplexed video (and optionally
//! audio) as WebRTC media tracks:
//!
//! ```text
//! Device agent (H264 / Opus / PCM)
//!        |
//!        v
//! StreamingSession readers -> bounded MediaQueues
//!        |
//!        v
//! Queue-backed tracks (TrackLocalStaticSample)
//!        |
//!        v
//! RTCPeerConnection <---- SDP offer/answer ----> remote peer
//! ```

pub mod bridge;
pub mod track;

pub use bridge::WebRtcBridge;
pub use track::{QueueAudioTrack, QueueVideoTrack};
