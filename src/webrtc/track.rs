//! Queue-backed WebRTC media tracks
//!
//! Each track pulls packets from a session's bounded queue through the
//! `MediaSource` trait and feeds them to a `TrackLocalStaticSample`, which
//! handles RTP packetization. H264 frames are split into NALUs and written
//! without start codes, one sample per NALU.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::codec::{nalu_type, split_annex_b_nalus};
use crate::session::{MediaPacket, MediaSource};

/// H264 RTP clock rate (RFC 6184)
pub const H264_CLOCK_RATE: u32 = 90_000;

/// Stream id shared by a device's tracks
const STREAM_ID: &str = "droidgate-stream";

/// Fallback frame duration when a pts delta is unusable
const DEFAULT_VIDEO_FRAME_DURATION: Duration = Duration::from_millis(33);

/// Opus/PCM frames are batched at 20 ms
const AUDIO_FRAME_DURATION: Duration = Duration::from_millis(20);

/// Video track negotiated for one peer connection
pub struct QueueVideoTrack {
    track: Arc<TrackLocalStaticSample>,
}

/// RTP capability for the negotiated H264 profile
pub fn h264_capability(profile_level_id: &str) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_H264.to_owned(),
        clock_rate: H264_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: format!(
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id={}",
            profile_level_id
        ),
        rtcp_feedback: vec![],
    }
}

/// RTP capability for the Opus audio track
pub fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48_000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

impl QueueVideoTrack {
    pub fn new(profile_level_id: &str) -> Self {
        Self {
            track: Arc::new(TrackLocalStaticSample::new(
                h264_capability(profile_level_id),
                "video0".to_string(),
                STREAM_ID.to_string(),
            )),
        }
    }

    pub fn track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Drive the track from a media source until it ends or the token is
    /// cancelled.
    pub fn spawn_writer(&self, source: Arc<dyn MediaSource>, cancel: CancellationToken) {
        let track = self.track.clone();
        tokio::spawn(async move {
            info!("video track writer started");
            let mut last_pts: Option<u64> = None;
            loop {
                let packet = tokio::select! {
                    _ = cancel.cancelled() => break,
                    packet = source.next() => match packet {
                        Some(packet) => packet,
                        None => break,
                    },
                };

                let duration = frame_duration(&mut last_pts, &packet);
                if let Err(e) = write_video_frame(&track, &packet, duration).await {
                    // No peer attached yet is routine; keep draining.
                    trace!("video sample write failed: {}", e);
                }
            }
            info!("video track writer stopped");
        });
    }
}

fn frame_duration(last_pts: &mut Option<u64>, packet: &MediaPacket) -> Duration {
    let duration = match *last_pts {
        Some(last) if packet.pts > last => {
            let micros = packet.pts - last;
            if micros > 500_000 {
                DEFAULT_VIDEO_FRAME_DURATION
            } else {
                Duration::from_micros(micros)
            }
        }
        _ => DEFAULT_VIDEO_FRAME_DURATION,
    };
    *last_pts = Some(packet.pts);
    duration
}

/// Write one AnnexB frame as per-NALU samples. All NALUs of an access unit
/// share a timestamp, so only the last write advances the clock.
async fn write_video_frame(
    track: &TrackLocalStaticSample,
    packet: &MediaPacket,
    duration: Duration,
) -> webrtc::error::Result<()> {
    let nalus: Vec<Bytes> = split_annex_b_nalus(&packet.data)
        .into_iter()
        .filter_map(|nalu| {
            let nal_type = nalu_type(&nalu)?;
            // Access unit delimiters (9) and filler (12) are useless over RTP.
            if nal_type == 9 || nal_type == 12 {
                return None;
            }
            Some(strip_start_code(nalu))
        })
        .filter(|nalu| !nalu.is_empty())
        .collect();

    let count = nalus.len();
    for (index, data) in nalus.into_iter().enumerate() {
        let sample_duration = if index + 1 == count {
            duration
        } else {
            Duration::ZERO
        };
        track
            .write_sample(&Sample {
                data,
                duration: sample_duration,
                ..Default::default()
            })
            .await?;
    }
    Ok(())
}

fn strip_start_code(nalu: Bytes) -> Bytes {
    if nalu.starts_with(&[0, 0, 0, 1]) {
        nalu.slice(4..)
    } else if nalu.starts_with(&[0, 0, 1]) {
        nalu.slice(3..)
    } else {
        nalu
    }
}

/// Opus audio track negotiated for one peer connection
pub struct QueueAudioTrack {
    track: Arc<TrackLocalStaticSample>,
}

impl QueueAudioTrack {
    pub fn new() -> Self {
        Self {
            track: Arc::new(TrackLocalStaticSample::new(
                opus_capability(),
                "audio0".to_string(),
                STREAM_ID.to_string(),
            )),
        }
    }

    pub fn track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    pub fn spawn_writer(&self, source: Arc<dyn MediaSource>, cancel: CancellationToken) {
        let track = self.track.clone();
        tokio::spawn(async move {
            debug!("audio track writer started");
            loop {
                let packet = tokio::select! {
                    _ = cancel.cancelled() => break,
                    packet = source.next() => match packet {
                        Some(packet) => packet,
                        None => break,
                    },
                };

                let sample = Sample {
                    data: packet.data.clone(),
                    duration: AUDIO_FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    trace!("audio sample write failed: {}", e);
                }
            }
            debug!("audio track writer stopped");
        });
    }
}

impl Default for QueueAudioTrack {
    fn default() -> Self {
        Self::new()
    }
}
