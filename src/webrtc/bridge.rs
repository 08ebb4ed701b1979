//! WebRTC bridge: peer negotiation against live streaming sessions
//!
//! Negotiation matches the device's observed encoder profile against the
//! remote offer, registers the winning H264 profile (plus its paired RTX
//! codec) on a fresh media engine at a dynamically allocated payload type,
//! attaches queue-backed tracks and returns the local answer. One peer
//! connection is kept per device; renegotiating a device replaces and
//! closes the previous peer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};

use crate::codec::{choose_profile, profiles_from_offer};
use crate::error::{GatewayError, Result};
use crate::session::{
    AudioQueueSource, SessionManager, StreamingSession, VideoQueueSource,
};
use crate::webrtc::track::{h264_capability, opus_capability, QueueAudioTrack, QueueVideoTrack};

/// How long negotiation waits for the device profile to be observed
const PROFILE_WAIT: Duration = Duration::from_secs(3);

/// How long to wait for ICE gathering before answering with what we have
const GATHER_WAIT: Duration = Duration::from_secs(3);

/// Dynamic RTP payload type range probed for a free adjacent pair
const DYNAMIC_PAYLOAD_RANGE: std::ops::RangeInclusive<u8> = 96..=126;

struct PeerHandle {
    pc: Arc<RTCPeerConnection>,
    cancel: CancellationToken,
}

/// Bridge between streaming sessions and WebRTC peers
pub struct WebRtcBridge {
    manager: Arc<SessionManager>,
    peers: tokio::sync::Mutex<HashMap<String, PeerHandle>>,
}

impl WebRtcBridge {
    pub fn new(manager: Arc<SessionManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            peers: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Negotiate a peer connection for a device against a remote offer and
    /// return the local answer SDP. No partial answer is ever returned: any
    /// failure closes the half-built peer first.
    pub async fn negotiate(&self, device_id: &str, offer_sdp: &str) -> Result<String> {
        let candidates = profiles_from_offer(offer_sdp);
        if !candidates.iter().any(|c| c.is_packetization_mode_1()) {
            return Err(GatewayError::Negotiation(
                "offer contains no H264 payload with packetization-mode=1".into(),
            ));
        }

        let session = self
            .manager
            .session(device_id)
            .filter(|session| session.is_active())
            .ok_or_else(|| {
                GatewayError::NotFound(format!("no active session for device {}", device_id))
            })?;

        let observed = self.observed_profile(&session).await?;
        let profile = choose_profile(&candidates, observed.as_deref())?;
        let (payload_type, rtx_payload_type) = allocate_payload_types(offer_sdp);
        info!(
            device_id,
            %profile,
            payload_type,
            rtx_payload_type,
            "negotiated H264 profile"
        );

        let session_config = session.config();
        let want_audio = session_config.audio
            && session_config.audio_codec == "opus"
            && offer_has_audio(offer_sdp);

        let mut media_engine =
            build_media_engine(&profile, payload_type, rtx_payload_type, want_audio)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| GatewayError::WebRtc(format!("interceptor registry failed: {}", e)))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(|e| {
                    GatewayError::WebRtc(format!("peer connection creation failed: {}", e))
                })?,
        );

        let cancel = CancellationToken::new();
        match self
            .assemble_peer(&session, &pc, &cancel, &profile, want_audio, offer_sdp)
            .await
        {
            Ok(answer) => {
                let mut peers = self.peers.lock().await;
                if let Some(previous) = peers.insert(
                    device_id.to_string(),
                    PeerHandle {
                        pc: pc.clone(),
                        cancel,
                    },
                ) {
                    debug!(device_id, "closing superseded peer connection");
                    previous.cancel.cancel();
                    let _ = previous.pc.close().await;
                }
                Ok(answer)
            }
            Err(e) => {
                cancel.cancel();
                let _ = pc.close().await;
                Err(e)
            }
        }
    }

    /// The device encoder profile, waited for (bounded) when video is
    /// enabled but the first SPS has not arrived yet.
    async fn observed_profile(&self, session: &Arc<StreamingSession>) -> Result<Option<String>> {
        if !session.config().video {
            return Ok(None);
        }

        let mut watch = session.profile_watch();
        if let Some(profile) = watch.borrow().clone() {
            return Ok(Some(profile));
        }

        let deadline = tokio::time::Instant::now() + PROFILE_WAIT;
        loop {
            let timeout = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(timeout, watch.changed()).await {
                Ok(Ok(())) => {
                    if let Some(profile) = watch.borrow().clone() {
                        return Ok(Some(profile));
                    }
                }
                Ok(Err(_)) | Err(_) => {
                    return Err(GatewayError::Negotiation(
                        "device encoder profile was never observed".into(),
                    ));
                }
            }
        }
    }

    async fn assemble_peer(
        &self,
        session: &Arc<StreamingSession>,
        pc: &Arc<RTCPeerConnection>,
        cancel: &CancellationToken,
        profile: &str,
        want_audio: bool,
        offer_sdp: &str,
    ) -> Result<String> {
        let video_track = QueueVideoTrack::new(profile);
        pc.add_track(video_track.track())
            .await
            .map_err(|e| GatewayError::WebRtc(format!("adding video track failed: {}", e)))?;
        video_track.spawn_writer(
            Arc::new(VideoQueueSource(session.video_queue())),
            cancel.clone(),
        );

        if want_audio {
            let audio_track = QueueAudioTrack::new();
            pc.add_track(audio_track.track())
                .await
                .map_err(|e| GatewayError::WebRtc(format!("adding audio track failed: {}", e)))?;
            audio_track.spawn_writer(
                Arc::new(AudioQueueSource(session.audio_queue())),
                cancel.clone(),
            );
        }

        let state_session = session.clone();
        let state_cancel = cancel.clone();
        let device_id = session.device_id().to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let session = state_session.clone();
            let cancel = state_cancel.clone();
            let device_id = device_id.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        // Playback must begin cleanly from an IDR.
                        info!(%device_id, "peer connected, requesting keyframe restart");
                        session.request_keyframe().await;
                    }
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed
                    | RTCPeerConnectionState::Disconnected => {
                        debug!(%device_id, ?state, "peer connection ended");
                        cancel.cancel();
                    }
                    _ => {}
                }
            })
        }));

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| GatewayError::Negotiation(format!("invalid SDP offer: {}", e)))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| GatewayError::WebRtc(format!("remote description rejected: {}", e)))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| GatewayError::WebRtc(format!("answer creation failed: {}", e)))?;

        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer)
            .await
            .map_err(|e| GatewayError::WebRtc(format!("local description failed: {}", e)))?;

        if tokio::time::timeout(GATHER_WAIT, gather_complete.recv())
            .await
            .is_err()
        {
            warn!("ICE gathering did not finish in time, answering anyway");
        }

        let local = pc.local_description().await.ok_or_else(|| {
            GatewayError::WebRtc("no local description after gathering".into())
        })?;
        Ok(local.sdp)
    }

    /// Close every peer connection; called once at shutdown.
    pub async fn shutdown(&self) {
        let mut peers = self.peers.lock().await;
        for (device_id, handle) in peers.drain() {
            debug!(%device_id, "closing peer connection");
            handle.cancel.cancel();
            let _ = handle.pc.close().await;
        }
    }
}

/// Allocate an unused adjacent payload-type pair in the dynamic range for
/// the H264 codec and its retransmission twin; when the range is exhausted,
/// increment past the offer's maximum.
fn allocate_payload_types(offer_sdp: &str) -> (u8, u8) {
    let used = payload_types_in_offer(offer_sdp);

    for pt in DYNAMIC_PAYLOAD_RANGE {
        let rtx = match pt.checked_add(1) {
            Some(rtx) => rtx,
            None => break,
        };
        if !used.contains(&pt) && !used.contains(&rtx) {
            return (pt, rtx);
        }
    }

    let max = used.iter().max().copied().unwrap_or(*DYNAMIC_PAYLOAD_RANGE.start());
    (max.saturating_add(1), max.saturating_add(2))
}

fn payload_types_in_offer(offer_sdp: &str) -> HashSet<u8> {
    offer_sdp
        .lines()
        .filter_map(|line| line.strip_prefix("m="))
        .flat_map(|media| media.split_whitespace().skip(3))
        .filter_map(|pt| pt.parse().ok())
        .collect()
}

fn offer_has_audio(offer_sdp: &str) -> bool {
    offer_sdp.lines().any(|line| line.starts_with("m=audio"))
}

/// Media engine with exactly the codecs this peer will use: the negotiated
/// H264 profile first, its RTX pair, and Opus when audio is on. Registering
/// only the negotiated codec keeps it preferred on the outgoing media
/// description.
fn build_media_engine(
    profile: &str,
    payload_type: u8,
    rtx_payload_type: u8,
    with_audio: bool,
) -> Result<MediaEngine> {
    let mut media_engine = MediaEngine::default();

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: h264_capability(profile),
                payload_type,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| GatewayError::WebRtc(format!("H264 codec registration failed: {}", e)))?;

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability {
                    mime_type: "video/rtx".to_string(),
                    clock_rate: 90_000,
                    channels: 0,
                    sdp_fmtp_line: format!("apt={}", payload_type),
                    rtcp_feedback: vec![],
                },
                payload_type: rtx_payload_type,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| GatewayError::WebRtc(format!("RTX codec registration failed: {}", e)))?;

    if with_audio {
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: opus_capability(),
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| {
                GatewayError::WebRtc(format!("Opus codec registration failed: {}", e))
            })?;
    }

    Ok(media_engine)
}
