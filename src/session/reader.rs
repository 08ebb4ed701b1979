//! Per-channel reader loops
//!
//! One task per enabled channel, doing sequential blocking-style reads.
//! Cancellation is cooperative: the session's token is checked at every
//! read boundary, and teardown closes the underlying socket to unblock any
//! in-flight read.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::codec::{
    ensure_annex_b, h264_profile_id, nalu_type, parse_avc_config_record, split_annex_b_nalus,
    AudioCodec, FrameHeader, FRAME_HEADER_LEN, NALU_TYPE_IDR, NALU_TYPE_PPS, NALU_TYPE_SPS,
};
use crate::control::ControlChannelRegistry;
use crate::control::ControlEntry;
use crate::error::{GatewayError, Result};
use crate::session::queue::{MediaPacket, MediaQueue, PushOutcome};

/// Upper bound on a single media packet; anything larger is protocol noise.
const MAX_PACKET_SIZE: usize = 8 * 1024 * 1024;

/// Raw PCM batching: 48 kHz stereo s16le, 960-sample frames (20 ms)
pub(crate) const PCM_SAMPLE_RATE: u64 = 48_000;
pub(crate) const PCM_CHANNELS: usize = 2;
pub(crate) const PCM_FRAME_SAMPLES: usize = 960;
const PCM_FRAME_BYTES: usize = PCM_FRAME_SAMPLES * PCM_CHANNELS * 2;

/// Buffered reader that serves bytes left over from the meta-header probe
/// before touching the socket again.
pub(crate) struct ChannelReader<R> {
    inner: R,
    pending: BytesMut,
}

impl<R: AsyncRead + Unpin> ChannelReader<R> {
    pub(crate) fn new(inner: R, leftover: Bytes) -> Self {
        Self {
            inner,
            pending: BytesMut::from(&leftover[..]),
        }
    }

    pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        let from_pending = self.pending.len().min(buf.len());
        if from_pending > 0 {
            let taken = self.pending.split_to(from_pending);
            buf[..from_pending].copy_from_slice(&taken);
        }
        if from_pending < buf.len() {
            self.inner.read_exact(&mut buf[from_pending..]).await?;
        }
        Ok(())
    }
}

/// Video channel loop: frame headers, payload normalization, SPS/PPS
/// tracking and keyframe-gated queueing.
pub(crate) async fn video_reader<R>(
    stream: R,
    leftover: Bytes,
    queue: Arc<MediaQueue>,
    profile_tx: watch::Sender<Option<String>>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut reader = ChannelReader::new(stream, leftover);
    let mut sps: Option<Bytes> = None;
    let mut pps: Option<Bytes> = None;
    let mut length_prefix_size: Option<usize> = None;

    let mut header_buf = [0u8; FRAME_HEADER_LEN];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = reader.read_exact(&mut header_buf) => {
                result.map_err(|e| {
                    GatewayError::Connect(format!("video channel read failed: {}", e))
                })?;
            }
        }

        let header = FrameHeader::parse(&header_buf)?;
        if header.size as usize > MAX_PACKET_SIZE {
            return Err(GatewayError::Protocol(format!(
                "video packet of {} bytes exceeds limit",
                header.size
            )));
        }

        let mut payload = vec![0u8; header.size as usize];
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = reader.read_exact(&mut payload) => {
                result.map_err(|e| {
                    GatewayError::Connect(format!("video channel read failed: {}", e))
                })?;
            }
        }

        if header.is_config {
            // Configuration packets carry SPS/PPS, usually as an AVC
            // decoder configuration record; older agents send bare NALUs.
            let nalus = match parse_avc_config_record(&payload) {
                Some((nalus, prefix_size)) => {
                    debug!(prefix_size, "learned NALU length prefix from config record");
                    length_prefix_size = Some(prefix_size);
                    nalus
                }
                None => split_annex_b_nalus(&ensure_annex_b(&payload, length_prefix_size)),
            };
            update_parameter_sets(&nalus, &mut sps, &mut pps, &profile_tx);
            continue;
        }

        let annex_b = ensure_annex_b(&payload, length_prefix_size);
        let mut nalus = split_annex_b_nalus(&annex_b);
        update_parameter_sets(&nalus, &mut sps, &mut pps, &profile_tx);

        let has_idr = nalus.iter().any(|n| nalu_type(n) == Some(NALU_TYPE_IDR));
        let keyframe = has_idr || header.is_keyframe;

        if has_idr && !nalus.iter().any(|n| nalu_type(n) == Some(NALU_TYPE_SPS)) {
            // Keyframes must decode standalone after a queue drop, so put
            // the parameter sets back in front.
            let mut prefixed = Vec::with_capacity(nalus.len() + 2);
            prefixed.extend(sps.clone());
            prefixed.extend(pps.clone());
            prefixed.extend(nalus);
            nalus = prefixed;
        }

        let total: usize = nalus.iter().map(|n| n.len()).sum();
        let mut data = BytesMut::with_capacity(total);
        for nalu in &nalus {
            data.put_slice(nalu);
        }

        match queue.push(MediaPacket {
            data: data.freeze(),
            pts: header.pts,
            keyframe,
        }) {
            PushOutcome::Refused => trace!("video packet refused while awaiting keyframe"),
            PushOutcome::Evicted => trace!("video queue full, dropped oldest packet"),
            PushOutcome::Queued => {}
        }
    }
}

fn update_parameter_sets(
    nalus: &[Bytes],
    sps: &mut Option<Bytes>,
    pps: &mut Option<Bytes>,
    profile_tx: &watch::Sender<Option<String>>,
) {
    for nalu in nalus {
        match nalu_type(nalu) {
            Some(NALU_TYPE_SPS) => {
                *sps = Some(nalu.clone());
                if profile_tx.borrow().is_none() {
                    if let Some(profile) = h264_profile_id(nalu) {
                        info!(profile, "observed device encoder profile");
                        profile_tx.send_replace(Some(profile));
                    }
                }
            }
            Some(NALU_TYPE_PPS) => *pps = Some(nalu.clone()),
            _ => {}
        }
    }
}

/// Audio channel loop. Opus packets pass through framed; raw PCM is batched
/// into fixed 960-sample frames with a running sample-count timestamp.
pub(crate) async fn audio_reader<R>(
    stream: R,
    codec: AudioCodec,
    queue: Arc<MediaQueue>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut reader = ChannelReader::new(stream, Bytes::new());
    let mut header_buf = [0u8; FRAME_HEADER_LEN];
    let mut pcm_accumulator = BytesMut::new();
    let mut pcm_samples_total: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = reader.read_exact(&mut header_buf) => {
                result.map_err(|e| {
                    GatewayError::Connect(format!("audio channel read failed: {}", e))
                })?;
            }
        }

        let header = FrameHeader::parse(&header_buf)?;
        if header.size as usize > MAX_PACKET_SIZE {
            return Err(GatewayError::Protocol(format!(
                "audio packet of {} bytes exceeds limit",
                header.size
            )));
        }

        let mut payload = vec![0u8; header.size as usize];
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = reader.read_exact(&mut payload) => {
                result.map_err(|e| {
                    GatewayError::Connect(format!("audio channel read failed: {}", e))
                })?;
            }
        }

        if header.is_config {
            continue;
        }

        match codec {
            AudioCodec::Opus => {
                queue.push(MediaPacket {
                    data: Bytes::from(payload),
                    pts: header.pts,
                    keyframe: true,
                });
            }
            AudioCodec::Pcm => {
                pcm_accumulator.put_slice(&payload);
                while pcm_accumulator.len() >= PCM_FRAME_BYTES {
                    let frame = pcm_accumulator.split_to(PCM_FRAME_BYTES).freeze();
                    let pts = pcm_samples_total * 1_000_000 / PCM_SAMPLE_RATE;
                    pcm_samples_total += PCM_FRAME_SAMPLES as u64;
                    queue.push(MediaPacket {
                        data: frame,
                        pts,
                        keyframe: true,
                    });
                }
            }
        }
    }
}

/// Control channel loop: watches for socket death, draining any device
/// messages in the meantime. The registry entry is cleared with
/// compare-and-clear the moment the socket dies.
pub(crate) async fn control_reader<R>(
    mut stream: R,
    registry: Arc<ControlChannelRegistry>,
    device_id: String,
    entry: Arc<ControlEntry>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        registry.clear(&device_id, Some(&entry)).await;
                        return Err(GatewayError::Connect(
                            "control socket closed by device".into(),
                        ));
                    }
                    Ok(n) => trace!(%device_id, bytes = n, "device message received"),
                    Err(e) => {
                        registry.clear(&device_id, Some(&entry)).await;
                        return Err(GatewayError::Connect(format!(
                            "control channel read failed: {}",
                            e
                        )));
                    }
                }
            }
        }
    }
}
