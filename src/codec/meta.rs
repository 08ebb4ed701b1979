//! Codec meta header location on a freshly connected media channel
//!
//! After the transport handshake the device agent sends a codec meta header:
//! a 4-byte codec tag followed by 4-byte width and height. Depending on the
//! agent release, version-dependent bytes (a dummy byte, or a length-prefixed
//! device-name string) may precede the tag, so the locator probes several
//! candidate offsets in a rolling buffer instead of assuming a fixed layout.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::error::{GatewayError, Result};

/// Wire size of the codec meta header itself (tag + width + height)
pub const CODEC_META_LEN: usize = 12;

/// Upper bound on bytes consumed while hunting for the meta header
const META_READ_BUDGET: usize = 4096;

/// Plausible display dimension range used to validate probe hits
const DIMENSION_RANGE: std::ops::RangeInclusive<u32> = 1..=10_000;

/// Video codec announced by the device agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
    Av1,
}

impl VideoCodec {
    pub fn name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Av1 => "av1",
        }
    }

    /// Decode the 4-byte codec tag: an ASCII name on current agents, a small
    /// integer code on older ones.
    fn from_tag(tag: [u8; 4]) -> Option<Self> {
        match &tag {
            b"h264" => Some(VideoCodec::H264),
            b"h265" => Some(VideoCodec::H265),
            b"av01" | b"av1\0" => Some(VideoCodec::Av1),
            _ => match u32::from_be_bytes(tag) {
                1 => Some(VideoCodec::H264),
                2 => Some(VideoCodec::H265),
                3 => Some(VideoCodec::Av1),
                _ => None,
            },
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Audio codec announced on the audio channel (4-byte tag)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Opus,
    /// Raw 16-bit PCM, 48 kHz stereo
    Pcm,
}

impl AudioCodec {
    pub fn from_tag(tag: [u8; 4]) -> Option<Self> {
        match &tag {
            b"opus" => Some(AudioCodec::Opus),
            b"\0raw" | b"raw\0" => Some(AudioCodec::Pcm),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AudioCodec::Opus => "opus",
            AudioCodec::Pcm => "pcm",
        }
    }
}

/// Parsed codec meta header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecMeta {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
}

/// Locate and parse the codec meta header on `reader`.
///
/// Returns the parsed meta plus any trailing bytes already read past the
/// header; the caller must prepend those to its frame-reading loop. Fails
/// with a protocol error once `META_READ_BUDGET` bytes have been consumed
/// without a recognizable header.
pub async fn locate_codec_meta<R>(reader: &mut R) -> Result<(CodecMeta, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(GatewayError::Protocol(
                "stream ended before codec meta header".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((meta, consumed)) = probe(&buf) {
            trace!(
                codec = meta.codec.name(),
                width = meta.width,
                height = meta.height,
                offset = consumed - CODEC_META_LEN,
                "located codec meta header"
            );
            return Ok((meta, Bytes::copy_from_slice(&buf[consumed..])));
        }

        if buf.len() > META_READ_BUDGET {
            return Err(GatewayError::Protocol(format!(
                "no codec meta header within {} bytes",
                META_READ_BUDGET
            )));
        }
    }
}

/// Try every candidate offset against the rolling buffer.
fn probe(buf: &[u8]) -> Option<(CodecMeta, usize)> {
    for offset in candidate_offsets(buf) {
        if let Some(meta) = meta_at(buf, offset) {
            return Some((meta, offset + CODEC_META_LEN));
        }
    }
    None
}

/// Candidate byte offsets for the meta header: the happy path (0), a single
/// leading dummy byte (1), and layouts where a length-prefixed string (2-byte
/// or 4-byte length) precedes the tag.
fn candidate_offsets(buf: &[u8]) -> Vec<usize> {
    let mut offsets = vec![0usize, 1];
    if buf.len() >= 2 {
        offsets.push(2 + u16::from_be_bytes([buf[0], buf[1]]) as usize);
    }
    if buf.len() >= 4 {
        let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        if len <= META_READ_BUDGET {
            offsets.push(4 + len);
        }
    }
    offsets
}

/// Parse a meta header at `offset` if the bytes there look like one.
fn meta_at(buf: &[u8], offset: usize) -> Option<CodecMeta> {
    let bytes = buf.get(offset..offset.checked_add(CODEC_META_LEN)?)?;
    let codec = VideoCodec::from_tag(bytes[..4].try_into().unwrap())?;
    let width = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
    let height = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
    if !DIMENSION_RANGE.contains(&width) || !DIMENSION_RANGE.contains(&height) {
        return None;
    }
    Some(CodecMeta {
        codec,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_bytes(tag: &[u8; 4], width: u32, height: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(tag);
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&height.to_be_bytes());
        out
    }

    #[tokio::test]
    async fn test_meta_at_offset_zero() {
        let mut data = meta_bytes(b"h264", 1080, 2400);
        data.extend_from_slice(&[0xAA, 0xBB]);
        let (meta, leftover) = locate_codec_meta(&mut data.as_slice()).await.unwrap();
        assert_eq!(meta.codec, VideoCodec::H264);
        assert_eq!((meta.width, meta.height), (1080, 2400));
        assert_eq!(&leftover[..], &[0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn test_meta_after_dummy_byte() {
        let mut data = vec![0x00];
        data.extend_from_slice(&meta_bytes(b"h265", 720, 1280));
        let (meta, leftover) = locate_codec_meta(&mut data.as_slice()).await.unwrap();
        assert_eq!(meta.codec, VideoCodec::H265);
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_meta_after_length_prefixed_string() {
        let name = b"Pixel 8";
        let mut data = Vec::new();
        data.extend_from_slice(&(name.len() as u16).to_be_bytes());
        data.extend_from_slice(name);
        data.extend_from_slice(&meta_bytes(b"h264", 1080, 1920));
        let (meta, _) = locate_codec_meta(&mut data.as_slice()).await.unwrap();
        assert_eq!(meta.codec, VideoCodec::H264);
    }

    #[tokio::test]
    async fn test_integer_codec_tag() {
        let data = meta_bytes(&1u32.to_be_bytes(), 800, 600);
        let (meta, _) = locate_codec_meta(&mut data.as_slice()).await.unwrap();
        assert_eq!(meta.codec, VideoCodec::H264);
    }

    #[tokio::test]
    async fn test_implausible_dimensions_rejected() {
        // Valid tag but absurd width: the locator must keep probing and
        // eventually run out of budget.
        let mut data = meta_bytes(b"h264", 0, 1920);
        data.resize(META_READ_BUDGET + 64, 0xFF);
        let err = locate_codec_meta(&mut data.as_slice()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_budget_exhaustion() {
        let data = vec![0xFFu8; META_READ_BUDGET + 64];
        let err = locate_codec_meta(&mut data.as_slice()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[test]
    fn test_audio_codec_tags() {
        assert_eq!(AudioCodec::from_tag(*b"opus"), Some(AudioCodec::Opus));
        assert_eq!(AudioCodec::from_tag(*b"\0raw"), Some(AudioCodec::Pcm));
        assert_eq!(AudioCodec::from_tag(*b"aac\0"), None);
    }
}
