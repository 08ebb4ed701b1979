//! Frame header encoding/decoding for the device agent's media channels
//!
//! Every media packet on the video and audio channels is preceded by a fixed
//! 12-byte header: an 8-byte big-endian word carrying the config-packet flag
//! (bit 63), the keyframe flag (bit 62) and a 62-bit presentation timestamp,
//! followed by a 4-byte big-endian payload size.

use crate::error::{GatewayError, Result};

/// Wire size of a frame header
pub const FRAME_HEADER_LEN: usize = 12;

const CONFIG_FLAG: u64 = 1 << 63;
const KEYFRAME_FLAG: u64 = 1 << 62;
const PTS_MASK: u64 = (1 << 62) - 1;

/// Parsed media frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Packet carries codec configuration (SPS/PPS) instead of picture data
    pub is_config: bool,
    /// Packet contains a keyframe
    pub is_keyframe: bool,
    /// Presentation timestamp in microseconds (62 bits)
    pub pts: u64,
    /// Payload size in bytes
    pub size: u32,
}

impl FrameHeader {
    /// Parse a frame header from the first 12 bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(GatewayError::Protocol(format!(
                "truncated frame header: got {} bytes, need {}",
                buf.len(),
                FRAME_HEADER_LEN
            )));
        }

        let pts_and_flags = u64::from_be_bytes(buf[..8].try_into().unwrap());
        let size = u32::from_be_bytes(buf[8..12].try_into().unwrap());

        Ok(Self {
            is_config: pts_and_flags & CONFIG_FLAG != 0,
            is_keyframe: pts_and_flags & KEYFRAME_FLAG != 0,
            pts: pts_and_flags & PTS_MASK,
            size,
        })
    }

    /// Encode the header into its 12-byte wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut pts_and_flags = self.pts & PTS_MASK;
        if self.is_config {
            pts_and_flags |= CONFIG_FLAG;
        }
        if self.is_keyframe {
            pts_and_flags |= KEYFRAME_FLAG;
        }

        let mut out = [0u8; FRAME_HEADER_LEN];
        out[..8].copy_from_slice(&pts_and_flags.to_be_bytes());
        out[8..12].copy_from_slice(&self.size.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(is_config: bool, is_keyframe: bool, pts: u64, size: u32) {
        let header = FrameHeader {
            is_config,
            is_keyframe,
            pts,
            size,
        };
        let parsed = FrameHeader::parse(&header.encode()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_round_trip_flag_combinations() {
        for &config in &[false, true] {
            for &keyframe in &[false, true] {
                round_trip(config, keyframe, 123_456_789, 4096);
            }
        }
    }

    #[test]
    fn test_round_trip_pts_bounds() {
        round_trip(false, false, 0, 0);
        round_trip(true, true, (1 << 62) - 1, u32::MAX);
    }

    #[test]
    fn test_flags_do_not_leak_into_pts() {
        let header = FrameHeader {
            is_config: true,
            is_keyframe: true,
            pts: 42,
            size: 7,
        };
        let encoded = header.encode();
        assert_eq!(encoded[0] & 0xC0, 0xC0);
        let parsed = FrameHeader::parse(&encoded).unwrap();
        assert_eq!(parsed.pts, 42);
    }

    #[test]
    fn test_truncated_header_rejected() {
        let err = FrameHeader::parse(&[0u8; 11]).unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }
}
