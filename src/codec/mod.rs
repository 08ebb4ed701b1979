//! Binary codec utilities for the device agent wire protocol
//!
//! Stateless parsing and encoding helpers shared by the streaming session
//! and the WebRTC bridge: fixed-width frame headers, codec meta location
//! with protocol-version drift tolerance, AnnexB/AVCC normalization, SPS
//! profile extraction and SDP profile negotiation.

pub mod frame;
pub mod meta;
pub mod nal;
pub mod sdp;

pub use frame::{FrameHeader, FRAME_HEADER_LEN};
pub use meta::{locate_codec_meta, AudioCodec, CodecMeta, VideoCodec};
pub use nal::{
    avcc_to_annex_b, ensure_annex_b, h264_profile_id, nalu_type, parse_avc_config_record,
    split_annex_b_nalus, NALU_TYPE_IDR, NALU_TYPE_NON_IDR, NALU_TYPE_PPS, NALU_TYPE_SPS,
};
pub use sdp::{choose_profile, profiles_from_offer, H264Candidate, DEFAULT_PROFILE_LEVEL_ID};
