//! SDP offer inspection and H264 profile negotiation
//!
//! Only the small slice of SDP the bridge needs is parsed here: the H264
//! payload types declared on the video media line, each with its
//! `profile-level-id` and `packetization-mode` format parameters.

use std::collections::HashMap;

use crate::error::{GatewayError, Result};

/// Default profile-level-id when an H264 fmtp omits it (RFC 6184)
pub const DEFAULT_PROFILE_LEVEL_ID: &str = "42e01f";

/// Default packetization-mode when an H264 fmtp omits it
pub const DEFAULT_PACKETIZATION_MODE: &str = "0";

/// One H264 payload type offered by the remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H264Candidate {
    pub payload_type: u8,
    pub profile_level_id: String,
    pub packetization_mode: String,
}

impl H264Candidate {
    pub fn is_packetization_mode_1(&self) -> bool {
        self.packetization_mode == "1"
    }
}

/// Extract the H264 candidates from an SDP offer, in the payload-type order
/// declared by the video media line.
pub fn profiles_from_offer(sdp: &str) -> Vec<H264Candidate> {
    let mut video_payload_types: Vec<u8> = Vec::new();
    let mut rtpmap: HashMap<u8, String> = HashMap::new();
    let mut fmtp: HashMap<u8, HashMap<String, String>> = HashMap::new();

    let mut in_video_section = false;
    for line in sdp.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("m=") {
            in_video_section = rest.starts_with("video");
            if in_video_section {
                // m=video <port> <proto> <pt> <pt> ...
                video_payload_types = rest
                    .split_whitespace()
                    .skip(3)
                    .filter_map(|pt| pt.parse().ok())
                    .collect();
            }
            continue;
        }
        if !in_video_section {
            continue;
        }

        if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            if let Some((pt, codec)) = rest.split_once(' ') {
                if let Ok(pt) = pt.parse::<u8>() {
                    let name = codec.split('/').next().unwrap_or("").to_string();
                    rtpmap.insert(pt, name);
                }
            }
        } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
            if let Some((pt, params)) = rest.split_once(' ') {
                if let Ok(pt) = pt.parse::<u8>() {
                    let map = params
                        .split(';')
                        .filter_map(|kv| {
                            let (k, v) = kv.trim().split_once('=')?;
                            Some((k.to_string(), v.to_string()))
                        })
                        .collect();
                    fmtp.insert(pt, map);
                }
            }
        }
    }

    video_payload_types
        .into_iter()
        .filter(|pt| {
            rtpmap
                .get(pt)
                .map(|name| name.eq_ignore_ascii_case("H264"))
                .unwrap_or(false)
        })
        .map(|pt| {
            let params = fmtp.get(&pt);
            let profile_level_id = params
                .and_then(|p| p.get("profile-level-id"))
                .map(|s| s.to_ascii_lowercase())
                .unwrap_or_else(|| DEFAULT_PROFILE_LEVEL_ID.to_string());
            let packetization_mode = params
                .and_then(|p| p.get("packetization-mode"))
                .cloned()
                .unwrap_or_else(|| DEFAULT_PACKETIZATION_MODE.to_string());
            H264Candidate {
                payload_type: pt,
                profile_level_id,
                packetization_mode,
            }
        })
        .collect()
}

/// Choose the H264 profile to answer with.
///
/// Preference order, restricted to candidates with `packetization-mode=1`:
/// the device's observed profile exactly, then any candidate whose
/// `profile_idc` matches the observed one (ignoring the level), then the
/// first candidate. Fails when the offer has no packetization-mode=1
/// candidate at all.
pub fn choose_profile(candidates: &[H264Candidate], observed: Option<&str>) -> Result<String> {
    let mode_1: Vec<&H264Candidate> = candidates
        .iter()
        .filter(|c| c.is_packetization_mode_1())
        .collect();

    if let Some(observed) = observed {
        let observed = observed.to_ascii_lowercase();
        if let Some(c) = mode_1
            .iter()
            .find(|c| c.profile_level_id == observed)
        {
            return Ok(c.profile_level_id.clone());
        }
        if let Some(observed_class) = observed.get(..2) {
            if let Some(c) = mode_1
                .iter()
                .find(|c| c.profile_level_id.get(..2) == Some(observed_class))
            {
                return Ok(c.profile_level_id.clone());
            }
        }
    }

    mode_1
        .first()
        .map(|c| c.profile_level_id.clone())
        .ok_or_else(|| {
            GatewayError::Negotiation(
                "offer has no H264 payload with packetization-mode=1".into(),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 46117317 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 102 104 106\r\n\
a=rtpmap:102 H264/90000\r\n\
a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f\r\n\
a=rtpmap:104 H264/90000\r\n\
a=fmtp:104 level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=640028\r\n\
a=rtpmap:106 VP8/90000\r\n";

    #[test]
    fn test_profiles_from_offer_order_and_params() {
        let candidates = profiles_from_offer(OFFER);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].payload_type, 102);
        assert_eq!(candidates[0].profile_level_id, "42e01f");
        assert_eq!(candidates[0].packetization_mode, "1");
        assert_eq!(candidates[1].payload_type, 104);
        assert_eq!(candidates[1].profile_level_id, "640028");
        assert_eq!(candidates[1].packetization_mode, "0");
    }

    #[test]
    fn test_profiles_from_offer_defaults() {
        let sdp = "m=video 9 RTP/AVPF 97\r\na=rtpmap:97 H264/90000\r\n";
        let candidates = profiles_from_offer(sdp);
        assert_eq!(candidates[0].profile_level_id, DEFAULT_PROFILE_LEVEL_ID);
        assert_eq!(candidates[0].packetization_mode, DEFAULT_PACKETIZATION_MODE);
    }

    fn candidate(pt: u8, profile: &str, mode: &str) -> H264Candidate {
        H264Candidate {
            payload_type: pt,
            profile_level_id: profile.to_string(),
            packetization_mode: mode.to_string(),
        }
    }

    #[test]
    fn test_choose_profile_exact_match() {
        let candidates = [candidate(102, "42e01f", "1"), candidate(104, "640028", "0")];
        let chosen = choose_profile(&candidates, Some("42e01f")).unwrap();
        assert_eq!(chosen, "42e01f");
    }

    #[test]
    fn test_choose_profile_class_match() {
        // Observed 4d4028 is absent, but a 4dxxxx candidate with mode 1 exists
        let candidates = [
            candidate(102, "42e01f", "1"),
            candidate(104, "4d001f", "1"),
        ];
        let chosen = choose_profile(&candidates, Some("4d4028")).unwrap();
        assert_eq!(chosen, "4d001f");
    }

    #[test]
    fn test_choose_profile_falls_back_to_first_mode_1() {
        let candidates = [
            candidate(104, "640028", "0"),
            candidate(102, "42e01f", "1"),
        ];
        let chosen = choose_profile(&candidates, Some("aabbcc")).unwrap();
        assert_eq!(chosen, "42e01f");
    }

    #[test]
    fn test_choose_profile_no_mode_1_is_negotiation_error() {
        let candidates = [candidate(104, "640028", "0")];
        let err = choose_profile(&candidates, Some("640028")).unwrap_err();
        assert!(matches!(err, GatewayError::Negotiation(_)));
    }
}
