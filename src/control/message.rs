//! Control message encoding for the device agent's injection channel
//!
//! Fixed big-endian struct layouts, bit-exact with the unmodified device
//! agent. Every encoded message is sent as a single write on the shared
//! control socket.

use bytes::{BufMut, Bytes, BytesMut};

pub const TYPE_INJECT_KEYCODE: u8 = 0;
pub const TYPE_INJECT_TEXT: u8 = 1;
pub const TYPE_INJECT_TOUCH: u8 = 2;
pub const TYPE_INJECT_SCROLL: u8 = 3;
pub const TYPE_SET_CLIPBOARD: u8 = 9;
pub const TYPE_RESET_VIDEO: u8 = 17;

/// Maximum UTF-8 payload per text injection message
pub const TEXT_CHUNK_MAX: usize = 300;

/// Maximum UTF-8 payload per clipboard message
pub const CLIPBOARD_CHUNK_MAX: usize = 4000;

/// Key event direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Down = 0,
    Up = 1,
}

/// Touch event phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchAction {
    Down = 0,
    Up = 1,
    Move = 2,
}

/// Encode a keycode injection: `type, action, keycode, repeat, meta_state`.
pub fn encode_keycode(action: KeyAction, keycode: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(14);
    buf.put_u8(TYPE_INJECT_KEYCODE);
    buf.put_u8(action as u8);
    buf.put_i32(keycode);
    buf.put_i32(0); // repeat
    buf.put_i32(0); // meta state
    buf.freeze()
}

/// Encode a touch injection referencing the device screen size the agent
/// reported. Pressure is full-scale for down/move and zero for up.
pub fn encode_touch(
    action: TouchAction,
    x: i32,
    y: i32,
    screen_width: u16,
    screen_height: u16,
) -> Bytes {
    let pressure: u16 = match action {
        TouchAction::Down | TouchAction::Move => 0xFFFF,
        TouchAction::Up => 0,
    };

    let mut buf = BytesMut::with_capacity(32);
    buf.put_u8(TYPE_INJECT_TOUCH);
    buf.put_u8(action as u8);
    buf.put_u64(0); // pointer id
    buf.put_i32(x);
    buf.put_i32(y);
    buf.put_u16(screen_width);
    buf.put_u16(screen_height);
    buf.put_u16(pressure);
    buf.put_u32(0); // action button
    buf.put_u32(0); // buttons
    buf.freeze()
}

/// Encode a scroll injection at a screen position.
pub fn encode_scroll(
    x: i32,
    y: i32,
    screen_width: u16,
    screen_height: u16,
    hscroll: i16,
    vscroll: i16,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(21);
    buf.put_u8(TYPE_INJECT_SCROLL);
    buf.put_i32(x);
    buf.put_i32(y);
    buf.put_u16(screen_width);
    buf.put_u16(screen_height);
    buf.put_i16(hscroll);
    buf.put_i16(vscroll);
    buf.put_u32(0); // buttons
    buf.freeze()
}

/// Encode text injection, split into messages of at most `TEXT_CHUNK_MAX`
/// UTF-8 bytes, never splitting a multi-byte code point.
pub fn encode_text_chunks(text: &str) -> Vec<Bytes> {
    chunk_utf8(text, TEXT_CHUNK_MAX)
        .into_iter()
        .map(|chunk| {
            let mut buf = BytesMut::with_capacity(5 + chunk.len());
            buf.put_u8(TYPE_INJECT_TEXT);
            buf.put_u32(chunk.len() as u32);
            buf.put_slice(chunk.as_bytes());
            buf.freeze()
        })
        .collect()
}

/// Encode a clipboard update (optionally pasting immediately), split into
/// messages of at most `CLIPBOARD_CHUNK_MAX` UTF-8 bytes on code-point
/// boundaries. Non-ASCII text injection is routed through this path because
/// the agent's text injection only covers characters with key mappings.
pub fn encode_clipboard_chunks(text: &str, paste: bool, sequence: u64) -> Vec<Bytes> {
    chunk_utf8(text, CLIPBOARD_CHUNK_MAX)
        .into_iter()
        .map(|chunk| {
            let mut buf = BytesMut::with_capacity(14 + chunk.len());
            buf.put_u8(TYPE_SET_CLIPBOARD);
            buf.put_u64(sequence);
            buf.put_u8(paste as u8);
            buf.put_u32(chunk.len() as u32);
            buf.put_slice(chunk.as_bytes());
            buf.freeze()
        })
        .collect()
}

/// Encode a video reset request, asking the agent to restart its encoder so
/// the stream resumes from a fresh keyframe.
pub fn encode_reset_video() -> Bytes {
    Bytes::from_static(&[TYPE_RESET_VIDEO])
}

/// Random clipboard sequence number, letting the agent acknowledge a
/// specific update.
pub fn random_sequence() -> u64 {
    use rand::Rng;
    rand::thread_rng().gen()
}

/// Encode a text injection, routing non-ASCII input through the clipboard
/// path (with immediate paste) since the agent's text injection only covers
/// characters with key mappings.
pub fn encode_text_injection(text: &str) -> Vec<Bytes> {
    if text.is_ascii() {
        encode_text_chunks(text)
    } else {
        encode_clipboard_chunks(text, true, random_sequence())
    }
}

/// Split `text` into chunks of at most `max_bytes` UTF-8 bytes, with every
/// boundary on a code point.
fn chunk_utf8(text: &str, max_bytes: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < text.len() {
        let mut end = (start + max_bytes).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        chunks.push(&text[start..end]);
        start = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keycode_fixture() {
        // Keycode-down for KEYCODE_ENTER (66)
        let msg = encode_keycode(KeyAction::Down, 66);
        assert_eq!(
            &msg[..],
            &[
                0x00, 0x00, // type, action
                0x00, 0x00, 0x00, 0x42, // keycode
                0x00, 0x00, 0x00, 0x00, // repeat
                0x00, 0x00, 0x00, 0x00, // meta state
            ]
        );
        assert_eq!(msg.len(), 14);
    }

    #[test]
    fn test_touch_fixture() {
        let msg = encode_touch(TouchAction::Down, 540, 1200, 1080, 2400);
        assert_eq!(msg.len(), 32);
        assert_eq!(msg[0], TYPE_INJECT_TOUCH);
        assert_eq!(msg[1], 0); // down
        assert_eq!(&msg[2..10], &[0u8; 8]); // pointer id
        assert_eq!(&msg[10..14], &540i32.to_be_bytes());
        assert_eq!(&msg[14..18], &1200i32.to_be_bytes());
        assert_eq!(&msg[18..20], &1080u16.to_be_bytes());
        assert_eq!(&msg[20..22], &2400u16.to_be_bytes());
        assert_eq!(&msg[22..24], &[0xFF, 0xFF]); // pressure
        assert_eq!(&msg[24..32], &[0u8; 8]); // action button + buttons

        let up = encode_touch(TouchAction::Up, 0, 0, 1080, 2400);
        assert_eq!(&up[22..24], &[0x00, 0x00]);
    }

    #[test]
    fn test_scroll_fixture() {
        let msg = encode_scroll(100, 200, 1080, 2400, 0, -3);
        assert_eq!(msg.len(), 21);
        assert_eq!(msg[0], TYPE_INJECT_SCROLL);
        assert_eq!(&msg[13..15], &0i16.to_be_bytes());
        assert_eq!(&msg[15..17], &(-3i16).to_be_bytes());
    }

    #[test]
    fn test_text_message_layout() {
        let msgs = encode_text_chunks("hi");
        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0][..], &[TYPE_INJECT_TEXT, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_clipboard_message_layout() {
        let msgs = encode_clipboard_chunks("ok", true, 0x0102030405060708);
        assert_eq!(msgs.len(), 1);
        let msg = &msgs[0];
        assert_eq!(msg[0], TYPE_SET_CLIPBOARD);
        assert_eq!(&msg[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(msg[9], 1); // paste
        assert_eq!(&msg[10..14], &2u32.to_be_bytes());
        assert_eq!(&msg[14..], b"ok");
    }

    #[test]
    fn test_reset_video_fixture() {
        assert_eq!(&encode_reset_video()[..], &[TYPE_RESET_VIDEO]);
    }

    #[test]
    fn test_chunking_respects_code_points() {
        // 150 three-byte code points = 450 bytes; chunk limits that are not
        // multiples of 3 force boundaries inside a code point unless backed
        // off correctly.
        let text: String = std::iter::repeat('\u{4E2D}').take(150).collect();
        for max in [299, 300] {
            let chunks = chunk_utf8(&text, max);
            for chunk in &chunks {
                assert!(chunk.len() <= max);
                assert!(!chunk.is_empty());
                // Every chunk must itself be valid UTF-8 (guaranteed by &str)
                // and chunk lengths must be multiples of the code point width.
                assert_eq!(chunk.len() % 3, 0);
            }
            let reassembled: String = chunks.concat();
            assert_eq!(reassembled, text);
        }
    }

    #[test]
    fn test_text_injection_routes_non_ascii_through_clipboard() {
        let ascii = encode_text_injection("hello");
        assert_eq!(ascii[0][0], TYPE_INJECT_TEXT);

        let non_ascii = encode_text_injection("héllo");
        assert_eq!(non_ascii[0][0], TYPE_SET_CLIPBOARD);
        assert_eq!(non_ascii[0][9], 1); // paste flag
    }

    #[test]
    fn test_text_chunks_split_large_input() {
        let text = "a".repeat(TEXT_CHUNK_MAX * 2 + 5);
        let msgs = encode_text_chunks(&text);
        assert_eq!(msgs.len(), 3);
        let total: usize = msgs
            .iter()
            .map(|m| u32::from_be_bytes(m[1..5].try_into().unwrap()) as usize)
            .sum();
        assert_eq!(total, text.len());
    }
}
