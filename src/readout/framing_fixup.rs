// SPDX-License-Identifier: MIT OR Apache-2.0

//! USB framing fixup (spec §4.G): at buffer boundaries, split off trailing
//! partial frames into a carry buffer so the parser always sees
//! whole-frame-aligned data on USB.

use byteorder::{ByteOrder, LittleEndian};

use crate::frame;

/// Walks `buf` (a whole number of 32-bit words) frame by frame. Returns the
/// byte offset at which a partial frame begins, if any — everything from
/// that offset onward should be moved to the carry buffer.
pub fn find_fixup_point(buf: &[u8]) -> usize {
    let word_count = buf.len() / 4;
    let mut i = 0usize;
    while i < word_count {
        let word = LittleEndian::read_u32(&buf[i * 4..i * 4 + 4]);
        let declared_len = match frame::frame_type(word) {
            Some(frame::FrameType::SuperFrame) | Some(frame::FrameType::SuperContinuation) => {
                frame::decode_super_frame_length(word).unwrap_or(0) as usize
            }
            Some(frame::FrameType::StackFrame)
            | Some(frame::FrameType::StackContinuation)
            | Some(frame::FrameType::StackErrorNotification) => {
                frame::decode_stack_frame_header(word).map(|h| h.length as usize).unwrap_or(0)
            }
            Some(frame::FrameType::SystemEvent) => {
                frame::decode_system_event_header(word).map(|h| h.length as usize).unwrap_or(0)
            }
            Some(frame::FrameType::BlockRead) => {
                frame::decode_stack_frame_header(word).map(|h| h.length as usize).unwrap_or(0)
            }
            None => {
                // Unknown header: let the parser's resync logic deal with
                // it; from the fixup stage's point of view this word plus
                // everything after it is "safe" to keep (not a partial
                // frame boundary we need to protect).
                i += 1;
                continue;
            }
        };
        let frame_words = frame::frame_total_words(declared_len as u32) as usize;
        if i + frame_words > word_count {
            // This frame's body runs past the end of the buffer: carry it
            // (and everything after its header) to the next buffer.
            return i * 4;
        }
        i += frame_words;
    }
    buf.len()
}

/// Splits `buf` into `(keep, carry)` at the fixup point.
pub fn split_at_fixup(buf: &[u8]) -> (&[u8], &[u8]) {
    let point = find_fixup_point(buf);
    buf.split_at(point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_super_frame_header, FrameType};

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(words.len() * 4);
        for w in words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    #[test]
    fn whole_frames_need_no_fixup() {
        let words = vec![
            encode_super_frame_header(FrameType::SuperFrame, 2),
            0x1111_1111,
            0x2222_2222,
        ];
        let buf = words_to_bytes(&words);
        assert_eq!(find_fixup_point(&buf), buf.len());
    }

    #[test]
    fn trailing_partial_frame_is_split_off() {
        let complete = vec![
            encode_super_frame_header(FrameType::SuperFrame, 1),
            0xAAAA_AAAA,
        ];
        let mut buf = words_to_bytes(&complete);
        // Partial second frame: header declares length=3 but only 1 body
        // word is actually present in this buffer.
        let partial_header = encode_super_frame_header(FrameType::SuperFrame, 3);
        buf.extend_from_slice(&partial_header.to_le_bytes());
        buf.extend_from_slice(&0xBBBB_BBBBu32.to_le_bytes());

        let (keep, carry) = split_at_fixup(&buf);
        assert_eq!(keep.len(), 8); // the complete frame only
        assert_eq!(carry.len(), 8); // partial header + its one body word
    }
}
