//! Frames the relay writes to clients on its own behalf

use bytes::Bytes;
use serde_json::json;

/// Comment frame sent first so the client sees the stream open immediately
pub const OPEN_COMMENT: &[u8] = b":ok\n\n";

/// The one terminating frame of every session
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

pub fn open_comment() -> Bytes {
    Bytes::from_static(OPEN_COMMENT)
}

pub fn done() -> Bytes {
    Bytes::from_static(DONE_FRAME)
}

/// Blank line closing a record that upstream left unterminated
pub fn line_break() -> Bytes {
    Bytes::from_static(b"\n\n")
}

/// `data: {"meta":{"conversation_id":...}}`
pub fn meta(conversation_id: &str) -> Bytes {
    data_frame(&json!({ "meta": { "conversation_id": conversation_id } }))
}

/// `data: {"message":"<reason>"}`
pub fn error(message: &str) -> Bytes {
    data_frame(&json!({ "message": message }))
}

fn data_frame(payload: &serde_json::Value) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::parser::{FrameParser, SseRecord};

    #[test]
    fn test_meta_frame() {
        assert_eq!(
            meta("abc"),
            Bytes::from_static(b"data: {\"meta\":{\"conversation_id\":\"abc\"}}\n\n")
        );
    }

    #[test]
    fn test_error_frame_escapes_message() {
        let frame = error("bad \"quote\"\nline");
        let records = FrameParser::new().feed(&frame);
        assert_eq!(records.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(records[0].data()).unwrap();
        assert_eq!(parsed["message"], "bad \"quote\"\nline");
    }

    #[test]
    fn test_done_frame_parses_as_sentinel() {
        assert_eq!(FrameParser::new().feed(&done()), vec![SseRecord::Done]);
    }

    #[test]
    fn test_line_break_separates_partial_line_from_done() {
        let mut parser = FrameParser::new();
        let mut records = parser.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel");
        records.extend(parser.feed(&line_break()));
        records.extend(parser.feed(&done()));
        assert_eq!(records.last(), Some(&SseRecord::Done));
    }

    #[test]
    fn test_open_comment_yields_no_records() {
        assert!(FrameParser::new().feed(&open_comment()).is_empty());
    }
}
