//! Incremental server-sent-event parser
//!
//! Turns an arbitrarily fragmented byte stream into `data:` records. Only
//! complete lines ever produce a record, so the output is identical no matter
//! where the upstream transport splits its chunks.
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//!
//! data: [DONE]
//! ```

/// Payload that marks the logical end of an upstream stream
pub const DONE_SENTINEL: &str = "[DONE]";

const DATA_PREFIX: &str = "data:";

/// A parsed SSE `data:` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseRecord {
    /// Non-empty payload of a `data:` line
    Data(String),
    /// Terminal `[DONE]` marker
    Done,
}

impl SseRecord {
    pub fn is_sentinel(&self) -> bool {
        matches!(self, SseRecord::Done)
    }

    pub fn data(&self) -> &str {
        match self {
            SseRecord::Data(data) => data,
            SseRecord::Done => DONE_SENTINEL,
        }
    }
}

/// Stateful line splitter for one relay session.
///
/// The buffered tail is always a prefix of a single line and never contains a
/// `\n`. Bytes are buffered raw and decoded per complete line, so a multi-byte
/// character split across chunks decodes the same as an unsplit one.
#[derive(Debug, Default)]
pub struct FrameParser {
    tail: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every record completed by it
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseRecord> {
        if bytes.is_empty() {
            return Vec::new();
        }

        self.tail.extend_from_slice(bytes);

        let Some(last_newline) = self.tail.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let remainder = self.tail.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.tail, remainder);

        complete
            .split(|b| *b == b'\n')
            .filter_map(parse_line)
            .collect()
    }

    /// Parse whatever is left in the buffer as a final line.
    ///
    /// Only meaningful on forced termination: a well-formed stream always ends
    /// with a terminated `[DONE]` line.
    pub fn flush(&mut self) -> Option<SseRecord> {
        let tail = std::mem::take(&mut self.tail);
        parse_line(&tail)
    }

    /// Bytes of the incomplete trailing line
    pub fn pending(&self) -> &[u8] {
        &self.tail
    }
}

fn parse_line(line: &[u8]) -> Option<SseRecord> {
    let text = String::from_utf8_lossy(line);
    let data = text.strip_prefix(DATA_PREFIX)?.trim();

    if data == DONE_SENTINEL {
        Some(SseRecord::Done)
    } else if data.is_empty() {
        None
    } else {
        Some(SseRecord::Data(data.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = concat!(
        ": keep-alive comment\n\n",
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Grüß \"}}]}\n\n",
        "event: ignored\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"dich 👋\"}}]}\r\n\r\n",
        "data:\n\n",
        "data: [DONE]\n\n",
    );

    fn parse_whole(input: &[u8]) -> Vec<SseRecord> {
        FrameParser::new().feed(input)
    }

    #[test]
    fn test_parses_data_and_sentinel() {
        let records = parse_whole(STREAM.as_bytes());

        assert_eq!(records.len(), 4);
        assert_eq!(
            records[0],
            SseRecord::Data(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#.to_string())
        );
        assert_eq!(
            records[2],
            SseRecord::Data(r#"{"choices":[{"delta":{"content":"dich 👋"}}]}"#.to_string())
        );
        assert_eq!(records[3], SseRecord::Done);
        assert!(records[3].is_sentinel());
    }

    #[test]
    fn test_split_at_every_offset_yields_identical_records() {
        let bytes = STREAM.as_bytes();
        let expected = parse_whole(bytes);

        for offset in 0..=bytes.len() {
            let mut parser = FrameParser::new();
            let mut records = parser.feed(&bytes[..offset]);
            records.extend(parser.feed(&bytes[offset..]));
            assert_eq!(records, expected, "split at byte offset {offset}");
            assert!(parser.pending().is_empty());
        }
    }

    #[test]
    fn test_byte_at_a_time_yields_identical_records() {
        let bytes = STREAM.as_bytes();
        let mut parser = FrameParser::new();
        let records: Vec<SseRecord> = bytes.iter().flat_map(|b| parser.feed(&[*b])).collect();
        assert_eq!(records, parse_whole(bytes));
    }

    #[test]
    fn test_incomplete_line_is_held_back() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"data: {\"a\":1}").is_empty());
        assert_eq!(parser.pending(), b"data: {\"a\":1}");

        let records = parser.feed(b"\n\n");
        assert_eq!(records, vec![SseRecord::Data(r#"{"a":1}"#.to_string())]);
        assert!(parser.pending().is_empty());
    }

    #[test]
    fn test_empty_feed_is_a_no_op() {
        let mut parser = FrameParser::new();
        parser.feed(b"data: partial");

        assert!(parser.feed(b"").is_empty());
        assert_eq!(parser.pending(), b"data: partial");
    }

    #[test]
    fn test_prefix_without_space_and_surrounding_whitespace() {
        let records = parse_whole(b"data:{\"x\":1}\ndata:   [DONE]   \n");
        assert_eq!(
            records,
            vec![SseRecord::Data(r#"{"x":1}"#.to_string()), SseRecord::Done]
        );
    }

    #[test]
    fn test_non_data_lines_are_ignored() {
        let records = parse_whole(b"id: 7\nretry: 100\n: comment\nevent: message\n\n");
        assert!(records.is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_replaced_not_fatal() {
        let records = parse_whole(b"data: caf\xff\n");
        assert_eq!(records, vec![SseRecord::Data("caf\u{FFFD}".to_string())]);
    }

    #[test]
    fn test_flush_returns_trailing_record() {
        let mut parser = FrameParser::new();
        assert!(parser.feed(b"data: [DONE]").is_empty());
        assert_eq!(parser.flush(), Some(SseRecord::Done));
        assert!(parser.pending().is_empty());
        assert_eq!(parser.flush(), None);
    }

    #[test]
    fn test_data_accessor() {
        assert_eq!(SseRecord::Done.data(), "[DONE]");
        assert_eq!(SseRecord::Data("x".to_string()).data(), "x");
    }
}
