// src/io/cbt/framer.rs
//
// Frame classifier for the device -> host byte stream.
//
// The first byte of every frame selects its kind:
//   0x03  CAN notification, followed by a fixed 15-byte record:
//         [bus][id hi][id lo][data x8][len][status][reserved x2]
//   0x7B  '{' JSON-shaped frame, terminated by "}\r\n"
//   0xFF  OK acknowledgement, followed by a 2-byte "\r\n" terminator
//   0x80  ERROR acknowledgement, no terminator
//   other text line, that byte plus everything up to "\r\n"
//
// The classifier is fed whatever the channel returned; a frame may span any
// number of reads. The CAN record keeps its own assembly buffer and fill count,
// reset only when a record completes.

use super::{JsonReply, Reply};
use crate::io::IoError;

// =============================================================================
// Constants
// =============================================================================

/// Lead byte of a CAN frame notification
pub const LEAD_CAN: u8 = 0x03;
/// Lead byte of a JSON-shaped frame ('{')
pub const LEAD_JSON: u8 = 0x7B;
/// COMMAND_OK
pub const LEAD_OK: u8 = 0xFF;
/// COMMAND_ERROR
pub const LEAD_ERROR: u8 = 0x80;
/// Size of the CAN record following the lead byte
pub const CAN_RECORD_LEN: usize = 15;
/// Line terminator used by JSON, OK and text frames
pub const TERMINATOR: &[u8] = b"\r\n";

const JSON_END: &[u8] = b"}\r\n";
const MAX_PAYLOAD: usize = 8;

// =============================================================================
// Types
// =============================================================================

/// CAN notification record as sent by the device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanRecord {
    pub bus: u8,
    pub id: u16,
    pub data: Vec<u8>,
    pub status: u8,
}

impl CanRecord {
    fn decode(raw: &[u8; CAN_RECORD_LEN]) -> Result<CanRecord, IoError> {
        let len = raw[11] as usize;
        if len > MAX_PAYLOAD {
            return Err(IoError::protocol(
                "cbt",
                format!("CAN record length {} exceeds {} bytes", len, MAX_PAYLOAD),
            ));
        }
        Ok(CanRecord {
            bus: raw[0],
            id: u16::from_be_bytes([raw[1], raw[2]]),
            data: raw[3..3 + len].to_vec(),
            status: raw[12],
        })
    }
}

/// A classified frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Can(CanRecord),
    Json(JsonReply),
    /// `true` for OK, `false` for ERROR
    Ack(bool),
    Line(String),
}

impl Frame {
    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Can(_) => "CAN frame",
            Frame::Json(_) => "JSON response",
            Frame::Ack(true) => "OK",
            Frame::Ack(false) => "ERROR",
            Frame::Line(_) => "text line",
        }
    }

    /// The reply carried by a response frame; `None` for CAN notifications.
    pub fn into_reply(self) -> Option<Reply> {
        match self {
            Frame::Can(_) => None,
            Frame::Json(map) => Some(Reply::Json(map)),
            Frame::Ack(ok) => Some(Reply::Ack(ok)),
            Frame::Line(line) => Some(Reply::Line(line)),
        }
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Can,
    Json(Vec<u8>),
    OkTerminator(usize),
    Line(Vec<u8>),
}

/// Byte-fed frame classifier
#[derive(Debug)]
pub struct FrameClassifier {
    state: State,
    can_buf: [u8; CAN_RECORD_LEN],
    can_filled: usize,
    max_frame_len: usize,
}

impl Default for FrameClassifier {
    fn default() -> Self {
        FrameClassifier::new(4096)
    }
}

impl FrameClassifier {
    /// `max_frame_len` caps JSON and text frames; longer ones are discarded.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            state: State::Idle,
            can_buf: [0; CAN_RECORD_LEN],
            can_filled: 0,
            max_frame_len: max_frame_len.max(JSON_END.len()),
        }
    }

    /// Feed received bytes, returning every frame (or frame error) they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<Frame, IoError>> {
        let mut out = Vec::new();
        let mut rest = bytes;

        while !rest.is_empty() {
            // Bulk-copy CAN record bytes rather than going byte by byte
            if matches!(self.state, State::Can) {
                let take = (CAN_RECORD_LEN - self.can_filled).min(rest.len());
                self.can_buf[self.can_filled..self.can_filled + take].copy_from_slice(&rest[..take]);
                self.can_filled += take;
                rest = &rest[take..];

                if self.can_filled == CAN_RECORD_LEN {
                    self.can_filled = 0;
                    self.state = State::Idle;
                    out.push(CanRecord::decode(&self.can_buf).map(Frame::Can));
                }
                continue;
            }

            if let Some(result) = self.push(rest[0]) {
                out.push(result);
            }
            rest = &rest[1..];
        }

        out
    }

    /// Drop a partially read JSON, OK or text frame. A partial CAN record is kept.
    pub fn abandon_partial(&mut self) {
        if !matches!(self.state, State::Can) {
            self.state = State::Idle;
        }
    }

    /// Whether the classifier sits between frames.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Bytes of the current CAN record received so far.
    pub fn can_bytes_pending(&self) -> usize {
        self.can_filled
    }

    fn push(&mut self, byte: u8) -> Option<Result<Frame, IoError>> {
        match &mut self.state {
            State::Idle => {
                self.state = match byte {
                    LEAD_CAN => State::Can,
                    LEAD_JSON => State::Json(vec![LEAD_JSON]),
                    LEAD_OK => State::OkTerminator(TERMINATOR.len()),
                    LEAD_ERROR => return Some(Ok(Frame::Ack(false))),
                    other => State::Line(vec![other]),
                };
                self.complete_line_if_done()
            }
            State::Can => None, // handled in feed()
            State::OkTerminator(remaining) => {
                *remaining -= 1;
                if *remaining == 0 {
                    self.state = State::Idle;
                    Some(Ok(Frame::Ack(true)))
                } else {
                    None
                }
            }
            State::Json(buf) => {
                buf.push(byte);
                if buf.ends_with(JSON_END) {
                    let content = std::mem::take(buf);
                    self.state = State::Idle;
                    Some(parse_json(&content[..content.len() - TERMINATOR.len()]).map(Frame::Json))
                } else if buf.len() > self.max_frame_len {
                    self.state = State::Idle;
                    Some(Err(IoError::protocol(
                        "cbt",
                        format!("JSON frame exceeds {} bytes without terminator", self.max_frame_len),
                    )))
                } else {
                    None
                }
            }
            State::Line(buf) => {
                buf.push(byte);
                self.complete_line_if_done()
            }
        }
    }

    fn complete_line_if_done(&mut self) -> Option<Result<Frame, IoError>> {
        let State::Line(buf) = &mut self.state else {
            return None;
        };

        if buf.ends_with(TERMINATOR) {
            let line = String::from_utf8_lossy(&buf[..buf.len() - TERMINATOR.len()]).into_owned();
            self.state = State::Idle;
            // A bare terminator carries nothing worth delivering
            if line.is_empty() {
                None
            } else {
                Some(Ok(Frame::Line(line)))
            }
        } else if buf.len() > self.max_frame_len {
            self.state = State::Idle;
            Some(Err(IoError::protocol(
                "cbt",
                format!("text line exceeds {} bytes without terminator", self.max_frame_len),
            )))
        } else {
            None
        }
    }
}

/// Parse `{...}` into flat string pairs. Non-string scalars keep their textual form.
pub fn parse_json(content: &[u8]) -> Result<JsonReply, IoError> {
    let value: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(content)
        .map_err(|e| {
            IoError::protocol(
                "cbt",
                format!("unparsable JSON frame {:?}: {}", String::from_utf8_lossy(content), e),
            )
        })?;

    value
        .into_iter()
        .map(|(key, v)| {
            let text = match v {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                nested => {
                    return Err(IoError::protocol(
                        "cbt",
                        format!("nested value for key '{}': {}", key, nested),
                    ))
                }
            };
            Ok((key, text))
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn can_bytes(bus: u8, id: u16, data: &[u8], status: u8) -> Vec<u8> {
        let mut v = vec![LEAD_CAN, bus];
        v.extend_from_slice(&id.to_be_bytes());
        let mut slots = [0u8; 8];
        slots[..data.len()].copy_from_slice(data);
        v.extend_from_slice(&slots);
        v.push(data.len() as u8);
        v.push(status);
        v.extend_from_slice(&[0, 0]);
        v
    }

    fn frames(results: Vec<Result<Frame, IoError>>) -> Vec<Frame> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_classify_can_frame() {
        let mut framer = FrameClassifier::default();
        let out = frames(framer.feed(&can_bytes(1, 0x7E8, &[0x01, 0x02, 0x03], 0x01)));

        assert_eq!(
            out,
            vec![Frame::Can(CanRecord {
                bus: 1,
                id: 0x7E8,
                data: vec![0x01, 0x02, 0x03],
                status: 0x01,
            })]
        );
        assert!(framer.is_idle());
    }

    #[test]
    fn test_can_frame_across_reads() {
        let mut framer = FrameClassifier::default();
        let bytes = can_bytes(3, 0x0123, &[0xAA; 8], 0x03);

        assert!(framer.feed(&bytes[..4]).is_empty());
        assert_eq!(framer.can_bytes_pending(), 3);
        assert!(framer.feed(&bytes[4..10]).is_empty());
        assert_eq!(framer.can_bytes_pending(), 9);

        let out = frames(framer.feed(&bytes[10..]));
        assert_eq!(out.len(), 1);
        match &out[0] {
            Frame::Can(rec) => {
                assert_eq!(rec.bus, 3);
                assert_eq!(rec.id, 0x0123);
                assert_eq!(rec.data, vec![0xAA; 8]);
            }
            other => panic!("expected CAN frame, got {:?}", other),
        }
        assert_eq!(framer.can_bytes_pending(), 0);
    }

    #[test]
    fn test_classify_json_frame() {
        let mut framer = FrameClassifier::default();
        let out = frames(framer.feed(b"{\"name\":\"CANBus Triple\",\"version\":\"0.4.5\"}\r\n"));

        let mut expected = JsonReply::new();
        expected.insert("name".to_string(), "CANBus Triple".to_string());
        expected.insert("version".to_string(), "0.4.5".to_string());
        assert_eq!(out, vec![Frame::Json(expected)]);
    }

    #[test]
    fn test_json_numbers_become_text() {
        let mut framer = FrameClassifier::default();
        let out = frames(framer.feed(b"{\"bus\":1,\"rate\":125,\"ok\":true}\r\n"));
        match &out[0] {
            Frame::Json(map) => {
                assert_eq!(map["bus"], "1");
                assert_eq!(map["rate"], "125");
                assert_eq!(map["ok"], "true");
            }
            other => panic!("expected JSON frame, got {:?}", other),
        }
    }

    #[test]
    fn test_json_brace_inside_value_does_not_terminate() {
        let mut framer = FrameClassifier::default();
        let out = frames(framer.feed(b"{\"text\":\"a}b\"}\r\n"));
        match &out[0] {
            Frame::Json(map) => assert_eq!(map["text"], "a}b"),
            other => panic!("expected JSON frame, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json_is_protocol_error_and_loop_resumes() {
        let mut framer = FrameClassifier::default();
        let mut bytes = b"{not json}\r\n".to_vec();
        bytes.extend_from_slice(&[LEAD_OK, b'\r', b'\n']);

        let out = framer.feed(&bytes);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Err(IoError::Protocol { .. })));
        assert_eq!(out[1], Ok(Frame::Ack(true)));
    }

    #[test]
    fn test_nested_json_rejected() {
        let mut framer = FrameClassifier::default();
        let out = framer.feed(b"{\"a\":{\"b\":\"c\"}}\r\n");
        assert!(matches!(out[0], Err(IoError::Protocol { .. })));
    }

    #[test]
    fn test_ok_and_error_acks() {
        let mut framer = FrameClassifier::default();
        let out = frames(framer.feed(&[LEAD_ERROR, LEAD_OK, b'\r', b'\n', LEAD_ERROR]));
        assert_eq!(out, vec![Frame::Ack(false), Frame::Ack(true), Frame::Ack(false)]);
    }

    #[test]
    fn test_ok_terminator_split_across_reads() {
        let mut framer = FrameClassifier::default();
        assert!(framer.feed(&[LEAD_OK, b'\r']).is_empty());
        assert_eq!(frames(framer.feed(b"\n")), vec![Frame::Ack(true)]);
    }

    #[test]
    fn test_text_line() {
        let mut framer = FrameClassifier::default();
        assert!(framer.feed(b"Bus 1 ").is_empty());
        let out = frames(framer.feed(b"ready\r\n\r\n"));
        assert_eq!(out, vec![Frame::Line("Bus 1 ready".to_string())]);
    }

    #[test]
    fn test_interleaved_stream() {
        let mut framer = FrameClassifier::default();
        let mut bytes = can_bytes(2, 0x0100, &[0x11], 0x02);
        bytes.extend_from_slice(b"{\"result\":\"success\"}\r\n");
        bytes.extend_from_slice(&can_bytes(1, 0x0200, &[], 0x01));

        let out = frames(framer.feed(&bytes));
        assert_eq!(out.len(), 3);
        assert!(matches!(out[0], Frame::Can(ref r) if r.bus == 2));
        assert!(matches!(out[1], Frame::Json(ref m) if m["result"] == "success"));
        assert!(matches!(out[2], Frame::Can(ref r) if r.data.is_empty()));
    }

    #[test]
    fn test_oversized_can_length_rejected() {
        let mut framer = FrameClassifier::default();
        let mut bytes = can_bytes(1, 0x0100, &[0; 8], 0x01);
        bytes[12] = 9; // length byte

        let out = framer.feed(&bytes);
        assert!(matches!(out[0], Err(IoError::Protocol { .. })));
        assert!(framer.is_idle());
    }

    #[test]
    fn test_unterminated_line_is_bounded() {
        let mut framer = FrameClassifier::new(16);
        let out = framer.feed(&[b'x'; 20]);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(IoError::Protocol { .. })));
    }

    #[test]
    fn test_abandon_partial_keeps_can_cursor() {
        let mut framer = FrameClassifier::default();
        framer.feed(b"{\"half\":");
        framer.abandon_partial();
        assert!(framer.is_idle());

        let bytes = can_bytes(1, 0x0300, &[0x42], 0x01);
        framer.feed(&bytes[..6]);
        framer.abandon_partial();
        assert_eq!(framer.can_bytes_pending(), 5);

        let out = frames(framer.feed(&bytes[6..]));
        assert!(matches!(out[0], Frame::Can(ref r) if r.data == vec![0x42]));
    }
}
