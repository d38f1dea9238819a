//! Frames as seen by connections: an opaque payload plus a type tag.
//!
//! Payload encoding (JSON, binary, anything else) belongs to the handler
//! layer. A connection only inspects the tag to route control frames.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// Normal closure status code.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away (server shutdown, client teardown).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Message exceeded the configured size limit.
pub const CLOSE_TOO_LARGE: u16 = 1009;
/// Unexpected condition (write failure, liveness timeout).
pub const CLOSE_INTERNAL: u16 = 1011;

/// Frame type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// UTF-8 text data.
    Text,
    /// Binary data.
    Binary,
    /// Liveness check.
    Ping,
    /// Liveness reply.
    Pong,
    /// Close handshake; payload is a 2-byte status code plus a UTF-8 reason.
    Close,
}

/// One WebSocket frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    payload: Bytes,
}

impl Message {
    /// Text frame.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            payload: Bytes::from(text.into()),
        }
    }

    /// Binary frame.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Binary,
            payload: data.into(),
        }
    }

    /// Ping frame.
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Ping,
            payload: data.into(),
        }
    }

    /// Pong frame.
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Pong,
            payload: data.into(),
        }
    }

    /// Close frame with a status code and reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut buf = BytesMut::with_capacity(2 + reason.len());
        buf.put_u16(code);
        buf.put_slice(reason.as_bytes());
        Self {
            kind: MessageKind::Close,
            payload: buf.freeze(),
        }
    }

    /// Close frame without a status code.
    pub fn close_empty() -> Self {
        Self {
            kind: MessageKind::Close,
            payload: Bytes::new(),
        }
    }

    /// Reassemble a frame from its parts (used by transport adapters).
    pub(crate) fn from_parts(kind: MessageKind, payload: Bytes) -> Self {
        Self { kind, payload }
    }

    /// Frame type.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the frame, returning its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Text or binary (as opposed to a control frame).
    pub fn is_data(&self) -> bool {
        matches!(self.kind, MessageKind::Text | MessageKind::Binary)
    }

    /// Payload as UTF-8, if it is valid.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Status code of a close frame.
    pub fn close_code(&self) -> Option<u16> {
        if self.kind != MessageKind::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Reason text of a close frame.
    pub fn close_reason(&self) -> Option<&str> {
        if self.kind != MessageKind::Close || self.payload.len() < 2 {
            return None;
        }
        std::str::from_utf8(&self.payload[2..]).ok()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Message");
        let _ = s.field("kind", &self.kind).field("len", &self.payload.len());
        if self.kind == MessageKind::Text && self.payload.len() <= 64 {
            let _ = s.field("text", &self.as_text());
        }
        s.finish()
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self::binary(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frame() {
        let m = Message::text("hello");
        assert_eq!(m.kind(), MessageKind::Text);
        assert_eq!(m.as_text(), Some("hello"));
        assert_eq!(m.len(), 5);
        assert!(m.is_data());
    }

    #[test]
    fn control_frames_are_not_data() {
        assert!(!Message::ping(Bytes::new()).is_data());
        assert!(!Message::pong(Bytes::new()).is_data());
        assert!(!Message::close_empty().is_data());
        assert!(Message::binary(vec![1, 2, 3]).is_data());
    }

    #[test]
    fn close_frame_carries_code_and_reason() {
        let m = Message::close(CLOSE_GOING_AWAY, "shutdown");
        assert_eq!(m.close_code(), Some(1001));
        assert_eq!(m.close_reason(), Some("shutdown"));
        assert_eq!(m.len(), 2 + "shutdown".len());
    }

    #[test]
    fn empty_close_has_no_code() {
        let m = Message::close_empty();
        assert_eq!(m.close_code(), None);
        assert!(m.is_empty());
    }

    #[test]
    fn close_code_only_for_close_frames() {
        assert_eq!(Message::binary(vec![0x03, 0xE8]).close_code(), None);
    }

    #[test]
    fn conversions() {
        assert_eq!(Message::from("a"), Message::text("a"));
        assert_eq!(Message::from(String::from("a")), Message::text("a"));
        assert_eq!(Message::from(vec![1u8]).kind(), MessageKind::Binary);
    }

    #[test]
    fn debug_shows_short_text() {
        let dbg = format!("{:?}", Message::text("hi"));
        assert!(dbg.contains("hi"));
    }
}
