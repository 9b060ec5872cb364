use bytes::{BufMut, BytesMut};

use crate::frame::MAX_CONTROL_PAYLOAD;

/// Close reasons carried in the payload of an outbound close frame.
///
/// The wire encoding is vendor specific: byte 0 of the close payload is
/// always `0x03`, byte 1 is the code byte below, and a human-readable
/// reason follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// The server already closed the connection; no close frame is sent.
    ServerClosed,
    NormalClose,
    GoingToSleep,
    ProtocolError,
    UnsupportedDataType,
    InvalidData,
    PolicyViolation,
    FrameTooLarge,
    NoExtensionFound,
    UnexpectedCondition,
}

impl CloseCode {
    /// Second payload byte of the close frame. `ServerClosed` is never
    /// encoded; it falls back to the default byte.
    pub fn wire_byte(self) -> u8 {
        match self {
            CloseCode::NormalClose => 0xE8,
            CloseCode::GoingToSleep => 0xE9,
            CloseCode::ProtocolError => 0xEA,
            CloseCode::UnsupportedDataType => 0xEB,
            CloseCode::InvalidData => 0xEF,
            CloseCode::PolicyViolation => 0xF0,
            CloseCode::FrameTooLarge => 0xF1,
            CloseCode::NoExtensionFound => 0xF2,
            CloseCode::UnexpectedCondition | CloseCode::ServerClosed => 0xF3,
        }
    }

    fn reason_text(self) -> &'static str {
        match self {
            CloseCode::NormalClose => "Normal Close",
            CloseCode::GoingToSleep => "Going to Sleep",
            CloseCode::ProtocolError => "Protocol Error",
            CloseCode::UnsupportedDataType => "Unsupported Data Type",
            CloseCode::InvalidData => "Invalid Data",
            CloseCode::PolicyViolation => "Policy Violation",
            CloseCode::FrameTooLarge => "Frame too large",
            CloseCode::NoExtensionFound => "No extension found",
            CloseCode::UnexpectedCondition | CloseCode::ServerClosed => "Unexpected Condition",
        }
    }

    /// Builds the close frame payload: the two prefix bytes, the canned
    /// reason for this code, a space and the caller-supplied reason. Close
    /// frames are control frames, so the text is truncated to fit the
    /// control payload cap.
    pub(crate) fn close_payload(self, reason: &str) -> BytesMut {
        let text = self.reason_text();
        let mut payload = BytesMut::with_capacity(2 + text.len() + 1 + reason.len());
        payload.put_u8(0x03);
        payload.put_u8(self.wire_byte());
        payload.put_slice(text.as_bytes());
        payload.put_u8(b' ');
        payload.put_slice(reason.as_bytes());
        payload.truncate(MAX_CONTROL_PAYLOAD);
        payload
    }
}
