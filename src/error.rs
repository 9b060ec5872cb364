use std::io;
use thiserror::Error;

/// Stable integer error codes surfaced to foreign callers and logs.
///
/// The numbering is part of the public contract and must not change between
/// releases. Some codes (`AllocatingMemory`, `CreatingMutex`) exist only for
/// table stability; a Rust implementation has no failing allocation or mutex
/// creation path, so no [`Error`] variant maps to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    InvalidParam = 1,
    AllocatingMemory = 2,
    CreatingMutex = 3,
    SocketInit = 4,
    WritingToSocket = 5,
    InitializingWebsocket = 6,
    TimeoutInitializingWebsocket = 7,
    ReadingFromWebsocket = 8,
    WritingToWebsocket = 9,
    NotConnected = 10,
    FrameTooLarge = 11,
    MsgTooLarge = 12,
    InvalidFrameType = 13,
    InvalidAcceptKey = 14,
    Unknown = 15,
}

#[derive(Error, Debug)]
pub enum Error {
    // Parameter / construction errors
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    #[error("error opening socket: {source}")]
    SocketInit {
        #[from]
        source: io::Error,
    },

    // Handshake errors
    #[error("error writing upgrade request to socket")]
    WritingToSocket,

    #[error("error initializing websocket: {0}")]
    InitializingWebsocket(&'static str),

    #[error("timed out initializing websocket")]
    TimeoutInitializingWebsocket,

    #[error("server didn't send a valid Sec-WebSocket-Accept key")]
    InvalidAcceptKey,

    // Data path errors
    #[error("error reading from websocket")]
    ReadingFromWebsocket,

    #[error("error writing to websocket")]
    WritingToWebsocket,

    #[error("websocket is not connected")]
    NotConnected,

    // Framing errors
    #[error("message exceeds the maximum chunk size")]
    FrameTooLarge,

    #[error("payload exceeds the maximum frame size")]
    MsgTooLarge,

    #[error("invalid control frame type")]
    InvalidFrameType,
}

impl Error {
    /// The stable integer code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidParam(_) => ErrorCode::InvalidParam,
            Error::SocketInit { .. } => ErrorCode::SocketInit,
            Error::WritingToSocket => ErrorCode::WritingToSocket,
            Error::InitializingWebsocket(_) => ErrorCode::InitializingWebsocket,
            Error::TimeoutInitializingWebsocket => ErrorCode::TimeoutInitializingWebsocket,
            Error::InvalidAcceptKey => ErrorCode::InvalidAcceptKey,
            Error::ReadingFromWebsocket => ErrorCode::ReadingFromWebsocket,
            Error::WritingToWebsocket => ErrorCode::WritingToWebsocket,
            Error::NotConnected => ErrorCode::NotConnected,
            Error::FrameTooLarge => ErrorCode::FrameTooLarge,
            Error::MsgTooLarge => ErrorCode::MsgTooLarge,
            Error::InvalidFrameType => ErrorCode::InvalidFrameType,
        }
    }
}
