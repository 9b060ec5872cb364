//! Client-side WebSocket engine for embedded gateway connections.
//!
//! This library drives one websocket connection over a TLS byte transport:
//! it performs the opening HTTP upgrade handshake, frames and de-frames
//! text/binary/control messages, and delivers received data through
//! registered callbacks. There is no internal thread or async runtime; the
//! application calls the send methods from wherever it likes and polls
//! [`WsSession::receive`] in a loop, so the engine fits single-threaded
//! firmware loops as well as multithreaded hosts.
//!
//! The wire format follows [RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455)
//! with two deliberate deviations the upstream server depends on: outbound
//! frames use a zeroed masking key, and the 64-bit extended payload length
//! is rejected (frames are capped at 65535 bytes).

pub mod close;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
mod handshake;
mod receive;
pub mod session;
pub mod transport;

pub use close::CloseCode;
pub use config::WsConfig;
pub use error::{Error, ErrorCode};
pub use event::WsEvent;
pub use session::WsSession;
pub use transport::Transport;

#[cfg(test)]
mod tests;
