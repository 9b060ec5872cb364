use std::time::Duration;

use log::{debug, error, trace, warn};

use crate::error::Error;
use crate::event::WsEvent;
use crate::frame::{self, DataKind, LengthField, OpCode};
use crate::session::{lock, WsSession};

/// Scratch space for one frame header under assembly.
const HEADER_SCRATCH: usize = 64;
/// Header length once the extended-length bytes are included.
const EXTENDED_HEADER: usize = 4;

/// What the next transport read is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadState {
    /// Accumulating header bytes.
    Header,
    /// Accumulating the payload of a text frame.
    Text,
    /// Accumulating the payload of a binary frame.
    Binary,
    /// Accumulating the payload of a close, ping or pong frame.
    Control,
}

/// Resumable receive state: everything a single `receive` poll picks up
/// where the previous one left off.
pub(crate) struct RecvState {
    frame: Vec<u8>,
    frame_len: usize,
    header: [u8; HEADER_SCRATCH],
    header_len: usize,
    /// Bytes still required to finish the current parse step.
    bytes_needed: usize,
    state: ReadState,
    opcode: OpCode,
    /// Kind of the data message whose fragments are in flight. Survives
    /// both the per-fragment buffer reset and an interleaved control
    /// frame, so a continuation frame still reaches the right callback.
    pending: Option<DataKind>,
    frame_size: usize,
}

impl RecvState {
    pub(crate) fn new(frame_size: u16) -> Self {
        RecvState {
            frame: vec![0; frame_size as usize + frame::HEADER_MAX + 1],
            frame_len: 0,
            header: [0; HEADER_SCRATCH],
            header_len: 0,
            bytes_needed: frame::HEADER_MIN,
            state: ReadState::Header,
            opcode: OpCode::Continue,
            pending: None,
            frame_size: frame_size as usize,
        }
    }

    // Back to the start of the next frame; an in-flight fragmented message
    // keeps its `pending` kind.
    fn reset_frame(&mut self) {
        self.header = [0; HEADER_SCRATCH];
        self.header_len = 0;
        self.frame_len = 0;
        self.bytes_needed = frame::HEADER_MIN;
        self.state = ReadState::Header;
    }

    pub(crate) fn reset_all(&mut self) {
        self.reset_frame();
        self.pending = None;
    }

    fn payload(&self) -> &[u8] {
        &self.frame[..self.frame_len]
    }

    fn fin(&self) -> bool {
        self.header[0] & 0x80 != 0
    }

    #[cfg(test)]
    pub(crate) fn parse_position(&self) -> (ReadState, usize) {
        (self.state, self.bytes_needed)
    }
}

impl WsSession {
    /// Checks the transport for data and drives the receive state machine.
    ///
    /// Must be polled regularly; each call performs at most one payload
    /// read and returns. A timeout with no data is not an error, the call
    /// returns Ok with the state unchanged. Received frames are delivered
    /// through the registered callbacks before the call returns.
    pub fn receive(&self, timeout: Duration) -> Result<(), Error> {
        if !self.is_connected() {
            debug!("receive: not connected");
            return Err(Error::NotConnected);
        }
        let mut rx = lock(&self.recv);

        // A parse step must never ask for more bytes than the frame buffer
        // has room for.
        if rx.bytes_needed + rx.frame_len > rx.frame_size {
            error!("receive: buffer overrun avoided, resetting receive state");
            rx.reset_frame();
            return Ok(());
        }

        while rx.state == ReadState::Header {
            let (start, need) = (rx.header_len, rx.bytes_needed);
            let n = match self
                .transport()
                .read(&mut rx.header[start..start + need], timeout)
            {
                Ok(n) => n,
                Err(e) => {
                    warn!("receive: error reading frame header: {e}");
                    return self.fatal_receive_error(&mut rx);
                }
            };
            if n == 0 {
                return Ok(());
            }
            trace!("receive: read {n} bytes into the header buffer");
            rx.header_len += n;
            rx.bytes_needed -= n;
            if rx.bytes_needed > 0 {
                trace!(
                    "receive: header still missing {} bytes, will try again",
                    rx.bytes_needed
                );
                return Ok(());
            }

            match frame::length_field(rx.header[1]) {
                LengthField::Unsupported => {
                    error!("receive: incoming frame is too large to receive");
                    return self.fatal_receive_error(&mut rx);
                }
                LengthField::Extended => {
                    if rx.header_len < EXTENDED_HEADER {
                        rx.bytes_needed = EXTENDED_HEADER - rx.header_len;
                        continue;
                    }
                    let len = u16::from_be_bytes([rx.header[2], rx.header[3]]) as usize;
                    trace!("receive: got 2 byte length, payload is {len} bytes");
                    if len > rx.frame_size {
                        error!(
                            "receive: frame of {len} bytes exceeds the max frame size {}",
                            rx.frame_size
                        );
                        return self.fatal_receive_error(&mut rx);
                    }
                    rx.bytes_needed = len;
                }
                LengthField::Immediate(len) => {
                    if len as usize > rx.frame_size {
                        error!(
                            "receive: frame of {len} bytes exceeds the max frame size {}",
                            rx.frame_size
                        );
                        return self.fatal_receive_error(&mut rx);
                    }
                    rx.bytes_needed = len as usize;
                }
            }

            let opcode = match OpCode::from(rx.header[0] & 0x0F) {
                Some(opcode) => opcode,
                None => {
                    error!(
                        "receive: unknown opcode 0x{:02x}",
                        rx.header[0] & 0x0F
                    );
                    return self.fatal_receive_error(&mut rx);
                }
            };
            rx.opcode = opcode;
            rx.state = match opcode {
                // A continuation carries more of the pending message; a
                // lone continuation defaults to binary delivery.
                OpCode::Continue => match rx.pending {
                    Some(DataKind::Text) => ReadState::Text,
                    _ => ReadState::Binary,
                },
                OpCode::Text => {
                    rx.pending = Some(DataKind::Text);
                    ReadState::Text
                }
                OpCode::Binary => {
                    rx.pending = Some(DataKind::Binary);
                    ReadState::Binary
                }
                OpCode::Close | OpCode::Ping | OpCode::Pong => ReadState::Control,
            };
            trace!("receive: got header, body length is {}", rx.bytes_needed);

            if rx.bytes_needed == 0 {
                warn!("receive: got a header but the frame size is 0, discarding");
                rx.reset_frame();
                return Ok(());
            }
        }

        let (start, need) = (rx.frame_len, rx.bytes_needed);
        let n = match self
            .transport()
            .read(&mut rx.frame[start..start + need], timeout)
        {
            Ok(n) => n,
            Err(e) => {
                warn!("receive: error reading frame payload: {e}");
                return self.fatal_receive_error(&mut rx);
            }
        };
        if n == 0 {
            return Ok(());
        }
        trace!("receive: read {n} bytes into the frame buffer");
        rx.frame_len += n;
        rx.bytes_needed -= n;
        if rx.bytes_needed > 0 {
            trace!(
                "receive: frame still missing {} bytes, will try again",
                rx.bytes_needed
            );
            return Ok(());
        }

        self.dispatch_frame(&mut rx);
        Ok(())
    }

    fn dispatch_frame(&self, rx: &mut RecvState) {
        if !rx.fin() && rx.state != ReadState::Control {
            // Non-final data fragment: each fragment is handed out as-is
            // and the buffer recycled; `pending` keeps the message kind for
            // the continuation frames.
            match rx.state {
                ReadState::Text => {
                    trace!("receive: received multiframe text fragment");
                    self.callbacks.emit(self, WsEvent::Text(rx.payload()));
                }
                _ => {
                    trace!("receive: received multiframe binary fragment");
                    self.callbacks.emit(self, WsEvent::Binary(rx.payload()));
                }
            }
            rx.reset_frame();
            return;
        }

        match rx.opcode {
            OpCode::Continue => {
                match rx.pending {
                    Some(DataKind::Text) => {
                        trace!("receive: received final fragment of a text message");
                        self.callbacks.emit(self, WsEvent::Text(rx.payload()));
                    }
                    _ => {
                        trace!("receive: received final fragment of a binary message");
                        self.callbacks.emit(self, WsEvent::Binary(rx.payload()));
                    }
                }
                rx.pending = None;
            }
            OpCode::Text => {
                trace!("receive: received text message in a single frame");
                self.callbacks.emit(self, WsEvent::Text(rx.payload()));
                rx.pending = None;
            }
            OpCode::Binary => {
                trace!("receive: received binary message in a single frame");
                self.callbacks.emit(self, WsEvent::Binary(rx.payload()));
                rx.pending = None;
            }
            OpCode::Close => {
                warn!("receive: websocket closed by the peer");
                self.mark_disconnected();
                self.callbacks.emit(self, WsEvent::Closed(rx.payload()));
            }
            OpCode::Ping => {
                trace!("receive: received ping");
                self.callbacks.emit(self, WsEvent::Ping(rx.payload()));
            }
            OpCode::Pong => {
                trace!("receive: received pong");
                self.callbacks.emit(self, WsEvent::Pong(rx.payload()));
            }
        }
        rx.reset_frame();
    }

    // A broken transport or malformed frame kills the session: flag it,
    // tell the application, bring up a fresh socket for the next connect.
    fn fatal_receive_error(&self, rx: &mut RecvState) -> Result<(), Error> {
        self.mark_disconnected();
        self.callbacks.emit(self, WsEvent::Closed(b"Socket Error"));
        rx.reset_all();
        if let Err(e) = self.transport().reconnect() {
            warn!("receive: error restarting the transport: {e}");
        }
        Err(Error::ReadingFromWebsocket)
    }
}
