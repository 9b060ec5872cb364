use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::close::CloseCode;
use crate::config::WsConfig;
use crate::error::Error;
use crate::event::{CallbackRegistry, WsEvent};
use crate::frame::{self, DataKind, OpCode};
use crate::handshake;
use crate::receive::RecvState;
use crate::transport::{TlsTransport, Transport};

/// Timeout applied to every frame and handshake write.
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

// Locks a mutex, ignoring poisoning: a panicking callback must not wedge
// the engine for every later caller.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnStatus {
    Disconnected,
    Connected,
    Failed,
}

/// One client-side websocket connection.
///
/// The session has no thread of its own: callers drive it by invoking the
/// send methods and by polling [`WsSession::receive`] in a loop. Received
/// data is delivered synchronously from inside `receive` through the
/// registered callbacks.
///
/// Lock order, where locks nest at all, is message lock, then receive
/// state, then frame lock. `connect` holds the message lock and briefly
/// takes the receive state; a callback running under the receive state may
/// take the frame lock to answer a ping. The frame lock never waits on
/// either of the others.
pub struct WsSession {
    config: WsConfig,
    transport: Box<dyn Transport>,
    /// Base64 nonce of the current connect attempt, kept until the next one.
    security_key: Mutex<Option<String>>,
    status: Mutex<ConnStatus>,
    pub(crate) recv: Mutex<RecvState>,
    /// Serializes the fragments of one logical message.
    send_message: Mutex<()>,
    /// Serializes the bytes of a single frame on the wire.
    send_frame: Mutex<()>,
    pub(crate) callbacks: CallbackRegistry,
}

impl WsSession {
    /// Creates a session backed by a TLS transport to the configured
    /// endpoint. No connection is attempted until [`WsSession::connect`].
    pub fn new(config: WsConfig) -> Result<Self, Error> {
        let transport = TlsTransport::new(&config.host, config.port, config.ca_file.as_deref())?;
        Self::with_transport(config, Box::new(transport))
    }

    /// Creates a session over a caller-supplied transport.
    pub fn with_transport(config: WsConfig, transport: Box<dyn Transport>) -> Result<Self, Error> {
        config.validate()?;
        info!(
            "creating websocket session for {}:{}{}",
            config.host, config.port, config.resource
        );
        Ok(Self {
            recv: Mutex::new(RecvState::new(config.frame_size)),
            config,
            transport,
            security_key: Mutex::new(None),
            status: Mutex::new(ConnStatus::Disconnected),
            send_message: Mutex::new(()),
            send_frame: Mutex::new(()),
            callbacks: CallbackRegistry::default(),
        })
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        *lock(&self.status) == ConnStatus::Connected
    }

    pub(crate) fn mark_disconnected(&self) {
        *lock(&self.status) = ConnStatus::Disconnected;
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    // Callback registration. The callbacks are borrowed for the lifetime of
    // the session; dropping the session drops them.

    pub fn on_connected(&self, cb: impl FnMut(&WsSession) + Send + 'static) {
        self.callbacks.set_connected(Box::new(cb));
    }

    pub fn on_close(&self, cb: impl FnMut(&WsSession, &[u8]) + Send + 'static) {
        self.callbacks.set_close(Box::new(cb));
    }

    pub fn on_text_message(&self, cb: impl FnMut(&WsSession, &[u8]) + Send + 'static) {
        self.callbacks.set_text(Box::new(cb));
    }

    pub fn on_binary_message(&self, cb: impl FnMut(&WsSession, &[u8]) + Send + 'static) {
        self.callbacks.set_binary(Box::new(cb));
    }

    pub fn on_ping(&self, cb: impl FnMut(&WsSession, &[u8]) + Send + 'static) {
        self.callbacks.set_ping(Box::new(cb));
    }

    pub fn on_pong(&self, cb: impl FnMut(&WsSession, &[u8]) + Send + 'static) {
        self.callbacks.set_pong(Box::new(cb));
    }

    /// Opens the transport and performs the HTTP upgrade handshake.
    ///
    /// `timeout` bounds the whole exchange. Returns Ok immediately when the
    /// session is already connected. On success the connected callback has
    /// fired and the receive state machine is ready for polling.
    pub fn connect(&self, timeout: Duration) -> Result<(), Error> {
        if self.is_connected() {
            warn!("connect: already connected");
            return Ok(());
        }
        let msg_guard = lock(&self.send_message);

        let key = handshake::generate_key();
        let request = handshake::build_request(
            &self.config.resource,
            &self.config.host,
            &key,
            self.config.frame_size,
            &self.config.api_key,
        )?;
        *lock(&self.security_key) = Some(key);

        // Fresh transport for every attempt
        self.mark_disconnected();
        lock(&self.recv).reset_all();
        self.transport
            .reconnect()
            .map_err(|source| Error::SocketInit { source })?;

        let written = self
            .transport
            .write(request.as_bytes(), WRITE_TIMEOUT)
            .map_err(|e| {
                error!("connect: error sending upgrade request: {e}");
                self.teardown_transport();
                Error::WritingToSocket
            })?;
        if written != request.len() {
            error!("connect: short write sending upgrade request");
            self.teardown_transport();
            return Err(Error::WritingToSocket);
        }
        trace!("connect: sent upgrade request ({written} bytes)");

        // Accumulate the response until the blank line shows up, the
        // deadline passes, or the scratch buffer (one frame) runs out.
        let deadline = Instant::now() + timeout;
        let mut response = vec![0u8; self.config.frame_size as usize];
        let mut response_len = 0usize;
        let progress = loop {
            if Instant::now() >= deadline {
                error!("connect: timed out waiting for the upgrade response");
                *lock(&self.status) = ConnStatus::Failed;
                return Err(Error::TimeoutInitializingWebsocket);
            }
            if response_len == response.len() {
                error!("connect: upgrade response too big, websocket connect failed");
                *lock(&self.status) = ConnStatus::Failed;
                return Err(Error::InitializingWebsocket(
                    "upgrade response exceeds the frame buffer",
                ));
            }
            let n = self
                .transport
                .read(&mut response[response_len..], self.config.socket_read_timeout)
                .map_err(|e| {
                    error!("connect: error reading the upgrade response: {e}");
                    *lock(&self.status) = ConnStatus::Failed;
                    Error::InitializingWebsocket("error reading the upgrade response")
                })?;
            if n == 0 {
                continue;
            }
            response_len += n;
            if !handshake::has_terminator(&response[..response_len]) {
                trace!("connect: upgrade response incomplete, reading more");
                continue;
            }
            let stored_key = lock(&self.security_key);
            break handshake::parse_response(
                &response[..response_len],
                stored_key.as_deref().unwrap_or_default(),
            )
            .map_err(|e| {
                *lock(&self.status) = ConnStatus::Failed;
                e
            })?;
        };

        if progress.accept_mismatch {
            error!("connect: server sent an invalid accept key");
            *lock(&self.status) = ConnStatus::Failed;
            return Err(Error::InvalidAcceptKey);
        }
        if progress.failed() || !progress.complete() {
            error!("connect: error in upgrade response headers, websocket connect failed");
            *lock(&self.status) = ConnStatus::Failed;
            return Err(Error::InitializingWebsocket(
                "missing or invalid upgrade headers",
            ));
        }

        *lock(&self.status) = ConnStatus::Connected;
        lock(&self.recv).reset_all();
        info!("websocket connected to {}:{}", self.config.host, self.config.port);
        // Release the message lock before the callback so it may send
        drop(msg_guard);
        self.callbacks.emit(self, WsEvent::Connected);
        Ok(())
    }

    /// Sends a close frame carrying `code` and `reason`, closes the
    /// transport and fires the close callback.
    ///
    /// With [`CloseCode::ServerClosed`] the server is already gone: no
    /// frame is sent and no callback fires, the transport is just torn
    /// down.
    pub fn disconnect(&self, code: CloseCode, reason: &str) -> Result<(), Error> {
        debug!("disconnect called, code {code:?}, reason: {reason}");
        let mut sent_payload = None;
        if code != CloseCode::ServerClosed {
            let payload = code.close_payload(reason);
            // The transport goes away regardless of whether the frame made
            // it out, so a send failure only gets logged.
            if let Err(e) = self.send_control_frame(OpCode::Close, &payload) {
                warn!("disconnect: error sending close frame: {e}");
            }
            sent_payload = Some(payload);
        }
        self.mark_disconnected();
        self.transport.close();
        if let Some(payload) = sent_payload {
            self.callbacks.emit(self, WsEvent::Closed(&payload[2..]));
        }
        Ok(())
    }

    /// Sends one logical message, fragmenting it across frames when it
    /// exceeds the frame size. Fragments of concurrent messages are never
    /// interleaved.
    pub fn send_message(&self, buf: &[u8], is_text: bool) -> Result<(), Error> {
        if !self.is_connected() {
            warn!("send_message: not connected");
            return Err(Error::NotConnected);
        }
        if buf.is_empty() {
            return Err(Error::InvalidParam("message must not be empty"));
        }
        if buf.len() > self.config.message_chunk_size as usize {
            error!(
                "send_message: message of {} bytes exceeds the {} byte chunk limit",
                buf.len(),
                self.config.message_chunk_size
            );
            return Err(Error::FrameTooLarge);
        }
        let kind = if is_text { DataKind::Text } else { DataKind::Binary };

        let _guard = lock(&self.send_message);
        let mut frames_sent = 0u32;
        for (range, opcode, fin) in
            frame::fragments(buf.len(), self.config.frame_size as usize, kind)
        {
            self.send_data_frame(&buf[range], opcode, fin).map_err(|e| {
                error!("send_message: error sending frame {frames_sent}: {e}");
                e
            })?;
            frames_sent += 1;
        }
        debug!(
            "send_message: sent {} bytes using {frames_sent} frames",
            buf.len()
        );
        Ok(())
    }

    /// Sends a ping. Without a payload the current wall-clock time
    /// (`HH:MM:SS`) is used.
    pub fn send_ping(&self, msg: Option<&[u8]>) -> Result<(), Error> {
        let stamp;
        let payload = match msg {
            Some(payload) => payload,
            None => {
                stamp = current_time_stamp();
                stamp.as_bytes()
            }
        };
        self.send_control_frame(OpCode::Ping, payload)
    }

    /// Sends a pong, usually echoing a received ping payload.
    pub fn send_pong(&self, msg: &[u8]) -> Result<(), Error> {
        self.send_control_frame(OpCode::Pong, msg)
    }

    fn send_data_frame(&self, payload: &[u8], opcode: OpCode, fin: bool) -> Result<(), Error> {
        if !self.is_connected() {
            warn!("send_data_frame: not connected");
            return Err(Error::NotConnected);
        }
        if payload.len() > self.config.frame_size as usize {
            warn!(
                "send_data_frame: frame of {} bytes is too large, max frame size is {}",
                payload.len(),
                self.config.frame_size
            );
            return Err(Error::MsgTooLarge);
        }
        let header = frame::data_frame_header(opcode, fin, payload.len() as u16);

        let _guard = lock(&self.send_frame);
        let written = self
            .transport
            .write(&header, WRITE_TIMEOUT)
            .and_then(|h| self.transport.write(payload, WRITE_TIMEOUT).map(|p| h + p));
        match written {
            Ok(n) if n == header.len() + payload.len() => Ok(()),
            _ => {
                warn!("send_data_frame: error writing to socket");
                self.teardown_transport();
                Err(Error::WritingToWebsocket)
            }
        }
    }

    fn send_control_frame(&self, opcode: OpCode, payload: &[u8]) -> Result<(), Error> {
        if !self.is_connected() {
            warn!("send_control_frame: not connected");
            return Err(Error::NotConnected);
        }
        let frame = frame::control_frame(opcode, payload)?;

        let _guard = lock(&self.send_frame);
        debug!(
            "sending {opcode:?} control frame with {} payload bytes",
            payload.len()
        );
        match self.transport.write(&frame, WRITE_TIMEOUT) {
            Ok(n) if n == frame.len() => Ok(()),
            _ => {
                warn!("send_control_frame: error writing to socket");
                self.teardown_transport();
                Err(Error::WritingToWebsocket)
            }
        }
    }

    // Marks the session disconnected and reopens the transport to the same
    // endpoint. Receive cursors are deliberately not touched here: only the
    // receive path and `connect` reset them, each under the receive lock,
    // which keeps the lock order acyclic when this runs under the frame
    // lock.
    pub(crate) fn teardown_transport(&self) {
        self.mark_disconnected();
        if let Err(e) = self.transport.reconnect() {
            warn!("error restarting the transport: {e}");
        }
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        self.transport.close();
    }
}

fn current_time_stamp() -> String {
    let now = time::OffsetDateTime::now_utc().time();
    format!("{:02}:{:02}:{:02}", now.hour(), now.minute(), now.second())
}
