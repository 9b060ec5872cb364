use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::close::CloseCode;
use crate::config::WsConfig;
use crate::error::{Error, ErrorCode};
use crate::handshake;
use crate::receive::ReadState;
use crate::session::{lock, WsSession};
use crate::transport::Transport;

const POLL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct MockState {
    /// Bytes the "server" has queued for the engine to read.
    incoming: VecDeque<u8>,
    /// Everything the engine wrote.
    written: Vec<u8>,
    reconnects: usize,
    /// Answer the next complete upgrade request with a valid 101 response.
    answer_upgrade: bool,
    fail_reads: bool,
    fail_writes: bool,
    /// Serve at most this many bytes per read; 0 means unlimited.
    max_read: usize,
}

struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    fn new(state: Arc<Mutex<MockState>>) -> Self {
        Self { state }
    }
}

impl Transport for MockTransport {
    fn reconnect(&self) -> io::Result<()> {
        lock(&self.state).reconnects += 1;
        Ok(())
    }

    fn read(&self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.fail_reads {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted failure"));
        }
        let mut n = usize::min(buf.len(), state.incoming.len());
        if state.max_read > 0 {
            n = usize::min(n, state.max_read);
        }
        for slot in buf.iter_mut().take(n) {
            *slot = state.incoming.pop_front().expect("length checked above");
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8], _timeout: Duration) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted failure"));
        }
        state.written.extend_from_slice(buf);
        if state.answer_upgrade && state.written.ends_with(b"\r\n\r\n") {
            let request = String::from_utf8_lossy(&state.written).into_owned();
            let key = request
                .split("Sec-WebSocket-Key: ")
                .nth(1)
                .and_then(|rest| rest.split("\r\n").next())
                .expect("upgrade request carries a key")
                .to_string();
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\
                 \r\n",
                handshake::accept_value(&key)
            );
            state.incoming.extend(response.as_bytes());
            state.answer_upgrade = false;
        }
        Ok(buf.len())
    }

    fn close(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Recorded {
    Connected,
    Text(Vec<u8>),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Closed(Vec<u8>),
}

struct Harness {
    session: WsSession,
    state: Arc<Mutex<MockState>>,
    events: Arc<Mutex<Vec<Recorded>>>,
}

impl Harness {
    fn events(&self) -> Vec<Recorded> {
        lock(&self.events).clone()
    }

    fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    fn reconnects(&self) -> usize {
        lock(&self.state).reconnects
    }

    fn queue(&self, bytes: &[u8]) {
        lock(&self.state).incoming.extend(bytes);
    }

    fn parse_position(&self) -> (ReadState, usize) {
        lock(&self.session.recv).parse_position()
    }
}

fn test_config() -> WsConfig {
    WsConfig {
        host: "gateway.example.com".into(),
        port: 443,
        resource: "/Gateway/WS".into(),
        api_key: "unit-test-key".into(),
        message_chunk_size: 1024,
        frame_size: 1024,
        socket_read_timeout: Duration::from_millis(5),
        ..Default::default()
    }
}

fn disconnected_harness(config: WsConfig) -> Harness {
    let state = Arc::new(Mutex::new(MockState {
        answer_upgrade: true,
        ..Default::default()
    }));
    let transport = MockTransport::new(state.clone());
    let session = WsSession::with_transport(config, Box::new(transport)).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    session.on_connected(move |_| lock(&sink).push(Recorded::Connected));
    let sink = events.clone();
    session.on_text_message(move |_, b| lock(&sink).push(Recorded::Text(b.to_vec())));
    let sink = events.clone();
    session.on_binary_message(move |_, b| lock(&sink).push(Recorded::Binary(b.to_vec())));
    let sink = events.clone();
    session.on_ping(move |_, b| lock(&sink).push(Recorded::Ping(b.to_vec())));
    let sink = events.clone();
    session.on_pong(move |_, b| lock(&sink).push(Recorded::Pong(b.to_vec())));
    let sink = events.clone();
    session.on_close(move |_, b| lock(&sink).push(Recorded::Closed(b.to_vec())));

    Harness {
        session,
        state,
        events,
    }
}

// A connected session with the handshake already behind it and the write
// capture cleared.
fn connected_harness() -> Harness {
    let harness = disconnected_harness(test_config());
    harness
        .session
        .connect(Duration::from_millis(250))
        .expect("scripted handshake succeeds");
    assert!(harness.session.is_connected());
    assert_eq!(harness.events(), vec![Recorded::Connected]);
    lock(&harness.state).written.clear();
    lock(&harness.events).clear();
    harness
}

#[test]
fn test_connect_sends_upgrade_request() {
    let harness = disconnected_harness(test_config());
    harness.session.connect(Duration::from_millis(250)).unwrap();
    let request = String::from_utf8(harness.written()).unwrap();
    assert!(request.starts_with("GET /Gateway/WS HTTP/1.1\r\n"));
    assert!(request.contains("Upgrade: websocket\r\n"));
    assert!(request.contains("Max-Frame-Size: 1024\r\n"));
    assert!(request.contains("appKey: unit-test-key\r\n"));
    assert!(harness.session.is_connected());
    assert_eq!(harness.events(), vec![Recorded::Connected]);
    // Connecting again is a no-op
    harness.session.connect(Duration::from_millis(250)).unwrap();
    assert_eq!(harness.events(), vec![Recorded::Connected]);
}

#[test]
fn test_handshake_failure_non_101() {
    let harness = disconnected_harness(test_config());
    lock(&harness.state).answer_upgrade = false;
    harness.queue(b"HTTP/1.1 200 OK\r\n\r\n");
    let err = harness
        .session
        .connect(Duration::from_millis(250))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InitializingWebsocket);
    assert!(!harness.session.is_connected());
    assert!(harness.events().is_empty());
}

#[test]
fn test_handshake_accept_mismatch() {
    let harness = disconnected_harness(test_config());
    lock(&harness.state).answer_upgrade = false;
    harness.queue(
        b"HTTP/1.1 101 Switching Protocols\r\n\
          Upgrade: websocket\r\n\
          Connection: Upgrade\r\n\
          Sec-WebSocket-Accept: bm90IHRoZSByaWdodCBrZXk=\r\n\
          \r\n",
    );
    let err = harness
        .session
        .connect(Duration::from_millis(250))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidAcceptKey));
    assert!(!harness.session.is_connected());
}

#[test]
fn test_connect_timeout() {
    let harness = disconnected_harness(test_config());
    lock(&harness.state).answer_upgrade = false;
    let err = harness
        .session
        .connect(Duration::from_millis(30))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TimeoutInitializingWebsocket);
    assert!(!harness.session.is_connected());
}

#[test]
fn test_single_text_frame() {
    let harness = connected_harness();
    harness.queue(&[0x81, 0x05]);
    harness.queue(b"hello");
    harness.session.receive(POLL).unwrap();
    assert_eq!(harness.events(), vec![Recorded::Text(b"hello".to_vec())]);
    assert_eq!(harness.parse_position(), (ReadState::Header, 2));
}

#[test]
fn test_fragmented_binary_message() {
    let harness = connected_harness();
    harness.queue(&[0x02, 0x03]);
    harness.queue(b"abc");
    harness.queue(&[0x80, 0x02]);
    harness.queue(b"de");
    harness.session.receive(POLL).unwrap();
    harness.session.receive(POLL).unwrap();
    // Each fragment is delivered individually, never coalesced
    assert_eq!(
        harness.events(),
        vec![
            Recorded::Binary(b"abc".to_vec()),
            Recorded::Binary(b"de".to_vec()),
        ]
    );
}

#[test]
fn test_ping_between_fragments() {
    let harness = connected_harness();
    harness.queue(&[0x02, 0x03]);
    harness.queue(b"abc");
    harness.queue(&[0x89, 0x04]);
    harness.queue(b"PING");
    harness.queue(&[0x80, 0x02]);
    harness.queue(b"de");
    for _ in 0..3 {
        harness.session.receive(POLL).unwrap();
    }
    // The control frame does not disturb the in-flight binary message
    assert_eq!(
        harness.events(),
        vec![
            Recorded::Binary(b"abc".to_vec()),
            Recorded::Ping(b"PING".to_vec()),
            Recorded::Binary(b"de".to_vec()),
        ]
    );
}

#[test]
fn test_extended_length_frame() {
    let harness = connected_harness();
    let payload = vec![b'X'; 256];
    harness.queue(&[0x82, 0x7E, 0x01, 0x00]);
    harness.queue(&payload);
    harness.session.receive(POLL).unwrap();
    assert_eq!(harness.events(), vec![Recorded::Binary(payload)]);
    assert_eq!(harness.parse_position(), (ReadState::Header, 2));
}

#[test]
fn test_oversized_frame_tears_down_session() {
    let harness = connected_harness();
    let reconnects_before = harness.reconnects();
    harness.queue(&[0x82, 0x7F]);
    let err = harness.session.receive(POLL).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ReadingFromWebsocket);
    assert!(!harness.session.is_connected());
    assert_eq!(harness.reconnects(), reconnects_before + 1);
    assert_eq!(
        harness.events(),
        vec![Recorded::Closed(b"Socket Error".to_vec())]
    );
}

#[test]
fn test_announced_payload_larger_than_frame_size() {
    let harness = connected_harness();
    // 2000 bytes announced against a 1024 byte frame buffer
    harness.queue(&[0x82, 0x7E, 0x07, 0xD0]);
    let err = harness.session.receive(POLL).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ReadingFromWebsocket);
    assert!(!harness.session.is_connected());
}

#[test]
fn test_unknown_opcode_is_fatal() {
    let harness = connected_harness();
    harness.queue(&[0x83, 0x01, 0x00]);
    let err = harness.session.receive(POLL).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ReadingFromWebsocket);
    assert_eq!(
        harness.events(),
        vec![Recorded::Closed(b"Socket Error".to_vec())]
    );
}

#[test]
fn test_receive_close_frame() {
    let harness = connected_harness();
    harness.queue(&[0x88, 0x02, 0x03, 0xE8]);
    harness.session.receive(POLL).unwrap();
    assert!(!harness.session.is_connected());
    assert_eq!(
        harness.events(),
        vec![Recorded::Closed(vec![0x03, 0xE8])]
    );
}

#[test]
fn test_receive_timeout_keeps_state() {
    let harness = connected_harness();
    harness.session.receive(POLL).unwrap();
    assert!(harness.events().is_empty());
    assert_eq!(harness.parse_position(), (ReadState::Header, 2));
    assert!(harness.session.is_connected());
}

#[test]
fn test_byte_at_a_time_delivery() {
    let harness = connected_harness();
    lock(&harness.state).max_read = 1;
    harness.queue(&[0x81, 0x05]);
    harness.queue(b"hello");
    // One byte per poll: the state machine resumes where it left off
    for _ in 0..7 {
        harness.session.receive(POLL).unwrap();
    }
    assert_eq!(harness.events(), vec![Recorded::Text(b"hello".to_vec())]);
}

#[test]
fn test_zero_length_frame_is_dropped() {
    let harness = connected_harness();
    harness.queue(&[0x89, 0x00]);
    harness.session.receive(POLL).unwrap();
    assert!(harness.events().is_empty());
    assert_eq!(harness.parse_position(), (ReadState::Header, 2));
    assert!(harness.session.is_connected());
}

#[test]
fn test_read_error_fires_close_and_restarts() {
    let harness = connected_harness();
    let reconnects_before = harness.reconnects();
    lock(&harness.state).fail_reads = true;
    let err = harness.session.receive(POLL).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ReadingFromWebsocket);
    assert!(!harness.session.is_connected());
    assert_eq!(harness.reconnects(), reconnects_before + 1);
    assert_eq!(
        harness.events(),
        vec![Recorded::Closed(b"Socket Error".to_vec())]
    );
    // Polling a dead session reports the state without touching the wire
    let err = harness.session.receive(POLL).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotConnected);
}

#[test]
fn test_send_message_single_frame() {
    let harness = connected_harness();
    harness.session.send_message(b"hi", true).unwrap();
    assert_eq!(
        harness.written(),
        vec![0x81, 0x82, 0x00, 0x00, 0x00, 0x00, b'h', b'i']
    );
}

#[test]
fn test_send_binary_message_extended_length() {
    let harness = connected_harness();
    let payload = vec![0xAB; 200];
    harness.session.send_message(&payload, false).unwrap();
    let written = harness.written();
    assert_eq!(&written[..8], &[0x82, 0xFE, 0x00, 200, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(&written[8..], &payload[..]);
}

#[test]
fn test_send_message_too_large() {
    let harness = connected_harness();
    let payload = vec![0u8; 1025];
    let err = harness.session.send_message(&payload, false).unwrap_err();
    assert_eq!(err.code(), ErrorCode::FrameTooLarge);
    assert!(harness.written().is_empty());
}

#[test]
fn test_send_when_disconnected() {
    let harness = disconnected_harness(test_config());
    let err = harness.session.send_message(b"hi", true).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotConnected);
}

#[test]
fn test_send_ping_and_pong() {
    let harness = connected_harness();
    harness.session.send_ping(Some(b"PING")).unwrap();
    harness.session.send_pong(b"PONG").unwrap();
    assert_eq!(
        harness.written(),
        vec![
            0x89, 0x84, 0x00, 0x00, 0x00, 0x00, b'P', b'I', b'N', b'G',
            0x8A, 0x84, 0x00, 0x00, 0x00, 0x00, b'P', b'O', b'N', b'G',
        ]
    );
}

#[test]
fn test_send_ping_default_payload_is_a_timestamp() {
    let harness = connected_harness();
    harness.session.send_ping(None).unwrap();
    let written = harness.written();
    assert_eq!(written[0], 0x89);
    assert_eq!(written[1], 0x80 | 8);
    let stamp = &written[6..];
    assert_eq!(stamp.len(), 8);
    assert_eq!(stamp[2], b':');
    assert_eq!(stamp[5], b':');
}

#[test]
fn test_send_write_error_tears_down_without_close_callback() {
    let harness = connected_harness();
    let reconnects_before = harness.reconnects();
    lock(&harness.state).fail_writes = true;
    let err = harness.session.send_message(b"hi", true).unwrap_err();
    assert_eq!(err.code(), ErrorCode::WritingToWebsocket);
    assert!(!harness.session.is_connected());
    assert_eq!(harness.reconnects(), reconnects_before + 1);
    assert!(harness.events().is_empty());
}

#[test]
fn test_disconnect_sends_close_frame() {
    let harness = connected_harness();
    harness
        .session
        .disconnect(CloseCode::NormalClose, "done")
        .unwrap();
    let written = harness.written();
    let text = b"Normal Close done";
    assert_eq!(written[0], 0x88);
    assert_eq!(written[1] as usize, 0x80 | (2 + text.len()));
    assert_eq!(&written[2..6], &[0x00, 0x00, 0x00, 0x00]);
    assert_eq!(&written[6..8], &[0x03, 0xE8]);
    assert_eq!(&written[8..], text);
    assert!(!harness.session.is_connected());
    assert_eq!(harness.events(), vec![Recorded::Closed(text.to_vec())]);
}

#[test]
fn test_disconnect_server_closed_sends_nothing() {
    let harness = connected_harness();
    harness
        .session
        .disconnect(CloseCode::ServerClosed, "gone")
        .unwrap();
    assert!(harness.written().is_empty());
    assert!(harness.events().is_empty());
    assert!(!harness.session.is_connected());
}

#[test]
fn test_callback_can_answer_ping_from_receive() {
    let harness = connected_harness();
    // Replace the recording ping callback with one that pongs back
    harness.session.on_ping(|ws, bytes| {
        ws.send_pong(bytes).unwrap();
    });
    harness.queue(&[0x89, 0x02]);
    harness.queue(b"hi");
    harness.session.receive(POLL).unwrap();
    assert_eq!(
        harness.written(),
        vec![0x8A, 0x82, 0x00, 0x00, 0x00, 0x00, b'h', b'i']
    );
}
