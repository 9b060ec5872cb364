use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use log::{error, trace};
use rand::random;
use sha1::{Digest, Sha1};

use crate::error::Error;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const WS_VERSION: &str = "13";
const USER_AGENT: &str = "ThingWorx C SDK";
/// The complete upgrade request must fit into this many bytes.
const MAX_REQUEST_SIZE: usize = 512;

/// Generates the `Sec-WebSocket-Key` for one connect attempt: the base64 of
/// 16 random bytes. The randomness only has to differ per attempt, it binds
/// this client's request to this client's response.
pub(crate) fn generate_key() -> String {
    let nonce: [u8; 16] = random();
    BASE64_STANDARD.encode(nonce)
}

/// The accept value the server must echo for `key`.
pub(crate) fn accept_value(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Builds the HTTP upgrade request. The header set and order are fixed; the
/// server rejects requests that deviate from them.
pub(crate) fn build_request(
    resource: &str,
    host: &str,
    key: &str,
    frame_size: u16,
    api_key: &str,
) -> Result<String, Error> {
    let request = format!(
        "GET {resource} HTTP/1.1\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Host: {host}\r\n\
         Sec-WebSocket-Version: {WS_VERSION}\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Max-Frame-Size: {frame_size}\r\n\
         appKey: {api_key}\r\n\
         \r\n"
    );
    if request.len() > MAX_REQUEST_SIZE {
        return Err(Error::InvalidParam("upgrade request exceeds 512 bytes"));
    }
    Ok(request)
}

pub(crate) fn has_terminator(raw: &[u8]) -> bool {
    raw.windows(4).any(|window| window == b"\r\n\r\n")
}

/// Progress through the required upgrade response headers.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HandshakeProgress {
    pub upgrade: bool,
    pub connection: bool,
    pub accept_valid: bool,
    /// The accept header was present but did not match the expected value.
    pub accept_mismatch: bool,
    /// Some other required header carried the wrong value.
    pub header_mismatch: bool,
}

impl HandshakeProgress {
    pub fn complete(&self) -> bool {
        self.upgrade && self.connection && self.accept_valid
    }

    pub fn failed(&self) -> bool {
        self.accept_mismatch || self.header_mismatch
    }
}

/// Parses a complete upgrade response and checks the three headers that
/// matter. Header names are case-insensitive; the accept key comparison is
/// exact.
pub(crate) fn parse_response(raw: &[u8], key: &str) -> Result<HandshakeProgress, Error> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Error::InitializingWebsocket("incomplete upgrade response"))
        }
        Err(_) => return Err(Error::InitializingWebsocket("malformed upgrade response")),
    }
    if response.code != Some(101) {
        error!(
            "unexpected upgrade response status: {}",
            response.code.unwrap_or_default()
        );
        return Err(Error::InitializingWebsocket("unexpected response status"));
    }

    let expected = accept_value(key);
    let mut progress = HandshakeProgress::default();
    for header in response.headers.iter() {
        trace!("upgrade response header {}: {:?}", header.name, header.value);
        if header.name.eq_ignore_ascii_case("upgrade") {
            if header.value.eq_ignore_ascii_case(b"websocket") {
                progress.upgrade = true;
            } else {
                error!("invalid 'upgrade' header value: {:?}", header.value);
                progress.header_mismatch = true;
            }
        } else if header.name.eq_ignore_ascii_case("connection") {
            if header.value.eq_ignore_ascii_case(b"upgrade") {
                progress.connection = true;
            } else {
                error!("invalid 'connection' header value: {:?}", header.value);
                progress.header_mismatch = true;
            }
        } else if header.name.eq_ignore_ascii_case("sec-websocket-accept") {
            if header.value == expected.as_bytes() {
                progress.accept_valid = true;
            } else {
                error!(
                    "accept keys don't match: expected {expected}, received {:?}",
                    header.value
                );
                progress.accept_mismatch = true;
            }
        }
    }
    Ok(progress)
}
