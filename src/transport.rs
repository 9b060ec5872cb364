use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};
use pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};

use crate::error::Error;
use crate::session::lock;

/// Byte transport the engine is driven over.
///
/// The engine only ever performs four operations: (re)open the connection to
/// the configured endpoint, read with a timeout, write with a timeout, and
/// close. `read` returns `Ok(0)` when nothing arrived within the timeout so
/// the caller can poll again; end-of-stream and socket failures are `Err`.
pub trait Transport: Send + Sync {
    fn reconnect(&self) -> io::Result<()>;
    fn read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
    fn write(&self, buf: &[u8], timeout: Duration) -> io::Result<usize>;
    fn close(&self);
}

struct TlsStream {
    sock: TcpStream,
    conn: ClientConnection,
}

/// TLS client transport: a `rustls` session over a blocking `TcpStream`.
///
/// Read and write share the connection state behind one lock, so a writer
/// can wait on an in-flight read for at most one read timeout.
pub struct TlsTransport {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    config: Arc<ClientConfig>,
    stream: Mutex<Option<TlsStream>>,
}

impl TlsTransport {
    pub fn new(host: &str, port: u16, ca_file: Option<&str>) -> Result<Self, Error> {
        let mut roots = RootCertStore::empty();
        match ca_file {
            Some(path) => {
                let file = File::open(path)?;
                let mut reader = BufReader::new(file);
                for cert in rustls_pemfile::certs(&mut reader) {
                    let cert = cert?;
                    roots
                        .add(cert)
                        .map_err(|_| Error::InvalidParam("ca_file contains an invalid certificate"))?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::InvalidParam("host is not a valid server name"))?;
        Ok(Self {
            host: host.to_string(),
            port,
            server_name,
            config: Arc::new(config),
            stream: Mutex::new(None),
        })
    }

    // Hands out already-decrypted bytes, if any. Ok(None) means the rustls
    // session has no plaintext buffered yet.
    fn drain_plaintext(stream: &mut TlsStream, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match stream.conn.reader().read(buf) {
            Ok(0) => Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn flush_tls(stream: &mut TlsStream) -> io::Result<()> {
        while stream.conn.wants_write() {
            stream.conn.write_tls(&mut stream.sock)?;
        }
        Ok(())
    }
}

fn timed_out(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn protocol_error(err: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

impl Transport for TlsTransport {
    fn reconnect(&self) -> io::Result<()> {
        let mut guard = lock(&self.stream);
        // Drop any previous connection before dialing again
        *guard = None;
        debug!("connecting to {}:{}", self.host, self.port);
        let sock = TcpStream::connect((self.host.as_str(), self.port))?;
        sock.set_nodelay(true)?;
        let conn = ClientConnection::new(self.config.clone(), self.server_name.clone())
            .map_err(protocol_error)?;
        *guard = Some(TlsStream { sock, conn });
        Ok(())
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let mut guard = lock(&self.stream);
        let stream = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is closed"))?;
        if let Some(n) = Self::drain_plaintext(stream, buf)? {
            return Ok(n);
        }
        // Nothing buffered; pull ciphertext off the socket, waiting at most
        // `timeout`. A timeout is not an error, the caller polls again.
        stream.sock.set_read_timeout(Some(timeout))?;
        Self::flush_tls(stream)?;
        match stream.conn.read_tls(&mut stream.sock) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => trace!("read {n} TLS bytes"),
            Err(e) if timed_out(&e) => return Ok(0),
            Err(e) => return Err(e),
        }
        stream
            .conn
            .process_new_packets()
            .map_err(protocol_error)?;
        Self::flush_tls(stream)?;
        // Pure handshake traffic yields no plaintext; report "nothing yet"
        Ok(Self::drain_plaintext(stream, buf)?.unwrap_or(0))
    }

    fn write(&self, buf: &[u8], timeout: Duration) -> io::Result<usize> {
        let mut guard = lock(&self.stream);
        let stream = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is closed"))?;
        stream.sock.set_write_timeout(Some(timeout))?;
        stream.sock.set_read_timeout(Some(timeout))?;
        stream.conn.writer().write_all(buf)?;
        Self::flush_tls(stream)?;
        // The first write lands before the TLS handshake is done; drive it
        // to completion so the payload actually leaves within the timeout.
        while stream.conn.is_handshaking() {
            if stream.conn.wants_read() {
                match stream.conn.read_tls(&mut stream.sock) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(_) => {}
                    Err(e) if timed_out(&e) => {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "TLS handshake timed out",
                        ))
                    }
                    Err(e) => return Err(e),
                }
                stream
                    .conn
                    .process_new_packets()
                    .map_err(protocol_error)?;
            }
            Self::flush_tls(stream)?;
        }
        Ok(buf.len())
    }

    fn close(&self) {
        let mut guard = lock(&self.stream);
        if let Some(stream) = guard.take() {
            if let Err(e) = stream.sock.shutdown(Shutdown::Both) {
                warn!("error shutting down socket: {e}");
            }
        }
    }
}
