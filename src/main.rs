use std::env;
use std::process;
use std::time::Duration;

use log::{error, info};

use edge_socket::{CloseCode, WsConfig, WsSession};

// Minimal poll-loop client: connects to a gateway endpoint, echoes pings,
// prints whatever the server sends, until the connection goes away.
fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let (host, resource, api_key) = match (args.next(), args.next(), args.next()) {
        (Some(host), Some(resource), Some(api_key)) => (host, resource, api_key),
        _ => {
            eprintln!("usage: edge-socket <host> <resource> <api-key> [port]");
            process::exit(2);
        }
    };
    let port = args
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(443);

    let config = WsConfig {
        host,
        port,
        resource,
        api_key,
        ..Default::default()
    };
    let session = match WsSession::new(config) {
        Ok(session) => session,
        Err(e) => {
            error!("failed to create session: {e}");
            process::exit(1);
        }
    };

    session.on_connected(|_| info!("connected"));
    session.on_text_message(|_, bytes| {
        println!("{}", String::from_utf8_lossy(bytes));
    });
    session.on_binary_message(|_, bytes| info!("binary message of {} bytes", bytes.len()));
    session.on_ping(|ws, bytes| {
        if let Err(e) = ws.send_pong(bytes) {
            error!("failed to answer ping: {e}");
        }
    });
    session.on_close(|_, reason| {
        info!("closed: {}", String::from_utf8_lossy(reason));
    });

    if let Err(e) = session.connect(Duration::from_secs(10)) {
        error!("connect failed: {e}");
        process::exit(1);
    }

    while session.is_connected() {
        if let Err(e) = session.receive(Duration::from_millis(100)) {
            error!("receive failed: {e}");
            break;
        }
    }
    let _ = session.disconnect(CloseCode::NormalClose, "done");
}
