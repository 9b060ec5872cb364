use std::sync::Mutex;

use crate::session::{lock, WsSession};

/// One event surfaced by the engine, tagged with the bytes it carries.
///
/// Everything the receive state machine and the lifecycle layer deliver to
/// the application funnels through this enum, so control-frame interleaving
/// and close delivery are explicit rather than spread over independent
/// callback checks.
#[derive(Debug)]
pub enum WsEvent<'a> {
    Connected,
    Text(&'a [u8]),
    Binary(&'a [u8]),
    Ping(&'a [u8]),
    Pong(&'a [u8]),
    Closed(&'a [u8]),
}

pub type ConnectedCallback = Box<dyn FnMut(&WsSession) + Send>;
pub type DataCallback = Box<dyn FnMut(&WsSession, &[u8]) + Send>;

/// Borrowed application callbacks, one optional slot per event.
///
/// Each slot has its own lock so a callback may send frames or register a
/// different callback while it runs. A callback must not re-register its
/// own slot or call `receive` from inside its body.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    connected: Mutex<Option<ConnectedCallback>>,
    close: Mutex<Option<DataCallback>>,
    text: Mutex<Option<DataCallback>>,
    binary: Mutex<Option<DataCallback>>,
    ping: Mutex<Option<DataCallback>>,
    pong: Mutex<Option<DataCallback>>,
}

impl CallbackRegistry {
    pub fn set_connected(&self, cb: ConnectedCallback) {
        *lock(&self.connected) = Some(cb);
    }

    pub fn set_close(&self, cb: DataCallback) {
        *lock(&self.close) = Some(cb);
    }

    pub fn set_text(&self, cb: DataCallback) {
        *lock(&self.text) = Some(cb);
    }

    pub fn set_binary(&self, cb: DataCallback) {
        *lock(&self.binary) = Some(cb);
    }

    pub fn set_ping(&self, cb: DataCallback) {
        *lock(&self.ping) = Some(cb);
    }

    pub fn set_pong(&self, cb: DataCallback) {
        *lock(&self.pong) = Some(cb);
    }

    /// Dispatches an event to its registered callback, if any.
    pub fn emit(&self, ws: &WsSession, event: WsEvent<'_>) {
        match event {
            WsEvent::Connected => {
                if let Some(cb) = lock(&self.connected).as_mut() {
                    cb(ws);
                }
            }
            WsEvent::Text(bytes) => Self::fire(&self.text, ws, bytes),
            WsEvent::Binary(bytes) => Self::fire(&self.binary, ws, bytes),
            WsEvent::Ping(bytes) => Self::fire(&self.ping, ws, bytes),
            WsEvent::Pong(bytes) => Self::fire(&self.pong, ws, bytes),
            WsEvent::Closed(bytes) => Self::fire(&self.close, ws, bytes),
        }
    }

    fn fire(slot: &Mutex<Option<DataCallback>>, ws: &WsSession, bytes: &[u8]) {
        if let Some(cb) = lock(slot).as_mut() {
            cb(ws, bytes);
        }
    }
}
