use std::time::Duration;

use crate::error::Error;

/// Connection parameters for a [`crate::WsSession`].
///
/// `message_chunk_size` caps a single outbound message and must fit into one
/// frame, so `message_chunk_size <= frame_size <= 65535` is enforced when the
/// session is created.
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub host: String,
    pub port: u16,
    /// HTTP resource used in the upgrade request, e.g. `/Gateway/WS`.
    pub resource: String,
    /// Application key sent as the `appKey` header during the handshake.
    pub api_key: String,
    /// Optional gateway identity, consumed by the binding layer above.
    pub gateway_name: Option<String>,
    pub gateway_type: Option<String>,
    /// Maximum size in bytes of one outbound message chunk.
    pub message_chunk_size: u32,
    /// Maximum size in bytes of a single websocket frame payload.
    pub frame_size: u16,
    /// Timeout applied to each transport read while waiting for the
    /// upgrade response.
    pub socket_read_timeout: Duration,
    /// PEM file with additional trust anchors; system roots are used when
    /// this is `None`.
    pub ca_file: Option<String>,
}

impl Default for WsConfig {
    fn default() -> Self {
        WsConfig {
            host: String::new(),
            port: 443,
            resource: String::new(),
            api_key: String::new(),
            gateway_name: None,
            gateway_type: None,
            message_chunk_size: 8192,
            frame_size: 8192,
            socket_read_timeout: Duration::from_millis(500),
            ca_file: None,
        }
    }
}

impl WsConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.host.is_empty() {
            return Err(Error::InvalidParam("host must not be empty"));
        }
        if self.port == 0 {
            return Err(Error::InvalidParam("port must not be zero"));
        }
        if self.resource.is_empty() {
            return Err(Error::InvalidParam("resource must not be empty"));
        }
        if self.api_key.is_empty() {
            return Err(Error::InvalidParam("api_key must not be empty"));
        }
        if self.frame_size == 0 {
            return Err(Error::InvalidParam("frame_size must not be zero"));
        }
        // Message chunks must fit into a single frame
        if self.message_chunk_size > u32::from(self.frame_size) {
            return Err(Error::InvalidParam(
                "message_chunk_size must be less than or equal to frame_size",
            ));
        }
        Ok(())
    }
}
