// Protocol version rewriting for the initialize exchange
use serde_json::Value;
use tracing::debug;

use crate::protocol::{CLIENT_PROTOCOL_VERSION, SERVER_PROTOCOL_VERSION};

/// Rewrites the negotiated-version field in initialize traffic so client and
/// server agree despite differing native revisions: outbound initialize
/// requests are stamped with the version the server expects, the matching
/// response is stamped back with the version the client speaks. Every other
/// message passes through untouched. Holds no state beyond the two version
/// strings.
#[derive(Debug, Clone)]
pub struct VersionAdapter {
    client_version: String,
    server_version: String,
}

impl Default for VersionAdapter {
    fn default() -> Self {
        Self::new(CLIENT_PROTOCOL_VERSION, SERVER_PROTOCOL_VERSION)
    }
}

impl VersionAdapter {
    pub fn new(client_version: impl Into<String>, server_version: impl Into<String>) -> Self {
        Self {
            client_version: client_version.into(),
            server_version: server_version.into(),
        }
    }

    /// Applied to every message written to the server.
    pub fn adapt_outgoing(&self, message: &mut Value) {
        if message.get("method").and_then(Value::as_str) != Some("initialize") {
            return;
        }
        if let Some(version) = message
            .get_mut("params")
            .and_then(|params| params.get_mut("protocolVersion"))
        {
            if version.as_str() != Some(self.server_version.as_str()) {
                debug!(
                    from = %version,
                    to = %self.server_version,
                    "rewriting outbound protocol version"
                );
            }
            *version = Value::String(self.server_version.clone());
        }
    }

    /// Applied to every message read from the server. Only initialize
    /// responses carry `result.protocolVersion`, so the field's presence
    /// identifies the handshake reply.
    pub fn adapt_incoming(&self, message: &mut Value) {
        if let Some(version) = message
            .get_mut("result")
            .and_then(|result| result.get_mut("protocolVersion"))
        {
            if version.as_str() != Some(self.client_version.as_str()) {
                debug!(
                    from = %version,
                    to = %self.client_version,
                    "rewriting inbound protocol version"
                );
            }
            *version = Value::String(self.client_version.clone());
        }
    }
}
