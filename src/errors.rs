use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur while managing MCP stdio sessions.
#[derive(Error, Debug)]
pub enum McpError {
    /// Error when the server process could not be spawned.
    #[error("Failed to launch '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    /// Error when the server produced no protocol frame within the startup window.
    #[error("No protocol frame within {window:?} of startup")]
    StartupTimeout { window: Duration },
    /// Error when the server closed its output stream.
    #[error("Server stream closed: {0}")]
    StreamClosed(String),
    /// Error when a line that looked like a protocol frame failed to parse.
    #[error("Malformed protocol frame: {source} in line {line:?}")]
    FrameParse {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    /// Error when the initialize response did not arrive in time.
    #[error("Initialize handshake timed out after {timeout:?}")]
    HandshakeTimeout { timeout: Duration },
    /// Error when the initialize handshake failed.
    #[error("Initialize handshake failed: {0}")]
    Handshake(String),
    /// Error when tool discovery failed.
    #[error("Tool discovery failed: {0}")]
    Discovery(String),
    /// Error when a server identifier already has a live session.
    #[error("Server '{0}' is already connected")]
    AlreadyConnected(String),
    /// Error when a requested tool is not found.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),
    /// Error occurring during a tool call execution.
    #[error("Tool call failed: {0}")]
    ToolCall(String),
    /// Error when operating on a closed or unknown session.
    #[error("Session closed: {0}")]
    SessionClosed(String),
    /// Error related to invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// Other errors wrapped by anyhow.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
