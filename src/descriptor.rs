use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::McpError;

/// Launch description for one stdio MCP server. Immutable once a connection
/// attempt starts; the registry keys live sessions by `identifier`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique name for this server within one client. Server config files in
    /// the `mcpServers` mapping shape carry it as the map key instead of a
    /// field, so it is optional on the wire and filled in by the loader.
    #[serde(default, alias = "name")]
    pub identifier: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, alias = "env_vars")]
    pub env: HashMap<String, String>,
}

impl ServerDescriptor {
    pub fn new(identifier: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), McpError> {
        if self.identifier.trim().is_empty() {
            return Err(McpError::Config(
                "server descriptor is missing an identifier".to_string(),
            ));
        }
        if self.command.trim().is_empty() {
            return Err(McpError::Config(format!(
                "server '{}' has an empty command",
                self.identifier
            )));
        }
        Ok(())
    }
}
