use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{ClientInfo, CLIENT_PROTOCOL_VERSION, SERVER_PROTOCOL_VERSION};

/// How long the startup filter waits for the first protocol frame.
pub const DEFAULT_STARTUP_WINDOW: Duration = Duration::from_secs(5);
/// How long the initialize handshake may take end to end.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a single tool call may take.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait McpVariablesConfig: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, String>>;
    async fn get(&self, key: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct McpClientConfig {
    pub variables: HashMap<String, String>,
    pub servers_file_path: Option<PathBuf>,
    pub load_variables_from: Vec<Arc<dyn McpVariablesConfig>>,
    pub client_protocol_version: String,
    pub server_protocol_version: String,
    pub client_info: ClientInfo,
    pub startup_window: Duration,
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for McpClientConfig {
    fn default() -> Self {
        Self {
            variables: HashMap::new(),
            servers_file_path: None,
            load_variables_from: Vec::new(),
            client_protocol_version: CLIENT_PROTOCOL_VERSION.to_string(),
            server_protocol_version: SERVER_PROTOCOL_VERSION.to_string(),
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            startup_window: DEFAULT_STARTUP_WINDOW,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl McpClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_servers_file(mut self, path: PathBuf) -> Self {
        self.servers_file_path = Some(path);
        self
    }

    pub fn with_variable(mut self, key: String, value: String) -> Self {
        self.variables.insert(key, value);
        self
    }

    pub fn with_variables(mut self, vars: HashMap<String, String>) -> Self {
        self.variables.extend(vars);
        self
    }

    pub fn with_variables_loader(mut self, loader: Arc<dyn McpVariablesConfig>) -> Self {
        self.load_variables_from.push(loader);
        self
    }

    pub fn with_protocol_versions(
        mut self,
        client_version: impl Into<String>,
        server_version: impl Into<String>,
    ) -> Self {
        self.client_protocol_version = client_version.into();
        self.server_protocol_version = server_version.into();
        self
    }

    pub fn with_client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_info = ClientInfo {
            name: name.into(),
            version: version.into(),
        };
        self
    }

    pub fn with_startup_window(mut self, window: Duration) -> Self {
        self.startup_window = window;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub async fn get_variable(&self, key: &str) -> Option<String> {
        // Check inline variables first
        if let Some(val) = self.variables.get(key) {
            return Some(val.clone());
        }

        // Check variable loaders
        for loader in &self.load_variables_from {
            if let Ok(val) = loader.get(key).await {
                return Some(val);
            }
        }

        // Check environment variables
        std::env::var(key).ok()
    }
}

// DotEnv variable loader implementation
pub struct DotEnvLoader {
    file_path: PathBuf,
}

impl DotEnvLoader {
    pub fn new(file_path: PathBuf) -> Self {
        Self { file_path }
    }
}

#[async_trait]
impl McpVariablesConfig for DotEnvLoader {
    async fn load(&self) -> Result<HashMap<String, String>> {
        let contents = tokio::fs::read_to_string(&self.file_path).await?;
        let mut vars = HashMap::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                vars.insert(
                    key.trim().to_string(),
                    value.trim().trim_matches('"').to_string(),
                );
            }
        }

        Ok(vars)
    }

    async fn get(&self, key: &str) -> Result<String> {
        let vars = self.load().await?;
        vars.get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Variable {} not found", key))
    }
}
