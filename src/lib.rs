pub mod adapter;
pub mod config;
pub mod content;
pub mod descriptor;
pub mod errors;
pub mod framing;
pub mod loader;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod session;

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::McpClientConfig;
use crate::descriptor::ServerDescriptor;
use crate::errors::McpError;
use crate::protocol::ToolDescriptor;
use crate::registry::in_memory::InMemorySessionRegistry;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionSettings};

#[async_trait]
pub trait McpClientInterface: Send + Sync {
    async fn connect(&self, descriptor: ServerDescriptor) -> Result<Arc<Session>, McpError>;
    async fn connect_many(
        &self,
        descriptors: Vec<ServerDescriptor>,
    ) -> Vec<(String, Result<Arc<Session>, McpError>)>;
    async fn call_tool(
        &self,
        identifier: &str,
        tool: &str,
        args: HashMap<String, serde_json::Value>,
    ) -> Result<String, McpError>;
    async fn list_tools(&self, identifier: &str) -> Result<Vec<ToolDescriptor>, McpError>;
    async fn session(&self, identifier: &str) -> Option<Arc<Session>>;
    async fn connected(&self) -> Vec<String>;
    async fn disconnect(&self, identifier: &str) -> Result<(), McpError>;
    async fn disconnect_all(&self);
}

pub struct McpClient {
    config: McpClientConfig,
    registry: Arc<dyn SessionRegistry>,

    // Identifiers with a connect currently in flight, so a concurrent
    // duplicate fails fast instead of racing the handshake.
    connecting: Mutex<HashSet<String>>,
}

impl McpClient {
    pub fn new(config: McpClientConfig, registry: Arc<dyn SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            connecting: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_config(config: McpClientConfig) -> Self {
        Self::new(config, Arc::new(InMemorySessionRegistry::new()))
    }

    /// Create a new McpClient and automatically connect the servers listed in
    /// the JSON file specified in config
    pub async fn from_servers_file(config: McpClientConfig) -> Result<Self, McpError> {
        let client = Self::with_config(config);

        // Connect servers if file path is specified
        if let Some(path) = client.config.servers_file_path.clone() {
            let servers = crate::loader::load_servers_from_file(&path, &client.config).await?;

            for (identifier, outcome) in client.connect_many(servers).await {
                match outcome {
                    Ok(session) => {
                        let tools = session.list_tools().await.len();
                        info!("✓ Connected '{}' with {} tools", identifier, tools);
                    }
                    Err(err) => {
                        warn!("✗ Failed to connect '{}': {}", identifier, err);
                    }
                }
            }
        }

        Ok(client)
    }

    pub fn config(&self) -> &McpClientConfig {
        &self.config
    }

    async fn establish_and_register(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<Session>, McpError> {
        let session = Session::establish(descriptor, SessionSettings::from(&self.config)).await?;

        if let Err(err) = self.registry.save(session.clone()).await {
            // Lost a save race; tear the fresh session down before reporting.
            session.close().await;
            return Err(err);
        }
        Ok(session)
    }
}

#[async_trait]
impl McpClientInterface for McpClient {
    async fn connect(&self, descriptor: ServerDescriptor) -> Result<Arc<Session>, McpError> {
        descriptor.validate()?;
        let identifier = descriptor.identifier.clone();

        // Reserve the identifier before launching anything.
        {
            let mut connecting = self.connecting.lock().await;
            if connecting.contains(&identifier) || self.registry.get(&identifier).await.is_some() {
                return Err(McpError::AlreadyConnected(identifier));
            }
            connecting.insert(identifier.clone());
        }

        let result = self.establish_and_register(&descriptor).await;

        // Release the reservation whether the connect stuck or not.
        self.connecting.lock().await.remove(&identifier);
        result
    }

    async fn connect_many(
        &self,
        descriptors: Vec<ServerDescriptor>,
    ) -> Vec<(String, Result<Arc<Session>, McpError>)> {
        let connects = descriptors.into_iter().map(|descriptor| async move {
            let identifier = descriptor.identifier.clone();
            (identifier, self.connect(descriptor).await)
        });
        join_all(connects).await
    }

    async fn call_tool(
        &self,
        identifier: &str,
        tool: &str,
        args: HashMap<String, serde_json::Value>,
    ) -> Result<String, McpError> {
        let session = self.registry.get(identifier).await.ok_or_else(|| {
            McpError::SessionClosed(format!("no active session for server '{identifier}'"))
        })?;
        session.call_tool(tool, args).await
    }

    async fn list_tools(&self, identifier: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        let session = self.registry.get(identifier).await.ok_or_else(|| {
            McpError::SessionClosed(format!("no active session for server '{identifier}'"))
        })?;
        Ok(session.list_tools().await)
    }

    async fn session(&self, identifier: &str) -> Option<Arc<Session>> {
        self.registry.get(identifier).await
    }

    async fn connected(&self) -> Vec<String> {
        self.registry
            .list()
            .await
            .iter()
            .map(|session| session.identifier().to_string())
            .collect()
    }

    async fn disconnect(&self, identifier: &str) -> Result<(), McpError> {
        if let Some(session) = self.registry.remove(identifier).await {
            session.close().await;
            info!(server = %identifier, "disconnected");
        }
        Ok(())
    }

    async fn disconnect_all(&self) {
        let sessions = self.registry.list().await;
        for session in &sessions {
            self.registry.remove(session.identifier()).await;
        }
        join_all(sessions.iter().map(|session| session.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn bogus_descriptor(identifier: &str) -> ServerDescriptor {
        ServerDescriptor::new(identifier, "definitely-not-a-real-binary-1234")
    }

    #[tokio::test]
    async fn connect_rejects_registered_identifier_without_launching() {
        let client = McpClient::with_config(McpClientConfig::default());
        client.registry.save(Session::stub("files")).await.unwrap();

        // The command does not exist; the duplicate check must fire first.
        let err = client.connect(bogus_descriptor("files")).await.err().unwrap();
        assert!(matches!(err, McpError::AlreadyConnected(_)));
    }

    #[tokio::test]
    async fn connect_validates_descriptor_first() {
        let client = McpClient::with_config(McpClientConfig::default());
        let err = client
            .connect(ServerDescriptor::new("", "mcp"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::Config(_)));
    }

    #[tokio::test]
    async fn failed_connect_leaves_nothing_registered() {
        let client = McpClient::with_config(McpClientConfig::default());

        let err = client.connect(bogus_descriptor("ghost")).await.err().unwrap();
        assert!(matches!(err, McpError::Launch { .. }));
        assert!(client.session("ghost").await.is_none());
        assert!(client.connected().await.is_empty());

        // The reservation was released, so the identifier can be retried.
        let err = client.connect(bogus_descriptor("ghost")).await.err().unwrap();
        assert!(matches!(err, McpError::Launch { .. }));
    }

    #[tokio::test]
    async fn connect_can_be_driven_from_a_spawned_task() {
        // tokio::spawn requires the connect future to be Send.
        let client = Arc::new(McpClient::with_config(McpClientConfig::default()));
        let task = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.connect(bogus_descriptor("spawned")).await })
        };
        let err = task.await.unwrap().err().unwrap();
        assert!(matches!(err, McpError::Launch { .. }));
        assert!(client.connected().await.is_empty());
    }

    #[tokio::test]
    async fn call_tool_on_unknown_identifier_reports_closed_session() {
        let client = McpClient::with_config(McpClientConfig::default());
        let err = client
            .call_tool("nope", "echo", HashMap::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_closes_the_session() {
        let client = McpClient::with_config(McpClientConfig::default());
        let stub = Session::stub("files");
        client.registry.save(stub.clone()).await.unwrap();

        client.disconnect("files").await.unwrap();
        assert_eq!(stub.state().await, SessionState::Closed);
        assert!(client.connected().await.is_empty());

        // Second disconnect finds nothing and stays quiet.
        client.disconnect("files").await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_all_clears_the_registry() {
        let client = McpClient::with_config(McpClientConfig::default());
        client.registry.save(Session::stub("a")).await.unwrap();
        client.registry.save(Session::stub("b")).await.unwrap();

        client.disconnect_all().await;
        assert!(client.connected().await.is_empty());
    }

    #[tokio::test]
    async fn connect_many_reports_partial_failures() {
        let client = McpClient::with_config(McpClientConfig::default());
        client.registry.save(Session::stub("taken")).await.unwrap();

        let outcomes = client
            .connect_many(vec![bogus_descriptor("taken"), bogus_descriptor("missing")])
            .await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].0, "taken");
        assert!(matches!(outcomes[0].1, Err(McpError::AlreadyConnected(_))));
        assert!(matches!(outcomes[1].1, Err(McpError::Launch { .. })));
    }

    #[tokio::test]
    async fn from_servers_file_survives_failed_connects() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"mcpServers": {{"ghost": {{"command": "definitely-not-a-real-binary-1234"}}}}}}"#
        )
        .unwrap();

        let config = McpClientConfig::default().with_servers_file(file.path().to_path_buf());
        let client = McpClient::from_servers_file(config).await.unwrap();
        assert!(client.connected().await.is_empty());
    }
}
