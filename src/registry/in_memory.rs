use crate::errors::McpError;
use crate::registry::SessionRegistry;
use crate::session::Session;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Simple in-memory registry; the default for a single-process client.
pub struct InMemorySessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl InMemorySessionRegistry {
    /// Create an empty registry instance.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionRegistry for InMemorySessionRegistry {
    async fn save(&self, session: Arc<Session>) -> Result<(), McpError> {
        let mut sessions = self.sessions.write().await;
        let identifier = session.identifier().to_string();
        if sessions.contains_key(&identifier) {
            return Err(McpError::AlreadyConnected(identifier));
        }
        sessions.insert(identifier, session);
        Ok(())
    }

    async fn get(&self, identifier: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.get(identifier).cloned()
    }

    async fn remove(&self, identifier: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(identifier)
    }

    async fn list(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<Arc<Session>> = sessions.values().cloned().collect();
        all.sort_by(|a, b| a.identifier().cmp(b.identifier()));
        all
    }
}
