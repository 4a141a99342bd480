pub mod in_memory;

use crate::errors::McpError;
use crate::session::Session;
use async_trait::async_trait;
use std::sync::Arc;

/// Storage for live sessions, keyed by server identifier.
///
/// Implementations hold at most one session per identifier; the client's
/// connect path relies on `save` behaving as insert-if-absent.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Inserts a session under its identifier. Fails with
    /// `AlreadyConnected` when the identifier is taken.
    async fn save(&self, session: Arc<Session>) -> Result<(), McpError>;
    async fn get(&self, identifier: &str) -> Option<Arc<Session>>;
    /// Removes and returns the session, if present.
    async fn remove(&self, identifier: &str) -> Option<Arc<Session>>;
    /// Live sessions, in identifier order.
    async fn list(&self) -> Vec<Arc<Session>>;
}
