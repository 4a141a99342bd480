// Session lifecycle for one connected stdio MCP server
use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::VersionAdapter;
use crate::config::McpClientConfig;
use crate::content;
use crate::descriptor::ServerDescriptor;
use crate::errors::McpError;
use crate::framing::FrameReader;
use crate::process::{self, ManagedProcess};
use crate::protocol::{
    CallToolParams, ClientCapabilities, ClientInfo, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult, RequestId, ServerInfo,
    ToolDescriptor,
};

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Negotiating,
    Ready,
    Closed,
}

/// The slice of client configuration one session needs.
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub client_protocol_version: String,
    pub server_protocol_version: String,
    pub client_info: ClientInfo,
    pub startup_window: Duration,
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
}

impl From<&McpClientConfig> for SessionSettings {
    fn from(config: &McpClientConfig) -> Self {
        Self {
            client_protocol_version: config.client_protocol_version.clone(),
            server_protocol_version: config.server_protocol_version.clone(),
            client_info: config.client_info.clone(),
            startup_window: config.startup_window,
            handshake_timeout: config.handshake_timeout,
            call_timeout: config.call_timeout,
        }
    }
}

type PendingSender = oneshot::Sender<Result<JsonRpcResponse, McpError>>;

/// Outcome of one request/response exchange, before call sites map it onto
/// the public error taxonomy.
enum RequestError {
    Timeout(Duration),
    Transport(McpError),
    Remote(crate::protocol::JsonRpcError),
    Invalid(String),
}

/// The stateful conversation with one connected server process.
///
/// A dedicated reader task drains the server's output and routes responses
/// to waiting callers through a pending-request table keyed by request id;
/// requests go out in issue order under the writer lock. Sessions are
/// created by the client's connect path and owned by its registry.
pub struct Session {
    identifier: String,
    settings: SessionSettings,
    adapter: VersionAdapter,
    state: Mutex<SessionState>,
    tools: RwLock<HashMap<String, ToolDescriptor>>,
    writer: Mutex<Option<BoxedWriter>>,
    pending: Mutex<HashMap<i64, PendingSender>>,
    next_id: AtomicI64,
    process: Mutex<Option<ManagedProcess>>,
    stderr_tail: Option<Arc<Mutex<String>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    server_info: OnceCell<ServerInfo>,
    negotiated_version: OnceCell<String>,
    created_at: Instant,
}

impl Session {
    /// Launches the described server and runs the full establishment flow:
    /// startup filtering, initialize handshake, tool discovery. On any
    /// failure the child is terminated and the error is returned; a session
    /// is only handed out in the Ready state.
    pub(crate) async fn establish(
        descriptor: &ServerDescriptor,
        settings: SessionSettings,
    ) -> Result<Arc<Self>, McpError> {
        let mut process = process::launch(descriptor).await?;
        let stdin = process
            .take_stdin()
            .ok_or_else(|| McpError::Other(anyhow::anyhow!("stdin pipe already taken")))?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| McpError::Other(anyhow::anyhow!("stdout pipe already taken")))?;
        let stderr_tail = process.stderr_tail_handle();
        Self::establish_io(
            descriptor.identifier.clone(),
            Box::new(stdout),
            Box::new(stdin),
            Some(process),
            Some(stderr_tail),
            settings,
        )
        .await
    }

    /// Establishment over arbitrary streams. Production goes through
    /// [`Session::establish`]; tests drive this with in-process pipes.
    pub(crate) async fn establish_io(
        identifier: String,
        output: BoxedReader,
        input: BoxedWriter,
        managed: Option<ManagedProcess>,
        stderr_tail: Option<Arc<Mutex<String>>>,
        settings: SessionSettings,
    ) -> Result<Arc<Self>, McpError> {
        let adapter = VersionAdapter::new(
            &settings.client_protocol_version,
            &settings.server_protocol_version,
        );
        let reader = FrameReader::new(output, settings.startup_window);

        let session = Arc::new(Session {
            identifier,
            settings,
            adapter: adapter.clone(),
            state: Mutex::new(SessionState::Uninitialized),
            tools: RwLock::new(HashMap::new()),
            writer: Mutex::new(Some(input)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            process: Mutex::new(managed),
            stderr_tail,
            reader_task: Mutex::new(None),
            server_info: OnceCell::new(),
            negotiated_version: OnceCell::new(),
            created_at: Instant::now(),
        });

        let task = tokio::spawn(read_loop(Arc::downgrade(&session), reader, adapter));
        *session.reader_task.lock().await = Some(task);

        if let Err(err) = session.handshake().await {
            session.close().await;
            return Err(err);
        }
        if let Err(err) = session.discover_tools().await {
            session.close().await;
            return Err(err);
        }

        // The reader task may have observed end-of-stream while discovery
        // was finishing. Closed is terminal; a torn-down session must not
        // come back as Ready.
        let promoted = {
            let mut state = session.state.lock().await;
            if *state == SessionState::Negotiating {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        };
        if !promoted {
            let mut message = "server exited during establishment".to_string();
            let tail = session.stderr_tail_snapshot().await;
            if !tail.is_empty() {
                message = format!("{message}; stderr: {tail}");
            }
            return Err(McpError::StreamClosed(message));
        }

        let tool_count = session.tools.read().await.len();
        info!(
            server = %session.identifier,
            tools = tool_count,
            "session ready"
        );
        Ok(session)
    }

    /// Bare Ready session with no process behind it; registry tests only.
    #[cfg(test)]
    pub(crate) fn stub(identifier: &str) -> Arc<Self> {
        Arc::new(Session {
            identifier: identifier.to_string(),
            settings: SessionSettings {
                client_protocol_version: crate::protocol::CLIENT_PROTOCOL_VERSION.to_string(),
                server_protocol_version: crate::protocol::SERVER_PROTOCOL_VERSION.to_string(),
                client_info: ClientInfo {
                    name: "stub".to_string(),
                    version: "0.0.0".to_string(),
                },
                startup_window: Duration::from_secs(1),
                handshake_timeout: Duration::from_secs(1),
                call_timeout: Duration::from_secs(1),
            },
            adapter: VersionAdapter::default(),
            state: Mutex::new(SessionState::Ready),
            tools: RwLock::new(HashMap::new()),
            writer: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            process: Mutex::new(None),
            stderr_tail: None,
            reader_task: Mutex::new(None),
            server_info: OnceCell::new(),
            negotiated_version: OnceCell::new(),
            created_at: Instant::now(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// Server implementation details reported during the handshake.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.get()
    }

    /// Protocol version as seen by this client after adaptation.
    pub fn negotiated_version(&self) -> Option<&str> {
        self.negotiated_version.get().map(String::as_str)
    }

    pub async fn has_tool(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// Discovered tools, sorted by name.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self.tools.read().await.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Invokes a discovered tool and returns its normalized text result.
    ///
    /// Unknown names fail locally with `ToolNotFound` before anything is
    /// written to the server. Remote failures and timeouts surface as
    /// `ToolCall` and leave the session Ready; a transport failure closes
    /// the session.
    pub async fn call_tool(
        &self,
        name: &str,
        args: HashMap<String, Value>,
    ) -> Result<String, McpError> {
        if *self.state.lock().await == SessionState::Closed {
            return Err(McpError::SessionClosed(self.identifier.clone()));
        }
        if !self.has_tool(name).await {
            return Err(McpError::ToolNotFound(format!(
                "{} (server '{}')",
                name, self.identifier
            )));
        }

        let params = CallToolParams {
            name: name.to_string(),
            arguments: args,
        };
        let params =
            serde_json::to_value(&params).map_err(|err| McpError::ToolCall(err.to_string()))?;

        debug!(server = %self.identifier, tool = %name, "calling tool");
        let result = match self
            .request("tools/call", Some(params), self.settings.call_timeout)
            .await
        {
            Ok(result) => result,
            Err(RequestError::Timeout(timeout)) => {
                return Err(McpError::ToolCall(format!(
                    "'{name}' timed out after {timeout:?}"
                )))
            }
            Err(RequestError::Remote(err)) => {
                return Err(McpError::ToolCall(format!("'{name}': {err}")))
            }
            Err(RequestError::Invalid(msg)) => {
                return Err(McpError::ToolCall(format!("'{name}': {msg}")))
            }
            Err(RequestError::Transport(cause)) => {
                // The channel itself broke; this session is done.
                self.close().await;
                return Err(McpError::ToolCall(format!("'{name}': {cause}")));
            }
        };

        Ok(content::normalize_result(&result))
    }

    /// Closes the session: fails all in-flight requests, terminates the
    /// child process and stops the reader task. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.fail_pending(|| McpError::SessionClosed(self.identifier.clone()))
            .await;
        *self.writer.lock().await = None;
        if let Some(mut process) = self.process.lock().await.take() {
            process.kill().await;
        }
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        info!(
            server = %self.identifier,
            uptime = ?self.created_at.elapsed(),
            "session closed"
        );
    }

    async fn handshake(&self) -> Result<(), McpError> {
        *self.state.lock().await = SessionState::Negotiating;

        let params = InitializeParams {
            protocol_version: self.settings.client_protocol_version.clone(),
            capabilities: ClientCapabilities::default(),
            client_info: self.settings.client_info.clone(),
        };
        let params =
            serde_json::to_value(&params).map_err(|err| McpError::Handshake(err.to_string()))?;

        let result = match self
            .request("initialize", Some(params), self.settings.handshake_timeout)
            .await
        {
            Ok(result) => result,
            Err(RequestError::Timeout(timeout)) => {
                return Err(McpError::HandshakeTimeout { timeout })
            }
            Err(RequestError::Remote(err)) => return Err(McpError::Handshake(err.to_string())),
            Err(RequestError::Invalid(msg)) => return Err(McpError::Handshake(msg)),
            Err(RequestError::Transport(cause)) => return Err(cause),
        };

        let initialized: InitializeResult = serde_json::from_value(result)
            .map_err(|err| McpError::Handshake(format!("unreadable initialize result: {err}")))?;
        if let Some(info) = initialized.server_info {
            info!(
                server = %self.identifier,
                name = %info.name,
                version = %info.version,
                "handshake complete"
            );
            let _ = self.server_info.set(info);
        }
        if let Some(version) = initialized.protocol_version {
            let _ = self.negotiated_version.set(version);
        }

        // Servers expect this before taking any other request.
        self.notify("notifications/initialized").await
    }

    async fn discover_tools(&self) -> Result<(), McpError> {
        let result = match self
            .request(
                "tools/list",
                Some(json!({})),
                self.settings.handshake_timeout,
            )
            .await
        {
            Ok(result) => result,
            Err(RequestError::Timeout(timeout)) => {
                return Err(McpError::Discovery(format!(
                    "tools/list timed out after {timeout:?}"
                )))
            }
            Err(RequestError::Remote(err)) => return Err(McpError::Discovery(err.to_string())),
            Err(RequestError::Invalid(msg)) => return Err(McpError::Discovery(msg)),
            Err(RequestError::Transport(cause)) => return Err(cause),
        };

        let listed: ListToolsResult = serde_json::from_value(result)
            .map_err(|err| McpError::Discovery(format!("unreadable tool list: {err}")))?;

        let mut tools = self.tools.write().await;
        for tool in listed.tools {
            if let Some(previous) = tools.insert(tool.name.clone(), tool) {
                warn!(
                    server = %self.identifier,
                    tool = %previous.name,
                    "duplicate tool name in discovery, keeping the later entry"
                );
            }
        }
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            if *self.state.lock().await == SessionState::Closed {
                return Err(RequestError::Transport(McpError::SessionClosed(
                    self.identifier.clone(),
                )));
            }
            self.pending.lock().await.insert(id, tx);
        }

        let message = JsonRpcRequest::new(id, method, params);
        let message = match serde_json::to_value(&message) {
            Ok(value) => value,
            Err(err) => {
                self.pending.lock().await.remove(&id);
                return Err(RequestError::Invalid(err.to_string()));
            }
        };
        if let Err(err) = self.send_value(message).await {
            self.pending.lock().await.remove(&id);
            return Err(RequestError::Transport(err));
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RequestError::Timeout(timeout))
            }
            // Sender dropped without a value: the reader task was torn down.
            Ok(Err(_)) => Err(RequestError::Transport(McpError::SessionClosed(
                self.identifier.clone(),
            ))),
            Ok(Ok(Err(err))) => Err(RequestError::Transport(err)),
            Ok(Ok(Ok(response))) => {
                if let Some(error) = response.error {
                    Err(RequestError::Remote(error))
                } else if let Some(result) = response.result {
                    Ok(result)
                } else {
                    Err(RequestError::Invalid(
                        "response carried neither result nor error".to_string(),
                    ))
                }
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<(), McpError> {
        let note = JsonRpcNotification::new(method);
        let value =
            serde_json::to_value(&note).map_err(|err| McpError::Handshake(err.to_string()))?;
        self.send_value(value).await
    }

    async fn send_value(&self, mut message: Value) -> Result<(), McpError> {
        self.adapter.adapt_outgoing(&mut message);
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(err) => return Err(McpError::Other(err.into())),
        };
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(McpError::SessionClosed(self.identifier.clone()));
        };
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|err| McpError::StreamClosed(format!("write failed: {err}")))?;
        writer
            .flush()
            .await
            .map_err(|err| McpError::StreamClosed(format!("flush failed: {err}")))?;
        Ok(())
    }

    async fn fail_pending<F>(&self, make: F)
    where
        F: Fn() -> McpError,
    {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return;
        }
        warn!(
            server = %self.identifier,
            count = pending.len(),
            "failing in-flight requests"
        );
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(make()));
        }
    }

    async fn stderr_tail_snapshot(&self) -> String {
        match &self.stderr_tail {
            Some(tail) => tail.lock().await.trim().to_string(),
            None => String::new(),
        }
    }

    /// Routes one inbound frame: responses go to their waiting caller,
    /// server-initiated traffic is observed and dropped.
    async fn dispatch(&self, frame: Value) {
        if let Some(method) = frame.get("method").and_then(Value::as_str) {
            debug!(server = %self.identifier, method, "ignoring server-initiated message");
            return;
        }
        let response: JsonRpcResponse = match serde_json::from_value(frame) {
            Ok(response) => response,
            Err(err) => {
                warn!(server = %self.identifier, "undecodable response frame: {}", err);
                return;
            }
        };
        let Some(id) = response.id.as_ref().and_then(RequestId::as_i64) else {
            warn!(server = %self.identifier, "response without a usable id");
            return;
        };
        match self.pending.lock().await.remove(&id) {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => warn!(server = %self.identifier, id, "response for unknown request id"),
        }
    }

    /// Terminal stream failure seen by the reader task: the startup window
    /// expired or the child closed its output. Fails every waiter with the
    /// cause (plus captured stderr, when there is any) and tears down.
    async fn on_stream_error(&self, err: McpError) {
        {
            let mut state = self.state.lock().await;
            if *state == SessionState::Closed {
                // close() already ran; EOF after the kill is expected.
                return;
            }
            *state = SessionState::Closed;
        }

        match err {
            McpError::StartupTimeout { window } => {
                warn!(server = %self.identifier, ?window, "no protocol frame before deadline");
                self.fail_pending(|| McpError::StartupTimeout { window })
                    .await;
            }
            other => {
                let mut message = other.to_string();
                let tail = self.stderr_tail_snapshot().await;
                if !tail.is_empty() {
                    message = format!("{message}; stderr: {tail}");
                }
                warn!(server = %self.identifier, "stream failed: {}", message);
                self.fail_pending(|| McpError::StreamClosed(message.clone()))
                    .await;
            }
        }

        *self.writer.lock().await = None;
        if let Some(mut process) = self.process.lock().await.take() {
            process.kill().await;
        }
    }
}

/// Per-session reader task. Holds only a weak reference so dropping the last
/// session handle releases the child process instead of pinning it alive.
async fn read_loop(
    session: Weak<Session>,
    mut reader: FrameReader<BoxedReader>,
    adapter: VersionAdapter,
) {
    loop {
        let result = reader.read_frame().await;
        let Some(session) = session.upgrade() else {
            return;
        };
        match result {
            Ok(mut frame) => {
                adapter.adapt_incoming(&mut frame);
                session.dispatch(frame).await;
            }
            Err(McpError::FrameParse { line, source }) => {
                // Protocol violation, but the stream itself is still alive.
                warn!(
                    server = %session.identifier,
                    line = %line,
                    "dropping malformed frame: {}",
                    source
                );
            }
            Err(err) => {
                session.on_stream_error(err).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::error_codes;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    fn test_settings() -> SessionSettings {
        SessionSettings {
            client_protocol_version: "2025-03-26".to_string(),
            server_protocol_version: "2024-11-05".to_string(),
            client_info: ClientInfo {
                name: "test-client".to_string(),
                version: "0.0.0".to_string(),
            },
            startup_window: Duration::from_secs(2),
            handshake_timeout: Duration::from_millis(500),
            call_timeout: Duration::from_millis(500),
        }
    }

    type Handler =
        Box<dyn Fn(&str, i64, Option<&Value>) -> Option<JsonRpcResponse> + Send + Sync>;

    fn default_initialize(id: i64) -> JsonRpcResponse {
        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "serverInfo": {"name": "scripted", "version": "1.0"}
            }),
        )
    }

    fn default_tools(id: i64) -> JsonRpcResponse {
        JsonRpcResponse::success(
            id,
            json!({"tools": [
                {"name": "echo", "description": "Echoes input", "inputSchema": {"type": "object"}}
            ]}),
        )
    }

    /// Scripted peer: reads request lines, answers per the handler, counts
    /// every line it sees. Returning None from the handler drops the
    /// request; a handler may also close the stream by answering with a
    /// response whose id is i64::MIN (sentinel used by one test).
    fn spawn_server(
        stream: DuplexStream,
        lines_seen: Arc<AtomicUsize>,
        handler: Handler,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(stream);
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                lines_seen.fetch_add(1, Ordering::SeqCst);
                let frame: Value = match serde_json::from_str(&line) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                let method = frame["method"].as_str().unwrap_or_default().to_string();
                let Some(id) = frame["id"].as_i64() else {
                    continue; // notification
                };
                if let Some(response) = handler(&method, id, frame.get("params")) {
                    if response.id == Some(RequestId::Number(i64::MIN)) {
                        break; // simulate a crash
                    }
                    let mut out = serde_json::to_string(&response).unwrap();
                    out.push('\n');
                    if write_half.write_all(out.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        })
    }

    async fn establish_with(handler: Handler) -> (Result<Arc<Session>, McpError>, Arc<AtomicUsize>)
    {
        let (client_side, server_side) = tokio::io::duplex(16 * 1024);
        let lines_seen = Arc::new(AtomicUsize::new(0));
        spawn_server(server_side, Arc::clone(&lines_seen), handler);

        let (read_half, write_half) = tokio::io::split(client_side);
        let session = Session::establish_io(
            "scripted".to_string(),
            Box::new(read_half),
            Box::new(write_half),
            None,
            None,
            test_settings(),
        )
        .await;
        (session, lines_seen)
    }

    fn standard_handler() -> Handler {
        Box::new(|method, id, _params| match method {
            "initialize" => Some(default_initialize(id)),
            "tools/list" => Some(default_tools(id)),
            "tools/call" => Some(JsonRpcResponse::success(
                id,
                json!({"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]}),
            )),
            _ => None,
        })
    }

    #[tokio::test]
    async fn establishes_and_reports_server_details() {
        let seen_version: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let capture = Arc::clone(&seen_version);
        let handler: Handler = Box::new(move |method, id, params| match method {
            "initialize" => {
                let version = params
                    .and_then(|p| p.get("protocolVersion"))
                    .and_then(Value::as_str)
                    .map(String::from);
                if let Ok(mut guard) = capture.try_lock() {
                    *guard = version;
                }
                Some(default_initialize(id))
            }
            "tools/list" => Some(default_tools(id)),
            _ => None,
        });

        let (session, _) = establish_with(handler).await;
        let session = session.unwrap();
        assert_eq!(session.state().await, SessionState::Ready);
        assert_eq!(session.server_info().map(|info| info.name.as_str()), Some("scripted"));
        // Inbound version was adapted back to the client's native revision.
        assert_eq!(session.negotiated_version(), Some("2025-03-26"));
        assert!(session.has_tool("echo").await);
        // Outbound version was adapted to what the server expects.
        assert_eq!(
            seen_version.lock().await.as_deref(),
            Some("2024-11-05")
        );
        session.close().await;
    }

    #[tokio::test]
    async fn call_tool_joins_content_items() {
        let (session, _) = establish_with(standard_handler()).await;
        let session = session.unwrap();
        let output = session.call_tool("echo", HashMap::new()).await.unwrap();
        assert_eq!(output, "a\nb");
        session.close().await;
    }

    #[tokio::test]
    async fn unknown_tool_fails_without_touching_the_channel() {
        let (session, lines_seen) = establish_with(standard_handler()).await;
        let session = session.unwrap();

        // initialize + initialized notification + tools/list
        let after_connect = lines_seen.load(Ordering::SeqCst);
        assert_eq!(after_connect, 3);

        let err = session.call_tool("missing", HashMap::new()).await.err().unwrap();
        assert!(matches!(err, McpError::ToolNotFound(_)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lines_seen.load(Ordering::SeqCst), after_connect);
        session.close().await;
    }

    #[tokio::test]
    async fn remote_error_leaves_session_ready() {
        let flaky = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flaky);
        let handler: Handler = Box::new(move |method, id, _| match method {
            "initialize" => Some(default_initialize(id)),
            "tools/list" => Some(default_tools(id)),
            "tools/call" => {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Some(JsonRpcResponse::failure(
                        id,
                        error_codes::INTERNAL_ERROR,
                        "backend exploded",
                    ))
                } else {
                    Some(JsonRpcResponse::success(
                        id,
                        json!({"content": [{"type": "text", "text": "recovered"}]}),
                    ))
                }
            }
            _ => None,
        });

        let (session, _) = establish_with(handler).await;
        let session = session.unwrap();

        let err = session.call_tool("echo", HashMap::new()).await.err().unwrap();
        assert!(matches!(err, McpError::ToolCall(_)));
        assert!(err.to_string().contains("backend exploded"));
        assert_eq!(session.state().await, SessionState::Ready);

        let output = session.call_tool("echo", HashMap::new()).await.unwrap();
        assert_eq!(output, "recovered");
        session.close().await;
    }

    #[tokio::test]
    async fn unanswered_initialize_times_out() {
        let handler: Handler = Box::new(|method, _id, _| match method {
            // Keep the stream alive with a frame that is not the response.
            "initialize" => Some(JsonRpcResponse::success(
                i64::MAX,
                json!({"unrelated": true}),
            )),
            _ => None,
        });
        let (session, _) = establish_with(handler).await;
        let err = session.err().unwrap();
        assert!(matches!(err, McpError::HandshakeTimeout { .. }));
    }

    #[tokio::test]
    async fn silent_server_hits_startup_window() {
        let handler: Handler = Box::new(|_, _, _| None);
        let (client_side, server_side) = tokio::io::duplex(4096);
        let lines_seen = Arc::new(AtomicUsize::new(0));
        spawn_server(server_side, lines_seen, handler);

        let mut settings = test_settings();
        settings.startup_window = Duration::from_millis(100);
        settings.handshake_timeout = Duration::from_secs(5);

        let (read_half, write_half) = tokio::io::split(client_side);
        let err = Session::establish_io(
            "silent".to_string(),
            Box::new(read_half),
            Box::new(write_half),
            None,
            None,
            settings,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, McpError::StartupTimeout { .. }));
    }

    #[tokio::test]
    async fn handshake_error_response_fails_connect() {
        let handler: Handler = Box::new(|method, id, _| match method {
            "initialize" => Some(JsonRpcResponse::failure(
                id,
                error_codes::INVALID_PARAMS,
                "unsupported protocol",
            )),
            _ => None,
        });
        let (session, _) = establish_with(handler).await;
        let err = session.err().unwrap();
        assert!(matches!(err, McpError::Handshake(_)));
        assert!(err.to_string().contains("unsupported protocol"));
    }

    #[tokio::test]
    async fn failed_discovery_fails_connect() {
        let handler: Handler = Box::new(|method, id, _| match method {
            "initialize" => Some(default_initialize(id)),
            "tools/list" => Some(JsonRpcResponse::failure(
                id,
                error_codes::METHOD_NOT_FOUND,
                "tools unsupported",
            )),
            _ => None,
        });
        let (session, _) = establish_with(handler).await;
        let err = session.err().unwrap();
        assert!(matches!(err, McpError::Discovery(_)));
    }

    #[tokio::test]
    async fn hangup_after_discovery_fails_connect() {
        // Scripted peer that answers the establishment requests and then
        // closes the stream the instant the tool listing is out.
        let (client_side, server_side) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(server_side);
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let frame: Value = match serde_json::from_str(&line) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                let method = frame["method"].as_str().unwrap_or_default().to_string();
                let Some(id) = frame["id"].as_i64() else {
                    continue;
                };
                let response = match method.as_str() {
                    "initialize" => default_initialize(id),
                    "tools/list" => default_tools(id),
                    _ => continue,
                };
                let mut out = serde_json::to_string(&response).unwrap();
                out.push('\n');
                if write_half.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
                if method == "tools/list" {
                    break; // hang up straight after the listing
                }
            }
        });

        let (read_half, write_half) = tokio::io::split(client_side);
        let session = Session::establish_io(
            "flaky".to_string(),
            Box::new(read_half),
            Box::new(write_half),
            None,
            None,
            test_settings(),
        )
        .await;

        // The session died before it could be handed out; the caller gets
        // the stream failure, never a Ready handle over a dead stream.
        let err = session.err().unwrap();
        assert!(matches!(err, McpError::StreamClosed(_)));
    }

    #[tokio::test]
    async fn close_fails_in_flight_calls_and_is_idempotent() {
        let handler: Handler = Box::new(|method, id, _| match method {
            "initialize" => Some(default_initialize(id)),
            "tools/list" => Some(default_tools(id)),
            "tools/call" => None, // never answer
            _ => None,
        });
        let (session, _) = establish_with(handler).await;
        let session = session.unwrap();

        let in_flight = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.call_tool("echo", HashMap::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.close().await;
        let err = in_flight.await.unwrap().err().unwrap();
        assert!(matches!(err, McpError::ToolCall(_)));

        // Second close is a no-op; later calls fail fast.
        session.close().await;
        let err = session.call_tool("echo", HashMap::new()).await.err().unwrap();
        assert!(matches!(err, McpError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn server_crash_mid_call_closes_session() {
        let handler: Handler = Box::new(|method, id, _| match method {
            "initialize" => Some(default_initialize(id)),
            "tools/list" => Some(default_tools(id)),
            // Sentinel: the scripted peer hangs up instead of answering.
            "tools/call" => Some(JsonRpcResponse::success(i64::MIN, json!(null))),
            _ => None,
        });
        let (session, _) = establish_with(handler).await;
        let session = session.unwrap();

        let err = session.call_tool("echo", HashMap::new()).await.err().unwrap();
        assert!(matches!(err, McpError::ToolCall(_)));
        assert_eq!(session.state().await, SessionState::Closed);
    }
}
